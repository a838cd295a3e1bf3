//! DDIM sampling driven by an injected noise predictor.

mod schedule;

use std::time::Instant;

use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, StandardNormal};
use tracing::{debug, info, info_span};

use lumen_instrumentation::{MetricEvent, record_metric};

pub use schedule::{DdimSchedule, NoiseSchedule, TRAIN_TIMESTEPS};

use crate::{EngineError, error::Result};

/// Seed of the initial latent noise when none is supplied.
pub const DEFAULT_SEED: u64 = 42;

/// Evaluates the denoising network: `(latent, timestep, conditioning) -> predicted noise`.
pub trait NoisePredictor {
    fn predict(&mut self, latent: &[f32], timestep: u32, cond: &[f32]) -> Result<Vec<f32>>;
}

impl<F> NoisePredictor for F
where
    F: FnMut(&[f32], u32, &[f32]) -> Result<Vec<f32>>,
{
    fn predict(&mut self, latent: &[f32], timestep: u32, cond: &[f32]) -> Result<Vec<f32>> {
        self(latent, timestep, cond)
    }
}

/// Deterministic DDIM (eta 0) over a single latent, without classifier-free guidance.
#[derive(Clone, Debug)]
pub struct DdimSampler {
    schedule: NoiseSchedule,
    seed: u64,
}

impl Default for DdimSampler {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

impl DdimSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            schedule: NoiseSchedule::new(),
            seed,
        }
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Standard normal noise for a `[C, H, W]` latent, from this sampler's seed.
    pub fn initial_noise(&self, shape: [usize; 3]) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        (0..shape.iter().product::<usize>())
            .map(|_| StandardNormal.sample(&mut rng))
            .collect()
    }

    /// Denoise `initial` (or seeded noise) over `steps` reduced timesteps, latest first.
    pub fn sample(
        &self,
        predictor: &mut dyn NoisePredictor,
        initial: Option<Vec<f32>>,
        steps: usize,
        shape: [usize; 3],
        cond: &[f32],
    ) -> Result<Vec<f32>> {
        let ddim = self.schedule.ddim(steps)?;
        let len = shape.iter().product::<usize>();
        let mut x = match initial {
            Some(latent) if latent.len() != len => return Err(EngineError::mismatch("ddim initial latent", len, latent.len())),
            Some(latent) => latent,
            None => self.initial_noise(shape),
        };
        info!(steps, ?shape, seed = self.seed, "sampling");

        for (step, index) in (0..ddim.len()).rev().enumerate() {
            let timestep = ddim.timesteps[index];
            let _span = info_span!("ddim_step", step, timestep).entered();
            let started = Instant::now();

            let e_t = predictor.predict(&x, timestep, cond)?;
            if e_t.len() != len {
                return Err(EngineError::mismatch("ddim noise prediction", len, e_t.len()));
            }
            let (a_t, a_prev) = (ddim.alphas[index], ddim.alphas_prev[index]);
            let (sqrt_a_t, sqrt_one_minus_a_t) = (a_t.sqrt(), (1.0 - a_t).sqrt());
            let (sqrt_a_prev, dir_coeff) = (a_prev.sqrt(), (1.0 - a_prev).sqrt());
            for (value, noise) in x.iter_mut().zip(&e_t) {
                let pred_x0 = (*value - sqrt_one_minus_a_t * noise) / sqrt_a_t;
                *value = sqrt_a_prev * pred_x0 + dir_coeff * noise;
            }

            let duration_us = started.elapsed().as_micros() as u64;
            debug!(step, timestep, duration_us, "ddim step");
            record_metric!(MetricEvent::SamplerStep {
                step: step as u64,
                timestep: timestep as u64,
                duration_us,
            });
        }
        Ok(x)
    }
}

#[cfg(test)]
mod sampler_test {
    use super::*;

    #[test]
    fn test_reverse_order_and_reproducibility() {
        let sampler = DdimSampler::default();
        let mut seen = Vec::new();
        let mut stub = |latent: &[f32], timestep: u32, _cond: &[f32]| -> Result<Vec<f32>> {
            seen.push(timestep);
            Ok(latent.iter().map(|v| 0.1 * v + timestep as f32 * 1e-4).collect())
        };
        let first = sampler.sample(&mut stub, None, 50, [4, 2, 2], &[]).unwrap();
        assert_eq!(seen.len(), 50);
        assert_eq!((seen[0], seen[49]), (981, 1));
        assert!(seen.windows(2).all(|w| w[0] > w[1]));

        let mut stub = |latent: &[f32], timestep: u32, _cond: &[f32]| -> Result<Vec<f32>> {
            Ok(latent.iter().map(|v| 0.1 * v + timestep as f32 * 1e-4).collect())
        };
        let second = sampler.sample(&mut stub, None, 50, [4, 2, 2], &[]).unwrap();
        assert_eq!(first.iter().map(|v| v.to_bits()).collect::<Vec<_>>(), second.iter().map(|v| v.to_bits()).collect::<Vec<_>>());
    }

    #[test]
    fn test_single_step_update() {
        let sampler = DdimSampler::new(7);
        let schedule = sampler.schedule().ddim(1).unwrap();
        let (a_t, a_prev) = (schedule.alphas[0], schedule.alphas_prev[0]);
        let mut constant = |_: &[f32], _: u32, _: &[f32]| -> Result<Vec<f32>> { Ok(vec![0.5; 2]) };
        let out = sampler.sample(&mut constant, Some(vec![1.0, -1.0]), 1, [2, 1, 1], &[]).unwrap();
        for (x, start) in out.iter().zip([1.0f32, -1.0]) {
            let pred_x0 = (start - (1.0 - a_t).sqrt() * 0.5) / a_t.sqrt();
            let expected = a_prev.sqrt() * pred_x0 + (1.0 - a_prev).sqrt() * 0.5;
            assert!((x - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_noise_is_seeded() {
        let a = DdimSampler::new(42).initial_noise([4, 8, 8]);
        assert_eq!(a, DdimSampler::default().initial_noise([4, 8, 8]));
        assert_ne!(a, DdimSampler::new(43).initial_noise([4, 8, 8]));
        let mean = a.iter().sum::<f32>() / a.len() as f32;
        assert!(mean.abs() < 0.2);
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let sampler = DdimSampler::default();
        let mut short = |_: &[f32], _: u32, _: &[f32]| -> Result<Vec<f32>> { Ok(vec![0.0]) };
        assert!(sampler.sample(&mut short, None, 5, [1, 2, 2], &[]).is_err());
        assert!(sampler.sample(&mut short, Some(vec![0.0; 3]), 5, [1, 2, 2], &[]).is_err());
    }
}
