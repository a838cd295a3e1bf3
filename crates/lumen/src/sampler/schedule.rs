use crate::{EngineError, error::Result};

/// Number of diffusion steps the model was trained with.
pub const TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.00085;
const BETA_END: f64 = 0.0120;

/// Training noise schedule: `betas = linspace(√β₀, √β₁, 1000)²` and the cumulative product
/// of `1 − β`, accumulated in f64.
#[derive(Clone, Debug)]
pub struct NoiseSchedule {
    betas: Vec<f32>,
    alphas_cumprod: Vec<f32>,
}

impl Default for NoiseSchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl NoiseSchedule {
    pub fn new() -> Self {
        let (start, end) = (BETA_START.sqrt(), BETA_END.sqrt());
        let last = (TRAIN_TIMESTEPS - 1) as f64;
        let betas: Vec<f64> = (0..TRAIN_TIMESTEPS)
            .map(|i| {
                let root = start + (end - start) * i as f64 / last;
                root * root
            })
            .collect();
        let alphas_cumprod = betas
            .iter()
            .scan(1.0f64, |product, beta| {
                *product *= 1.0 - beta;
                Some(*product as f32)
            })
            .collect();
        Self {
            betas: betas.into_iter().map(|beta| beta as f32).collect(),
            alphas_cumprod,
        }
    }

    pub fn betas(&self) -> &[f32] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f32] {
        &self.alphas_cumprod
    }

    /// Reduce the schedule to `steps` evenly spaced timesteps.
    ///
    /// Timesteps are `1, 1 + 1000/steps, …`; when `steps` does not divide 1000 the range
    /// yields an extra value, and only the first `steps` are kept.
    pub fn ddim(&self, steps: usize) -> Result<DdimSchedule> {
        if steps == 0 || steps > TRAIN_TIMESTEPS {
            return Err(EngineError::InvalidArgument(format!(
                "DDIM needs between 1 and {TRAIN_TIMESTEPS} steps, got {steps}"
            )));
        }
        let stride = TRAIN_TIMESTEPS / steps;
        let timesteps: Vec<u32> = (0..TRAIN_TIMESTEPS)
            .step_by(stride)
            .take(steps)
            .map(|t| t as u32 + 1)
            .collect();
        if let Some(&last) = timesteps.last()
            && last as usize >= TRAIN_TIMESTEPS
        {
            return Err(EngineError::InvalidArgument(format!(
                "{steps} steps reach timestep {last}, past the last trained timestep"
            )));
        }
        let alphas: Vec<f32> = timesteps.iter().map(|t| self.alphas_cumprod[*t as usize]).collect();
        let alphas_prev = std::iter::once(self.alphas_cumprod[0])
            .chain(alphas[..steps - 1].iter().copied())
            .collect();
        Ok(DdimSchedule {
            timesteps,
            alphas,
            alphas_prev,
        })
    }
}

/// Per-step coefficients for a reduced timestep sequence, in ascending timestep order.
#[derive(Clone, Debug, PartialEq)]
pub struct DdimSchedule {
    pub timesteps: Vec<u32>,
    pub alphas: Vec<f32>,
    pub alphas_prev: Vec<f32>,
}

impl DdimSchedule {
    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }
}

#[cfg(test)]
mod schedule_test {
    use super::*;

    #[test]
    fn test_training_schedule() {
        let schedule = NoiseSchedule::new();
        assert_eq!(schedule.betas().len(), TRAIN_TIMESTEPS);
        assert!((schedule.betas()[0] - 0.00085).abs() < 1e-9);
        assert!((schedule.betas()[999] - 0.012).abs() < 1e-7);
        assert!((schedule.alphas_cumprod()[0] - 0.99915).abs() < 1e-7);
        assert!(schedule.alphas_cumprod().windows(2).all(|w| w[1] < w[0]));
        assert!(schedule.alphas_cumprod()[999] > 0.0);
    }

    #[test]
    fn test_fifty_steps() {
        let schedule = NoiseSchedule::new();
        let ddim = schedule.ddim(50).unwrap();
        assert_eq!(ddim.len(), 50);
        assert_eq!(ddim.timesteps[..3], [1, 21, 41]);
        assert_eq!(*ddim.timesteps.last().unwrap(), 981);
        assert_eq!(ddim.alphas_prev[0], schedule.alphas_cumprod()[0]);
        assert_eq!(ddim.alphas[7], schedule.alphas_cumprod()[141]);
        assert_eq!(ddim.alphas_prev[8], ddim.alphas[7]);
    }

    #[test]
    fn test_uneven_step_counts_stay_in_range() {
        let schedule = NoiseSchedule::new();
        let ddim = schedule.ddim(3).unwrap();
        assert_eq!(ddim.timesteps, vec![1, 334, 667]);
        assert_eq!(schedule.ddim(999).unwrap().timesteps.last(), Some(&999));
        assert!(schedule.ddim(1000).is_err());
        assert!(schedule.ddim(0).is_err());
        assert!(schedule.ddim(1001).is_err());
    }
}
