//! Host entry points: tokens to conditioning, conditioning to latent, latent to pixels.

use std::time::Instant;

use tracing::{info, info_span};

use crate::{
    Context, error::Result, models::{Decoder, DecoderConfig, TextEncoder, TextEncoderConfig, Unet, UnetConfig}, sampler::DdimSampler, tokenizer::pad_tokens
};

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub text_encoder: TextEncoderConfig,
    pub unet: UnetConfig,
    pub decoder: DecoderConfig,
    /// Spatial size of the square latent.
    pub latent_size: usize,
    pub seed: u64,
    /// Release decoder weights stage by stage.
    pub release_decoder_stages: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            text_encoder: TextEncoderConfig::default(),
            unet: UnetConfig::default(),
            decoder: DecoderConfig::default(),
            latent_size: 64,
            seed: crate::sampler::DEFAULT_SEED,
            release_decoder_stages: false,
        }
    }
}

impl PipelineConfig {
    /// Small matching configs for host tests.
    pub fn tiny() -> Self {
        let text_encoder = TextEncoderConfig::tiny();
        Self {
            unet: UnetConfig {
                context_dim: text_encoder.width,
                ..UnetConfig::tiny()
            },
            text_encoder,
            decoder: DecoderConfig::tiny(),
            latent_size: 8,
            seed: crate::sampler::DEFAULT_SEED,
            release_decoder_stages: false,
        }
    }
}

/// Text encoder, denoiser, decoder and sampler sharing one context.
pub struct Pipeline {
    config: PipelineConfig,
    text_encoder: TextEncoder,
    unet: Unet,
    decoder: Decoder,
    sampler: DdimSampler,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Ok(Self {
            text_encoder: TextEncoder::new("text_encoder", config.text_encoder.clone())?,
            unet: Unet::new("unet", config.unet.clone())?,
            decoder: Decoder::new("vae", config.decoder.clone()).with_stage_release(config.release_decoder_stages),
            sampler: DdimSampler::new(config.seed),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn text_encoder(&self) -> &TextEncoder {
        &self.text_encoder
    }

    pub fn unet(&self) -> &Unet {
        &self.unet
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn latent_shape(&self) -> [usize; 3] {
        let size = self.config.latent_size;
        [self.config.unet.in_channels, size, size]
    }

    /// Pad raw prompt ids to the context window and encode them; returns `[tokens, width]`.
    pub fn encode(&self, ctx: &Context, ids: &[u32]) -> Result<Vec<f32>> {
        let _span = info_span!("encode").entered();
        let encoder = &self.config.text_encoder;
        let tokens = pad_tokens(ids, encoder.context_length, encoder.special_tokens);
        let cond = self.text_encoder.encode(ctx, &tokens, &[])?;
        ctx.read(&cond.buffer, &cond.waits())
    }

    /// Run DDIM from `initial` or seeded noise.
    pub fn sample(&self, ctx: &Context, cond: &[f32], steps: usize, initial: Option<Vec<f32>>) -> Result<Vec<f32>> {
        let _span = info_span!("sample", steps).entered();
        let mut predictor = self.unet.predictor(ctx);
        self.sampler.sample(&mut predictor, initial, steps, self.latent_shape(), cond)
    }

    pub fn decode(&self, ctx: &Context, latent: &[f32]) -> Result<Vec<f32>> {
        let _span = info_span!("decode").entered();
        self.decoder.decode(ctx, latent)
    }

    /// Prompt ids to planar `[3, H, W]` pixels.
    pub fn generate(&self, ctx: &Context, ids: &[u32], steps: usize) -> Result<Vec<f32>> {
        let started = Instant::now();
        let cond = self.encode(ctx, ids)?;
        let latent = self.sample(ctx, &cond, steps, None)?;
        let pixels = self.decode(ctx, &latent)?;
        ctx.finish()?;
        info!(steps, elapsed_ms = started.elapsed().as_millis() as u64, "generated image");
        Ok(pixels)
    }
}

#[cfg(test)]
mod pipeline_test {
    use super::*;
    use crate::nn::test_util::{host_ctx, random_store};

    #[test]
    fn test_markers_fit_vocabulary() {
        for config in [TextEncoderConfig::default(), TextEncoderConfig::tiny()] {
            let special = config.special_tokens;
            for id in [special.start, special.end, special.pad] {
                assert!((id as usize) < config.vocab_size, "{id} outside {}", config.vocab_size);
            }
        }
    }

    #[test]
    fn test_tiny_encode_frames_prompt() {
        let pipeline = Pipeline::new(PipelineConfig::tiny()).unwrap();
        let ctx = host_ctx(random_store(pipeline.text_encoder(), 3));
        let config = &pipeline.config().text_encoder;

        let cond = pipeline.encode(&ctx, &[12, 7, 33]).unwrap();
        assert_eq!(cond.len(), config.context_length * config.width);
        assert!(cond.iter().all(|v| v.is_finite()));

        let long: Vec<u32> = (1..40).collect();
        assert_eq!(pipeline.encode(&ctx, &long).unwrap().len(), cond.len());
    }
}
