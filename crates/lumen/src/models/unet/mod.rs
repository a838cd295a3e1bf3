//! The conditional denoising U-Net.

mod stages;

use std::time::Instant;

use tracing::debug_span;

pub use stages::{LayerPlan, StageTable};

use super::report_weights;
use crate::{
    Context, DeviceBuffer, EngineError, Pending, backend::CompletionToken, error::Result, kernels::SiluOp, nn::{Conv2d, GroupNorm, Linear, Module, ResBlock, SpatialTransformer, Upsample, child_name, concat}, sampler::NoisePredictor, weights::Weight
};

/// U-Net hyperparameters. Defaults are the 512px v2 model: 320 base channels, multipliers
/// 1, 2, 4, 4, two residual blocks per level, attention on the first three levels with 64-wide
/// heads and 1024-wide conditioning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnetConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub model_channels: usize,
    pub channel_mult: Vec<usize>,
    pub num_res_blocks: usize,
    pub attention_levels: Vec<bool>,
    pub head_dim: usize,
    pub context_dim: usize,
    pub norm_groups: usize,
}

impl Default for UnetConfig {
    fn default() -> Self {
        Self {
            in_channels: 4,
            out_channels: 4,
            model_channels: 320,
            channel_mult: vec![1, 2, 4, 4],
            num_res_blocks: 2,
            attention_levels: vec![true, true, true, false],
            head_dim: 64,
            context_dim: 1024,
            norm_groups: 32,
        }
    }
}

impl UnetConfig {
    /// Two levels of one block each; small enough for host tests.
    pub fn tiny() -> Self {
        Self {
            in_channels: 4,
            out_channels: 4,
            model_channels: 16,
            channel_mult: vec![1, 2],
            num_res_blocks: 1,
            attention_levels: vec![true, false],
            head_dim: 8,
            context_dim: 16,
            norm_groups: 4,
        }
    }

    /// Width of the time embedding fed to every residual block.
    pub fn time_dim(&self) -> usize {
        4 * self.model_channels
    }
}

/// Sinusoidal embedding of a scalar timestep: cosines in the first half, sines in the second.
pub fn timestep_embedding(timestep: u32, dim: usize) -> Vec<f32> {
    let half = dim / 2;
    let mut embedding = vec![0.0; dim];
    for i in 0..half {
        let freq = (-(10000f64.ln()) * i as f64 / half as f64).exp();
        let arg = timestep as f64 * freq;
        embedding[i] = arg.cos() as f32;
        embedding[i + half] = arg.sin() as f32;
    }
    embedding
}

enum Layer {
    Conv(Conv2d),
    Res(ResBlock),
    Transformer(SpatialTransformer),
    Upsample(Upsample),
}

impl Layer {
    fn build(name: String, plan: LayerPlan, config: &UnetConfig) -> Result<Self> {
        let groups = config.norm_groups;
        Ok(match plan {
            LayerPlan::ConvIn {
                in_channels,
                out_channels,
            } => Layer::Conv(Conv2d::new(name, in_channels, out_channels, 3, 1, 1)),
            LayerPlan::Res {
                in_channels,
                out_channels,
            } => Layer::Res(ResBlock::unet(name, in_channels, out_channels, config.time_dim(), groups)),
            LayerPlan::Transformer { channels } => {
                Layer::Transformer(SpatialTransformer::new(name, channels, config.context_dim, config.head_dim, groups)?)
            }
            LayerPlan::Downsample { channels } => Layer::Conv(Conv2d::downsample(child_name(&name, "op"), channels)),
            LayerPlan::Upsample { channels } => Layer::Upsample(Upsample::new(name, channels)),
        })
    }

    fn module(&self) -> &dyn Module {
        match self {
            Layer::Conv(conv) => conv,
            Layer::Res(block) => block,
            Layer::Transformer(transformer) => transformer,
            Layer::Upsample(upsample) => upsample,
        }
    }

    fn forward(&self, ctx: &Context, x: &DeviceBuffer, emb: &Pending, cond: &DeviceBuffer, waits: &[CompletionToken]) -> Result<Pending> {
        match self {
            Layer::Conv(conv) => conv.forward(ctx, x, waits),
            Layer::Res(block) => {
                let mut waits = waits.to_vec();
                waits.push(emb.token);
                waits.sort_unstable();
                waits.dedup();
                block.forward(ctx, x, Some(&emb.buffer), &waits)
            }
            Layer::Transformer(transformer) => transformer.forward(ctx, x, cond, waits),
            Layer::Upsample(upsample) => upsample.forward(ctx, x, waits),
        }
    }
}

struct Stage {
    layers: Vec<Layer>,
}

impl Stage {
    fn build(prefix: &str, index: usize, plans: &[LayerPlan], config: &UnetConfig) -> Result<Self> {
        let stage = child_name(prefix, index);
        let layers = plans
            .iter()
            .enumerate()
            .map(|(j, plan)| Layer::build(child_name(&stage, j), *plan, config))
            .collect::<Result<_>>()?;
        Ok(Self { layers })
    }

    fn forward(&self, ctx: &Context, x: &DeviceBuffer, emb: &Pending, cond: &DeviceBuffer, waits: &[CompletionToken]) -> Result<Pending> {
        let mut layers = self.layers.iter();
        let first = layers
            .next()
            .ok_or_else(|| EngineError::InvalidArgument("empty U-Net stage".into()))?;
        let mut h = first.forward(ctx, x, emb, cond, waits)?;
        for layer in layers {
            h = layer.forward(ctx, &h.buffer, emb, cond, &h.waits())?;
        }
        Ok(h)
    }
}

pub struct Unet {
    name: String,
    config: UnetConfig,
    time_embed_in: Linear,
    time_embed_out: Linear,
    input_blocks: Vec<Stage>,
    middle_block: Stage,
    output_blocks: Vec<Stage>,
    out_norm: GroupNorm,
    out_conv: Conv2d,
}

impl Unet {
    /// Lay out every stage from `config`; weights are named under `{name}.`.
    pub fn new(name: impl Into<String>, config: UnetConfig) -> Result<Self> {
        let name = name.into();
        let table = StageTable::build(&config);
        let (mc, time_dim) = (config.model_channels, config.time_dim());

        let stages = |prefix: &str, plans: &[Vec<LayerPlan>]| -> Result<Vec<Stage>> {
            let prefix = child_name(&name, prefix);
            plans
                .iter()
                .enumerate()
                .map(|(i, plans)| Stage::build(&prefix, i, plans, &config))
                .collect()
        };
        let input_blocks = stages("input_blocks", &table.input)?;
        let output_blocks = stages("output_blocks", &table.output)?;
        let middle_block = Stage {
            layers: table
                .middle
                .iter()
                .enumerate()
                .map(|(j, plan)| Layer::build(child_name(&name, format!("middle_block.{j}")), *plan, &config))
                .collect::<Result<_>>()?,
        };

        Ok(Self {
            time_embed_in: Linear::new(child_name(&name, "time_embed.0"), mc, time_dim, true),
            time_embed_out: Linear::new(child_name(&name, "time_embed.2"), time_dim, time_dim, true),
            input_blocks,
            middle_block,
            output_blocks,
            out_norm: GroupNorm::new(child_name(&name, "out.0"), table.out_channels(), config.norm_groups, GroupNorm::DEFAULT_EPS),
            out_conv: Conv2d::new(child_name(&name, "out.2"), table.out_channels(), config.out_channels, 3, 1, 1),
            name,
            config,
        })
    }

    pub fn config(&self) -> &UnetConfig {
        &self.config
    }

    /// Materialize every weight and report the per-component sizes.
    pub fn load(&self, ctx: &Context) -> Result<u64> {
        self.init(ctx)?;
        let components = [&self.time_embed_in as &dyn Module, &self.time_embed_out, &self.out_norm, &self.out_conv];
        let layers = self
            .input_blocks
            .iter()
            .chain(std::iter::once(&self.middle_block))
            .chain(&self.output_blocks)
            .flat_map(|stage| stage.layers.iter().map(Layer::module));
        Ok(report_weights(&self.name, components.into_iter().chain(layers)))
    }

    fn time_embedding(&self, ctx: &Context, timestep: u32) -> Result<Pending> {
        let sinusoid = ctx.upload(&timestep_embedding(timestep, self.config.model_channels))?;
        let h = self.time_embed_in.forward(ctx, &sinusoid, &[])?;
        let (h, token) = ctx.call::<SiluOp>(&h.buffer, &h.waits())?;
        self.time_embed_out.forward(ctx, &h, &[token])
    }

    /// Predict the noise in `latent` (`[C, S, S]`) at `timestep`, conditioned on `cond`
    /// (`[tokens, context_dim]`).
    pub fn forward(&self, ctx: &Context, latent: &DeviceBuffer, timestep: u32, cond: &DeviceBuffer, waits: &[CompletionToken]) -> Result<Pending> {
        let _span = debug_span!("unet", timestep).entered();
        let started = Instant::now();
        if cond.len() % self.config.context_dim != 0 {
            return Err(EngineError::mismatch(
                "unet conditioning",
                cond.len().next_multiple_of(self.config.context_dim),
                cond.len(),
            ));
        }
        let emb = self.time_embedding(ctx, timestep)?;

        let mut skips = Vec::with_capacity(self.input_blocks.len());
        let mut stages = self.input_blocks.iter();
        let first = stages
            .next()
            .ok_or_else(|| EngineError::InvalidArgument("U-Net without input stages".into()))?;
        let mut h = first.forward(ctx, latent, &emb, cond, waits)?;
        skips.push(h.clone());
        for stage in stages {
            h = stage.forward(ctx, &h.buffer, &emb, cond, &h.waits())?;
            skips.push(h.clone());
        }

        h = self.middle_block.forward(ctx, &h.buffer, &emb, cond, &h.waits())?;

        for stage in &self.output_blocks {
            let skip = skips
                .pop()
                .ok_or_else(|| EngineError::InvalidArgument("U-Net output stage without a skip activation".into()))?;
            let joined = ctx.alloc(h.buffer.len() + skip.buffer.len())?;
            let mut waits = vec![h.token, skip.token];
            waits.sort_unstable();
            let joined = concat(ctx, &h.buffer, &skip.buffer, &joined, &waits)?;
            h = stage.forward(ctx, &joined.buffer, &emb, cond, &joined.waits())?;
        }

        let normed = self.out_norm.forward(ctx, &h.buffer, &h.waits())?;
        let (activated, token) = ctx.call::<SiluOp>(&normed.buffer, &normed.waits())?;
        let out = self.out_conv.forward(ctx, &activated, &[token])?;
        ctx.module_output(&self.name, &out, started)?;
        Ok(out)
    }

    /// Adapter used by the sampler: host latent in, host noise prediction out.
    pub fn predictor<'a>(&'a self, ctx: &'a Context) -> UnetPredictor<'a> {
        UnetPredictor { unet: self, ctx }
    }
}

impl Module for Unet {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        self.time_embed_in.visit_weights(visitor);
        self.time_embed_out.visit_weights(visitor);
        for stage in self.input_blocks.iter().chain(std::iter::once(&self.middle_block)).chain(&self.output_blocks) {
            for layer in &stage.layers {
                layer.module().visit_weights(visitor);
            }
        }
        self.out_norm.visit_weights(visitor);
        self.out_conv.visit_weights(visitor);
    }
}

/// Runs a full U-Net evaluation per call and synchronizes on its output.
pub struct UnetPredictor<'a> {
    unet: &'a Unet,
    ctx: &'a Context,
}

impl NoisePredictor for UnetPredictor<'_> {
    fn predict(&mut self, latent: &[f32], timestep: u32, cond: &[f32]) -> Result<Vec<f32>> {
        let latent = self.ctx.upload(latent)?;
        let cond = self.ctx.upload(cond)?;
        let noise = self.unet.forward(self.ctx, &latent, timestep, &cond, &[])?;
        self.ctx.read(&noise.buffer, &noise.waits())
    }
}

#[cfg(test)]
mod unet_test {
    use super::*;
    use crate::nn::test_util::{host_ctx, random_store, random_vec};

    #[test]
    fn test_timestep_embedding() {
        let emb = timestep_embedding(0, 320);
        assert_eq!(emb.len(), 320);
        assert!(emb[..160].iter().all(|v| *v == 1.0));
        assert!(emb[160..].iter().all(|v| *v == 0.0));

        let emb = timestep_embedding(981, 8);
        assert!((emb[0] - 981f32.cos()).abs() < 1e-5);
        assert!((emb[4] - 981f32.sin()).abs() < 1e-5);
        let freq = (-(10000f64.ln()) / 4.0).exp();
        assert!((emb[5] as f64 - (981.0 * freq).sin()).abs() < 1e-5);
    }

    #[test]
    fn test_weight_names_follow_stage_layout() {
        let unet = Unet::new("unet", UnetConfig::default()).unwrap();
        let names: Vec<String> = unet.weights().iter().map(|w| w.name().to_string()).collect();
        for expected in [
            "unet.time_embed.0.weight",
            "unet.input_blocks.0.0.weight",
            "unet.input_blocks.1.0.in_layers.0.weight",
            "unet.input_blocks.1.1.transformer_blocks.0.attn2.to_k.weight",
            "unet.input_blocks.3.0.op.weight",
            "unet.input_blocks.4.0.skip_connection.weight",
            "unet.middle_block.1.proj_in.weight",
            "unet.output_blocks.2.1.conv.weight",
            "unet.output_blocks.11.1.proj_out.bias",
            "unet.out.2.bias",
        ] {
            assert!(names.iter().any(|name| name == expected), "missing {expected}");
        }
        let to_k = unet
            .weights()
            .into_iter()
            .find(|w| w.name() == "unet.input_blocks.1.1.transformer_blocks.0.attn2.to_k.weight")
            .map(|w| w.shape().to_vec());
        assert_eq!(to_k, Some(vec![320, 1024]));
    }

    #[test]
    fn test_tiny_unet_forward() {
        let config = UnetConfig::tiny();
        let unet = Unet::new("unet", config.clone()).unwrap();
        let ctx = host_ctx(random_store(&unet, 51));
        assert!(unet.load(&ctx).unwrap() > 0);

        let latent = random_vec(config.in_channels * 8 * 8, 1);
        let cond = random_vec(3 * config.context_dim, 2);
        let mut predictor = unet.predictor(&ctx);
        let first = predictor.predict(&latent, 981, &cond).unwrap();
        assert_eq!(first.len(), config.out_channels * 8 * 8);
        assert!(first.iter().all(|v| v.is_finite()));

        let again = predictor.predict(&latent, 981, &cond).unwrap();
        assert_eq!(first, again);
        let later = predictor.predict(&latent, 1, &cond).unwrap();
        assert_ne!(first, later);
    }
}
