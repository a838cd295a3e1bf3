//! Autoencoder decoder: latent to RGB pixels.

use std::time::Instant;

use tracing::{debug, debug_span};

use super::report_weights;
use crate::{
    Context, DeviceBuffer, EngineError, Pending, backend::CompletionToken, error::Result, kernels::SiluOp, nn::{AttnBlock, Conv2d, GroupNorm, Module, ResBlock, Upsample, child_name}, weights::Weight
};

/// Decoder hyperparameters; defaults decode a `4×64×64` latent to `3×512×512` pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct DecoderConfig {
    pub latent_channels: usize,
    pub base_channels: usize,
    pub channel_mult: Vec<usize>,
    /// Residual blocks per up level.
    pub blocks_per_level: usize,
    pub out_channels: usize,
    pub norm_groups: usize,
    /// The latent is divided by this before decoding.
    pub scale_factor: f32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            latent_channels: 4,
            base_channels: 128,
            channel_mult: vec![1, 2, 4, 4],
            blocks_per_level: 3,
            out_channels: 3,
            norm_groups: 32,
            scale_factor: 0.18215,
        }
    }
}

impl DecoderConfig {
    pub fn tiny() -> Self {
        Self {
            latent_channels: 4,
            base_channels: 8,
            channel_mult: vec![1, 2],
            blocks_per_level: 2,
            out_channels: 3,
            norm_groups: 4,
            scale_factor: 0.18215,
        }
    }

    fn top_channels(&self) -> usize {
        self.base_channels * self.channel_mult.last().copied().unwrap_or(1)
    }
}

struct UpLevel {
    blocks: Vec<ResBlock>,
    upsample: Option<Upsample>,
}

impl UpLevel {
    fn modules(&self) -> impl Iterator<Item = &dyn Module> {
        let blocks = self.blocks.iter().map(|block| block as &dyn Module);
        blocks.chain(self.upsample.iter().map(|up| up as &dyn Module))
    }
}

pub struct Decoder {
    name: String,
    config: DecoderConfig,
    post_quant_conv: Conv2d,
    conv_in: Conv2d,
    mid_block_1: ResBlock,
    mid_attn: AttnBlock,
    mid_block_2: ResBlock,
    /// Highest resolution first in storage order (`up.0`), run in reverse.
    up: Vec<UpLevel>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
    release_stages: bool,
}

impl Decoder {
    pub fn new(name: impl Into<String>, config: DecoderConfig) -> Self {
        let name = name.into();
        let decoder = child_name(&name, "decoder");
        let groups = config.norm_groups;
        let top = config.top_channels();
        let levels = config.channel_mult.len();

        let mut block_in = top;
        let mut up: Vec<UpLevel> = Vec::with_capacity(levels);
        for (level, mult) in config.channel_mult.iter().enumerate().rev() {
            let block_out = config.base_channels * mult;
            let prefix = child_name(&decoder, format!("up.{level}"));
            let blocks = (0..config.blocks_per_level)
                .map(|i| {
                    let block = ResBlock::vae(child_name(&prefix, format!("block.{i}")), block_in, block_out, groups);
                    block_in = block_out;
                    block
                })
                .collect();
            let upsample = (level != 0).then(|| Upsample::new(child_name(&prefix, "upsample"), block_out));
            up.push(UpLevel { blocks, upsample });
        }
        up.reverse();

        Self {
            post_quant_conv: Conv2d::new(child_name(&name, "post_quant_conv"), config.latent_channels, config.latent_channels, 1, 1, 0),
            conv_in: Conv2d::new(child_name(&decoder, "conv_in"), config.latent_channels, top, 3, 1, 1),
            mid_block_1: ResBlock::vae(child_name(&decoder, "mid.block_1"), top, top, groups),
            mid_attn: AttnBlock::new(child_name(&decoder, "mid.attn_1"), top, groups),
            mid_block_2: ResBlock::vae(child_name(&decoder, "mid.block_2"), top, top, groups),
            up,
            norm_out: GroupNorm::new(child_name(&decoder, "norm_out"), block_in, groups, 1e-6),
            conv_out: Conv2d::new(child_name(&decoder, "conv_out"), block_in, config.out_channels, 3, 1, 1),
            name,
            config,
            release_stages: false,
        }
    }

    /// Drop each stage's weights once its work is queued, trading reloads for peak memory.
    pub fn with_stage_release(mut self, release: bool) -> Self {
        self.release_stages = release;
        self
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    fn components(&self) -> impl Iterator<Item = &dyn Module> {
        let head = [
            &self.post_quant_conv as &dyn Module,
            &self.conv_in,
            &self.mid_block_1,
            &self.mid_attn,
            &self.mid_block_2,
        ];
        let tail = [&self.norm_out as &dyn Module, &self.conv_out];
        head.into_iter().chain(self.up.iter().rev().flat_map(UpLevel::modules)).chain(tail)
    }

    pub fn load(&self, ctx: &Context) -> Result<u64> {
        self.init(ctx)?;
        Ok(report_weights(&self.name, self.components()))
    }

    fn finish_stage(&self, module: &dyn Module) {
        if self.release_stages {
            module.release();
            debug!(stage = module.name(), "released stage weights");
        }
    }

    /// Decode an already scaled latent buffer into `[out_channels, 8·S, 8·S]` pixels in `[-1, 1]`.
    pub fn forward(&self, ctx: &Context, latent: &DeviceBuffer, waits: &[CompletionToken]) -> Result<Pending> {
        let _span = debug_span!("decoder", latent = latent.len()).entered();
        let started = Instant::now();

        let mut h = self.post_quant_conv.forward(ctx, latent, waits)?;
        self.finish_stage(&self.post_quant_conv);
        h = self.conv_in.forward(ctx, &h.buffer, &h.waits())?;
        self.finish_stage(&self.conv_in);

        h = self.mid_block_1.forward(ctx, &h.buffer, None, &h.waits())?;
        self.finish_stage(&self.mid_block_1);
        h = self.mid_attn.forward(ctx, &h.buffer, &h.waits())?;
        self.finish_stage(&self.mid_attn);
        h = self.mid_block_2.forward(ctx, &h.buffer, None, &h.waits())?;
        self.finish_stage(&self.mid_block_2);

        for level in self.up.iter().rev() {
            for block in &level.blocks {
                h = block.forward(ctx, &h.buffer, None, &h.waits())?;
                self.finish_stage(block);
            }
            if let Some(upsample) = &level.upsample {
                h = upsample.forward(ctx, &h.buffer, &h.waits())?;
                self.finish_stage(upsample);
            }
        }

        let normed = self.norm_out.forward(ctx, &h.buffer, &h.waits())?;
        self.finish_stage(&self.norm_out);
        let (activated, token) = ctx.call::<SiluOp>(&normed.buffer, &normed.waits())?;
        let out = self.conv_out.forward(ctx, &activated, &[token])?;
        self.finish_stage(&self.conv_out);

        ctx.module_output(&self.name, &out, started)?;
        Ok(out)
    }

    /// Host entry point: scale the latent, decode and read back the pixels.
    pub fn decode(&self, ctx: &Context, latent: &[f32]) -> Result<Vec<f32>> {
        if latent.len() % self.config.latent_channels != 0 {
            return Err(EngineError::mismatch(
                "decoder latent",
                latent.len().next_multiple_of(self.config.latent_channels),
                latent.len(),
            ));
        }
        let scale = 1.0 / self.config.scale_factor;
        let scaled: Vec<f32> = latent.iter().map(|v| v * scale).collect();
        let input = ctx.upload(&scaled)?;
        let pixels = self.forward(ctx, &input, &[])?;
        ctx.read(&pixels.buffer, &pixels.waits())
    }
}

impl Module for Decoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        for component in self.components() {
            component.visit_weights(visitor);
        }
    }
}

/// Planar `[3, H, W]` pixels in `[-1, 1]` to interleaved RGB bytes.
pub fn to_rgb8(pixels: &[f32]) -> Result<Vec<u8>> {
    if pixels.len() % 3 != 0 {
        return Err(EngineError::mismatch("rgb planes", pixels.len().next_multiple_of(3), pixels.len()));
    }
    let plane = pixels.len() / 3;
    let (r, rest) = pixels.split_at(plane);
    let (g, b) = rest.split_at(plane);
    let to_byte = |v: f32| (((v + 1.0) / 2.0).clamp(0.0, 1.0) * 255.0).round() as u8;
    Ok(r.iter()
        .zip(g)
        .zip(b)
        .flat_map(|((r, g), b)| [to_byte(*r), to_byte(*g), to_byte(*b)])
        .collect())
}
