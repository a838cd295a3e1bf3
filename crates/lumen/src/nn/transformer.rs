use std::time::Instant;

use super::{CrossAttention, FeedForward, GroupNorm, LayerNorm, Linear, Module, child_name};
use crate::{
    Context, DeviceBuffer, EngineError, Pending, backend::CompletionToken, error::Result, kernels::{AddOp, PermuteOp}, weights::Weight
};

/// Self-attention, cross-attention and feed-forward, each pre-normed with a residual add.
pub struct BasicTransformerBlock {
    name: String,
    norm1: LayerNorm,
    attn1: CrossAttention,
    norm2: LayerNorm,
    attn2: CrossAttention,
    norm3: LayerNorm,
    ff: FeedForward,
}

impl BasicTransformerBlock {
    pub fn new(name: impl Into<String>, dim: usize, context_dim: usize, head_dim: usize) -> Result<Self> {
        let name = name.into();
        Ok(Self {
            norm1: LayerNorm::new(child_name(&name, "norm1"), dim),
            attn1: CrossAttention::new(child_name(&name, "attn1"), dim, dim, head_dim)?,
            norm2: LayerNorm::new(child_name(&name, "norm2"), dim),
            attn2: CrossAttention::new(child_name(&name, "attn2"), dim, context_dim, head_dim)?,
            norm3: LayerNorm::new(child_name(&name, "norm3"), dim),
            ff: FeedForward::new(child_name(&name, "ff"), dim),
            name,
        })
    }

    /// `x` is `[tokens, dim]`, `context` is `[m, context_dim]`.
    pub fn forward(&self, ctx: &Context, x: &DeviceBuffer, context: &DeviceBuffer, waits: &[CompletionToken]) -> Result<Pending> {
        let started = Instant::now();

        let normed = self.norm1.forward(ctx, x, waits)?;
        let attended = self.attn1.forward(ctx, &normed.buffer, None, &normed.waits())?;
        let (h, token) = ctx.call::<AddOp>((x, &attended.buffer), &attended.waits())?;

        let normed = self.norm2.forward(ctx, &h, &[token])?;
        let attended = self.attn2.forward(ctx, &normed.buffer, Some(context), &normed.waits())?;
        let (h, token) = ctx.call::<AddOp>((&h, &attended.buffer), &attended.waits())?;

        let normed = self.norm3.forward(ctx, &h, &[token])?;
        let fed = self.ff.forward(ctx, &normed.buffer, &normed.waits())?;
        let (h, token) = ctx.call::<AddOp>((&h, &fed.buffer), &fed.waits())?;

        let out = Pending::new(h, token);
        ctx.module_output(&self.name, &out, started)?;
        Ok(out)
    }
}

impl Module for BasicTransformerBlock {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        self.norm1.visit_weights(visitor);
        self.attn1.visit_weights(visitor);
        self.norm2.visit_weights(visitor);
        self.attn2.visit_weights(visitor);
        self.norm3.visit_weights(visitor);
        self.ff.visit_weights(visitor);
    }
}

/// Transformer over the spatial positions of a `[C, H·W]` map, added back onto the map.
pub struct SpatialTransformer {
    name: String,
    norm: GroupNorm,
    proj_in: Linear,
    block: BasicTransformerBlock,
    proj_out: Linear,
    channels: usize,
}

impl SpatialTransformer {
    pub fn new(name: impl Into<String>, channels: usize, context_dim: usize, head_dim: usize, groups: usize) -> Result<Self> {
        let name = name.into();
        Ok(Self {
            norm: GroupNorm::new(child_name(&name, "norm"), channels, groups, 1e-6),
            proj_in: Linear::new(child_name(&name, "proj_in"), channels, channels, true),
            block: BasicTransformerBlock::new(child_name(&name, "transformer_blocks.0"), channels, context_dim, head_dim)?,
            proj_out: Linear::new(child_name(&name, "proj_out"), channels, channels, true),
            name,
            channels,
        })
    }

    pub fn forward(&self, ctx: &Context, x: &DeviceBuffer, context: &DeviceBuffer, waits: &[CompletionToken]) -> Result<Pending> {
        let started = Instant::now();
        if x.len() % self.channels != 0 {
            return Err(EngineError::mismatch("spatial transformer", x.len().next_multiple_of(self.channels), x.len()));
        }
        let positions = x.len() / self.channels;

        let normed = self.norm.forward(ctx, x, waits)?;
        // [C, HW] -> [HW, C]
        let (tokens, token) = ctx.call::<PermuteOp>((&normed.buffer, [self.channels, positions, 1]), &normed.waits())?;
        let h = self.proj_in.forward(ctx, &tokens, &[token])?;
        let h = self.block.forward(ctx, &h.buffer, context, &h.waits())?;
        let h = self.proj_out.forward(ctx, &h.buffer, &h.waits())?;
        let (h, token) = ctx.call::<PermuteOp>((&h.buffer, [positions, self.channels, 1]), &h.waits())?;
        let (out, token) = ctx.call::<AddOp>((x, &h), &[token])?;

        let out = Pending::new(out, token);
        ctx.module_output(&self.name, &out, started)?;
        Ok(out)
    }
}

impl Module for SpatialTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        self.norm.visit_weights(visitor);
        self.proj_in.visit_weights(visitor);
        self.block.visit_weights(visitor);
        self.proj_out.visit_weights(visitor);
    }
}

#[cfg(test)]
mod transformer_test {
    use super::*;
    use crate::nn::test_util::{host_ctx, random_store, random_vec};

    #[test]
    fn test_spatial_transformer_preserves_shape() {
        let transformer = SpatialTransformer::new("input_blocks.1.1", 16, 8, 8, 4).unwrap();
        let names: Vec<_> = transformer.weights().iter().map(|w| w.name().to_string()).collect();
        assert!(names.contains(&"input_blocks.1.1.transformer_blocks.0.attn2.to_k.weight".to_string()));
        assert!(names.contains(&"input_blocks.1.1.transformer_blocks.0.ff.net.2.bias".to_string()));

        let ctx = host_ctx(random_store(&transformer, 21));
        let x = ctx.upload(&random_vec(16 * 4 * 4, 1)).unwrap();
        let context = ctx.upload(&random_vec(5 * 8, 2)).unwrap();
        let out = transformer.forward(&ctx, &x, &context, &[]).unwrap();
        let values = ctx.read(&out.buffer, &out.waits()).unwrap();
        assert_eq!(values.len(), 16 * 16);
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_zero_projection_is_identity() {
        let transformer = SpatialTransformer::new("st", 16, 8, 8, 4).unwrap();
        let mut store = random_store(&transformer, 22);
        store.insert("st.proj_out.weight", vec![16, 16], vec![0.0; 256]);
        store.insert("st.proj_out.bias", vec![16], vec![0.0; 16]);
        let ctx = host_ctx(store);

        let x = random_vec(16 * 4, 3);
        let input = ctx.upload(&x).unwrap();
        let context = ctx.upload(&random_vec(2 * 8, 4)).unwrap();
        let out = transformer.forward(&ctx, &input, &context, &[]).unwrap();
        assert_eq!(ctx.read(&out.buffer, &out.waits()).unwrap(), x);
    }
}
