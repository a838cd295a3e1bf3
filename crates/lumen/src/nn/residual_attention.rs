use std::time::Instant;

use super::{LayerNorm, Linear, Module, MultiHeadAttention, child_name};
use crate::{
    Context, DeviceBuffer, Pending, backend::CompletionToken, error::Result, kernels::{AddOp, GeluOp}, weights::Weight
};

/// Text transformer layer: masked self-attention then a GELU MLP, both pre-normed.
pub struct ResidualAttentionBlock {
    name: String,
    ln_1: LayerNorm,
    attn: MultiHeadAttention,
    ln_2: LayerNorm,
    c_fc: Linear,
    c_proj: Linear,
}

impl ResidualAttentionBlock {
    pub const MLP_RATIO: usize = 4;

    pub fn new(name: impl Into<String>, dim: usize, heads: usize) -> Result<Self> {
        let name = name.into();
        let hidden = dim * Self::MLP_RATIO;
        Ok(Self {
            ln_1: LayerNorm::new(child_name(&name, "ln_1"), dim),
            attn: MultiHeadAttention::new(child_name(&name, "attn"), dim, heads)?,
            ln_2: LayerNorm::new(child_name(&name, "ln_2"), dim),
            c_fc: Linear::new(child_name(&name, "mlp.c_fc"), dim, hidden, true),
            c_proj: Linear::new(child_name(&name, "mlp.c_proj"), hidden, dim, true),
            name,
        })
    }

    pub fn forward(&self, ctx: &Context, x: &DeviceBuffer, mask: Option<&DeviceBuffer>, waits: &[CompletionToken]) -> Result<Pending> {
        let started = Instant::now();

        let normed = self.ln_1.forward(ctx, x, waits)?;
        let attended = self.attn.forward(ctx, &normed.buffer, mask, &normed.waits())?;
        let (h, token) = ctx.call::<AddOp>((x, &attended.buffer), &attended.waits())?;

        let normed = self.ln_2.forward(ctx, &h, &[token])?;
        let hidden = self.c_fc.forward(ctx, &normed.buffer, &normed.waits())?;
        let (activated, gelu_done) = ctx.call::<GeluOp>(&hidden.buffer, &hidden.waits())?;
        let projected = self.c_proj.forward(ctx, &activated, &[gelu_done])?;
        let (out, token) = ctx.call::<AddOp>((&h, &projected.buffer), &projected.waits())?;

        let out = Pending::new(out, token);
        ctx.module_output(&self.name, &out, started)?;
        Ok(out)
    }
}

impl Module for ResidualAttentionBlock {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        self.ln_1.visit_weights(visitor);
        self.attn.visit_weights(visitor);
        self.ln_2.visit_weights(visitor);
        self.c_fc.visit_weights(visitor);
        self.c_proj.visit_weights(visitor);
    }
}
