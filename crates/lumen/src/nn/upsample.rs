use std::time::Instant;

use super::{Conv2d, Module, child_name};
use crate::{
    Context, DeviceBuffer, Pending, backend::CompletionToken, error::Result, kernels::UpsampleNearestOp, weights::Weight
};

/// Nearest-neighbour ×2 followed by a 3×3 conv.
pub struct Upsample {
    name: String,
    conv: Conv2d,
    channels: usize,
}

impl Upsample {
    pub fn new(name: impl Into<String>, channels: usize) -> Self {
        let name = name.into();
        Self {
            conv: Conv2d::new(child_name(&name, "conv"), channels, channels, 3, 1, 1),
            name,
            channels,
        }
    }

    pub fn forward(&self, ctx: &Context, x: &DeviceBuffer, waits: &[CompletionToken]) -> Result<Pending> {
        let started = Instant::now();
        let (doubled, token) = ctx.call::<UpsampleNearestOp>((x, self.channels), waits)?;
        let out = self.conv.forward(ctx, &doubled, &[token])?;
        ctx.module_output(&self.name, &out, started)?;
        Ok(out)
    }
}

impl Module for Upsample {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        self.conv.visit_weights(visitor);
    }
}
