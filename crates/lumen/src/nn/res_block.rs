use std::time::Instant;

use super::{Conv2d, GroupNorm, Linear, Module, child_name};
use crate::{
    Context, DeviceBuffer, EngineError, Pending, backend::CompletionToken, context::{DispatchGraph, NodeId}, error::Result, kernels::{AddOp, ChunkwiseAddOp, SiluOp}, weights::Weight
};

/// Residual connection around two norm, SiLU and 3×3 conv stages.
///
/// The skip path is the identity when channel counts match and a 1×1 conv otherwise; the
/// choice is made once, at construction.
pub struct ResBlock {
    name: String,
    norm1: GroupNorm,
    conv1: Conv2d,
    time_proj: Option<Linear>,
    norm2: GroupNorm,
    conv2: Conv2d,
    skip: Option<Conv2d>,
    out_channels: usize,
}

impl ResBlock {
    /// Diffusion model block with a time embedding injection (`in_layers`, `emb_layers`,
    /// `out_layers`, `skip_connection`).
    pub fn unet(name: impl Into<String>, in_channels: usize, out_channels: usize, time_dim: usize, groups: usize) -> Self {
        let name = name.into();
        let eps = GroupNorm::DEFAULT_EPS;
        Self {
            norm1: GroupNorm::new(child_name(&name, "in_layers.0"), in_channels, groups, eps),
            conv1: Conv2d::new(child_name(&name, "in_layers.2"), in_channels, out_channels, 3, 1, 1),
            time_proj: Some(Linear::new(child_name(&name, "emb_layers.1"), time_dim, out_channels, true)),
            norm2: GroupNorm::new(child_name(&name, "out_layers.0"), out_channels, groups, eps),
            conv2: Conv2d::new(child_name(&name, "out_layers.3"), out_channels, out_channels, 3, 1, 1),
            skip: (in_channels != out_channels)
                .then(|| Conv2d::new(child_name(&name, "skip_connection"), in_channels, out_channels, 1, 1, 0)),
            name,
            out_channels,
        }
    }

    /// Autoencoder block without time embedding (`norm1`, `conv1`, `norm2`, `conv2`, `nin_shortcut`).
    pub fn vae(name: impl Into<String>, in_channels: usize, out_channels: usize, groups: usize) -> Self {
        let name = name.into();
        let eps = 1e-6;
        Self {
            norm1: GroupNorm::new(child_name(&name, "norm1"), in_channels, groups, eps),
            conv1: Conv2d::new(child_name(&name, "conv1"), in_channels, out_channels, 3, 1, 1),
            time_proj: None,
            norm2: GroupNorm::new(child_name(&name, "norm2"), out_channels, groups, eps),
            conv2: Conv2d::new(child_name(&name, "conv2"), out_channels, out_channels, 3, 1, 1),
            skip: (in_channels != out_channels)
                .then(|| Conv2d::new(child_name(&name, "nin_shortcut"), in_channels, out_channels, 1, 1, 0)),
            name,
            out_channels,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn has_projected_skip(&self) -> bool {
        self.skip.is_some()
    }

    /// `x` is `[in_channels, S, S]`; `emb` is the shared time embedding for diffusion blocks.
    pub fn forward(&self, ctx: &Context, x: &DeviceBuffer, emb: Option<&DeviceBuffer>, waits: &[CompletionToken]) -> Result<Pending> {
        let started = Instant::now();
        let mut graph = DispatchGraph::new(ctx, waits);
        let entry = [DispatchGraph::ENTRY];

        let (h, n) = graph.module(&entry, |ctx, waits| self.norm1.forward(ctx, x, waits))?;
        let (h, n) = graph.call::<SiluOp>(&h, &[n])?;
        let (mut h, mut n) = graph.module(&[n], |ctx, waits| self.conv1.forward(ctx, &h, waits))?;

        match (&self.time_proj, emb) {
            (Some(time_proj), Some(emb)) => {
                let (e, en) = graph.call::<SiluOp>(emb, &entry)?;
                let (e, en) = graph.module(&[en], |ctx, waits| time_proj.forward(ctx, &e, waits))?;
                (h, n) = graph.call::<ChunkwiseAddOp>((&h, &e), &[n, en])?;
            }
            (None, None) => {}
            (Some(_), None) => {
                return Err(EngineError::InvalidArgument(format!("{} needs a time embedding", self.name)));
            }
            (None, Some(_)) => {
                return Err(EngineError::InvalidArgument(format!("{} takes no time embedding", self.name)));
            }
        }

        let (h, n) = graph.module(&[n], |ctx, waits| self.norm2.forward(ctx, &h, waits))?;
        let (h, n) = graph.call::<SiluOp>(&h, &[n])?;
        let (h, n) = graph.module(&[n], |ctx, waits| self.conv2.forward(ctx, &h, waits))?;

        let (skip, s): (DeviceBuffer, NodeId) = match &self.skip {
            Some(skip) => graph.module(&entry, |ctx, waits| skip.forward(ctx, x, waits))?,
            None => (x.clone(), DispatchGraph::ENTRY),
        };
        let (out, o) = graph.call::<AddOp>((&skip, &h), &[s, n])?;

        let out = graph.finish(out, o)?;
        ctx.module_output(&self.name, &out, started)?;
        Ok(out)
    }
}

impl Module for ResBlock {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        self.norm1.visit_weights(visitor);
        self.conv1.visit_weights(visitor);
        if let Some(time_proj) = &self.time_proj {
            time_proj.visit_weights(visitor);
        }
        self.norm2.visit_weights(visitor);
        self.conv2.visit_weights(visitor);
        if let Some(skip) = &self.skip {
            skip.visit_weights(visitor);
        }
    }
}

#[cfg(test)]
mod res_block_test {
    use super::*;
    use crate::nn::test_util::{host_ctx, random_store, random_vec};

    #[test]
    fn test_skip_is_chosen_by_channels() {
        let same = ResBlock::unet("block", 8, 8, 16, 4);
        let widened = ResBlock::unet("block", 8, 16, 16, 4);
        assert!(!same.has_projected_skip());
        assert!(widened.has_projected_skip());
        assert!(widened.weights().iter().any(|w| w.name() == "block.skip_connection.weight"));
        assert!(ResBlock::vae("mid.block_1", 4, 8, 2).weights().iter().any(|w| w.name() == "mid.block_1.nin_shortcut.bias"));
    }

    #[test]
    fn test_forward_shapes() {
        let block = ResBlock::unet("block", 8, 16, 12, 4);
        let ctx = host_ctx(random_store(&block, 6));
        let x = ctx.upload(&random_vec(8 * 4 * 4, 1)).unwrap();
        let emb = ctx.upload(&random_vec(12, 2)).unwrap();
        let out = block.forward(&ctx, &x, Some(&emb), &[]).unwrap();
        let values = ctx.read(&out.buffer, &out.waits()).unwrap();
        assert_eq!(values.len(), 16 * 4 * 4);
        assert!(values.iter().all(|v| v.is_finite()));

        assert!(block.forward(&ctx, &x, None, &[]).is_err());
    }

    #[test]
    fn test_identity_skip_keeps_input() {
        // conv2 all zero makes the residual branch vanish
        let block = ResBlock::vae("res", 4, 4, 2);
        let mut store = random_store(&block, 7);
        store.insert("res.conv2.weight", vec![4, 4, 3, 3], vec![0.0; 4 * 4 * 9]);
        store.insert("res.conv2.bias", vec![4], vec![0.0; 4]);
        let ctx = host_ctx(store);

        let x = random_vec(4 * 4 * 4, 8);
        let input = ctx.upload(&x).unwrap();
        let out = block.forward(&ctx, &input, None, &[]).unwrap();
        assert_eq!(ctx.read(&out.buffer, &out.waits()).unwrap(), x);
    }
}
