use std::time::Instant;

use super::{Conv2d, GroupNorm, Module, child_name};
use crate::{
    Context, DeviceBuffer, EngineError, Pending, backend::CompletionToken, context::DispatchGraph, error::Result, kernels::{AddOp, BatchDims, PermuteOp, ScoresOp, SoftmaxOp, WeightedSumOp}, weights::Weight
};

/// Single-head spatial self-attention of the autoencoder, with 1×1 conv projections.
pub struct AttnBlock {
    name: String,
    norm: GroupNorm,
    q: Conv2d,
    k: Conv2d,
    v: Conv2d,
    proj_out: Conv2d,
    channels: usize,
}

impl AttnBlock {
    pub fn new(name: impl Into<String>, channels: usize, groups: usize) -> Self {
        let name = name.into();
        let pointwise = |child: &str| Conv2d::new(child_name(&name, child), channels, channels, 1, 1, 0);
        Self {
            norm: GroupNorm::new(child_name(&name, "norm"), channels, groups, 1e-6),
            q: pointwise("q"),
            k: pointwise("k"),
            v: pointwise("v"),
            proj_out: pointwise("proj_out"),
            name,
            channels,
        }
    }

    pub fn forward(&self, ctx: &Context, x: &DeviceBuffer, waits: &[CompletionToken]) -> Result<Pending> {
        let started = Instant::now();
        if x.len() % self.channels != 0 {
            return Err(EngineError::mismatch("attn_block", x.len().next_multiple_of(self.channels), x.len()));
        }
        let positions = x.len() / self.channels;
        let layout = [self.channels, positions, 1];

        let mut graph = DispatchGraph::new(ctx, waits);
        let (h, n) = graph.module(&[DispatchGraph::ENTRY], |ctx, waits| self.norm.forward(ctx, x, waits))?;
        let (q, qn) = graph.module(&[n], |ctx, waits| self.q.forward(ctx, &h, waits))?;
        let (k, kn) = graph.module(&[n], |ctx, waits| self.k.forward(ctx, &h, waits))?;
        let (v, vn) = graph.module(&[n], |ctx, waits| self.v.forward(ctx, &h, waits))?;
        // [C, HW] -> [HW, C]
        let (q, qn) = graph.call::<PermuteOp>((&q, layout), &[qn])?;
        let (k, kn) = graph.call::<PermuteOp>((&k, layout), &[kn])?;
        let (v, vn) = graph.call::<PermuteOp>((&v, layout), &[vn])?;

        let dims = BatchDims {
            batch: 1,
            rows: positions,
            cols: positions,
            depth: self.channels,
        };
        let scale = 1.0 / (self.channels as f32).sqrt();
        let (scores, s) = graph.call::<ScoresOp>((&q, &k, dims, scale), &[qn, kn])?;
        let (probs, p) = graph.call::<SoftmaxOp>((&scores, positions), &[s])?;
        let (h, n) = graph.call::<WeightedSumOp>((&probs, &v, dims), &[p, vn])?;
        let (h, n) = graph.call::<PermuteOp>((&h, [positions, self.channels, 1]), &[n])?;
        let (h, n) = graph.module(&[n], |ctx, waits| self.proj_out.forward(ctx, &h, waits))?;
        let (out, o) = graph.call::<AddOp>((x, &h), &[DispatchGraph::ENTRY, n])?;

        let out = graph.finish(out, o)?;
        ctx.module_output(&self.name, &out, started)?;
        Ok(out)
    }
}

impl Module for AttnBlock {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        self.norm.visit_weights(visitor);
        for conv in [&self.q, &self.k, &self.v, &self.proj_out] {
            conv.visit_weights(visitor);
        }
    }
}

#[cfg(test)]
mod attn_block_test {
    use super::*;
    use crate::nn::test_util::{host_ctx, random_store, random_vec};

    #[test]
    fn test_attn_block_residual() {
        let block = AttnBlock::new("mid.attn_1", 8, 2);
        assert_eq!(block.weights().len(), 10);

        let mut store = random_store(&block, 41);
        let ctx = host_ctx(store.clone());
        let x = random_vec(8 * 4 * 4, 1);
        let input = ctx.upload(&x).unwrap();
        let out = block.forward(&ctx, &input, &[]).unwrap();
        let values = ctx.read(&out.buffer, &out.waits()).unwrap();
        assert_eq!(values.len(), x.len());
        assert_ne!(values, x);

        store.insert("mid.attn_1.proj_out.weight", vec![8, 8, 1, 1], vec![0.0; 64]);
        store.insert("mid.attn_1.proj_out.bias", vec![8], vec![0.0; 8]);
        let block = AttnBlock::new("mid.attn_1", 8, 2);
        let ctx = host_ctx(store);
        let input = ctx.upload(&x).unwrap();
        let out = block.forward(&ctx, &input, &[]).unwrap();
        assert_eq!(ctx.read(&out.buffer, &out.waits()).unwrap(), x);
    }
}
