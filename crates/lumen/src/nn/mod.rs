//! Neural network modules.
//!
//! A module owns its weights and its children by value. `forward` consumes input buffers and
//! a wait list and returns the output buffer with the one token that completes it; nothing
//! blocks on the host.

mod attention;
mod attn_block;
mod concat;
mod conv2d;
mod feed_forward;
mod linear;
mod norm;
mod res_block;
mod residual_attention;
mod transformer;
mod upsample;

pub use attention::{CrossAttention, MultiHeadAttention, causal_mask};
pub use attn_block::AttnBlock;
pub use concat::concat;
pub use conv2d::Conv2d;
pub use feed_forward::{FeedForward, Geglu};
pub use linear::Linear;
pub use norm::{GroupNorm, LayerNorm};
pub use res_block::ResBlock;
pub use residual_attention::ResidualAttentionBlock;
pub use transformer::{BasicTransformerBlock, SpatialTransformer};
pub use upsample::Upsample;

use crate::{Context, error::Result, weights::Weight};

pub trait Module {
    /// Dotted path of this module; weight names and hook reports are derived from it.
    fn name(&self) -> &str;

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight));

    fn weights(&self) -> Vec<&Weight> {
        let mut all = Vec::new();
        self.visit_weights(&mut |weight| all.push(weight));
        all
    }

    /// Materialize every weight ahead of the first forward.
    fn init(&self, ctx: &Context) -> Result<()> {
        for weight in self.weights() {
            weight.materialize(ctx)?;
        }
        Ok(())
    }

    /// Drop every device copy; a later forward reloads on demand.
    fn release(&self) {
        for weight in self.weights() {
            weight.release();
        }
    }

    fn weight_bytes(&self) -> u64 {
        self.weights().iter().map(|weight| weight.size_bytes()).sum()
    }
}

/// `{prefix}.{child}`, or `child` alone for an empty prefix.
pub(crate) fn child_name(prefix: &str, child: impl std::fmt::Display) -> String {
    if prefix.is_empty() {
        child.to_string()
    } else {
        format!("{prefix}.{child}")
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::Arc;

    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::Module;
    use crate::{Context, weights::MemoryWeightStore};

    /// Fill a store with small deterministic values for every weight `module` declares.
    /// Norm weights start near one so activations keep their scale.
    pub fn random_store(module: &dyn Module, seed: u64) -> MemoryWeightStore {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut store = MemoryWeightStore::new();
        for weight in module.weights() {
            let fan_in = weight.shape().iter().skip(1).product::<usize>().max(1) as f32;
            let scale = 1.0 / fan_in.sqrt();
            let is_norm_scale = weight.shape().len() == 1 && weight.name().ends_with(".weight");
            let data = (0..weight.element_count())
                .map(|_| {
                    let noise: f32 = rng.random_range(-1.0..1.0);
                    if is_norm_scale { 1.0 + 0.1 * noise } else { noise * scale }
                })
                .collect();
            store.insert(weight.name(), weight.shape().to_vec(), data);
        }
        store
    }

    pub fn host_ctx(store: MemoryWeightStore) -> Context {
        Context::host(Arc::new(store)).with_reduction_width(16)
    }

    pub fn random_vec(len: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
    }

    pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
        assert_eq!(actual.len(), expected.len(), "length mismatch");
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!((a - e).abs() < tolerance, "element {i}: {a} vs {e}");
        }
    }
}
