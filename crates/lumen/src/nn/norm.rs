use std::time::Instant;

use super::{Module, child_name};
use crate::{
    Context, DeviceBuffer, Pending, backend::CompletionToken, error::Result, kernels::{GroupNormOp, LayerNormOp, NormArgs, ReductionMeanOp, ReductionVarianceOp}, weights::Weight
};

struct Affine {
    weight: Weight,
    bias: Weight,
}

impl Affine {
    fn new(name: &str, features: usize) -> Self {
        Self {
            weight: Weight::new(child_name(name, "weight"), vec![features]),
            bias: Weight::new(child_name(name, "bias"), vec![features]),
        }
    }

    fn visit<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        visitor(&self.weight);
        visitor(&self.bias);
    }
}

/// Mean and variance passes over `groups` runs; the variance waits on the mean.
fn statistics(
    ctx: &Context,
    input: &DeviceBuffer,
    groups: usize,
    waits: &[CompletionToken],
) -> Result<(DeviceBuffer, DeviceBuffer, CompletionToken)> {
    let (means, mean_done) = ctx.call::<ReductionMeanOp>((input, groups), waits)?;
    let (variances, variance_done) = ctx.call::<ReductionVarianceOp>((input, &means, groups), &[mean_done])?;
    Ok((means, variances, variance_done))
}

/// Group normalization over `[channels, spatial]` with per-channel affine.
pub struct GroupNorm {
    name: String,
    affine: Affine,
    channels: usize,
    groups: usize,
    eps: f32,
}

impl GroupNorm {
    pub const DEFAULT_EPS: f32 = 1e-5;

    pub fn new(name: impl Into<String>, channels: usize, groups: usize, eps: f32) -> Self {
        let name = name.into();
        Self {
            affine: Affine::new(&name, channels),
            name,
            channels,
            groups,
            eps,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn forward(&self, ctx: &Context, input: &DeviceBuffer, waits: &[CompletionToken]) -> Result<Pending> {
        let started = Instant::now();
        let weight = self.affine.weight.materialize(ctx)?;
        let bias = self.affine.bias.materialize(ctx)?;
        let (means, variances, ready) = statistics(ctx, input, self.groups, waits)?;
        let norm = NormArgs {
            input,
            means: &means,
            variances: &variances,
            weight: &weight,
            bias: &bias,
            eps: self.eps,
        };
        let (buffer, token) = ctx.call::<GroupNormOp>((norm, self.channels, self.groups), &[ready])?;
        let out = Pending::new(buffer, token);
        ctx.module_output(&self.name, &out, started)?;
        Ok(out)
    }
}

impl Module for GroupNorm {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        self.affine.visit(visitor);
    }
}

/// Per-row normalization over the trailing `features` values.
pub struct LayerNorm {
    name: String,
    affine: Affine,
    features: usize,
    eps: f32,
}

impl LayerNorm {
    pub const DEFAULT_EPS: f32 = 1e-5;

    pub fn new(name: impl Into<String>, features: usize) -> Self {
        let name = name.into();
        Self {
            affine: Affine::new(&name, features),
            name,
            features,
            eps: Self::DEFAULT_EPS,
        }
    }

    pub fn forward(&self, ctx: &Context, input: &DeviceBuffer, waits: &[CompletionToken]) -> Result<Pending> {
        let started = Instant::now();
        let weight = self.affine.weight.materialize(ctx)?;
        let bias = self.affine.bias.materialize(ctx)?;
        let rows = input.len() / self.features.max(1);
        let (means, variances, ready) = statistics(ctx, input, rows, waits)?;
        let norm = NormArgs {
            input,
            means: &means,
            variances: &variances,
            weight: &weight,
            bias: &bias,
            eps: self.eps,
        };
        let (buffer, token) = ctx.call::<LayerNormOp>((norm, self.features), &[ready])?;
        let out = Pending::new(buffer, token);
        ctx.module_output(&self.name, &out, started)?;
        Ok(out)
    }
}

impl Module for LayerNorm {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_weights<'a>(&'a self, visitor: &mut dyn FnMut(&'a Weight)) {
        self.affine.visit(visitor);
    }
}

#[cfg(test)]
mod norm_test {
    use super::*;
    use crate::{
        ErrorKind, nn::test_util::{assert_close, host_ctx, random_store, random_vec}, weights::{MemoryWeightStore, WeightStore}
    };

    #[test]
    fn test_group_norm_matches_reference() {
        let (channels, groups, spatial) = (8, 4, 16);
        let norm = GroupNorm::new("norm1", channels, groups, 1e-6);
        let store = random_store(&norm, 2);
        let gamma = store.load("norm1.weight").unwrap().data;
        let beta = store.load("norm1.bias").unwrap().data;
        let ctx = host_ctx(store);

        let x = random_vec(channels * spatial, 4);
        let input = ctx.upload(&x).unwrap();
        let out = norm.forward(&ctx, &input, &[]).unwrap();
        let actual = ctx.read(&out.buffer, &out.waits()).unwrap();

        let per_group = channels / groups * spatial;
        let mut expected = vec![0.0; x.len()];
        for (g, chunk) in x.chunks(per_group).enumerate() {
            let mean = chunk.iter().sum::<f32>() / per_group as f32;
            let var = chunk.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / per_group as f32;
            for (i, v) in chunk.iter().enumerate() {
                let c = (g * per_group + i) / spatial;
                expected[g * per_group + i] = (v - mean) / (var + 1e-6).sqrt() * gamma[c] + beta[c];
            }
        }
        assert_close(&actual, &expected, 1e-4);
    }

    #[test]
    fn test_constant_input_yields_bias() {
        let features = 32;
        let norm = LayerNorm::new("ln_1", features);
        let mut store = MemoryWeightStore::new();
        store.insert("ln_1.weight", vec![features], vec![3.0; features]);
        store.insert("ln_1.bias", vec![features], (0..features).map(|i| i as f32).collect());
        let ctx = host_ctx(store);

        let input = ctx.upload(&vec![7.5; 2 * features]).unwrap();
        let out = norm.forward(&ctx, &input, &[]).unwrap();
        let actual = ctx.read(&out.buffer, &out.waits()).unwrap();
        let expected: Vec<f32> = (0..2).flat_map(|_| (0..features).map(|i| i as f32)).collect();
        assert_close(&actual, &expected, 1e-3);
    }

    #[test]
    fn test_constant_groups_yield_bias() {
        let (channels, groups, spatial) = (8, 4, 16);
        let norm = GroupNorm::new("norm", channels, groups, GroupNorm::DEFAULT_EPS);
        let mut store = MemoryWeightStore::new();
        store.insert("norm.weight", vec![channels], vec![2.0; channels]);
        store.insert("norm.bias", vec![channels], (0..channels).map(|c| c as f32 - 3.0).collect());
        let ctx = host_ctx(store);

        // every group of two channels holds one value, different per group
        let per_group = channels / groups * spatial;
        let x: Vec<f32> = (0..groups).flat_map(|g| vec![0.5 + 1.5 * g as f32; per_group]).collect();
        let input = ctx.upload(&x).unwrap();
        let out = norm.forward(&ctx, &input, &[]).unwrap();
        let actual = ctx.read(&out.buffer, &out.waits()).unwrap();
        let expected: Vec<f32> = (0..channels).flat_map(|c| vec![c as f32 - 3.0; spatial]).collect();
        assert_close(&actual, &expected, 1e-3);
    }

    #[test]
    fn test_extent_must_match_reduction_width() {
        let norm = GroupNorm::new("norm", 4, 2, GroupNorm::DEFAULT_EPS);
        let ctx = host_ctx(random_store(&norm, 1));
        // 2 channels of 5 per group: 10 is not a multiple of 16
        let input = ctx.upload(&[1.0; 20]).unwrap();
        assert_eq!(norm.forward(&ctx, &input, &[]).unwrap_err().kind(), ErrorKind::ShapeMismatch);
    }
}
