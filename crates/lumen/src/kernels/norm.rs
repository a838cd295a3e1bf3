//! The three normalization passes: mean, variance, normalize.

use super::*;

fn group_extent(ctx: &Context, op: &str, input: &DeviceBuffer, groups: usize) -> Result<usize> {
    if groups == 0 || input.len() % groups != 0 {
        return Err(EngineError::InvalidShape(format!("{op}: {} values do not split into {groups} groups", input.len())));
    }
    let extent = input.len() / groups;
    let width = ctx.reduction_width();
    if extent % width != 0 {
        return Err(EngineError::InvalidShape(format!(
            "{op}: normalized extent {extent} is not a multiple of the reduction width {width}"
        )));
    }
    Ok(extent)
}

/// Mean of each of `groups` contiguous runs (`local_reduction_mean`).
pub struct ReductionMeanOp;

impl KernelInvocable for ReductionMeanOp {
    type Args<'a> = (&'a DeviceBuffer, usize);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (input, groups) = args;
        let extent = group_extent(ctx, "local_reduction_mean", input, groups)?;
        let means = ctx.alloc(groups)?;
        let call = KernelCall::new(
            KernelFunction::LocalReductionMean,
            vec![input.into(), (&means).into(), dim(groups)?, dim(extent)?, dim(ctx.reduction_width())?],
        );
        Ok((call, means))
    }
}

/// Biased variance of each run around a precomputed mean (`local_reduction_variance`).
pub struct ReductionVarianceOp;

impl KernelInvocable for ReductionVarianceOp {
    type Args<'a> = (&'a DeviceBuffer, &'a DeviceBuffer, usize);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (input, means, groups) = args;
        let extent = group_extent(ctx, "local_reduction_variance", input, groups)?;
        if means.len() != groups {
            return Err(EngineError::mismatch("local_reduction_variance means", groups, means.len()));
        }
        let variances = ctx.alloc(groups)?;
        let call = KernelCall::new(
            KernelFunction::LocalReductionVariance,
            vec![
                input.into(),
                means.into(),
                (&variances).into(),
                dim(groups)?,
                dim(extent)?,
                dim(ctx.reduction_width())?,
            ],
        );
        Ok((call, variances))
    }
}

/// Statistics and affine parameters for the final normalize pass.
pub struct NormArgs<'a> {
    pub input: &'a DeviceBuffer,
    pub means: &'a DeviceBuffer,
    pub variances: &'a DeviceBuffer,
    pub weight: &'a DeviceBuffer,
    pub bias: &'a DeviceBuffer,
    pub eps: f32,
}

/// `(x − mean[g]) / sqrt(var[g] + eps) · weight[c] + bias[c]` over `[channels, spatial]`.
pub struct GroupNormOp;

impl KernelInvocable for GroupNormOp {
    /// (statistics, channels, groups)
    type Args<'a> = (NormArgs<'a>, usize, usize);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (norm, channels, groups) = args;
        if channels == 0 || groups == 0 || channels % groups != 0 || norm.input.len() % channels != 0 {
            return Err(EngineError::InvalidShape(format!(
                "group_norm: {} values, {channels} channels, {groups} groups",
                norm.input.len()
            )));
        }
        if norm.weight.len() != channels || norm.bias.len() != channels {
            return Err(EngineError::mismatch("group_norm affine", channels, norm.weight.len().min(norm.bias.len())));
        }
        let spatial = norm.input.len() / channels;
        let output = ctx.alloc(norm.input.len())?;
        let call = KernelCall::new(
            KernelFunction::GroupNorm,
            vec![
                norm.input.into(),
                norm.means.into(),
                norm.variances.into(),
                norm.weight.into(),
                norm.bias.into(),
                (&output).into(),
                dim(channels)?,
                dim(groups)?,
                dim(spatial)?,
                norm.eps.into(),
            ],
        );
        Ok((call, output))
    }
}

/// Per-row normalization over `features`.
pub struct LayerNormOp;

impl KernelInvocable for LayerNormOp {
    /// (statistics, features)
    type Args<'a> = (NormArgs<'a>, usize);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (norm, features) = args;
        if features == 0 || norm.input.len() % features != 0 {
            return Err(EngineError::InvalidShape(format!(
                "layer_norm: {} values are not rows of {features} features",
                norm.input.len()
            )));
        }
        if norm.weight.len() != features || norm.bias.len() != features {
            return Err(EngineError::mismatch("layer_norm affine", features, norm.weight.len().min(norm.bias.len())));
        }
        let rows = norm.input.len() / features;
        let output = ctx.alloc(norm.input.len())?;
        let call = KernelCall::new(
            KernelFunction::LayerNorm,
            vec![
                norm.input.into(),
                norm.means.into(),
                norm.variances.into(),
                norm.weight.into(),
                norm.bias.into(),
                (&output).into(),
                dim(rows)?,
                dim(features)?,
                norm.eps.into(),
            ],
        );
        Ok((call, output))
    }
}
