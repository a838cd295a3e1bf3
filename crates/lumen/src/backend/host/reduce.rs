//! Local reductions, normalization and row softmax.

use rayon::prelude::*;

use super::expect_len;
use crate::{EngineError, error::Result, kernels::KernelCall};

fn check_width(op: &'static str, extent: usize, width: usize) -> Result<()> {
    if width == 0 || extent % width != 0 {
        return Err(EngineError::InvalidShape(format!(
            "{op}: extent {extent} is not a multiple of reduction width {width}"
        )));
    }
    Ok(())
}

/// Sum `values` as `width`-sized partial sums, the way a work group reduces locally.
fn local_sum(values: &[f32], width: usize, f: impl Fn(f32) -> f32) -> f32 {
    values.chunks(width).map(|chunk| chunk.iter().map(|v| f(*v)).sum::<f32>()).sum()
}

pub(super) fn mean(call: &KernelCall) -> Result<()> {
    let (input, means) = (call.buffer(0)?, call.buffer(1)?);
    let (groups, extent, width) = (call.u32(2)?, call.u32(3)?, call.u32(4)?);
    let op = call.name();
    check_width(op, extent, width)?;
    expect_len(op, input, groups * extent)?;
    expect_len(op, means, groups)?;

    let x = input.host_read();
    let mut out = means.host_write();
    out.par_iter_mut().enumerate().for_each(|(g, mean)| {
        *mean = local_sum(&x[g * extent..(g + 1) * extent], width, |v| v) / extent as f32;
    });
    Ok(())
}

pub(super) fn variance(call: &KernelCall) -> Result<()> {
    let (input, means, variances) = (call.buffer(0)?, call.buffer(1)?, call.buffer(2)?);
    let (groups, extent, width) = (call.u32(3)?, call.u32(4)?, call.u32(5)?);
    let op = call.name();
    check_width(op, extent, width)?;
    expect_len(op, input, groups * extent)?;
    expect_len(op, means, groups)?;
    expect_len(op, variances, groups)?;

    let x = input.host_read();
    let mu = means.host_read();
    let mut out = variances.host_write();
    out.par_iter_mut().enumerate().for_each(|(g, var)| {
        let m = mu[g];
        *var = local_sum(&x[g * extent..(g + 1) * extent], width, |v| (v - m) * (v - m)) / extent as f32;
    });
    Ok(())
}

pub(super) fn group_norm(call: &KernelCall) -> Result<()> {
    let (input, means, variances) = (call.buffer(0)?, call.buffer(1)?, call.buffer(2)?);
    let (weight, bias, output) = (call.buffer(3)?, call.buffer(4)?, call.buffer(5)?);
    let (channels, groups, spatial) = (call.u32(6)?, call.u32(7)?, call.u32(8)?);
    let eps = call.f32(9)?;
    let op = call.name();
    if groups == 0 || channels % groups != 0 {
        return Err(EngineError::InvalidShape(format!("{op}: {channels} channels in {groups} groups")));
    }
    expect_len(op, input, channels * spatial)?;
    expect_len(op, output, channels * spatial)?;
    expect_len(op, means, groups)?;
    expect_len(op, variances, groups)?;
    expect_len(op, weight, channels)?;
    expect_len(op, bias, channels)?;

    let per_group = channels / groups;
    let (x, mu, var) = (input.host_read(), means.host_read(), variances.host_read());
    let (gamma, beta) = (weight.host_read(), bias.host_read());
    let mut y = output.host_write();
    y.par_chunks_mut(spatial).enumerate().for_each(|(c, plane)| {
        let g = c / per_group;
        let inv_std = 1.0 / (var[g] + eps).sqrt();
        let src = &x[c * spatial..(c + 1) * spatial];
        for (value, v) in plane.iter_mut().zip(src) {
            *value = (v - mu[g]) * inv_std * gamma[c] + beta[c];
        }
    });
    Ok(())
}

pub(super) fn layer_norm(call: &KernelCall) -> Result<()> {
    let (input, means, variances) = (call.buffer(0)?, call.buffer(1)?, call.buffer(2)?);
    let (weight, bias, output) = (call.buffer(3)?, call.buffer(4)?, call.buffer(5)?);
    let (rows, features) = (call.u32(6)?, call.u32(7)?);
    let eps = call.f32(8)?;
    let op = call.name();
    expect_len(op, input, rows * features)?;
    expect_len(op, output, rows * features)?;
    expect_len(op, means, rows)?;
    expect_len(op, variances, rows)?;
    expect_len(op, weight, features)?;
    expect_len(op, bias, features)?;

    let (x, mu, var) = (input.host_read(), means.host_read(), variances.host_read());
    let (gamma, beta) = (weight.host_read(), bias.host_read());
    let mut y = output.host_write();
    y.par_chunks_mut(features).enumerate().for_each(|(r, row)| {
        let inv_std = 1.0 / (var[r] + eps).sqrt();
        let src = &x[r * features..(r + 1) * features];
        for (f, (value, v)) in row.iter_mut().zip(src).enumerate() {
            *value = (v - mu[r]) * inv_std * gamma[f] + beta[f];
        }
    });
    Ok(())
}

pub(super) fn softmax(call: &KernelCall) -> Result<()> {
    let (input, output) = (call.buffer(0)?, call.buffer(1)?);
    let (rows, cols) = (call.u32(2)?, call.u32(3)?);
    let op = call.name();
    expect_len(op, input, rows * cols)?;
    expect_len(op, output, rows * cols)?;

    let x = input.host_read();
    let mut y = output.host_write();
    y.par_chunks_mut(cols).enumerate().for_each(|(r, row)| {
        let src = &x[r * cols..(r + 1) * cols];
        let max = src.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for (value, v) in row.iter_mut().zip(src) {
            *value = (v - max).exp();
            sum += *value;
        }
        for value in row.iter_mut() {
            *value /= sum;
        }
    });
    Ok(())
}
