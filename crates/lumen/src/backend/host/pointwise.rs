//! Elementwise math and data movement.

use rayon::prelude::*;

use super::expect_len;
use crate::{EngineError, error::Result, kernels::KernelCall};

pub(super) fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Exact GELU, `0.5·x·(1 + erf(x/√2))`.
pub(crate) fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + erf(x * std::f32::consts::FRAC_1_SQRT_2))
}

// Abramowitz & Stegun 7.1.26, |error| < 1.5e-7.
fn erf(x: f32) -> f32 {
    let sign = x.signum();
    let x = f64::from(x.abs());
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t * (0.254_829_592 + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp()) as f32
}

pub(super) fn unary(call: &KernelCall, f: fn(f32) -> f32) -> Result<()> {
    let (input, output) = (call.buffer(0)?, call.buffer(1)?);
    expect_len(call.name(), output, input.len())?;
    let x = input.host_read();
    let mut y = output.host_write();
    y.par_iter_mut().zip(x.par_iter()).for_each(|(value, v)| *value = f(*v));
    Ok(())
}

pub(super) fn add(call: &KernelCall) -> Result<()> {
    let (a, b, output) = (call.buffer(0)?, call.buffer(1)?, call.buffer(2)?);
    let op = call.name();
    expect_len(op, b, a.len())?;
    expect_len(op, output, a.len())?;
    let (lhs, rhs) = (a.host_read(), b.host_read());
    let mut y = output.host_write();
    y.par_iter_mut()
        .zip(lhs.par_iter().zip(rhs.par_iter()))
        .for_each(|(value, (l, r))| *value = l + r);
    Ok(())
}

/// Add `values[c]` to every element of chunk `c`.
pub(super) fn chunkwise_add(call: &KernelCall) -> Result<()> {
    let (input, values, output) = (call.buffer(0)?, call.buffer(1)?, call.buffer(2)?);
    let (chunks, chunk_len) = (call.u32(3)?, call.u32(4)?);
    let op = call.name();
    expect_len(op, input, chunks * chunk_len)?;
    expect_len(op, values, chunks)?;
    expect_len(op, output, chunks * chunk_len)?;
    let (x, v) = (input.host_read(), values.host_read());
    let mut y = output.host_write();
    y.par_chunks_mut(chunk_len).enumerate().for_each(|(c, chunk)| {
        for (value, src) in chunk.iter_mut().zip(&x[c * chunk_len..(c + 1) * chunk_len]) {
            *value = src + v[c];
        }
    });
    Ok(())
}

/// Rows of `2·half` values; `out[r, i] = in[r, i] · gelu(in[r, half + i])`.
pub(super) fn gelu_multiply(call: &KernelCall) -> Result<()> {
    let (input, output) = (call.buffer(0)?, call.buffer(1)?);
    let (rows, half) = (call.u32(2)?, call.u32(3)?);
    let op = call.name();
    expect_len(op, input, rows * half * 2)?;
    expect_len(op, output, rows * half)?;
    let x = input.host_read();
    let mut y = output.host_write();
    y.par_chunks_mut(half).enumerate().for_each(|(r, row)| {
        let src = &x[r * 2 * half..(r + 1) * 2 * half];
        let (value, gate) = src.split_at(half);
        for ((out, a), g) in row.iter_mut().zip(value).zip(gate) {
            *out = a * gelu(*g);
        }
    });
    Ok(())
}

/// Nearest-neighbour ×2 on `[channels, size, size]`.
pub(super) fn upsample_nearest(call: &KernelCall) -> Result<()> {
    let (input, output) = (call.buffer(0)?, call.buffer(1)?);
    let (channels, size) = (call.u32(2)?, call.u32(3)?);
    let op = call.name();
    let out_size = size * 2;
    expect_len(op, input, channels * size * size)?;
    expect_len(op, output, channels * out_size * out_size)?;
    let x = input.host_read();
    let mut y = output.host_write();
    y.par_chunks_mut(out_size * out_size).enumerate().for_each(|(c, plane)| {
        let src = &x[c * size * size..(c + 1) * size * size];
        for oy in 0..out_size {
            for ox in 0..out_size {
                plane[oy * out_size + ox] = src[(oy / 2) * size + ox / 2];
            }
        }
    });
    Ok(())
}

/// `[d0, d1, d2] -> [d1, d0, d2]`.
pub(super) fn permute_102(call: &KernelCall) -> Result<()> {
    let (input, output) = (call.buffer(0)?, call.buffer(1)?);
    let (d0, d1, d2) = (call.u32(2)?, call.u32(3)?, call.u32(4)?);
    let op = call.name();
    expect_len(op, input, d0 * d1 * d2)?;
    expect_len(op, output, d0 * d1 * d2)?;
    let x = input.host_read();
    let mut y = output.host_write();
    y.par_chunks_mut(d2).enumerate().for_each(|(row, out)| {
        let (j, i) = (row / d0, row % d0);
        out.copy_from_slice(&x[(i * d1 + j) * d2..(i * d1 + j + 1) * d2]);
    });
    Ok(())
}

pub(super) fn copy_buffer(call: &KernelCall) -> Result<()> {
    let (source, destination) = (call.buffer(0)?, call.buffer(1)?);
    let (src_offset, dst_offset, len) = (call.u32(2)?, call.u32(3)?, call.u32(4)?);
    let op = call.name();
    if src_offset + len > source.len() {
        return Err(EngineError::mismatch(op, source.len(), src_offset + len));
    }
    if dst_offset + len > destination.len() {
        return Err(EngineError::mismatch(op, destination.len(), dst_offset + len));
    }
    let src = source.host_read();
    destination.host_write()[dst_offset..dst_offset + len].copy_from_slice(&src[src_offset..src_offset + len]);
    Ok(())
}

/// Gather table rows for `ids`, optionally adding a positional row per position.
pub(super) fn embedding(call: &KernelCall) -> Result<()> {
    let (table, positional, output) = (call.buffer(0)?, call.optional_buffer(1)?, call.buffer(2)?);
    let width = call.u32(3)?;
    let ids = call.u32_list(4)?;
    let op = call.name();
    if width == 0 || table.len() % width != 0 {
        return Err(EngineError::InvalidShape(format!("{op}: table of {} values with width {width}", table.len())));
    }
    let vocab = table.len() / width;
    if let Some(bad) = ids.iter().find(|id| **id as usize >= vocab) {
        return Err(EngineError::InvalidArgument(format!("token id {bad} outside vocabulary of {vocab}")));
    }
    expect_len(op, output, ids.len() * width)?;
    if let Some(positional) = positional {
        expect_len(op, positional, ids.len() * width)?;
    }

    let rows = table.host_read();
    let positional = positional.map(|p| p.host_read());
    let positional = positional.as_deref().map(Vec::as_slice);
    let mut y = output.host_write();
    y.par_chunks_mut(width).enumerate().for_each(|(t, out)| {
        let id = ids[t] as usize;
        out.copy_from_slice(&rows[id * width..(id + 1) * width]);
        if let Some(pos) = positional {
            for (value, p) in out.iter_mut().zip(&pos[t * width..(t + 1) * width]) {
                *value += p;
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod pointwise_test {
    use super::*;

    #[test]
    fn test_gelu_matches_known_values() {
        assert!((gelu(0.0)).abs() < 1e-7);
        assert!((gelu(1.0) - 0.841_344_7).abs() < 1e-5);
        assert!((gelu(-1.0) + 0.158_655_3).abs() < 1e-5);
        assert!((gelu(3.0) - 2.995_950_3).abs() < 1e-5);
    }

    #[test]
    fn test_silu_is_x_times_sigmoid() {
        assert_eq!(silu(0.0), 0.0);
        assert!((silu(2.0) - 2.0 / (1.0 + (-2.0f32).exp())).abs() < 1e-7);
    }
}
