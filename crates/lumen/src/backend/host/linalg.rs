//! Matrix products: projections, convolutions and attention contractions.

use rayon::prelude::*;

use super::expect_len;
use crate::{EngineError, error::Result, kernels::KernelCall};

/// Output rows computed together by the blocked projection.
const ROW_BLOCK: usize = 4;

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub(super) fn linear(call: &KernelCall, blocked: bool) -> Result<()> {
    let (input, weight, bias, output) = (call.buffer(0)?, call.buffer(1)?, call.optional_buffer(2)?, call.buffer(3)?);
    let (m, k, n) = (call.u32(4)?, call.u32(5)?, call.u32(6)?);
    let op = call.name();
    expect_len(op, input, m * k)?;
    expect_len(op, weight, n * k)?;
    expect_len(op, output, m * n)?;
    if let Some(bias) = bias {
        expect_len(op, bias, n)?;
    }

    let x = input.host_read();
    let w = weight.host_read();
    let bias = bias.map(|b| b.host_read());
    let bias = bias.as_deref().map(Vec::as_slice);
    let mut y = output.host_write();

    if !blocked {
        y.par_chunks_mut(n).enumerate().for_each(|(row, out)| {
            let xr = &x[row * k..(row + 1) * k];
            for (col, value) in out.iter_mut().enumerate() {
                *value = dot(xr, &w[col * k..(col + 1) * k]) + bias.map_or(0.0, |b| b[col]);
            }
        });
        return Ok(());
    }

    // Each weight row is streamed once per block of ROW_BLOCK input rows.
    y.par_chunks_mut(n * ROW_BLOCK).enumerate().for_each(|(block, out)| {
        let rows = out.len() / n;
        let base = block * ROW_BLOCK;
        for col in 0..n {
            let wr = &w[col * k..(col + 1) * k];
            let mut acc = [0.0f32; ROW_BLOCK];
            for (kk, wv) in wr.iter().enumerate() {
                for (r, slot) in acc.iter_mut().enumerate().take(rows) {
                    *slot += x[(base + r) * k + kk] * wv;
                }
            }
            let b = bias.map_or(0.0, |b| b[col]);
            for (r, value) in acc.iter().enumerate().take(rows) {
                out[r * n + col] = value + b;
            }
        }
    });
    Ok(())
}

pub(super) fn conv2d(call: &KernelCall) -> Result<()> {
    let (input, weight, bias, output) = (call.buffer(0)?, call.buffer(1)?, call.optional_buffer(2)?, call.buffer(3)?);
    let (in_ch, out_ch, size) = (call.u32(4)?, call.u32(5)?, call.u32(6)?);
    let (kernel, stride, padding, out_size) = (call.u32(7)?, call.u32(8)?, call.u32(9)?, call.u32(10)?);
    let op = call.name();
    expect_len(op, input, in_ch * size * size)?;
    expect_len(op, weight, out_ch * in_ch * kernel * kernel)?;
    expect_len(op, output, out_ch * out_size * out_size)?;
    if let Some(bias) = bias {
        expect_len(op, bias, out_ch)?;
    }

    let x = input.host_read();
    let w = weight.host_read();
    let bias = bias.map(|b| b.host_read());
    let bias = bias.as_deref().map(Vec::as_slice);
    let mut y = output.host_write();

    y.par_chunks_mut(out_size * out_size).enumerate().for_each(|(o, plane)| {
        let filters = &w[o * in_ch * kernel * kernel..(o + 1) * in_ch * kernel * kernel];
        for oy in 0..out_size {
            for ox in 0..out_size {
                let mut acc = bias.map_or(0.0, |b| b[o]);
                for c in 0..in_ch {
                    for ky in 0..kernel {
                        let Some(iy) = (oy * stride + ky).checked_sub(padding).filter(|iy| *iy < size) else {
                            continue;
                        };
                        for kx in 0..kernel {
                            let Some(ix) = (ox * stride + kx).checked_sub(padding).filter(|ix| *ix < size) else {
                                continue;
                            };
                            acc += x[(c * size + iy) * size + ix] * filters[(c * kernel + ky) * kernel + kx];
                        }
                    }
                }
                plane[oy * out_size + ox] = acc;
            }
        }
    });
    Ok(())
}

/// Unfold convolution windows into a `[in_ch·k·k, out_size²]` column matrix.
pub(super) fn im2col(call: &KernelCall) -> Result<()> {
    let (input, columns) = (call.buffer(0)?, call.buffer(1)?);
    let (in_ch, size, kernel, stride, padding, out_size) =
        (call.u32(2)?, call.u32(3)?, call.u32(4)?, call.u32(5)?, call.u32(6)?, call.u32(7)?);
    let op = call.name();
    let positions = out_size * out_size;
    expect_len(op, input, in_ch * size * size)?;
    expect_len(op, columns, in_ch * kernel * kernel * positions)?;

    let x = input.host_read();
    let mut cols = columns.host_write();
    cols.par_chunks_mut(positions).enumerate().for_each(|(row, out)| {
        let c = row / (kernel * kernel);
        let ky = (row / kernel) % kernel;
        let kx = row % kernel;
        for oy in 0..out_size {
            for ox in 0..out_size {
                let iy = (oy * stride + ky).checked_sub(padding).filter(|iy| *iy < size);
                let ix = (ox * stride + kx).checked_sub(padding).filter(|ix| *ix < size);
                out[oy * out_size + ox] = match (iy, ix) {
                    (Some(iy), Some(ix)) => x[(c * size + iy) * size + ix],
                    _ => 0.0,
                };
            }
        }
    });
    Ok(())
}

/// `out[o, p] = bias[o] + Σ_d weight[o, d] · columns[d, p]`.
pub(super) fn conv2d_matmul(call: &KernelCall) -> Result<()> {
    let (columns, weight, bias, output) = (call.buffer(0)?, call.buffer(1)?, call.optional_buffer(2)?, call.buffer(3)?);
    let (out_ch, depth, positions) = (call.u32(4)?, call.u32(5)?, call.u32(6)?);
    let op = call.name();
    expect_len(op, columns, depth * positions)?;
    expect_len(op, weight, out_ch * depth)?;
    expect_len(op, output, out_ch * positions)?;
    if let Some(bias) = bias {
        expect_len(op, bias, out_ch)?;
    }

    let cols = columns.host_read();
    let w = weight.host_read();
    let bias = bias.map(|b| b.host_read());
    let bias = bias.as_deref().map(Vec::as_slice);
    let mut y = output.host_write();
    y.par_chunks_mut(positions).enumerate().for_each(|(o, row)| {
        row.fill(bias.map_or(0.0, |b| b[o]));
        for d in 0..depth {
            let wv = w[o * depth + d];
            let col = &cols[d * positions..(d + 1) * positions];
            for (value, c) in row.iter_mut().zip(col) {
                *value += wv * c;
            }
        }
    });
    Ok(())
}

/// `out[b, i, j] = scale · Σ_k a[b, i, k] · b[b, j, k]`, optionally plus `mask[i, j]`.
pub(super) fn scores(call: &KernelCall, masked: bool) -> Result<()> {
    let shift = usize::from(masked);
    let (a, b) = (call.buffer(0)?, call.buffer(1)?);
    let mask = if masked { Some(call.buffer(2)?) } else { None };
    let output = call.buffer(2 + shift)?;
    let (batch, rows, cols, depth) = (call.u32(3 + shift)?, call.u32(4 + shift)?, call.u32(5 + shift)?, call.u32(6 + shift)?);
    let scale = call.f32(7 + shift)?;
    let op = call.name();
    expect_len(op, a, batch * rows * depth)?;
    expect_len(op, b, batch * cols * depth)?;
    expect_len(op, output, batch * rows * cols)?;
    if let Some(mask) = mask {
        expect_len(op, mask, rows * cols)?;
    }

    let lhs = a.host_read();
    let rhs = b.host_read();
    let mask = mask.map(|m| m.host_read());
    let mask = mask.as_deref().map(Vec::as_slice);
    let mut y = output.host_write();
    y.par_chunks_mut(cols).enumerate().for_each(|(row_index, out)| {
        let bi = row_index / rows;
        let i = row_index % rows;
        let q = &lhs[row_index * depth..(row_index + 1) * depth];
        for (j, value) in out.iter_mut().enumerate() {
            let k = &rhs[(bi * cols + j) * depth..(bi * cols + j + 1) * depth];
            *value = dot(q, k) * scale + mask.map_or(0.0, |m| m[i * cols + j]);
        }
    });
    Ok(())
}

/// `out[b, i, k] = Σ_j a[b, i, j] · b[b, j, k]`.
pub(super) fn weighted_sum(call: &KernelCall) -> Result<()> {
    let (a, b, output) = (call.buffer(0)?, call.buffer(1)?, call.buffer(2)?);
    let (batch, rows, inner, depth) = (call.u32(3)?, call.u32(4)?, call.u32(5)?, call.u32(6)?);
    let op = call.name();
    expect_len(op, a, batch * rows * inner)?;
    expect_len(op, b, batch * inner * depth)?;
    expect_len(op, output, batch * rows * depth)?;
    if depth == 0 {
        return Err(EngineError::InvalidShape(format!("{op} with zero depth")));
    }

    let weights = a.host_read();
    let values = b.host_read();
    let mut y = output.host_write();
    y.par_chunks_mut(depth).enumerate().for_each(|(row_index, out)| {
        let bi = row_index / rows;
        out.fill(0.0);
        for j in 0..inner {
            let p = weights[row_index * inner + j];
            let v = &values[(bi * inner + j) * depth..(bi * inner + j + 1) * depth];
            for (value, x) in out.iter_mut().zip(v) {
                *value += p * x;
            }
        }
    });
    Ok(())
}
