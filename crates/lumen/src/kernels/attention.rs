//! Batched contractions used by attention.

use super::*;

/// Batched `[batch, rows, depth] × [batch, cols, depth]ᵀ` problem size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchDims {
    pub batch: usize,
    pub rows: usize,
    pub cols: usize,
    pub depth: usize,
}

impl BatchDims {
    fn args(&self) -> Result<[KernelArg; 4]> {
        Ok([dim(self.batch)?, dim(self.rows)?, dim(self.cols)?, dim(self.depth)?])
    }

    fn check(&self, op: &'static str, lhs: &DeviceBuffer, rhs: &DeviceBuffer) -> Result<()> {
        if lhs.len() != self.batch * self.rows * self.depth {
            return Err(EngineError::mismatch(op, self.batch * self.rows * self.depth, lhs.len()));
        }
        if rhs.len() != self.batch * self.cols * self.depth {
            return Err(EngineError::mismatch(op, self.batch * self.cols * self.depth, rhs.len()));
        }
        Ok(())
    }
}

/// Scaled scores `Q·Kᵀ · scale` (`einsum_bik_bjk_bij`).
pub struct ScoresOp;

impl KernelInvocable for ScoresOp {
    type Args<'a> = (&'a DeviceBuffer, &'a DeviceBuffer, BatchDims, f32);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (query, key, dims, scale) = args;
        dims.check("einsum_bik_bjk_bij", query, key)?;
        let output = ctx.alloc(dims.batch * dims.rows * dims.cols)?;
        let mut call_args = vec![query.into(), key.into(), (&output).into()];
        call_args.extend(dims.args()?);
        call_args.push(scale.into());
        Ok((KernelCall::new(KernelFunction::EinsumBikBjkBij, call_args), output))
    }
}

/// Scaled scores plus an additive `[rows, cols]` mask shared by every batch (`add_matmul_attention`).
pub struct MaskedScoresOp;

impl KernelInvocable for MaskedScoresOp {
    type Args<'a> = (&'a DeviceBuffer, &'a DeviceBuffer, &'a DeviceBuffer, BatchDims, f32);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (query, key, mask, dims, scale) = args;
        dims.check("add_matmul_attention", query, key)?;
        if mask.len() != dims.rows * dims.cols {
            return Err(EngineError::mismatch("add_matmul_attention mask", dims.rows * dims.cols, mask.len()));
        }
        let output = ctx.alloc(dims.batch * dims.rows * dims.cols)?;
        let mut call_args = vec![query.into(), key.into(), mask.into(), (&output).into()];
        call_args.extend(dims.args()?);
        call_args.push(scale.into());
        Ok((KernelCall::new(KernelFunction::AddMatmulAttention, call_args), output))
    }
}

/// Probabilities times values: `[batch, rows, cols] × [batch, cols, depth]` (`einsum_bij_bjk_bik`).
pub struct WeightedSumOp;

impl KernelInvocable for WeightedSumOp {
    type Args<'a> = (&'a DeviceBuffer, &'a DeviceBuffer, BatchDims);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (probs, values, dims) = args;
        if probs.len() != dims.batch * dims.rows * dims.cols {
            return Err(EngineError::mismatch("einsum_bij_bjk_bik", dims.batch * dims.rows * dims.cols, probs.len()));
        }
        if values.len() != dims.batch * dims.cols * dims.depth {
            return Err(EngineError::mismatch("einsum_bij_bjk_bik", dims.batch * dims.cols * dims.depth, values.len()));
        }
        let output = ctx.alloc(dims.batch * dims.rows * dims.depth)?;
        let mut call_args = vec![probs.into(), values.into(), (&output).into()];
        call_args.extend(dims.args()?);
        Ok((KernelCall::new(KernelFunction::EinsumBijBjkBik, call_args), output))
    }
}
