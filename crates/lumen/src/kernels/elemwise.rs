use super::*;

fn unary(ctx: &Context, function: KernelFunction, input: &DeviceBuffer) -> Result<(KernelCall, DeviceBuffer)> {
    let output = ctx.alloc(input.len())?;
    Ok((KernelCall::new(function, vec![input.into(), (&output).into()]), output))
}

/// `a + b` over equally sized buffers.
pub struct AddOp;

impl KernelInvocable for AddOp {
    type Args<'a> = (&'a DeviceBuffer, &'a DeviceBuffer);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (a, b) = args;
        if a.len() != b.len() {
            return Err(EngineError::mismatch("elemwise_add", a.len(), b.len()));
        }
        let output = ctx.alloc(a.len())?;
        Ok((KernelCall::new(KernelFunction::ElemwiseAdd, vec![a.into(), b.into(), (&output).into()]), output))
    }
}

/// Broadcast one value per chunk, e.g. a per-channel time embedding over `[C, H·W]`.
pub struct ChunkwiseAddOp;

impl KernelInvocable for ChunkwiseAddOp {
    type Args<'a> = (&'a DeviceBuffer, &'a DeviceBuffer);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (input, values) = args;
        if values.is_empty() || input.len() % values.len() != 0 {
            return Err(EngineError::InvalidShape(format!(
                "chunkwise_add: {} values do not split into {} chunks",
                input.len(),
                values.len()
            )));
        }
        let output = ctx.alloc(input.len())?;
        let call = KernelCall::new(
            KernelFunction::ChunkwiseAdd,
            vec![
                input.into(),
                values.into(),
                (&output).into(),
                dim(values.len())?,
                dim(input.len() / values.len())?,
            ],
        );
        Ok((call, output))
    }
}

pub struct SiluOp;

impl KernelInvocable for SiluOp {
    type Args<'a> = &'a DeviceBuffer;

    fn new(ctx: &Context, input: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        unary(ctx, KernelFunction::Silu, input)
    }
}

pub struct GeluOp;

impl KernelInvocable for GeluOp {
    type Args<'a> = &'a DeviceBuffer;

    fn new(ctx: &Context, input: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        unary(ctx, KernelFunction::Gelu, input)
    }
}

/// GEGLU gate: rows of `[value | gate]`, each `half` wide, to `value · gelu(gate)`.
pub struct GeluMultiplyOp;

impl KernelInvocable for GeluMultiplyOp {
    type Args<'a> = (&'a DeviceBuffer, usize);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (input, half) = args;
        if half == 0 || input.len() % (2 * half) != 0 {
            return Err(EngineError::InvalidShape(format!(
                "gelu_multiply: {} values are not rows of 2×{half}",
                input.len()
            )));
        }
        let rows = input.len() / (2 * half);
        let output = ctx.alloc(rows * half)?;
        let call = KernelCall::new(
            KernelFunction::GeluMultiply,
            vec![input.into(), (&output).into(), dim(rows)?, dim(half)?],
        );
        Ok((call, output))
    }
}

#[cfg(test)]
mod elemwise_test {
    use std::sync::Arc;

    use super::*;
    use crate::{backend::host::gelu, weights::MemoryWeightStore};

    #[test]
    fn test_chunkwise_add_broadcasts_per_chunk() -> Result<()> {
        let ctx = Context::host(Arc::new(MemoryWeightStore::new()));
        let input = ctx.upload(&[1.0, 1.0, 1.0, 2.0, 2.0, 2.0])?;
        let values = ctx.upload(&[10.0, 20.0])?;
        let (out, token) = ctx.call::<ChunkwiseAddOp>((&input, &values), &[])?;
        assert_eq!(ctx.read(&out, &[token])?, vec![11.0, 11.0, 11.0, 22.0, 22.0, 22.0]);

        let odd = ctx.upload(&[1.0; 5])?;
        assert!(ctx.call::<ChunkwiseAddOp>((&odd, &values), &[]).is_err());
        Ok(())
    }

    #[test]
    fn test_gelu_multiply_splits_value_and_gate() -> Result<()> {
        let ctx = Context::host(Arc::new(MemoryWeightStore::new()));
        // Two rows: [a0 a1 | g0 g1]
        let data = [1.0, 2.0, 0.5, -1.0, 3.0, -2.0, 1.5, 0.0];
        let input = ctx.upload(&data)?;
        let (out, token) = ctx.call::<GeluMultiplyOp>((&input, 2), &[])?;
        let values = ctx.read(&out, &[token])?;
        let expected = [1.0 * gelu(0.5), 2.0 * gelu(-1.0), 3.0 * gelu(1.5), -2.0 * gelu(0.0)];
        for (a, e) in values.iter().zip(expected) {
            assert!((a - e).abs() < 1e-6);
        }
        Ok(())
    }
}
