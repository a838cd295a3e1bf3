use super::*;

/// Numerically stable softmax over each row of `cols` values (`local_softmax`).
pub struct SoftmaxOp;

impl KernelInvocable for SoftmaxOp {
    type Args<'a> = (&'a DeviceBuffer, usize);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (input, cols) = args;
        if cols == 0 || input.len() % cols != 0 {
            return Err(EngineError::InvalidShape(format!("softmax: {} values are not rows of {cols}", input.len())));
        }
        let output = ctx.alloc(input.len())?;
        let call = KernelCall::new(
            KernelFunction::LocalSoftmax,
            vec![input.into(), (&output).into(), dim(input.len() / cols)?, dim(cols)?],
        );
        Ok((call, output))
    }
}

#[cfg(test)]
mod softmax_test {
    use std::sync::Arc;

    use super::*;
    use crate::weights::MemoryWeightStore;

    #[test]
    fn test_softmax_rows_are_distributions() -> Result<()> {
        let ctx = Context::host(Arc::new(MemoryWeightStore::new()));
        let data: Vec<f32> = (0..6 * 9).map(|i| ((i * 7919) % 23) as f32 - 11.0).collect();
        let input = ctx.upload(&data)?;
        let (out, token) = ctx.call::<SoftmaxOp>((&input, 9), &[])?;
        let values = ctx.read(&out, &[token])?;
        for row in values.chunks(9) {
            assert!(row.iter().all(|v| *v >= 0.0));
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "row sums to {sum}");
        }
        Ok(())
    }

    #[test]
    fn test_softmax_handles_masked_entries() -> Result<()> {
        let ctx = Context::host(Arc::new(MemoryWeightStore::new()));
        let input = ctx.upload(&[0.0, f32::NEG_INFINITY, 1000.0, 1000.0])?;
        let (out, token) = ctx.call::<SoftmaxOp>((&input, 2), &[])?;
        assert_eq!(ctx.read(&out, &[token])?, vec![1.0, 0.0, 0.5, 0.5]);
        Ok(())
    }
}
