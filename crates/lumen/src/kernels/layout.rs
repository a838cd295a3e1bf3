//! Data movement: permutes, resampling, copies and lookups.

use super::*;

/// `[d0, d1, d2] -> [d1, d0, d2]` (`permute3D__1_0_2`).
pub struct PermuteOp;

impl KernelInvocable for PermuteOp {
    type Args<'a> = (&'a DeviceBuffer, [usize; 3]);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (input, [d0, d1, d2]) = args;
        if input.len() != d0 * d1 * d2 {
            return Err(EngineError::mismatch("permute3D__1_0_2", d0 * d1 * d2, input.len()));
        }
        let output = ctx.alloc(input.len())?;
        let call = KernelCall::new(
            KernelFunction::Permute3D102,
            vec![input.into(), (&output).into(), dim(d0)?, dim(d1)?, dim(d2)?],
        );
        Ok((call, output))
    }
}

/// Nearest-neighbour ×2 upsampling of a square `[channels, S, S]` map.
pub struct UpsampleNearestOp;

impl KernelInvocable for UpsampleNearestOp {
    type Args<'a> = (&'a DeviceBuffer, usize);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (input, channels) = args;
        let area = if channels == 0 { 0 } else { input.len() / channels };
        let size = area.isqrt();
        if channels == 0 || input.len() % channels != 0 || size * size != area {
            return Err(EngineError::InvalidShape(format!(
                "up_sample_nearest: {} values are not {channels} square planes",
                input.len()
            )));
        }
        let output = ctx.alloc(input.len() * 4)?;
        let call = KernelCall::new(
            KernelFunction::UpSampleNearest,
            vec![input.into(), (&output).into(), dim(channels)?, dim(size)?],
        );
        Ok((call, output))
    }
}

/// Copy all of `source` into `destination` starting at element `offset`; returns the destination.
pub struct CopyBufferOp;

impl KernelInvocable for CopyBufferOp {
    type Args<'a> = (&'a DeviceBuffer, &'a DeviceBuffer, usize);

    fn new(_ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (source, destination, offset) = args;
        if offset + source.len() > destination.len() {
            return Err(EngineError::mismatch("copy_buffer", destination.len(), offset + source.len()));
        }
        let call = KernelCall::new(
            KernelFunction::CopyBuffer,
            vec![source.into(), destination.into(), dim(0)?, dim(offset)?, dim(source.len())?],
        );
        Ok((call, destination.clone()))
    }
}

/// Copy `len` elements starting at `offset` out of `source` into a new buffer.
pub struct SliceOp;

impl KernelInvocable for SliceOp {
    type Args<'a> = (&'a DeviceBuffer, usize, usize);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (source, offset, len) = args;
        if offset + len > source.len() {
            return Err(EngineError::mismatch("copy_buffer", source.len(), offset + len));
        }
        let output = ctx.alloc(len)?;
        let call = KernelCall::new(
            KernelFunction::CopyBuffer,
            vec![source.into(), (&output).into(), dim(offset)?, dim(0)?, dim(len)?],
        );
        Ok((call, output))
    }
}

/// Row gather from a `[vocab, width]` table, plus an optional positional table.
pub struct EmbeddingOp;

impl KernelInvocable for EmbeddingOp {
    type Args<'a> = (&'a DeviceBuffer, Option<&'a DeviceBuffer>, usize, &'a [u32]);

    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)> {
        let (table, positional, width, ids) = args;
        if ids.is_empty() {
            return Err(EngineError::InvalidArgument("embedding lookup without token ids".into()));
        }
        if width == 0 || table.len() % width != 0 {
            return Err(EngineError::InvalidShape(format!("embedding: table of {} values with width {width}", table.len())));
        }
        let vocab = table.len() / width;
        if let Some(bad) = ids.iter().find(|id| **id as usize >= vocab) {
            return Err(EngineError::InvalidArgument(format!("token id {bad} outside vocabulary of {vocab}")));
        }
        if let Some(positional) = positional
            && positional.len() != ids.len() * width
        {
            return Err(EngineError::mismatch("embedding positional", ids.len() * width, positional.len()));
        }
        let output = ctx.alloc(ids.len() * width)?;
        let call = KernelCall::new(
            KernelFunction::Embedding,
            vec![
                table.into(),
                positional.into(),
                (&output).into(),
                dim(width)?,
                KernelArg::U32List(Arc::from(ids)),
            ],
        );
        Ok((call, output))
    }
}

#[cfg(test)]
mod layout_test {
    use std::sync::Arc;

    use super::*;
    use crate::weights::MemoryWeightStore;

    fn ctx() -> Context {
        Context::host(Arc::new(MemoryWeightStore::new()))
    }

    #[test]
    fn test_permute_swaps_leading_axes() -> Result<()> {
        let ctx = ctx();
        // [2, 3, 1]
        let input = ctx.upload(&[0.0, 1.0, 2.0, 10.0, 11.0, 12.0])?;
        let (out, token) = ctx.call::<PermuteOp>((&input, [2, 3, 1]), &[])?;
        assert_eq!(ctx.read(&out, &[token])?, vec![0.0, 10.0, 1.0, 11.0, 2.0, 12.0]);
        Ok(())
    }

    #[test]
    fn test_upsample_repeats_pixels() -> Result<()> {
        let ctx = ctx();
        let input = ctx.upload(&[1.0, 2.0, 3.0, 4.0])?;
        let (out, token) = ctx.call::<UpsampleNearestOp>((&input, 1), &[])?;
        let values = ctx.read(&out, &[token])?;
        assert_eq!(&values[..4], &[1.0, 1.0, 2.0, 2.0]);
        assert_eq!(&values[12..], &[3.0, 3.0, 4.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_copy_and_slice() -> Result<()> {
        let ctx = ctx();
        let source = ctx.upload(&[1.0, 2.0, 3.0, 4.0])?;
        let (middle, token) = ctx.call::<SliceOp>((&source, 1, 2), &[])?;
        assert_eq!(ctx.read(&middle, &[token])?, vec![2.0, 3.0]);

        let destination = ctx.alloc(5)?;
        let (same, token) = ctx.call::<CopyBufferOp>((&middle, &destination, 3), &[token])?;
        assert!(same.same(&destination));
        assert_eq!(ctx.read(&destination, &[token])?, vec![0.0, 0.0, 0.0, 2.0, 3.0]);

        assert!(ctx.call::<CopyBufferOp>((&source, &destination, 2), &[]).is_err());
        assert!(ctx.call::<SliceOp>((&source, 3, 2), &[]).is_err());
        Ok(())
    }

    #[test]
    fn test_embedding_gathers_and_adds_positions() -> Result<()> {
        let ctx = ctx();
        let table = ctx.upload(&[0.0, 0.0, 1.0, 1.0, 2.0, 2.0])?;
        let positions = ctx.upload(&[0.5, 0.5, 0.25, 0.25])?;
        let (out, token) = ctx.call::<EmbeddingOp>((&table, Some(&positions), 2, &[2, 1]), &[])?;
        assert_eq!(ctx.read(&out, &[token])?, vec![2.5, 2.5, 1.25, 1.25]);

        let err = ctx.call::<EmbeddingOp>((&table, None, 2, &[3]), &[]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
        Ok(())
    }
}
