use crate::{
    Context, DeviceBuffer, EngineError, Pending, backend::CompletionToken, error::Result, kernels::CopyBufferOp
};

/// Copy `first` then `second` end to end into `output`.
///
/// For `[C, H·W]` activations this is a concatenation along the channel axis. The two sizes
/// must add up to the output size exactly.
pub fn concat(
    ctx: &Context,
    first: &DeviceBuffer,
    second: &DeviceBuffer,
    output: &DeviceBuffer,
    waits: &[CompletionToken],
) -> Result<Pending> {
    if first.len() + second.len() != output.len() {
        return Err(EngineError::mismatch("concat", output.len(), first.len() + second.len()));
    }
    if first.same(output) || second.same(output) {
        return Err(EngineError::InvalidArgument("concat output aliases an input".into()));
    }
    let (_, head) = ctx.call::<CopyBufferOp>((first, output, 0), waits)?;
    let (buffer, tail) = ctx.call::<CopyBufferOp>((second, output, first.len()), &[head])?;
    Ok(Pending::new(buffer, tail))
}

#[cfg(test)]
mod concat_test {
    use std::sync::Arc;

    use super::*;
    use crate::{ErrorKind, weights::MemoryWeightStore};

    #[test]
    fn test_concat_places_inputs_end_to_end() {
        let ctx = Context::host(Arc::new(MemoryWeightStore::new()));
        let a = ctx.upload(&[1.0, 2.0, 3.0]).unwrap();
        let b = ctx.upload(&[4.0, 5.0]).unwrap();
        let out = ctx.alloc(5).unwrap();
        let joined = concat(&ctx, &a, &b, &out, &[]).unwrap();
        assert!(joined.buffer.same(&out));
        let values = ctx.read(&joined.buffer, &joined.waits()).unwrap();
        assert_eq!(&values[..3], &[1.0, 2.0, 3.0]);
        assert_eq!(&values[3..], &[4.0, 5.0]);
    }

    #[test]
    fn test_concat_rejects_size_mismatch() {
        let ctx = Context::host(Arc::new(MemoryWeightStore::new()));
        let a = ctx.upload(&[1.0; 4]).unwrap();
        let b = ctx.upload(&[1.0; 4]).unwrap();
        for len in [7, 9] {
            let out = ctx.alloc(len).unwrap();
            let err = concat(&ctx, &a, &b, &out, &[]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
        }
    }
}
