//! The named kernel catalog and the typed operations that build calls against it.
//!
//! A kernel is addressed by name and bound positionally: every [`KernelFunction`] has a fixed
//! argument signature that backends validate before queueing a [`KernelCall`]. The typed
//! operations in the submodules validate shapes, allocate outputs and assemble the call so
//! modules never build argument lists by hand.

use std::sync::Arc;

use crate::{Context, DeviceBuffer, EngineError, error::Result};

pub mod attention;
pub mod conv;
pub mod elemwise;
pub mod layout;
pub mod linear;
pub mod norm;
pub mod softmax;

pub use attention::{BatchDims, MaskedScoresOp, ScoresOp, WeightedSumOp};
pub use conv::{Conv2dDirectOp, Conv2dMatmulOp, ConvGeometry, Im2ColOp};
pub use elemwise::{AddOp, ChunkwiseAddOp, GeluMultiplyOp, GeluOp, SiluOp};
pub use layout::{CopyBufferOp, EmbeddingOp, PermuteOp, SliceOp, UpsampleNearestOp};
pub use linear::{LinearArgs, LinearOp};
pub use norm::{GroupNormOp, LayerNormOp, NormArgs, ReductionMeanOp, ReductionVarianceOp};
pub use softmax::SoftmaxOp;

/// Uniquely identifies a kernel routine offered by a backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KernelFunction {
    Linear,
    RegLinear,
    Conv2d,
    Im2Col,
    Conv2dMatmul,
    LocalReductionMean,
    LocalReductionVariance,
    GroupNorm,
    LayerNorm,
    LocalSoftmax,
    EinsumBikBjkBij,
    AddMatmulAttention,
    EinsumBijBjkBik,
    Permute3D102,
    ElemwiseAdd,
    ChunkwiseAdd,
    Silu,
    Gelu,
    GeluMultiply,
    UpSampleNearest,
    CopyBuffer,
    Embedding,
}

/// Kind of a positional kernel argument.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Input,
    /// An input buffer that may be bound as [`KernelArg::Null`].
    OptionalInput,
    /// The buffer written by the kernel. It must not alias any input.
    Output,
    U32,
    F32,
    U32List,
}

use ArgKind::{F32, Input, OptionalInput, Output, U32, U32List};

impl KernelFunction {
    pub const ALL: [KernelFunction; 22] = [
        KernelFunction::Linear,
        KernelFunction::RegLinear,
        KernelFunction::Conv2d,
        KernelFunction::Im2Col,
        KernelFunction::Conv2dMatmul,
        KernelFunction::LocalReductionMean,
        KernelFunction::LocalReductionVariance,
        KernelFunction::GroupNorm,
        KernelFunction::LayerNorm,
        KernelFunction::LocalSoftmax,
        KernelFunction::EinsumBikBjkBij,
        KernelFunction::AddMatmulAttention,
        KernelFunction::EinsumBijBjkBik,
        KernelFunction::Permute3D102,
        KernelFunction::ElemwiseAdd,
        KernelFunction::ChunkwiseAdd,
        KernelFunction::Silu,
        KernelFunction::Gelu,
        KernelFunction::GeluMultiply,
        KernelFunction::UpSampleNearest,
        KernelFunction::CopyBuffer,
        KernelFunction::Embedding,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            KernelFunction::Linear => "linear",
            KernelFunction::RegLinear => "reg_linear",
            KernelFunction::Conv2d => "conv2d",
            KernelFunction::Im2Col => "im2col",
            KernelFunction::Conv2dMatmul => "conv2d_matmul",
            KernelFunction::LocalReductionMean => "local_reduction_mean",
            KernelFunction::LocalReductionVariance => "local_reduction_variance",
            KernelFunction::GroupNorm => "group_norm",
            KernelFunction::LayerNorm => "layer_norm",
            KernelFunction::LocalSoftmax => "local_softmax",
            KernelFunction::EinsumBikBjkBij => "einsum_bik_bjk_bij",
            KernelFunction::AddMatmulAttention => "add_matmul_attention",
            KernelFunction::EinsumBijBjkBik => "einsum_bij_bjk_bik",
            KernelFunction::Permute3D102 => "permute3D__1_0_2",
            KernelFunction::ElemwiseAdd => "elemwise_add",
            KernelFunction::ChunkwiseAdd => "chunkwise_add",
            KernelFunction::Silu => "silu",
            KernelFunction::Gelu => "gelu",
            KernelFunction::GeluMultiply => "gelu_multiply",
            KernelFunction::UpSampleNearest => "up_sample_nearest",
            KernelFunction::CopyBuffer => "copy_buffer",
            KernelFunction::Embedding => "embedding",
        }
    }

    pub fn from_name(name: &str) -> Option<KernelFunction> {
        Self::ALL.into_iter().find(|function| function.name() == name)
    }

    /// Positional argument layout.
    pub fn signature(&self) -> &'static [ArgKind] {
        match self {
            // input, weight, bias, output, m, k, n
            KernelFunction::Linear | KernelFunction::RegLinear => &[Input, Input, OptionalInput, Output, U32, U32, U32],
            // input, weight, bias, output, in_ch, out_ch, size, kernel, stride, padding, out_size
            KernelFunction::Conv2d => &[Input, Input, OptionalInput, Output, U32, U32, U32, U32, U32, U32, U32],
            // input, columns, in_ch, size, kernel, stride, padding, out_size
            KernelFunction::Im2Col => &[Input, Output, U32, U32, U32, U32, U32, U32],
            // columns, weight, bias, output, out_ch, depth, positions
            KernelFunction::Conv2dMatmul => &[Input, Input, OptionalInput, Output, U32, U32, U32],
            // input, means, groups, extent, width
            KernelFunction::LocalReductionMean => &[Input, Output, U32, U32, U32],
            // input, means, variances, groups, extent, width
            KernelFunction::LocalReductionVariance => &[Input, Input, Output, U32, U32, U32],
            // input, means, variances, weight, bias, output, channels, groups, spatial, eps
            KernelFunction::GroupNorm => &[Input, Input, Input, Input, Input, Output, U32, U32, U32, F32],
            // input, means, variances, weight, bias, output, rows, features, eps
            KernelFunction::LayerNorm => &[Input, Input, Input, Input, Input, Output, U32, U32, F32],
            // input, output, rows, cols
            KernelFunction::LocalSoftmax => &[Input, Output, U32, U32],
            // a, b, output, batch, i, j, k, scale
            KernelFunction::EinsumBikBjkBij => &[Input, Input, Output, U32, U32, U32, U32, F32],
            // a, b, mask, output, batch, i, j, k, scale
            KernelFunction::AddMatmulAttention => &[Input, Input, Input, Output, U32, U32, U32, U32, F32],
            // a, b, output, batch, i, j, k
            KernelFunction::EinsumBijBjkBik => &[Input, Input, Output, U32, U32, U32, U32],
            // input, output, d0, d1, d2
            KernelFunction::Permute3D102 => &[Input, Output, U32, U32, U32],
            // a, b, output
            KernelFunction::ElemwiseAdd => &[Input, Input, Output],
            // input, per-chunk values, output, chunks, chunk_len
            KernelFunction::ChunkwiseAdd => &[Input, Input, Output, U32, U32],
            KernelFunction::Silu | KernelFunction::Gelu => &[Input, Output],
            // input, output, rows, half
            KernelFunction::GeluMultiply => &[Input, Output, U32, U32],
            // input, output, channels, size
            KernelFunction::UpSampleNearest => &[Input, Output, U32, U32],
            // source, destination, source offset, destination offset, length
            KernelFunction::CopyBuffer => &[Input, Output, U32, U32, U32],
            // table, positional, output, width, ids
            KernelFunction::Embedding => &[Input, OptionalInput, Output, U32, U32List],
        }
    }
}

/// A positional argument bound to a kernel call.
#[derive(Clone, Debug)]
pub enum KernelArg {
    Buffer(DeviceBuffer),
    Null,
    U32(u32),
    F32(f32),
    U32List(Arc<[u32]>),
}

impl KernelArg {
    fn kind_name(&self) -> &'static str {
        match self {
            KernelArg::Buffer(_) => "buffer",
            KernelArg::Null => "null",
            KernelArg::U32(_) => "u32",
            KernelArg::F32(_) => "f32",
            KernelArg::U32List(_) => "u32 list",
        }
    }
}

impl From<&DeviceBuffer> for KernelArg {
    fn from(buffer: &DeviceBuffer) -> Self {
        KernelArg::Buffer(buffer.clone())
    }
}

impl From<Option<&DeviceBuffer>> for KernelArg {
    fn from(buffer: Option<&DeviceBuffer>) -> Self {
        buffer.map_or(KernelArg::Null, |b| KernelArg::Buffer(b.clone()))
    }
}

impl From<u32> for KernelArg {
    fn from(value: u32) -> Self {
        KernelArg::U32(value)
    }
}

impl From<f32> for KernelArg {
    fn from(value: f32) -> Self {
        KernelArg::F32(value)
    }
}

/// Convert a host dimension to a kernel scalar.
pub(crate) fn dim(value: usize) -> Result<KernelArg> {
    u32::try_from(value)
        .map(KernelArg::U32)
        .map_err(|_| EngineError::InvalidShape(format!("dimension {value} does not fit a u32 kernel argument")))
}

/// A named kernel plus its bound arguments, ready to be queued.
#[derive(Clone, Debug)]
pub struct KernelCall {
    pub function: KernelFunction,
    pub args: Vec<KernelArg>,
}

impl KernelCall {
    pub fn new(function: KernelFunction, args: Vec<KernelArg>) -> Self {
        Self { function, args }
    }

    pub fn name(&self) -> &'static str {
        self.function.name()
    }

    /// Check arity, argument kinds and output aliasing against the function's signature.
    pub fn validate(&self) -> Result<()> {
        let kernel = self.name();
        let signature = self.function.signature();
        if signature.len() != self.args.len() {
            return Err(EngineError::KernelArity {
                kernel,
                expected: signature.len(),
                actual: self.args.len(),
            });
        }

        let mismatch = |index: usize, expected: &str, arg: &KernelArg| EngineError::InvalidKernelArgument {
            kernel,
            index,
            reason: format!("expected {expected}, got {}", arg.kind_name()),
        };
        for (index, (kind, arg)) in signature.iter().zip(&self.args).enumerate() {
            match (kind, arg) {
                (Input | Output, KernelArg::Buffer(_))
                | (OptionalInput, KernelArg::Buffer(_) | KernelArg::Null)
                | (U32, KernelArg::U32(_))
                | (F32, KernelArg::F32(_))
                | (U32List, KernelArg::U32List(_)) => {}
                (Input | Output, _) => return Err(mismatch(index, "buffer", arg)),
                (OptionalInput, _) => return Err(mismatch(index, "buffer or null", arg)),
                (U32, _) => return Err(mismatch(index, "u32", arg)),
                (F32, _) => return Err(mismatch(index, "f32", arg)),
                (U32List, _) => return Err(mismatch(index, "u32 list", arg)),
            }
        }

        let Some(output_index) = signature.iter().position(|kind| *kind == Output) else {
            return Ok(());
        };
        let output = self.buffer(output_index)?;
        for (index, arg) in self.args.iter().enumerate() {
            if index != output_index
                && let KernelArg::Buffer(input) = arg
                && input.same(output)
            {
                return Err(EngineError::InvalidKernelArgument {
                    kernel,
                    index,
                    reason: "input aliases the output buffer".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Every buffer the call reads or writes.
    pub fn buffers(&self) -> impl Iterator<Item = &DeviceBuffer> {
        self.args.iter().filter_map(|arg| match arg {
            KernelArg::Buffer(buffer) => Some(buffer),
            _ => None,
        })
    }

    pub fn buffer(&self, index: usize) -> Result<&DeviceBuffer> {
        match self.args.get(index) {
            Some(KernelArg::Buffer(buffer)) => Ok(buffer),
            _ => Err(self.arg_error(index, "buffer")),
        }
    }

    pub fn optional_buffer(&self, index: usize) -> Result<Option<&DeviceBuffer>> {
        match self.args.get(index) {
            Some(KernelArg::Buffer(buffer)) => Ok(Some(buffer)),
            Some(KernelArg::Null) => Ok(None),
            _ => Err(self.arg_error(index, "buffer or null")),
        }
    }

    pub fn u32(&self, index: usize) -> Result<usize> {
        match self.args.get(index) {
            Some(KernelArg::U32(value)) => Ok(*value as usize),
            _ => Err(self.arg_error(index, "u32")),
        }
    }

    pub fn f32(&self, index: usize) -> Result<f32> {
        match self.args.get(index) {
            Some(KernelArg::F32(value)) => Ok(*value),
            _ => Err(self.arg_error(index, "f32")),
        }
    }

    pub fn u32_list(&self, index: usize) -> Result<&[u32]> {
        match self.args.get(index) {
            Some(KernelArg::U32List(values)) => Ok(values),
            _ => Err(self.arg_error(index, "u32 list")),
        }
    }

    fn arg_error(&self, index: usize, expected: &str) -> EngineError {
        EngineError::InvalidKernelArgument {
            kernel: self.name(),
            index,
            reason: format!("expected {expected}"),
        }
    }
}

/// A typed operation that can be submitted via [`Context::call`].
///
/// `new` validates the operands, allocates the output and binds the kernel arguments.
pub trait KernelInvocable {
    type Args<'a>;

    #[allow(clippy::new_ret_no_self)]
    fn new(ctx: &Context, args: Self::Args<'_>) -> Result<(KernelCall, DeviceBuffer)>;
}

#[cfg(test)]
mod kernels_test {
    use super::*;

    #[test]
    fn test_names_round_trip_through_catalog() {
        for function in KernelFunction::ALL {
            assert_eq!(KernelFunction::from_name(function.name()), Some(function));
            assert!(function.signature().iter().filter(|kind| **kind == Output).count() <= 1);
        }
        assert_eq!(KernelFunction::from_name("permute3D__1_0_2"), Some(KernelFunction::Permute3D102));
        assert_eq!(KernelFunction::from_name("softmax"), None);
    }

    #[test]
    fn test_validate_rejects_bad_bindings() {
        let a = DeviceBuffer::zeroed(4);
        let out = DeviceBuffer::zeroed(4);

        let ok = KernelCall::new(KernelFunction::Silu, vec![(&a).into(), (&out).into()]);
        assert!(ok.validate().is_ok());

        let short = KernelCall::new(KernelFunction::Silu, vec![(&a).into()]);
        assert!(matches!(short.validate(), Err(EngineError::KernelArity { expected: 2, actual: 1, .. })));

        let wrong_kind = KernelCall::new(KernelFunction::Silu, vec![(&a).into(), 3u32.into()]);
        assert!(matches!(wrong_kind.validate(), Err(EngineError::InvalidKernelArgument { index: 1, .. })));

        let aliased = KernelCall::new(KernelFunction::ElemwiseAdd, vec![(&a).into(), (&out).into(), (&a).into()]);
        assert!(matches!(aliased.validate(), Err(EngineError::InvalidKernelArgument { index: 0, .. })));

        let no_bias = KernelCall::new(
            KernelFunction::Linear,
            vec![(&a).into(), (&a).into(), KernelArg::Null, (&out).into(), 2u32.into(), 2u32.into(), 2u32.into()],
        );
        assert!(no_bias.validate().is_ok());
        assert_eq!(no_bias.buffers().count(), 3);
    }
}
