use thiserror::Error;

use crate::weights::npy::NpyError;

/// Coarse classification of every engine failure. All of them are fatal for the call that
/// raised them and none are retried.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A buffer or weight did not have the size or shape its consumer expects.
    ShapeMismatch,
    /// The kernel provider rejected a submission or failed while executing it.
    Backend,
    /// A weight could not be read from the store.
    ResourceLoad,
    /// A caller supplied an unusable parameter (step count, token id, configuration).
    InvalidArgument,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Dimension mismatch in {op}: expected {expected}, actual {actual}")]
    DimensionMismatch { op: &'static str, expected: usize, actual: usize },
    #[error("Invalid shape: {0}")]
    InvalidShape(String),
    #[error("Weight {name} has shape {actual:?}, module declares {expected:?}")]
    WeightShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Buffer creation failed with size {0}")]
    BufferCreationFailed(usize),
    #[error("Kernel {kernel} expects {expected} arguments, got {actual}")]
    KernelArity {
        kernel: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Invalid argument {index} for kernel {kernel}: {reason}")]
    InvalidKernelArgument {
        kernel: &'static str,
        index: usize,
        reason: String,
    },
    #[error("Completion token {0} was never issued by this queue")]
    UnknownToken(u64),
    #[error("Failed to load weight {name}: {source}")]
    ResourceLoad {
        name: String,
        #[source]
        source: NpyError,
    },
    #[error("Weight {0} not found in store")]
    WeightNotFound(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::DimensionMismatch { .. } | EngineError::InvalidShape(_) | EngineError::WeightShapeMismatch { .. } => {
                ErrorKind::ShapeMismatch
            }
            EngineError::BufferCreationFailed(_)
            | EngineError::KernelArity { .. }
            | EngineError::InvalidKernelArgument { .. }
            | EngineError::UnknownToken(_) => ErrorKind::Backend,
            EngineError::ResourceLoad { .. } | EngineError::WeightNotFound(_) => ErrorKind::ResourceLoad,
            EngineError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    pub(crate) fn mismatch(op: &'static str, expected: usize, actual: usize) -> Self {
        EngineError::DimensionMismatch { op, expected, actual }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod error_test {
    use super::*;

    #[test]
    fn test_kinds_follow_taxonomy() {
        assert_eq!(EngineError::mismatch("linear", 4, 3).kind(), ErrorKind::ShapeMismatch);
        assert_eq!(EngineError::UnknownToken(9).kind(), ErrorKind::Backend);
        assert_eq!(EngineError::WeightNotFound("x".into()).kind(), ErrorKind::ResourceLoad);
        let err = EngineError::ResourceLoad {
            name: "w".into(),
            source: NpyError::UnsupportedDtype("<f2".into()),
        };
        assert_eq!(err.kind(), ErrorKind::ResourceLoad);
        assert!(err.to_string().contains("<f2"));
    }
}
