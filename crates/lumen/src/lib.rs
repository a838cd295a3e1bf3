pub use buffer::DeviceBuffer;
pub use context::{Context, DispatchGraph, KernelStrategies, Pending};
pub use error::{EngineError, ErrorKind, Result};
pub use pipeline::{Pipeline, PipelineConfig};
pub use tokenizer::{TokenIdTokenizer, Tokenizer};

pub mod backend;
pub mod buffer;
pub mod context;
pub mod error;
pub mod kernels;
pub mod models;
pub mod nn;
pub mod pipeline;
pub mod sampler;
pub mod tokenizer;
pub mod weights;
