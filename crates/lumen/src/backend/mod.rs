//! Kernel capability providers.

pub mod host;

pub use host::HostBackend;

use crate::{DeviceBuffer, error::Result, kernels::KernelCall};

/// Marks the completion of one queued operation.
///
/// Every dispatch yields exactly one token; tokens passed as waits form the dependency DAG
/// of a forward pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompletionToken(u64);

impl CompletionToken {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CompletionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A device that allocates buffers and executes named kernels on a single in-order queue.
///
/// `dispatch` never blocks on the work it submits. The host only blocks in `wait`, `read`
/// and `finish`.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Allocate a zero-filled buffer of `elements` f32 values.
    fn alloc(&self, elements: usize) -> Result<DeviceBuffer>;

    /// Allocate a buffer holding a copy of `data`.
    fn upload(&self, data: &[f32]) -> Result<DeviceBuffer>;

    /// Queue `call` behind `waits`. Every wait must be a token issued by this backend.
    fn dispatch(&self, call: KernelCall, waits: &[CompletionToken]) -> Result<CompletionToken>;

    /// Block until the operation behind `token` completed.
    fn wait(&self, token: CompletionToken) -> Result<()>;

    /// Block on `after`, then copy the buffer back to the host.
    fn read(&self, buffer: &DeviceBuffer, after: &[CompletionToken]) -> Result<Vec<f32>>;

    /// Block until every queued operation completed.
    fn finish(&self) -> Result<()>;

    /// Operations submitted but not yet completed.
    fn pending(&self) -> usize;
}
