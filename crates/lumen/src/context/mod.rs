//! The execution context shared by every module forward.

mod graph;
mod hook;
mod strategy;

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use lumen_instrumentation::{MetricEvent, record_metric};

pub use graph::{DispatchGraph, NodeId};
pub use hook::{DispatchRecord, ForwardHook, ModuleDiff, RecordingHook, max_abs_diff};
pub use strategy::{ConvPath, ConvStrategy, KernelStrategies, MatmulStrategy};

use crate::{
    DeviceBuffer, backend::{Backend, CompletionToken, HostBackend}, error::Result, kernels::{KernelCall, KernelInvocable}, weights::WeightStore
};

/// Default element count reduced locally by the mean and variance kernels.
pub const DEFAULT_REDUCTION_WIDTH: usize = 64;

/// A buffer together with the token that completes it.
#[derive(Clone, Debug)]
pub struct Pending {
    pub buffer: DeviceBuffer,
    pub token: CompletionToken,
}

impl Pending {
    pub fn new(buffer: DeviceBuffer, token: CompletionToken) -> Self {
        Self { buffer, token }
    }

    /// The wait list a consumer of this buffer needs.
    pub fn waits(&self) -> [CompletionToken; 1] {
        [self.token]
    }
}

/// Backend, weight store, kernel strategies and an optional forward hook.
///
/// Modules hold no reference to the context; it is passed to every `init` and `forward`.
#[derive(Clone)]
pub struct Context {
    backend: Arc<dyn Backend>,
    store: Arc<dyn WeightStore>,
    strategies: KernelStrategies,
    reduction_width: usize,
    hook: Option<Arc<dyn ForwardHook>>,
}

impl Context {
    pub fn new(backend: Arc<dyn Backend>, store: Arc<dyn WeightStore>) -> Self {
        Self {
            backend,
            store,
            strategies: KernelStrategies::default(),
            reduction_width: DEFAULT_REDUCTION_WIDTH,
            hook: None,
        }
    }

    /// Host backend with queue depth and strategies taken from the environment.
    pub fn host(store: Arc<dyn WeightStore>) -> Self {
        Self::new(Arc::new(HostBackend::from_env()), store).with_strategies(KernelStrategies::from_env())
    }

    pub fn with_strategies(mut self, strategies: KernelStrategies) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_reduction_width(mut self, width: usize) -> Self {
        self.reduction_width = width.max(1);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn ForwardHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn store(&self) -> &dyn WeightStore {
        self.store.as_ref()
    }

    pub fn strategies(&self) -> KernelStrategies {
        self.strategies
    }

    pub fn reduction_width(&self) -> usize {
        self.reduction_width
    }

    pub fn alloc(&self, elements: usize) -> Result<DeviceBuffer> {
        self.backend.alloc(elements)
    }

    pub fn upload(&self, data: &[f32]) -> Result<DeviceBuffer> {
        self.backend.upload(data)
    }

    /// Synchronization point: blocks on `after` and copies the buffer to the host.
    pub fn read(&self, buffer: &DeviceBuffer, after: &[CompletionToken]) -> Result<Vec<f32>> {
        self.backend.read(buffer, after)
    }

    pub fn wait(&self, token: CompletionToken) -> Result<()> {
        self.backend.wait(token)
    }

    pub fn finish(&self) -> Result<()> {
        self.backend.finish()
    }

    /// Queue a raw kernel call.
    pub fn dispatch(&self, call: KernelCall, waits: &[CompletionToken]) -> Result<CompletionToken> {
        let kernel = call.name();
        let token = self.backend.dispatch(call, waits)?;
        debug!(kernel, token = %token, waits = waits.len(), "dispatched");
        record_metric!(MetricEvent::KernelDispatched {
            kernel_name: kernel.to_string(),
            backend: self.backend.name().to_string(),
            token: token.id(),
            waits: waits.iter().map(CompletionToken::id).collect(),
        });
        if let Some(hook) = &self.hook {
            hook.on_dispatch(&DispatchRecord {
                kernel,
                token,
                waits: waits.to_vec(),
            });
        }
        Ok(token)
    }

    /// Build and queue a typed operation, returning its output buffer and token.
    pub fn call<K: KernelInvocable>(&self, args: K::Args<'_>, waits: &[CompletionToken]) -> Result<(DeviceBuffer, CompletionToken)> {
        let (call, output) = K::new(self, args)?;
        let token = self.dispatch(call, waits)?;
        Ok((output, token))
    }

    /// Report a finished module forward to metrics and the hook.
    pub fn module_output(&self, module: &str, output: &Pending, started: Instant) -> Result<()> {
        record_metric!(MetricEvent::ModuleForward {
            module: module.to_string(),
            enqueue_us: started.elapsed().as_micros() as u64,
        });
        match &self.hook {
            Some(hook) => hook.on_module_output(self, module, output),
            None => Ok(()),
        }
    }
}
