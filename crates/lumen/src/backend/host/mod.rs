//! Reference backend executing kernels on the host with rayon.
//!
//! Submissions are queued in order and executed lazily: the queue drains when a caller
//! blocks (`wait`, `read`, `finish`) or when the number of pending operations reaches
//! `max_pending`. Completion is therefore monotonic: token `n` completed implies every
//! earlier token completed.

mod linalg;
mod pointwise;
mod reduce;

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, trace};

use lumen_env::MAX_PENDING_OPS;
use lumen_instrumentation::{MetricEvent, record_metric};

use super::{Backend, CompletionToken};
use crate::{
    DeviceBuffer, EngineError, error::Result, kernels::{KernelCall, KernelFunction}
};

pub(crate) use pointwise::gelu;

pub const DEFAULT_MAX_PENDING_OPS: usize = 16;
const BACKEND_NAME: &str = "host";

struct Submitted {
    token: CompletionToken,
    call: KernelCall,
}

struct QueueState {
    pending: VecDeque<Submitted>,
    next_token: u64,
    completed: u64,
}

pub struct HostBackend {
    queue: Mutex<QueueState>,
    max_pending: usize,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING_OPS)
    }
}

impl HostBackend {
    pub fn new(max_pending: usize) -> Self {
        Self {
            queue: Mutex::new(QueueState {
                pending: VecDeque::new(),
                next_token: 1,
                completed: 0,
            }),
            max_pending: max_pending.max(1),
        }
    }

    /// Queue depth from `LUMEN_MAX_PENDING_OPS`, falling back to the default.
    pub fn from_env() -> Self {
        Self::new(MAX_PENDING_OPS.get_or(DEFAULT_MAX_PENDING_OPS))
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Tokens issued so far.
    pub fn issued(&self) -> u64 {
        self.queue.lock().next_token - 1
    }

    fn check_issued(state: &QueueState, token: CompletionToken) -> Result<()> {
        if token.id() == 0 || token.id() >= state.next_token {
            return Err(EngineError::UnknownToken(token.id()));
        }
        Ok(())
    }

    /// Execute queued operations up to and including `through`.
    fn drain(state: &mut QueueState, through: u64) -> Result<usize> {
        let mut executed = 0;
        while state.completed < through {
            let Some(next) = state.pending.pop_front() else {
                break;
            };
            trace!(kernel = next.call.name(), token = %next.token, "executing");
            if let Err(err) = execute(&next.call) {
                // Everything queued behind a failed operation belongs to the failed call.
                state.pending.clear();
                state.completed = state.next_token - 1;
                return Err(err);
            }
            state.completed = next.token.id();
            executed += 1;
        }
        Ok(executed)
    }
}

impl Backend for HostBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn alloc(&self, elements: usize) -> Result<DeviceBuffer> {
        if elements == 0 || elements.checked_mul(std::mem::size_of::<f32>()).is_none() {
            return Err(EngineError::BufferCreationFailed(elements.saturating_mul(std::mem::size_of::<f32>())));
        }
        Ok(DeviceBuffer::zeroed(elements))
    }

    fn upload(&self, data: &[f32]) -> Result<DeviceBuffer> {
        if data.is_empty() {
            return Err(EngineError::BufferCreationFailed(0));
        }
        Ok(DeviceBuffer::from_vec(data.to_vec()))
    }

    fn dispatch(&self, call: KernelCall, waits: &[CompletionToken]) -> Result<CompletionToken> {
        call.validate()?;
        let mut state = self.queue.lock();
        for wait in waits {
            Self::check_issued(&state, *wait)?;
        }
        if state.pending.len() >= self.max_pending {
            let oldest = state.completed + 1;
            Self::drain(&mut state, oldest)?;
        }
        let token = CompletionToken::new(state.next_token);
        state.next_token += 1;
        state.pending.push_back(Submitted { token, call });
        Ok(token)
    }

    fn wait(&self, token: CompletionToken) -> Result<()> {
        let mut state = self.queue.lock();
        Self::check_issued(&state, token)?;
        Self::drain(&mut state, token.id())?;
        Ok(())
    }

    fn read(&self, buffer: &DeviceBuffer, after: &[CompletionToken]) -> Result<Vec<f32>> {
        if let Some(latest) = after.iter().max() {
            self.wait(*latest)?;
        }
        Ok(buffer.host_read().clone())
    }

    fn finish(&self) -> Result<()> {
        let started = Instant::now();
        let mut state = self.queue.lock();
        let through = state.next_token - 1;
        let executed = Self::drain(&mut state, through)?;
        drop(state);
        if executed > 0 {
            let duration_us = started.elapsed().as_micros() as u64;
            debug!(executed, duration_us, "host queue drained");
            record_metric!(MetricEvent::QueueDrained {
                backend: BACKEND_NAME.to_string(),
                executed_ops: executed as u64,
                duration_us,
            });
        }
        Ok(())
    }

    fn pending(&self) -> usize {
        self.queue.lock().pending.len()
    }
}

fn execute(call: &KernelCall) -> Result<()> {
    match call.function {
        KernelFunction::Linear => linalg::linear(call, false),
        KernelFunction::RegLinear => linalg::linear(call, true),
        KernelFunction::Conv2d => linalg::conv2d(call),
        KernelFunction::Im2Col => linalg::im2col(call),
        KernelFunction::Conv2dMatmul => linalg::conv2d_matmul(call),
        KernelFunction::EinsumBikBjkBij => linalg::scores(call, false),
        KernelFunction::AddMatmulAttention => linalg::scores(call, true),
        KernelFunction::EinsumBijBjkBik => linalg::weighted_sum(call),
        KernelFunction::LocalReductionMean => reduce::mean(call),
        KernelFunction::LocalReductionVariance => reduce::variance(call),
        KernelFunction::GroupNorm => reduce::group_norm(call),
        KernelFunction::LayerNorm => reduce::layer_norm(call),
        KernelFunction::LocalSoftmax => reduce::softmax(call),
        KernelFunction::ElemwiseAdd => pointwise::add(call),
        KernelFunction::ChunkwiseAdd => pointwise::chunkwise_add(call),
        KernelFunction::Silu => pointwise::unary(call, pointwise::silu),
        KernelFunction::Gelu => pointwise::unary(call, pointwise::gelu),
        KernelFunction::GeluMultiply => pointwise::gelu_multiply(call),
        KernelFunction::UpSampleNearest => pointwise::upsample_nearest(call),
        KernelFunction::Permute3D102 => pointwise::permute_102(call),
        KernelFunction::CopyBuffer => pointwise::copy_buffer(call),
        KernelFunction::Embedding => pointwise::embedding(call),
    }
}

/// Fail unless `buffer` holds exactly `expected` elements.
fn expect_len(op: &'static str, buffer: &DeviceBuffer, expected: usize) -> Result<()> {
    if buffer.len() != expected {
        return Err(EngineError::mismatch(op, expected, buffer.len()));
    }
    Ok(())
}

#[cfg(test)]
mod host_test {
    use super::*;
    use crate::kernels::KernelArg;

    fn silu_call(input: &DeviceBuffer, output: &DeviceBuffer) -> KernelCall {
        KernelCall::new(KernelFunction::Silu, vec![input.into(), output.into()])
    }

    #[test]
    fn test_execution_is_deferred_until_wait() {
        let backend = HostBackend::new(8);
        let input = backend.upload(&[0.0, 1.0]).unwrap();
        let output = backend.alloc(2).unwrap();

        let token = backend.dispatch(silu_call(&input, &output), &[]).unwrap();
        assert_eq!(backend.pending(), 1);
        assert_eq!(output.host_read()[1], 0.0);

        backend.wait(token).unwrap();
        assert_eq!(backend.pending(), 0);
        assert!((output.host_read()[1] - 0.731_058_6).abs() < 1e-6);
    }

    #[test]
    fn test_queue_depth_is_bounded() {
        let backend = HostBackend::new(2);
        let input = backend.upload(&[1.0; 4]).unwrap();
        let outputs: Vec<_> = (0..5).map(|_| backend.alloc(4).unwrap()).collect();
        let mut last = None;
        for output in &outputs {
            let waits: Vec<_> = last.into_iter().collect();
            last = Some(backend.dispatch(silu_call(&input, output), &waits).unwrap());
            assert!(backend.pending() <= 2);
        }
        backend.finish().unwrap();
        assert_eq!(backend.pending(), 0);
        assert_eq!(backend.issued(), 5);
    }

    #[test]
    fn test_unknown_tokens_are_rejected() {
        let backend = HostBackend::default();
        let input = backend.upload(&[1.0]).unwrap();
        let output = backend.alloc(1).unwrap();
        let err = backend.dispatch(silu_call(&input, &output), &[CompletionToken::new(99)]).unwrap_err();
        assert!(matches!(err, EngineError::UnknownToken(99)));
        assert!(matches!(backend.wait(CompletionToken::new(0)), Err(EngineError::UnknownToken(0))));
        assert_eq!(backend.pending(), 0);
    }

    #[test]
    fn test_failed_execution_clears_queue_and_recovers() {
        let backend = HostBackend::new(8);
        let input = backend.upload(&[1.0, 2.0, 3.0]).unwrap();
        let short = backend.alloc(2).unwrap();
        let bad = KernelCall::new(KernelFunction::ElemwiseAdd, vec![(&input).into(), (&input).into(), (&short).into()]);
        let first = backend.dispatch(bad, &[]).unwrap();
        let output = backend.alloc(3).unwrap();
        backend.dispatch(silu_call(&input, &output), &[first]).unwrap();

        let err = backend.finish().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ShapeMismatch);
        assert_eq!(backend.pending(), 0);

        let retry = backend.dispatch(silu_call(&input, &output), &[]).unwrap();
        let values = backend.read(&output, &[retry]).unwrap();
        assert!(values[2] > 2.8);
    }

    #[test]
    fn test_zero_sized_allocations_fail() {
        let backend = HostBackend::default();
        assert!(matches!(backend.alloc(0), Err(EngineError::BufferCreationFailed(0))));
        assert!(backend.upload(&[]).is_err());
        let call = KernelCall::new(KernelFunction::Silu, vec![KernelArg::Null, KernelArg::Null]);
        assert!(backend.dispatch(call, &[]).is_err());
    }

    #[test]
    fn test_queued_calls_keep_buffers_alive() {
        let backend = HostBackend::new(8);
        let input = backend.upload(&[2.0]).unwrap();
        let output = backend.alloc(1).unwrap();
        let token = backend.dispatch(silu_call(&input, &output), &[]).unwrap();
        assert_eq!(input.handle_count(), 2);
        backend.wait(token).unwrap();
        assert_eq!(input.handle_count(), 1);
    }
}
