//! Structured metric events.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MetricEvent {
    /// A named kernel was queued behind the listed completion tokens.
    KernelDispatched {
        kernel_name: String,
        backend: String,
        token: u64,
        waits: Vec<u64>,
    },
    /// The backend executed queued work up to a synchronization point.
    QueueDrained {
        backend: String,
        executed_ops: u64,
        duration_us: u64,
    },
    /// A module finished enqueuing its forward pass.
    ModuleForward { module: String, enqueue_us: u64 },
    /// A weight was loaded and uploaded for the first time.
    WeightMaterialized { name: String, bytes: u64 },
    /// Total weight bytes held by a model, grouped by component.
    ModelWeights {
        model: String,
        total_bytes: u64,
        breakdown: FxHashMap<String, u64>,
    },
    /// One DDIM iteration completed.
    SamplerStep {
        step: u64,
        timestep: u64,
        duration_us: u64,
    },
}

impl MetricEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MetricEvent::KernelDispatched { .. } => "kernel_dispatched",
            MetricEvent::QueueDrained { .. } => "queue_drained",
            MetricEvent::ModuleForward { .. } => "module_forward",
            MetricEvent::WeightMaterialized { .. } => "weight_materialized",
            MetricEvent::ModelWeights { .. } => "model_weights",
            MetricEvent::SamplerStep { .. } => "sampler_step",
        }
    }
}
