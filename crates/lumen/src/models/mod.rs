//! Network assemblies built from [`crate::nn`] modules.

pub mod decoder;
pub mod text_encoder;
pub mod unet;

use rustc_hash::FxHashMap;
use tracing::info;

use lumen_instrumentation::{MetricEvent, record_metric};

use crate::nn::Module;

pub use decoder::{Decoder, DecoderConfig, to_rgb8};
pub use text_encoder::{TextEncoder, TextEncoderConfig};
pub use unet::{Unet, UnetConfig, UnetPredictor, timestep_embedding};

/// Log and record the weight bytes of `model`, broken down by top-level component.
pub(crate) fn report_weights<'a>(model: &str, components: impl IntoIterator<Item = &'a dyn Module>) -> u64 {
    let mut breakdown = FxHashMap::default();
    let mut total_bytes = 0;
    for component in components {
        let bytes = component.weight_bytes();
        *breakdown.entry(component.name().to_string()).or_insert(0) += bytes;
        total_bytes += bytes;
    }
    info!(model, total_bytes, components = breakdown.len(), "model weights");
    record_metric!(MetricEvent::ModelWeights {
        model: model.to_string(),
        total_bytes,
        breakdown,
    });
    total_bytes
}
