//! Macros for emitting metric events.

#[doc(hidden)]
pub mod __private {
    pub use serde_json;
    pub use tracing;
}

/// Emit a [`MetricEvent`](crate::MetricEvent) as a `tracing` event with target `metrics`.
///
/// The event is serialised eagerly; when no subscriber is interested in the `metrics`
/// target the serialisation is skipped.
#[macro_export]
macro_rules! record_metric {
    ($event:expr) => {{
        use $crate::macros::__private::{serde_json as __sj, tracing as __tr};
        if __tr::enabled!(target: "metrics", __tr::Level::INFO) {
            if let Ok(__metric_json) = __sj::to_string(&$event) {
                __tr::event!(target: "metrics", __tr::Level::INFO, metric = %__metric_json);
            }
        }
    }};
}
