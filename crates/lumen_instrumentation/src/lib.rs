//! Logging and metrics plumbing shared by the lumen engine and CLI.

pub mod config;
pub mod event;
pub mod exporters;
pub mod logging;
pub mod macros;
pub mod prelude;
pub mod recorder;

pub use config::{AppConfig, AppConfigError};
pub use event::MetricEvent;
pub use logging::{LoggingError, init_tracing};
pub use recorder::{EnrichedMetricEvent, MetricExporter, MetricsLayer};

#[cfg(test)]
mod tests;
