//! Global subscriber installation.

use tracing_subscriber::{
    Layer, filter::{LevelFilter, Targets}, layer::SubscriberExt, util::SubscriberInitExt
};

use crate::config::AppConfig;
use crate::exporters::{ConsoleExporter, JsonlExporter};
use crate::recorder::{METRICS_TARGET, MetricExporter, MetricsLayer};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to open metrics file {path}: {source}")]
    MetricsFile { path: String, source: std::io::Error },
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

/// Build the exporters requested by `config`.
pub fn exporters_from_config(config: &AppConfig) -> Result<Vec<Box<dyn MetricExporter>>, LoggingError> {
    let mut exporters: Vec<Box<dyn MetricExporter>> = Vec::new();
    if let Some(path) = &config.metrics_jsonl_path {
        let exporter = JsonlExporter::new(path).map_err(|source| LoggingError::MetricsFile {
            path: path.display().to_string(),
            source,
        })?;
        exporters.push(Box::new(exporter));
    }
    if config.enable_console_metrics {
        exporters.push(Box::new(ConsoleExporter::new()));
    }
    Ok(exporters)
}

/// Install a formatted stderr logger filtered at `config.log_level` plus the metrics layer.
///
/// Metric events never reach the human-readable log; they only flow to exporters.
pub fn init_tracing(config: &AppConfig) -> Result<(), LoggingError> {
    let exporters = exporters_from_config(config)?;
    let metrics_enabled = !exporters.is_empty();

    let log_filter = Targets::new()
        .with_default(LevelFilter::from_level(config.log_level))
        .with_target(METRICS_TARGET, LevelFilter::OFF);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(log_filter);

    let metrics_filter = Targets::new().with_target(
        METRICS_TARGET,
        if metrics_enabled { LevelFilter::INFO } else { LevelFilter::OFF },
    );
    let metrics_layer = MetricsLayer::new(exporters).with_filter(metrics_filter);

    tracing_subscriber::registry().with(fmt_layer).with(metrics_layer).try_init()?;
    Ok(())
}
