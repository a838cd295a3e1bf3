//! Re-exports for instrumentation consumers and tests.

pub use crate::config::{AppConfig, AppConfigError};
pub use crate::event::MetricEvent;
pub use crate::exporters::{ChannelExporter, ConsoleExporter, JsonlExporter};
pub use crate::logging::{LoggingError, exporters_from_config, init_tracing};
pub use crate::record_metric;
pub use crate::recorder::{EnrichedMetricEvent, METRICS_TARGET, MetricExporter, MetricsLayer};

pub use lumen_env::{EnvVar, EnvVarError, EnvVarGuard, Environment, InstrumentEnvVar, LOG_LEVEL, METRICS_CONSOLE, METRICS_JSONL_PATH};

pub use chrono::{DateTime, Utc};
pub use tracing::{Level, info_span, subscriber};
pub use tracing_subscriber::{self, layer::SubscriberExt};
