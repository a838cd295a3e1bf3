//! Tracing layer that turns `metrics` events into exporter calls.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{Event, Subscriber};
use tracing_subscriber::{Layer, layer::Context, registry::LookupSpan};

use crate::event::MetricEvent;

pub const METRICS_TARGET: &str = "metrics";

/// A metric plus the span context it was emitted under.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedMetricEvent {
    pub timestamp: DateTime<Utc>,
    pub span_id: Option<u64>,
    pub parent_span_id: Option<u64>,
    pub span_name: Option<String>,
    pub event: MetricEvent,
}

pub trait MetricExporter: Send + Sync {
    fn export(&self, event: &EnrichedMetricEvent);
}

#[derive(Clone)]
pub struct MetricsLayer {
    exporters: Arc<Vec<Box<dyn MetricExporter>>>,
}

impl MetricsLayer {
    pub fn new(exporters: Vec<Box<dyn MetricExporter>>) -> Self {
        Self {
            exporters: Arc::new(exporters),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }
}

impl<S> Layer<S> for MetricsLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if event.metadata().target() != METRICS_TARGET || self.exporters.is_empty() {
            return;
        }

        let mut visitor = MetricVisitor::default();
        event.record(&mut visitor);
        let Some(metric_json) = visitor.metric_json else {
            return;
        };

        let metric_event: MetricEvent = match serde_json::from_str(&metric_json) {
            Ok(event) => event,
            Err(error) => {
                tracing::error!(target: "instrument", %error, "failed to deserialize metric event");
                return;
            }
        };

        let span = ctx.event_span(event);
        let enriched = EnrichedMetricEvent {
            timestamp: Utc::now(),
            span_id: span.as_ref().map(|s| s.id().into_u64()),
            parent_span_id: span.as_ref().and_then(|s| s.parent()).map(|parent| parent.id().into_u64()),
            span_name: span.as_ref().map(|s| s.name().to_string()),
            event: metric_event,
        };

        for exporter in self.exporters.iter() {
            exporter.export(&enriched);
        }
    }
}

#[derive(Default)]
struct MetricVisitor {
    metric_json: Option<String>,
}

impl tracing::field::Visit for MetricVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "metric" {
            self.metric_json = Some(format!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "metric" {
            self.metric_json = Some(value.to_string());
        }
    }
}
