//! Metric sinks.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::sync::mpsc::Sender;

use crate::recorder::{EnrichedMetricEvent, MetricExporter};

/// Appends one JSON object per line, flushed per event.
pub struct JsonlExporter {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlExporter {
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl MetricExporter for JsonlExporter {
    fn export(&self, event: &EnrichedMetricEvent) {
        let Ok(serialised) = serde_json::to_string(event) else {
            return;
        };
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        if let Err(error) = writeln!(writer, "{serialised}").and_then(|()| writer.flush()) {
            tracing::error!(target: "instrument", %error, "failed to write metric to jsonl");
        }
    }
}

#[derive(Default)]
pub struct ConsoleExporter;

impl ConsoleExporter {
    pub fn new() -> Self {
        Self
    }
}

impl MetricExporter for ConsoleExporter {
    fn export(&self, event: &EnrichedMetricEvent) {
        if let Ok(serialised) = serde_json::to_string(&event.event) {
            println!("METRIC {} {}", event.event.kind(), serialised);
        }
    }
}

/// Forwards events over an in-process channel, mostly for tests.
pub struct ChannelExporter {
    sender: Mutex<Sender<EnrichedMetricEvent>>,
}

impl ChannelExporter {
    pub fn new(sender: Sender<EnrichedMetricEvent>) -> Self {
        Self { sender: Mutex::new(sender) }
    }
}

impl MetricExporter for ChannelExporter {
    fn export(&self, event: &EnrichedMetricEvent) {
        if let Ok(sender) = self.sender.lock() {
            let _ = sender.send(event.clone());
        }
    }
}
