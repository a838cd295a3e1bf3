use std::{sync::mpsc, time::Duration};

use crate::prelude::*;

fn weight_event(name: &str) -> EnrichedMetricEvent {
    EnrichedMetricEvent {
        timestamp: Utc::now(),
        span_id: Some(42),
        parent_span_id: Some(24),
        span_name: Some("materialize".to_string()),
        event: MetricEvent::WeightMaterialized {
            name: name.to_string(),
            bytes: 4096,
        },
    }
}

#[test]
fn test_jsonl_exporter_writes_one_line_per_event() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("metrics.jsonl");

    let first = weight_event("unet/out.2.weight");
    let second = weight_event("unet/out.2.bias");
    {
        let exporter = JsonlExporter::new(&path).expect("jsonl exporter should open file");
        exporter.export(&first);
        exporter.export(&second);
    }

    let contents = std::fs::read_to_string(&path).expect("jsonl exporter should write file");
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], serde_json::to_string(&first).expect("serialise"));

    let parsed: serde_json::Value = serde_json::from_str(lines[1]).expect("line is json");
    assert_eq!(parsed["event"]["type"], "WeightMaterialized");
    assert_eq!(parsed["event"]["data"]["name"], "unet/out.2.bias");
}

#[test]
fn test_channel_exporter_sends_independent_copies() {
    let (sender, receiver) = mpsc::channel();
    let exporter = ChannelExporter::new(sender);

    let mut event = weight_event("decoder/conv_in.weight");
    exporter.export(&event);
    event.span_name = Some("mutated".to_string());

    let received = receiver.recv_timeout(Duration::from_secs(1)).expect("channel should receive event");
    assert_eq!(received.span_name.as_deref(), Some("materialize"));
    match received.event {
        MetricEvent::WeightMaterialized { name, bytes } => {
            assert_eq!(name, "decoder/conv_in.weight");
            assert_eq!(bytes, 4096);
        }
        other => panic!("expected weight event, got {other:?}"),
    }
}

#[test]
fn test_exporters_follow_config() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = AppConfig {
        metrics_jsonl_path: Some(dir.path().join("m.jsonl")),
        enable_console_metrics: true,
        ..AppConfig::default()
    };
    assert_eq!(exporters_from_config(&config).expect("exporters").len(), 2);
    assert!(exporters_from_config(&AppConfig::default()).expect("exporters").is_empty());

    let missing_dir = AppConfig {
        metrics_jsonl_path: Some(dir.path().join("missing").join("m.jsonl")),
        ..AppConfig::default()
    };
    assert!(matches!(exporters_from_config(&missing_dir), Err(LoggingError::MetricsFile { .. })));
}
