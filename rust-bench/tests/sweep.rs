mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeRuntime, Reply};
use sweepbench_rs::{
    BenchmarkConfig, FileConfig, NoopTelemetry, RequestExecutor, RunWriter, Stage, SweepController,
    TelemetryCollector, TelemetrySettings, REQUEST_CSV_HEADER,
};

fn stream_reply() -> Reply {
    Reply::sse(&[
        r#"{"choices":[{"delta":{"content":"The"}}]}"#,
        r#"{"choices":[{"delta":{"content":" answer"}}]}"#,
        r#"{"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":1020,"completion_tokens":2}}"#,
        "[DONE]",
    ])
}

#[tokio::test]
async fn synthetic_stage_end_to_end() {
    let server = FakeRuntime::start(stream_reply()).await;
    let root = tempfile::tempdir().unwrap();
    let writer = RunWriter::create(root.path(), Some("e2e")).await.unwrap();

    let config = Arc::new(
        BenchmarkConfig::try_new(server.endpoint(), None, "test-model", vec![1024], 2, 1)
            .unwrap()
            .with_request_timeout(Duration::from_secs(5)),
    );
    let executor = RequestExecutor::new(Arc::clone(&config), config.scenario.build()).unwrap();
    let controller =
        SweepController::new(Arc::clone(&config), Arc::new(executor)).with_writer(writer.clone());

    let result = controller
        .run_stage(Stage::Baseline, Arc::new(NoopTelemetry))
        .await
        .unwrap();

    assert_eq!(result.requests.len(), 2);
    assert!(result.requests.iter().all(|run| run.success && run.pass_fail));
    assert_eq!(result.aggregates.len(), 1);
    let aggregate = &result.aggregates[0];
    assert_eq!(aggregate.context, 1024);
    assert!(aggregate.run_count <= 2);
    assert_eq!(aggregate.pass_rate_pct, 100.0);
    assert_eq!(aggregate.total_completion_tokens, 4);
    assert_eq!(result.aborted_at, None);
    // warmup plus two measured requests
    assert_eq!(server.hits(), 3);

    let csv = std::fs::read_to_string(writer.requests_path(Stage::Baseline)).unwrap();
    let mut lines = csv.lines();
    assert_eq!(Some(REQUEST_CSV_HEADER.trim_end()), lines.next());
    assert_eq!(lines.count(), 2);
    assert!(writer.aggregates_path(Stage::Baseline).exists());
    assert!(writer.metadata_path(Stage::Baseline).exists());
}

#[tokio::test]
async fn failing_runtime_stops_after_first_context() {
    let server = FakeRuntime::start(Reply::Status(503, "overloaded".to_string())).await;
    let config = Arc::new(
        BenchmarkConfig::try_new(server.endpoint(), None, "test-model", vec![1024, 2048], 2, 2)
            .unwrap(),
    );
    let executor = RequestExecutor::new(Arc::clone(&config), config.scenario.build()).unwrap();
    let result = SweepController::new(Arc::clone(&config), Arc::new(executor))
        .run_stage(Stage::Aidaptiv, Arc::new(NoopTelemetry))
        .await
        .unwrap();

    assert_eq!(result.aborted_at, Some(1024));
    assert_eq!(result.aggregates.len(), 1);
    assert_eq!(result.aggregates[0].pass_rate_pct, 0.0);
    assert_eq!(result.aggregates[0].avg_latency_ms, 0.0);
    assert!(result.requests.iter().all(|run| run.error.starts_with("HTTP 503")));
    assert_eq!(server.hits(), 3);
}

#[tokio::test]
async fn telemetry_collector_mirrors_stage_to_dashboard() {
    let runtime = FakeRuntime::start(stream_reply()).await;
    let dashboard = FakeRuntime::start(Reply::Json("{}".to_string())).await;
    let root = tempfile::tempdir().unwrap();
    let writer = RunWriter::create(root.path(), None).await.unwrap();

    let config = Arc::new(
        BenchmarkConfig::try_new(runtime.endpoint(), None, "test-model", vec![512], 1, 1)
            .unwrap()
            .with_telemetry(TelemetrySettings {
                sample_interval: Duration::from_millis(100),
                dashboard_url: Some(dashboard.base_url()),
                model_name: "test-model".to_string(),
                ..TelemetrySettings::default()
            }),
    );
    let executor = RequestExecutor::new(Arc::clone(&config), config.scenario.build()).unwrap();
    let controller =
        SweepController::new(Arc::clone(&config), Arc::new(executor)).with_writer(writer.clone());

    let collector = Arc::new(TelemetryCollector::new(config.telemetry.clone()));
    collector.start(&writer.telemetry_path(Stage::Baseline)).await.unwrap();
    controller
        .run_stage(Stage::Baseline, collector.clone())
        .await
        .unwrap();
    collector.stop().await;

    assert!(collector.test_results().contains_key(&512));
    let metrics = std::fs::read_to_string(writer.telemetry_path(Stage::Baseline)).unwrap();
    assert!(metrics.starts_with("timestamp,"));

    let snapshots = dashboard.bodies();
    assert!(!snapshots.is_empty());
    assert!(snapshots
        .iter()
        .any(|snapshot| snapshot["test_progress"]["results"].get("512").is_some()));
    assert!(snapshots
        .iter()
        .all(|snapshot| snapshot["app"]["model"] == "test-model"));
}

#[test]
fn yaml_file_builds_config() {
    let yaml = r#"
runtime:
  endpoint: "http://127.0.0.1:11434/v1/completions"
  model_name: "llama3"
test:
  context_start: 1024
  context_end: 4096
  context_mode: geometric
  runs_per_context: 2
  concurrency: 2
scenario: needle
aidaptiv:
  enable_command: "systemctl start aidaptiv"
"#;
    let file = FileConfig::from_yaml(yaml).unwrap();
    let config = BenchmarkConfig::from_file(&file).unwrap();
    assert_eq!(config.contexts, vec![1024, 2048, 4096]);
    assert_eq!(config.scenario.to_string(), "needle");
    assert_eq!(config.enable_command.as_deref(), Some("systemctl start aidaptiv"));
    assert_eq!(config.telemetry.model_name, "llama3");
    assert_eq!(
        config.health_url().unwrap().as_str(),
        "http://127.0.0.1:11434/v1/models"
    );
}
