use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, SecondsFormat, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::BenchmarkConfig;
use crate::report::RequestMetrics;
use crate::sweep::{Stage, StageResult};

pub const REQUEST_CSV_HEADER: &str = "timestamp,context_len,success,pass_fail,ttft_ms,total_latency_ms,prompt_tokens,completion_tokens,tps_overall,tps_prefill,tps_decode,error\n";

/// Per-run results directory, `<root>/<run_id>/`.
#[derive(Clone, Debug)]
pub struct RunWriter {
    run_id: String,
    dir: PathBuf,
    resumed: bool,
}

impl RunWriter {
    /// Creates (or reuses, when resuming a run id) the results directory.
    pub async fn create(root: &Path, run_id: Option<&str>) -> Result<Self> {
        let requested = run_id.is_some();
        let run_id = match run_id {
            Some(id) => id.to_string(),
            None => Local::now().format("%Y%m%d_%H%M%S").to_string(),
        };
        let dir = root.join(&run_id);
        let resumed = run_id_exists(&dir).await;
        if resumed {
            tracing::info!(dir = %dir.display(), "appending to existing run");
        } else if requested {
            tracing::warn!(dir = %dir.display(), "run id directory does not exist, creating it");
        }
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create results directory at {}", dir.display()))?;
        Ok(Self {
            run_id,
            dir,
            resumed,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether the run directory already existed when the writer was created.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn requests_path(&self, stage: Stage) -> PathBuf {
        self.dir.join(format!("requests_{}.csv", stage))
    }

    pub fn aggregates_path(&self, stage: Stage) -> PathBuf {
        self.dir.join(format!("results_{}.json", stage))
    }

    pub fn metadata_path(&self, stage: Stage) -> PathBuf {
        self.dir.join(format!("metadata_{}.json", stage))
    }

    pub fn telemetry_path(&self, stage: Stage) -> PathBuf {
        self.dir.join(format!("metrics_{}.csv", stage))
    }

    /// Truncates the stage's request log and writes its header.
    pub async fn begin_stage(&self, stage: Stage) -> Result<()> {
        let path = self.requests_path(stage);
        fs::write(&path, REQUEST_CSV_HEADER)
            .await
            .with_context(|| format!("failed to write request log {}", path.display()))
    }

    pub async fn append_requests(&self, stage: Stage, runs: &[RequestMetrics]) -> Result<()> {
        let path = self.requests_path(stage);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open request log {}", path.display()))?;

        let rows: String = runs.iter().map(csv_row).collect();
        file.write_all(rows.as_bytes())
            .await
            .with_context(|| format!("failed to append to request log {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("failed to flush request log {}", path.display()))
    }

    /// Writes the aggregate array and the metadata snapshot for a stage.
    pub async fn finish_stage(&self, result: &StageResult, metadata: &RunMetadata) -> Result<()> {
        write_json(&self.aggregates_path(result.stage), &result.aggregates).await?;
        write_json(&self.metadata_path(result.stage), metadata).await
    }
}

async fn run_id_exists(dir: &Path) -> bool {
    fs::metadata(dir).await.is_ok()
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    fs::write(path, text)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

pub fn csv_row(run: &RequestMetrics) -> String {
    format!(
        "{},{},{},{},{:.2},{:.2},{},{},{:.2},{:.2},{:.2},{}\n",
        run.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        run.context_len,
        run.success,
        run.pass_fail,
        run.ttft_ms,
        run.total_latency_ms,
        run.prompt_tokens,
        run.completion_tokens,
        run.tps_overall,
        run.tps_prefill,
        run.tps_decode,
        csv_escape(&run.error)
    )
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub stage: Stage,
    pub model: String,
    pub endpoint: String,
    pub scenario: String,
    pub concurrency: usize,
    pub runs_per_context: usize,
    pub max_tokens: u32,
    pub planned_contexts: Vec<usize>,
    pub visited_contexts: Vec<usize>,
    pub aborted_at: Option<usize>,
    pub timestamp: DateTime<Utc>,
    pub git_revision: Option<String>,
}

impl RunMetadata {
    pub fn new(
        run_id: &str,
        config: &BenchmarkConfig,
        result: &StageResult,
        git_revision: Option<String>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage: result.stage,
            model: config.model.clone(),
            endpoint: config.endpoint.to_string(),
            scenario: config.scenario.to_string(),
            concurrency: config.concurrency,
            runs_per_context: config.runs_per_context,
            max_tokens: config.max_tokens,
            planned_contexts: config.contexts.clone(),
            visited_contexts: result.aggregates.iter().map(|agg| agg.context).collect(),
            aborted_at: result.aborted_at,
            timestamp: Utc::now(),
            git_revision,
        }
    }
}

/// Short hash of the checked-out revision, if this runs inside a git work tree.
pub async fn git_revision() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let revision = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!revision.is_empty()).then_some(revision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ContextAggregate;
    use crate::scenario::Meta;

    #[test]
    fn csv_escape_plain_string() {
        assert_eq!(csv_escape("hello"), "hello");
        assert_eq!(csv_escape(""), "");
    }

    #[test]
    fn csv_escape_special_characters() {
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("line1\nline2"), "\"line1\nline2\"");
    }

    #[test]
    fn csv_row_has_every_column() {
        let run = RequestMetrics::failed(
            Utc::now(),
            2048,
            12.5,
            "connection error: refused, twice",
            Meta::new(),
        );
        let row = csv_row(&run);
        assert!(row.ends_with(",\"connection error: refused, twice\"\n"));
        assert!(row.contains(",2048,false,false,0.00,12.50,0,0,"));
        assert_eq!(REQUEST_CSV_HEADER.split(',').count(), 12);
    }

    #[tokio::test]
    async fn run_id_resumes_only_existing_directories() {
        let root = tempfile::tempdir().unwrap();
        let fresh = RunWriter::create(root.path(), Some("later_stage")).await.unwrap();
        assert!(!fresh.resumed());
        assert!(fresh.dir().is_dir());

        let again = RunWriter::create(root.path(), Some("later_stage")).await.unwrap();
        assert!(again.resumed());
        assert_eq!(again.dir(), fresh.dir());
    }

    #[tokio::test]
    async fn stage_files_are_written() {
        let root = tempfile::tempdir().unwrap();
        let writer = RunWriter::create(root.path(), Some("run_a")).await.unwrap();
        assert_eq!(writer.dir(), root.path().join("run_a"));

        let run = RequestMetrics::failed(Utc::now(), 1024, 1.0, "", Meta::new());
        writer.begin_stage(Stage::Baseline).await.unwrap();
        writer.append_requests(Stage::Baseline, &[run.clone()]).await.unwrap();
        writer.append_requests(Stage::Baseline, &[run.clone()]).await.unwrap();

        let result = StageResult {
            stage: Stage::Baseline,
            aggregates: vec![ContextAggregate::from_runs(1024, &[run.clone()])],
            requests: vec![run],
            aborted_at: Some(1024),
        };
        let config = BenchmarkConfig::try_new(
            "http://localhost:8000/v1/completions",
            None,
            "m",
            vec![1024, 2048],
            1,
            1,
        )
        .unwrap();
        let metadata = RunMetadata::new(writer.run_id(), &config, &result, None);
        writer.finish_stage(&result, &metadata).await.unwrap();

        let csv = std::fs::read_to_string(writer.requests_path(Stage::Baseline)).unwrap();
        assert_eq!(csv.lines().count(), 3);

        let aggregates: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(writer.aggregates_path(Stage::Baseline)).unwrap())
                .unwrap();
        assert_eq!(aggregates[0]["context"], 1024);

        let metadata: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(writer.metadata_path(Stage::Baseline)).unwrap())
                .unwrap();
        assert_eq!(metadata["stage"], "baseline");
        assert_eq!(metadata["aborted_at"], 1024);
        assert_eq!(metadata["planned_contexts"], serde_json::json!([1024, 2048]));
    }
}
