use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::BenchmarkConfig;
use crate::executor::RequestRunner;
use crate::output::{git_revision, RunMetadata, RunWriter};
use crate::report::{ContextAggregate, RequestMetrics};
use crate::runner::run_bucket;
use crate::telemetry::TelemetrySink;

/// A bucket whose pass rate falls below this stops the stage.
pub const EARLY_EXIT_PASS_RATE_PCT: f64 = 50.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Baseline,
    Aidaptiv,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Baseline => "BASELINE",
            Stage::Aidaptiv => "AIDAPTIV",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Baseline => f.write_str("baseline"),
            Stage::Aidaptiv => f.write_str("aidaptiv"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StageResult {
    pub stage: Stage,
    pub aggregates: Vec<ContextAggregate>,
    pub requests: Vec<RequestMetrics>,
    /// Context whose bucket tripped the early exit, if any.
    pub aborted_at: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BucketOutcome {
    Continue,
    Abort,
}

impl BucketOutcome {
    fn of(aggregate: &ContextAggregate) -> Self {
        if aggregate.pass_rate_pct < EARLY_EXIT_PASS_RATE_PCT {
            BucketOutcome::Abort
        } else {
            BucketOutcome::Continue
        }
    }
}

/// Drives one stage at a time through the configured context buckets.
///
/// Buckets run strictly in order: the next one only starts after the previous
/// aggregate is known, since a failing bucket ends the stage. Larger contexts
/// are assumed to fail as well once memory pressure sets in.
pub struct SweepController {
    config: Arc<BenchmarkConfig>,
    runner: Arc<dyn RequestRunner>,
    writer: Option<RunWriter>,
}

impl SweepController {
    pub fn new(config: Arc<BenchmarkConfig>, runner: Arc<dyn RequestRunner>) -> Self {
        Self {
            config,
            runner,
            writer: None,
        }
    }

    pub fn with_writer(mut self, writer: RunWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub async fn run_stage(
        &self,
        stage: Stage,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<StageResult> {
        tracing::info!(%stage, contexts = ?self.config.contexts, "starting sweep");
        let toggle = match stage {
            Stage::Baseline => self.config.disable_command.as_deref(),
            Stage::Aidaptiv => self.config.enable_command.as_deref(),
        };
        if let Some(command) = toggle {
            tracing::info!(%stage, command, "stage toggle must be applied on the target runtime");
        }

        if let Some(writer) = &self.writer {
            writer.begin_stage(stage).await?;
        }

        let planned = &self.config.contexts;
        let mut aggregates = Vec::with_capacity(planned.len());
        let mut requests = Vec::new();
        let mut aborted_at = None;

        for (idx, &context) in planned.iter().enumerate() {
            telemetry.set_status(&format!("Running {} | Context: {}", stage.label(), context));
            telemetry.set_test_progress(idx + 1, planned.len(), planned);
            tracing::info!(%stage, context, bucket = idx + 1, total = planned.len(), "testing context");

            let runs = run_bucket(
                Arc::clone(&self.runner),
                Arc::clone(&telemetry),
                context,
                self.config.runs_per_context,
                self.config.concurrency,
            )
            .await?;

            let aggregate = ContextAggregate::from_runs(context, &runs);
            telemetry.save_test_result(
                context,
                aggregate.avg_ttft_ms,
                aggregate.avg_latency_ms,
                aggregate.avg_tps_overall,
            );
            // a lost request log must not cost the aggregates of finished buckets
            if let Some(writer) = &self.writer {
                if let Err(err) = writer.append_requests(stage, &runs).await {
                    tracing::warn!(%stage, context, "request rows not saved: {:#}", err);
                }
            }

            tracing::info!(
                %stage,
                context,
                pass_rate_pct = aggregate.pass_rate_pct,
                avg_latency_ms = aggregate.avg_latency_ms,
                p95_latency_ms = aggregate.p95_latency_ms,
                avg_ttft_ms = aggregate.avg_ttft_ms,
                avg_tps_decode = aggregate.avg_tps_decode,
                "context finished"
            );

            let outcome = BucketOutcome::of(&aggregate);
            requests.extend(runs);
            aggregates.push(aggregate);

            if outcome == BucketOutcome::Abort {
                tracing::warn!(%stage, context, "high failure rate, stopping sweep");
                aborted_at = Some(context);
                break;
            }
        }

        telemetry.set_status(&format!("{} complete", stage.label()));
        let result = StageResult {
            stage,
            aggregates,
            requests,
            aborted_at,
        };

        if let Some(writer) = &self.writer {
            let metadata = RunMetadata::new(writer.run_id(), &self.config, &result, git_revision().await);
            writer.finish_stage(&result, &metadata).await?;
            tracing::info!(%stage, dir = %writer.dir().display(), "stage results saved");
        }
        Ok(result)
    }
}
