use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::executor::{truncate_message, RequestRunner, MAX_ERROR_CHARS};
use crate::report::RequestMetrics;
use crate::scenario::Meta;
use crate::telemetry::TelemetrySink;

/// Runs one context bucket: a serial warmup whose result is discarded, then
/// `runs` measured requests with at most `concurrency` in flight.
///
/// Records are returned in completion order, not submission order.
pub async fn run_bucket(
    runner: Arc<dyn RequestRunner>,
    telemetry: Arc<dyn TelemetrySink>,
    context_len: usize,
    runs: usize,
    concurrency: usize,
) -> Result<Vec<RequestMetrics>> {
    let warmup = execute_guarded(runner.as_ref(), telemetry.as_ref(), context_len, true).await;
    tracing::debug!(
        context_len,
        success = warmup.success,
        latency_ms = warmup.total_latency_ms,
        "warmup finished"
    );

    let limit = concurrency.clamp(1, runs.max(1));
    let permits = Arc::new(Semaphore::new(limit));
    let (result_tx, result_rx) = mpsc::unbounded_channel();
    let collector = tokio::spawn(collect_results(result_rx, context_len, runs));

    let mut join_set = JoinSet::new();
    for run_id in 0..runs {
        let runner = Arc::clone(&runner);
        let telemetry = Arc::clone(&telemetry);
        let permits = Arc::clone(&permits);
        let tx = result_tx.clone();
        join_set.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| anyhow!("worker pool closed before run {} started", run_id))?;
            let metrics =
                execute_guarded(runner.as_ref(), telemetry.as_ref(), context_len, false).await;
            tx.send(metrics)
                .map_err(|_| anyhow!("result channel closed before run {} reported", run_id))?;
            Ok::<(), anyhow::Error>(())
        });
    }
    drop(result_tx);

    while let Some(join_result) = join_set.join_next().await {
        join_result??;
    }

    let results = collector
        .await
        .map_err(|err| anyhow!("result collector task failed: {}", err))?;

    // nothing is decoding between buckets, don't leave the last rate visible
    telemetry.set_tps(0.0);
    Ok(results)
}

/// Runs one request; a panic inside the runner becomes a failed record so the
/// rest of the bucket still completes.
async fn execute_guarded(
    runner: &dyn RequestRunner,
    telemetry: &dyn TelemetrySink,
    context_len: usize,
    dry_run: bool,
) -> RequestMetrics {
    let timestamp = Utc::now();
    let start = Instant::now();
    let outcome = AssertUnwindSafe(runner.execute(context_len, dry_run, telemetry))
        .catch_unwind()
        .await;
    match outcome {
        Ok(metrics) => metrics,
        Err(payload) => {
            let message = truncate_message(
                &format!("request task panicked: {}", panic_message(payload.as_ref())),
                MAX_ERROR_CHARS,
            );
            tracing::warn!(context_len, dry_run, "{}", message);
            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
            telemetry.end_request(latency_ms);
            RequestMetrics::failed(timestamp, context_len, latency_ms, message, Meta::new())
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

async fn collect_results(
    mut rx: mpsc::UnboundedReceiver<RequestMetrics>,
    context_len: usize,
    planned: usize,
) -> Vec<RequestMetrics> {
    let mut results = Vec::with_capacity(planned);
    while let Some(metrics) = rx.recv().await {
        results.push(metrics);
        let latest = &results[results.len() - 1];
        tracing::info!(
            context_len,
            completed = results.len(),
            planned,
            success = latest.success,
            ttft_ms = latest.ttft_ms,
            latency_ms = latest.total_latency_ms,
            tps_decode = latest.tps_decode,
            "request finished"
        );
    }
    results
}
