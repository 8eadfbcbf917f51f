use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scenario::Meta;

/// Outcome of one executed request, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetrics {
    pub timestamp: DateTime<Utc>,
    pub context_len: usize,
    pub success: bool,
    pub ttft_ms: f64,
    pub total_latency_ms: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub tps_overall: f64,
    pub tps_prefill: f64,
    pub tps_decode: f64,
    pub error: String,
    pub pass_fail: bool,
    pub meta: Meta,
    #[serde(default)]
    pub response_chars: usize,
}

impl RequestMetrics {
    /// A record for a request that never produced a usable response.
    pub fn failed(
        timestamp: DateTime<Utc>,
        context_len: usize,
        total_latency_ms: f64,
        error: impl Into<String>,
        meta: Meta,
    ) -> Self {
        Self {
            timestamp,
            context_len,
            success: false,
            ttft_ms: 0.0,
            total_latency_ms,
            prompt_tokens: 0,
            completion_tokens: 0,
            tps_overall: 0.0,
            tps_prefill: 0.0,
            tps_decode: 0.0,
            error: error.into(),
            pass_fail: false,
            meta,
            response_chars: 0,
        }
    }

    /// Fills the three throughput figures from the timing and token fields.
    pub fn compute_throughput(&mut self) {
        let (overall, prefill, decode) = throughput(
            self.prompt_tokens,
            self.completion_tokens,
            self.ttft_ms,
            self.total_latency_ms,
        );
        self.tps_overall = overall;
        self.tps_prefill = prefill;
        self.tps_decode = decode;
    }
}

/// Returns `(overall, prefill, decode)` tokens per second.
///
/// The first completion token is charged to the prefill window, so decode
/// throughput only counts the remaining `completion_tokens - 1` tokens and is
/// zero when there is at most one of them.
pub fn throughput(
    prompt_tokens: u64,
    completion_tokens: u64,
    ttft_ms: f64,
    total_latency_ms: f64,
) -> (f64, f64, f64) {
    let per_second = |tokens: f64, ms: f64| if ms > 0.0 { tokens / (ms / 1000.0) } else { 0.0 };

    let overall = per_second(completion_tokens as f64, total_latency_ms);
    let prefill = per_second(prompt_tokens as f64, ttft_ms);
    let decode = if completion_tokens > 1 {
        per_second((completion_tokens - 1) as f64, total_latency_ms - ttft_ms)
    } else {
        0.0
    };
    (overall, prefill, decode)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextAggregate {
    pub context: usize,
    pub run_count: usize,
    pub success_count: usize,
    pub pass_rate_pct: f64,
    pub correct_rate_pct: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub avg_ttft_ms: f64,
    pub avg_tps_overall: f64,
    pub avg_tps_prefill: f64,
    pub avg_tps_decode: f64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
}

impl ContextAggregate {
    /// Aggregates one bucket. Latency, TTFT and TPS statistics only cover
    /// successful runs; the pass rate covers every record.
    pub fn from_runs(context: usize, runs: &[RequestMetrics]) -> Self {
        let successes: Vec<&RequestMetrics> = runs.iter().filter(|run| run.success).collect();
        let run_count = runs.len();
        let success_count = successes.len();
        let correct = runs.iter().filter(|run| run.pass_fail).count();

        let mut latencies: Vec<f64> = successes.iter().map(|run| run.total_latency_ms).collect();
        latencies.sort_by(|a, b| a.total_cmp(b));

        Self {
            context,
            run_count,
            success_count,
            pass_rate_pct: percent(success_count, run_count),
            correct_rate_pct: percent(correct, run_count),
            avg_latency_ms: mean(&latencies),
            p50_latency_ms: percentile(&latencies, 0.50).unwrap_or(0.0),
            p95_latency_ms: percentile(&latencies, 0.95).unwrap_or(0.0),
            p99_latency_ms: percentile(&latencies, 0.99).unwrap_or(0.0),
            avg_ttft_ms: mean_of(&successes, |run| run.ttft_ms),
            avg_tps_overall: mean_of(&successes, |run| run.tps_overall),
            avg_tps_prefill: mean_of(&successes, |run| run.tps_prefill),
            avg_tps_decode: mean_of(&successes, |run| run.tps_decode),
            total_prompt_tokens: successes.iter().map(|run| run.prompt_tokens).sum(),
            total_completion_tokens: successes.iter().map(|run| run.completion_tokens).sum(),
        }
    }
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    100.0 * part as f64 / whole as f64
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn mean_of(runs: &[&RequestMetrics], field: impl Fn(&RequestMetrics) -> f64) -> f64 {
    let values: Vec<f64> = runs.iter().map(|run| field(*run)).collect();
    mean(&values)
}

/// Nearest-rank style percentile over an ascending slice: index
/// `floor(len * quantile)`, clamped to the last element.
pub fn percentile(sorted: &[f64], quantile: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }

    let clamped = quantile.clamp(0.0, 1.0);
    let idx = ((sorted.len() as f64 * clamped).floor() as usize).min(sorted.len() - 1);
    sorted.get(idx).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run(success: bool, latency: f64) -> RequestMetrics {
        let mut metrics = RequestMetrics::failed(Utc::now(), 1024, latency, "", Meta::new());
        metrics.success = success;
        metrics.pass_fail = success;
        if success {
            metrics.ttft_ms = latency / 4.0;
            metrics.prompt_tokens = 1024;
            metrics.completion_tokens = 10;
            metrics.compute_throughput();
        }
        metrics
    }

    #[test]
    fn decode_tps_is_zero_for_single_token() {
        let (overall, prefill, decode) = throughput(100, 1, 50.0, 100.0);
        assert_eq!(decode, 0.0);
        assert!((overall - 10.0).abs() < 1e-9);
        assert!((prefill - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn decode_tps_is_zero_without_decode_time() {
        let (_, _, decode) = throughput(100, 5, 100.0, 100.0);
        assert_eq!(decode, 0.0);
        let (overall, prefill, _) = throughput(100, 5, 0.0, 0.0);
        assert_eq!(overall, 0.0);
        assert_eq!(prefill, 0.0);
    }

    #[test]
    fn decode_tps_excludes_first_token() {
        let (_, _, decode) = throughput(100, 11, 100.0, 1100.0);
        assert!((decode - 10.0).abs() < 1e-9);
    }

    #[test]
    fn percentile_uses_floor_index() {
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(percentile(&values, 0.50), Some(6.0));
        assert_eq!(percentile(&values, 0.95), Some(10.0));
        assert_eq!(percentile(&values, 0.99), Some(10.0));
        assert_eq!(percentile(&[3.0], 0.5), Some(3.0));
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn aggregate_counts_every_run_in_pass_rate() {
        let runs = vec![
            run(true, 300.0),
            run(false, 10.0),
            run(true, 100.0),
            run(true, 200.0),
            run(false, 5.0),
        ];
        let aggregate = ContextAggregate::from_runs(1024, &runs);

        assert_eq!(aggregate.context, 1024);
        assert_eq!(aggregate.run_count, 5);
        assert_eq!(aggregate.success_count, 3);
        assert!((aggregate.pass_rate_pct - 60.0).abs() < 1e-9);
        assert!((aggregate.avg_latency_ms - 200.0).abs() < 1e-9);
        assert_eq!(aggregate.p50_latency_ms, 200.0);
        assert!(aggregate.p50_latency_ms <= aggregate.p95_latency_ms);
        assert!(aggregate.p95_latency_ms <= aggregate.p99_latency_ms);
        assert!((aggregate.avg_ttft_ms - 50.0).abs() < 1e-9);
        assert_eq!(aggregate.total_prompt_tokens, 3 * 1024);
        assert_eq!(aggregate.total_completion_tokens, 30);
    }

    #[test]
    fn aggregate_of_all_failures_is_zeroed() {
        let runs = vec![run(false, 10.0), run(false, 20.0)];
        let aggregate = ContextAggregate::from_runs(2048, &runs);
        assert_eq!(aggregate.pass_rate_pct, 0.0);
        assert_eq!(aggregate.p99_latency_ms, 0.0);
        assert_eq!(aggregate.avg_tps_decode, 0.0);
    }

    proptest! {
        #[test]
        fn aggregate_holds_for_any_bucket(
            outcomes in prop::collection::vec((any::<bool>(), 1.0f64..60_000.0), 1..40),
        ) {
            let runs: Vec<RequestMetrics> = outcomes
                .iter()
                .map(|(success, latency)| run(*success, *latency))
                .collect();
            let aggregate = ContextAggregate::from_runs(1024, &runs);
            let successes = outcomes.iter().filter(|(success, _)| *success).count();

            prop_assert_eq!(aggregate.run_count, runs.len());
            prop_assert_eq!(aggregate.success_count, successes);
            let expected = 100.0 * successes as f64 / runs.len() as f64;
            prop_assert!((aggregate.pass_rate_pct - expected).abs() < 1e-9);
            prop_assert!(aggregate.p50_latency_ms <= aggregate.p95_latency_ms);
            prop_assert!(aggregate.p95_latency_ms <= aggregate.p99_latency_ms);

            if successes == 0 {
                prop_assert_eq!(aggregate.avg_latency_ms, 0.0);
                prop_assert_eq!(aggregate.p99_latency_ms, 0.0);
                prop_assert_eq!(aggregate.avg_ttft_ms, 0.0);
                prop_assert_eq!(aggregate.avg_tps_overall, 0.0);
            } else {
                let fastest = outcomes
                    .iter()
                    .filter(|(success, _)| *success)
                    .map(|(_, latency)| *latency)
                    .fold(f64::INFINITY, f64::min);
                prop_assert!(aggregate.p50_latency_ms >= fastest);
            }
        }

        #[test]
        fn decode_rate_needs_two_tokens(
            prompt in 0u64..100_000,
            completion in 0u64..=1,
            ttft in 0.0f64..10_000.0,
            decode_ms in 0.0f64..10_000.0,
        ) {
            let (overall, prefill, decode) = throughput(prompt, completion, ttft, ttft + decode_ms);
            prop_assert_eq!(decode, 0.0);
            prop_assert!(overall >= 0.0);
            prop_assert!(prefill >= 0.0);
        }
    }
}
