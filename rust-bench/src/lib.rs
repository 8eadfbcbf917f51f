mod config;
mod executor;
pub mod logging;
mod output;
mod parser;
mod report;
mod runner;
mod scenario;
mod sweep;
mod telemetry;

pub use config::{
    BenchmarkConfig, ConfigError, ContextSchedule, FileConfig, StepMode, WARMUP_MAX_TOKENS,
};
pub use executor::{probe_runtime, RequestError, RequestExecutor, RequestRunner};
pub use output::{csv_row, git_revision, RunMetadata, RunWriter, REQUEST_CSV_HEADER};
pub use parser::{parse_chunk, parse_line, ParsedChunk, StreamLine, Usage};
pub use report::{percentile, throughput, ContextAggregate, RequestMetrics};
pub use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
pub use runner::run_bucket;
pub use scenario::{Meta, NeedleInHaystackScenario, Scenario, ScenarioKind, SyntheticScenario};
pub use sweep::{Stage, StageResult, SweepController, EARLY_EXIT_PASS_RATE_PCT};
pub use telemetry::{
    HostSample, NoopTelemetry, TelemetryCollector, TelemetrySettings, TelemetrySink,
    TestResultSnapshot,
};
