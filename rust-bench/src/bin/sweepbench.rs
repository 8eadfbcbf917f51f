use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use sweepbench_rs::{
    logging, probe_runtime, BenchmarkConfig, ContextAggregate, FileConfig, RequestExecutor,
    RunWriter, ScenarioKind, Stage, StageResult, SweepController, TelemetryCollector,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StageSelection {
    All,
    Baseline,
    Aidaptiv,
}

impl StageSelection {
    fn stages(self) -> Vec<Stage> {
        match self {
            StageSelection::All => vec![Stage::Baseline, Stage::Aidaptiv],
            StageSelection::Baseline => vec![Stage::Baseline],
            StageSelection::Aidaptiv => vec![Stage::Aidaptiv],
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "sweepbench",
    about = "Sweep an LLM runtime across context lengths, baseline vs aiDAPTIV"
)]
struct Args {
    /// Path to the YAML benchmark description
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run both stages or only one of them
    #[arg(long, value_enum, default_value_t = StageSelection::All)]
    stage: StageSelection,

    /// Resume/append to an existing run directory instead of a new timestamped one
    #[arg(long)]
    run_id: Option<String>,

    /// Root directory for run results
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,

    /// Do not wait for confirmation between the baseline and aiDAPTIV stages
    #[arg(long)]
    no_pause: bool,

    /// Completion endpoint (overrides runtime.endpoint)
    #[arg(long)]
    endpoint: Option<String>,

    /// Model identifier sent in each request (overrides runtime.model_name)
    #[arg(long)]
    model: Option<String>,

    /// Concurrent requests per context (overrides test.concurrency)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Measured requests per context (overrides test.runs_per_context)
    #[arg(long)]
    runs_per_context: Option<usize>,

    /// Prompt scenario: synthetic or needle
    #[arg(long)]
    scenario: Option<ScenarioKind>,

    /// Live dashboard base URL (overrides telemetry.dashboard_url)
    #[arg(long)]
    dashboard_url: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply_overrides(&self, file: &mut FileConfig) {
        if let Some(endpoint) = &self.endpoint {
            file.runtime.endpoint = endpoint.clone();
        }
        if let Some(model) = &self.model {
            file.runtime.model_name = model.clone();
        }
        if let Some(concurrency) = self.concurrency {
            file.test.concurrency = concurrency;
        }
        if let Some(runs) = self.runs_per_context {
            file.test.runs_per_context = runs;
        }
        if let Some(scenario) = self.scenario {
            file.scenario = scenario;
        }
        if let Some(url) = &self.dashboard_url {
            file.telemetry.dashboard_url = Some(url.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose)?;

    let mut file = FileConfig::load(&args.config)?;
    args.apply_overrides(&mut file);
    let config = Arc::new(BenchmarkConfig::from_file(&file)?);

    probe_runtime(&config).await?;

    let writer = RunWriter::create(&args.results_dir, args.run_id.as_deref()).await?;
    tracing::info!(dir = %writer.dir().display(), "results will be saved here");

    let executor = RequestExecutor::new(Arc::clone(&config), config.scenario.build())?;
    let controller =
        SweepController::new(Arc::clone(&config), Arc::new(executor)).with_writer(writer.clone());

    let mut completed = Vec::new();
    for (idx, stage) in args.stage.stages().into_iter().enumerate() {
        if idx > 0 && !args.no_pause && !intermission(writer.run_id()).await? {
            tracing::info!("exiting benchmark early");
            break;
        }

        let collector = Arc::new(TelemetryCollector::new(config.telemetry.clone()));
        collector.start(&writer.telemetry_path(stage)).await?;
        let outcome = controller.run_stage(stage, collector.clone()).await;
        collector.stop().await;

        let result = outcome?;
        print_summary(&result);
        completed.push(result);
    }

    if let [baseline, aidaptiv] = completed.as_slice() {
        print_comparison(baseline, aidaptiv);
    }

    tracing::info!(dir = %writer.dir().display(), "benchmark complete");
    Ok(())
}

/// Waits for the operator to switch the runtime over. Returns false on `q`.
async fn intermission(run_id: &str) -> Result<bool> {
    println!("{}", "=".repeat(60));
    println!("PAUSED FOR MANUAL TOGGLE");
    println!("Enable aiDAPTIV on the target server now.");
    println!("If a reboot is needed, stop here and later run:");
    println!("  sweepbench --stage aidaptiv --run-id {}", run_id);
    println!("{}", "=".repeat(60));
    print!("Press Enter to continue, or 'q' to quit >> ");
    io::stdout().flush().context("failed to flush stdout")?;

    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).map(|_| line)
    })
    .await
    .context("stdin reader task failed")?
    .context("failed to read from stdin")?;

    Ok(!answer.trim().eq_ignore_ascii_case("q"))
}

fn print_summary(result: &StageResult) {
    println!("Stage {} ({} contexts)", result.stage.label(), result.aggregates.len());
    for aggregate in &result.aggregates {
        print_aggregate(aggregate);
    }
    if let Some(context) = result.aborted_at {
        println!("  stopped early at context {} (pass rate below 50%)", context);
    }
}

fn print_aggregate(aggregate: &ContextAggregate) {
    println!(
        "  ctx {:>7}: pass {:>5.1}% | latency avg {:.0} p50 {:.0} p95 {:.0} p99 {:.0} ms | ttft {:.0} ms | prefill {:.1} tok/s | decode {:.1} tok/s",
        aggregate.context,
        aggregate.pass_rate_pct,
        aggregate.avg_latency_ms,
        aggregate.p50_latency_ms,
        aggregate.p95_latency_ms,
        aggregate.p99_latency_ms,
        aggregate.avg_ttft_ms,
        aggregate.avg_tps_prefill,
        aggregate.avg_tps_decode
    );
}

fn print_comparison(baseline: &StageResult, aidaptiv: &StageResult) {
    println!("Baseline vs aiDAPTIV (avg latency ms)");
    for base in &baseline.aggregates {
        let other = aidaptiv
            .aggregates
            .iter()
            .find(|aggregate| aggregate.context == base.context);
        match other {
            Some(other) if base.avg_latency_ms > 0.0 => println!(
                "  ctx {:>7}: {:.0} -> {:.0} ({:+.1}%)",
                base.context,
                base.avg_latency_ms,
                other.avg_latency_ms,
                (other.avg_latency_ms - base.avg_latency_ms) * 100.0 / base.avg_latency_ms
            ),
            Some(other) => println!(
                "  ctx {:>7}: n/a -> {:.0}",
                base.context, other.avg_latency_ms
            ),
            None => println!("  ctx {:>7}: {:.0} -> n/a", base.context, base.avg_latency_ms),
        }
    }
    for extra in aidaptiv
        .aggregates
        .iter()
        .filter(|aggregate| baseline.aggregates.iter().all(|base| base.context != aggregate.context))
    {
        println!("  ctx {:>7}: n/a -> {:.0}", extra.context, extra.avg_latency_ms);
    }
}
