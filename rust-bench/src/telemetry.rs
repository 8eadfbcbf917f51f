use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const SECTOR_BYTES: u64 = 512;
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
const DASHBOARD_PUSH_TIMEOUT: Duration = Duration::from_millis(100);

/// Live status pushed by the benchmark while it runs.
///
/// Every method is fire-and-forget: implementations must not block on I/O and
/// must swallow their own failures. Concurrent writers race on the scalar
/// fields and the last write wins.
pub trait TelemetrySink: Send + Sync {
    fn start_request(&self) {}

    fn set_ttft(&self, _ttft_ms: f64) {}

    fn set_tps(&self, _tps: f64) {}

    fn end_request(&self, _total_latency_ms: f64) {}

    fn set_status(&self, _status: &str) {}

    fn set_test_progress(&self, _current: usize, _total: usize, _planned: &[usize]) {}

    fn save_test_result(&self, _context: usize, _ttft_ms: f64, _runtime_ms: f64, _tps: f64) {}
}

/// Sink that drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {}

#[derive(Clone, Debug)]
pub struct TelemetrySettings {
    pub sample_interval: Duration,
    pub dashboard_url: Option<String>,
    pub storage_device: String,
    pub ram_limit_gb: Option<f64>,
    pub model_name: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            dashboard_url: None,
            storage_device: "nvme0n1".to_string(),
            ram_limit_gb: None,
            model_name: "Unknown".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq)]
pub struct TestResultSnapshot {
    pub ttft_ms: f64,
    pub runtime_ms: f64,
    pub tps: f64,
}

#[derive(Debug, Default)]
struct LiveState {
    status: String,
    tps: f64,
    ttft_ms: f64,
    last_latency_ms: f64,
    request_start: Option<Instant>,
    current_context: usize,
    total_contexts: usize,
    planned: Vec<usize>,
    results: BTreeMap<usize, TestResultSnapshot>,
}

impl LiveState {
    fn runtime_ms(&self) -> f64 {
        self.request_start
            .map(|start| start.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }
}

/// Polls host counters in the background and mirrors the live request status
/// to an optional dashboard.
pub struct TelemetryCollector {
    settings: TelemetrySettings,
    state: Arc<Mutex<LiveState>>,
    client: Client,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetryCollector {
    pub fn new(mut settings: TelemetrySettings) -> Self {
        if settings.sample_interval < MIN_SAMPLE_INTERVAL {
            settings.sample_interval = MIN_SAMPLE_INTERVAL;
        }
        let state = LiveState {
            status: "Initializing...".to_string(),
            ..LiveState::default()
        };
        Self {
            settings,
            state: Arc::new(Mutex::new(state)),
            client: Client::new(),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Starts the sampling task, which appends one row per interval to
    /// `output_path`.
    pub async fn start(&self, output_path: &Path) -> Result<()> {
        let mut file = tokio::fs::File::create(output_path)
            .await
            .with_context(|| format!("failed to create telemetry log {}", output_path.display()))?;
        file.write_all(HostSample::CSV_HEADER.as_bytes())
            .await
            .with_context(|| format!("failed to write telemetry log {}", output_path.display()))?;

        let poller = Poller {
            settings: self.settings.clone(),
            state: Arc::clone(&self.state),
            client: self.client.clone(),
            cancel: self.cancel.clone(),
            path: output_path.to_path_buf(),
        };
        let handle = tokio::spawn(poller.run(file));
        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
        tracing::info!(path = %output_path.display(), "telemetry started");
        Ok(())
    }

    /// Stops sampling and resets the dashboard to an idle snapshot.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!("telemetry task ended abnormally: {}", err);
            }
        }

        if let Some(url) = &self.settings.dashboard_url {
            let ram_total = self.settings.ram_limit_gb.unwrap_or(0.0);
            let idle = HostSample {
                ram_total_gb: ram_total,
                ..HostSample::default()
            };
            let payload = {
                let mut state = match self.state.lock() {
                    Ok(state) => state,
                    Err(poisoned) => poisoned.into_inner(),
                };
                state.tps = 0.0;
                state.request_start = None;
                dashboard_payload(&idle, &state, &self.settings.model_name)
            };
            push_snapshot(&self.client, url, &payload).await;
        }
        tracing::info!("telemetry stopped");
    }

    fn update(&self, apply: impl FnOnce(&mut LiveState)) {
        if let Ok(mut state) = self.state.lock() {
            apply(&mut state);
        }
    }

    pub fn test_results(&self) -> BTreeMap<usize, TestResultSnapshot> {
        self.state
            .lock()
            .map(|state| state.results.clone())
            .unwrap_or_default()
    }
}

impl TelemetrySink for TelemetryCollector {
    fn start_request(&self) {
        self.update(|state| {
            state.request_start = Some(Instant::now());
            state.ttft_ms = 0.0;
        });
    }

    fn set_ttft(&self, ttft_ms: f64) {
        self.update(|state| state.ttft_ms = ttft_ms);
    }

    fn set_tps(&self, tps: f64) {
        self.update(|state| state.tps = tps);
    }

    fn end_request(&self, total_latency_ms: f64) {
        self.update(|state| {
            state.last_latency_ms = total_latency_ms;
            state.request_start = None;
        });
    }

    fn set_status(&self, status: &str) {
        self.update(|state| state.status = status.to_string());
    }

    fn set_test_progress(&self, current: usize, total: usize, planned: &[usize]) {
        self.update(|state| {
            state.current_context = current;
            state.total_contexts = total;
            state.planned = planned.to_vec();
        });
    }

    fn save_test_result(&self, context: usize, ttft_ms: f64, runtime_ms: f64, tps: f64) {
        self.update(|state| {
            state.results.insert(
                context,
                TestResultSnapshot {
                    ttft_ms,
                    runtime_ms,
                    tps,
                },
            );
        });
    }
}

impl Drop for TelemetryCollector {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Poller {
    settings: TelemetrySettings,
    state: Arc<Mutex<LiveState>>,
    client: Client,
    cancel: CancellationToken,
    path: PathBuf,
}

impl Poller {
    async fn run(self, mut file: tokio::fs::File) {
        let mut sampler = HostSampler::new(&self.settings);
        sampler.prime().await;

        let mut ticker = tokio::time::interval(self.settings.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let sample = sampler.sample().await;
            if let Err(err) = file.write_all(sample.csv_row().as_bytes()).await {
                tracing::warn!(path = %self.path.display(), "failed to write telemetry row: {}", err);
            }

            if let Some(url) = &self.settings.dashboard_url {
                let payload = match self.state.lock() {
                    Ok(state) => dashboard_payload(&sample, &state, &self.settings.model_name),
                    Err(_) => continue,
                };
                push_snapshot(&self.client, url, &payload).await;
            }
        }

        if let Err(err) = file.flush().await {
            tracing::warn!(path = %self.path.display(), "failed to flush telemetry log: {}", err);
        }
    }
}

async fn push_snapshot(client: &Client, url: &str, payload: &Value) {
    let endpoint = format!("{}/update", url.trim_end_matches('/'));
    let result = client
        .post(&endpoint)
        .timeout(DASHBOARD_PUSH_TIMEOUT)
        .json(payload)
        .send()
        .await;
    if let Err(err) = result {
        tracing::trace!("dashboard push failed: {}", err);
    }
}

fn dashboard_payload(sample: &HostSample, state: &LiveState, model: &str) -> Value {
    json!({
        "timestamp": sample.timestamp,
        "status": state.status,
        "system": {
            "ram_used_gb": sample.ram_used_gb,
            "ram_total_gb": sample.ram_total_gb,
            "cpu_pct": sample.cpu_pct,
        },
        "gpu": {
            "vram_used_gb": sample.vram_used_gb,
            "vram_total_gb": sample.vram_total_gb,
        },
        "disk": {
            "read_mb_s": sample.disk_read_mb_s,
            "write_mb_s": sample.disk_write_mb_s,
        },
        "os_disk": {
            "read_mb_s": sample.os_read_mb_s,
            "write_mb_s": sample.os_write_mb_s,
        },
        "app": {
            "tps": state.tps,
            "model": model,
            "ttft_ms": state.ttft_ms,
            "runtime_ms": state.runtime_ms(),
            "last_latency_ms": state.last_latency_ms,
        },
        "test_progress": {
            "current_context": state.current_context,
            "total_contexts": state.total_contexts,
            "planned_contexts": state.planned,
            "results": state.results,
        },
    })
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq)]
pub struct HostSample {
    pub timestamp: f64,
    pub elapsed_sec: f64,
    pub ram_used_gb: f64,
    pub ram_total_gb: f64,
    pub vram_used_gb: f64,
    pub vram_total_gb: f64,
    pub disk_read_mb_s: f64,
    pub disk_write_mb_s: f64,
    pub os_read_mb_s: f64,
    pub os_write_mb_s: f64,
    pub cpu_pct: f64,
}

impl HostSample {
    pub const CSV_HEADER: &'static str = "timestamp,elapsed_sec,ram_used_gb,ram_total_gb,vram_used_gb,vram_total_gb,disk_read_mb_s,disk_write_mb_s,os_read_mb_s,os_write_mb_s,cpu_pct\n";

    pub fn csv_row(&self) -> String {
        format!(
            "{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{:.1}\n",
            self.timestamp,
            self.elapsed_sec,
            self.ram_used_gb,
            self.ram_total_gb,
            self.vram_used_gb,
            self.vram_total_gb,
            self.disk_read_mb_s,
            self.disk_write_mb_s,
            self.os_read_mb_s,
            self.os_write_mb_s,
            self.cpu_pct
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct DiskTotals {
    target_read: u64,
    target_write: u64,
    other_read: u64,
    other_write: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

struct HostSampler {
    storage_device: String,
    ram_limit_gb: Option<f64>,
    started: Instant,
    last_poll: Instant,
    last_disk: DiskTotals,
    last_cpu: CpuTimes,
    gpu_available: bool,
}

impl HostSampler {
    fn new(settings: &TelemetrySettings) -> Self {
        let ram_limit_gb = if cfg!(target_os = "linux") {
            settings.ram_limit_gb
        } else {
            None
        };
        Self {
            storage_device: settings.storage_device.clone(),
            ram_limit_gb,
            started: Instant::now(),
            last_poll: Instant::now(),
            last_disk: DiskTotals::default(),
            last_cpu: CpuTimes::default(),
            gpu_available: true,
        }
    }

    async fn prime(&mut self) {
        self.last_disk = self.disk_totals().await;
        self.last_cpu = read_proc("/proc/stat")
            .await
            .and_then(|text| parse_cpu_times(&text))
            .unwrap_or_default();
        self.last_poll = Instant::now();
    }

    async fn sample(&mut self) -> HostSample {
        let now = Instant::now();
        let dt = now.duration_since(self.last_poll).as_secs_f64();

        let (ram_total, ram_available) = read_proc("/proc/meminfo")
            .await
            .and_then(|text| parse_meminfo(&text))
            .unwrap_or((0, 0));
        let ram_used_gb = ram_total.saturating_sub(ram_available) as f64 / BYTES_PER_GB;
        let ram_total_gb = self
            .ram_limit_gb
            .unwrap_or(ram_total as f64 / BYTES_PER_GB);

        let (vram_used, vram_total) = self.gpu_memory().await;

        let disk = self.disk_totals().await;
        let rate = |current: u64, last: u64| {
            if dt > 0.0 {
                current.saturating_sub(last) as f64 / BYTES_PER_MB / dt
            } else {
                0.0
            }
        };
        let disk_read_mb_s = rate(disk.target_read, self.last_disk.target_read);
        let disk_write_mb_s = rate(disk.target_write, self.last_disk.target_write);
        let os_read_mb_s = rate(disk.other_read, self.last_disk.other_read);
        let os_write_mb_s = rate(disk.other_write, self.last_disk.other_write);
        self.last_disk = disk;

        let cpu = read_proc("/proc/stat")
            .await
            .and_then(|text| parse_cpu_times(&text))
            .unwrap_or_default();
        let cpu_pct = cpu_percent(self.last_cpu, cpu);
        self.last_cpu = cpu;
        self.last_poll = now;

        HostSample {
            timestamp: unix_seconds(),
            elapsed_sec: now.duration_since(self.started).as_secs_f64(),
            ram_used_gb,
            ram_total_gb,
            vram_used_gb: vram_used as f64 / BYTES_PER_GB,
            vram_total_gb: vram_total as f64 / BYTES_PER_GB,
            disk_read_mb_s,
            disk_write_mb_s,
            os_read_mb_s,
            os_write_mb_s,
            cpu_pct,
        }
    }

    async fn disk_totals(&self) -> DiskTotals {
        let Some(text) = read_proc("/proc/diskstats").await else {
            return DiskTotals::default();
        };
        let mut totals = DiskTotals::default();
        for (name, read, write) in parse_diskstats(&text) {
            if name == self.storage_device {
                totals.target_read += read;
                totals.target_write += write;
            } else if is_whole_device(&name).await {
                totals.other_read += read;
                totals.other_write += write;
            }
        }
        totals
    }

    /// Summed used/total VRAM in bytes. A failed probe disables later ones.
    async fn gpu_memory(&mut self) -> (u64, u64) {
        if !self.gpu_available {
            return (0, 0);
        }
        let probe = Command::new("nvidia-smi")
            .args([
                "--query-gpu=memory.used,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(Duration::from_secs(1), probe).await {
            Ok(Ok(output)) if output.status.success() => {
                parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
            }
            _ => {
                tracing::debug!("nvidia-smi unavailable, reporting zero VRAM");
                self.gpu_available = false;
                (0, 0)
            }
        }
    }
}

async fn read_proc(path: &str) -> Option<String> {
    tokio::fs::read_to_string(path).await.ok()
}

async fn is_whole_device(name: &str) -> bool {
    if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
        return false;
    }
    tokio::fs::metadata(format!("/sys/block/{}", name)).await.is_ok()
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// Returns `(total, available)` in bytes.
fn parse_meminfo(text: &str) -> Option<(u64, u64)> {
    let field = |key: &str| {
        text.lines()
            .find(|line| line.starts_with(key))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|value| value.parse::<u64>().ok())
            .map(|kib| kib * 1024)
    };
    Some((field("MemTotal:")?, field("MemAvailable:")?))
}

/// Returns `(device, bytes_read, bytes_written)` for every line.
fn parse_diskstats(text: &str) -> Vec<(String, u64, u64)> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let read = fields[5].parse::<u64>().ok()?;
            let write = fields[9].parse::<u64>().ok()?;
            Some((fields[2].to_string(), read * SECTOR_BYTES, write * SECTOR_BYTES))
        })
        .collect()
}

fn parse_cpu_times(text: &str) -> Option<CpuTimes> {
    let line = text.lines().find(|line| line.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|value| value.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

fn cpu_percent(previous: CpuTimes, current: CpuTimes) -> f64 {
    let total = current.total.saturating_sub(previous.total);
    if total == 0 {
        return 0.0;
    }
    current.busy.saturating_sub(previous.busy) as f64 * 100.0 / total as f64
}

/// Sums `used, total` MiB rows across devices, returned in bytes.
fn parse_nvidia_smi(text: &str) -> (u64, u64) {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split(',').map(str::trim);
            let used = parts.next()?.parse::<u64>().ok()?;
            let total = parts.next()?.parse::<u64>().ok()?;
            Some((used, total))
        })
        .fold((0, 0), |(used, total), (u, t)| {
            (used + u * 1024 * 1024, total + t * 1024 * 1024)
        })
}
