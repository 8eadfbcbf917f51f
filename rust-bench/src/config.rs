use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::scenario::ScenarioKind;
use crate::telemetry::TelemetrySettings;

/// Output cap for warmup requests.
pub const WARMUP_MAX_TOKENS: u32 = 10;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("context list is empty")]
    NoContexts,
    #[error("context lengths must be strictly ascending (found {0} after {1})")]
    NotAscending(usize, usize),
    #[error("context_end ({end}) is smaller than context_start ({start})")]
    InvertedRange { start: usize, end: usize },
    #[error("linear context schedule requires context_step")]
    MissingStep,
    #[error("either context_lengths or context_start/context_end must be set")]
    MissingSchedule,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    #[default]
    Linear,
    Geometric,
}

/// Order in which context-length buckets are visited.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContextSchedule {
    Explicit(Vec<usize>),
    /// `start, start + step, ...` up to and including `end`.
    Linear { start: usize, end: usize, step: usize },
    /// `start, 2 * start, 4 * start, ...` up to and including `end`.
    Geometric { start: usize, end: usize },
}

impl ContextSchedule {
    pub fn contexts(&self) -> Result<Vec<usize>, ConfigError> {
        let contexts = match self {
            ContextSchedule::Explicit(list) => list.clone(),
            ContextSchedule::Linear { start, end, step } => {
                check_range(*start, *end)?;
                if *step == 0 {
                    return Err(ConfigError::Zero("context_step"));
                }
                (*start..=*end).step_by(*step).collect()
            }
            ContextSchedule::Geometric { start, end } => {
                check_range(*start, *end)?;
                let mut contexts = Vec::new();
                let mut current = Some(*start);
                while let Some(value) = current.filter(|value| value <= end) {
                    contexts.push(value);
                    current = value.checked_mul(2);
                }
                contexts
            }
        };
        validate_contexts(&contexts)?;
        Ok(contexts)
    }
}

fn check_range(start: usize, end: usize) -> Result<(), ConfigError> {
    if start == 0 {
        return Err(ConfigError::Zero("context_start"));
    }
    if end < start {
        return Err(ConfigError::InvertedRange { start, end });
    }
    Ok(())
}

fn validate_contexts(contexts: &[usize]) -> Result<(), ConfigError> {
    if contexts.is_empty() {
        return Err(ConfigError::NoContexts);
    }
    if contexts.contains(&0) {
        return Err(ConfigError::Zero("context length"));
    }
    for pair in contexts.windows(2) {
        if pair[1] <= pair[0] {
            return Err(ConfigError::NotAscending(pair[1], pair[0]));
        }
    }
    Ok(())
}

/// YAML benchmark description as written by the operator.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub runtime: RuntimeSection,
    pub test: TestSection,
    pub scenario: ScenarioKind,
    pub telemetry: TelemetrySection,
    pub aidaptiv: AidaptivSection,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub endpoint: String,
    pub model_name: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    /// Extra headers sent with every request, e.g. a tenant or routing key.
    pub headers: BTreeMap<String, String>,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/v1/completions".to_string(),
            model_name: "default".to_string(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSection {
    pub context_lengths: Option<Vec<usize>>,
    pub context_start: Option<usize>,
    pub context_end: Option<usize>,
    pub context_step: Option<usize>,
    pub context_mode: StepMode,
    pub runs_per_context: usize,
    pub concurrency: usize,
    pub max_tokens_output: u32,
    pub timeout_seconds: u64,
    pub temperature: f64,
    pub top_p: f64,
    pub seed: Option<u64>,
    pub ram_limit: Option<f64>,
}

impl Default for TestSection {
    fn default() -> Self {
        Self {
            context_lengths: None,
            context_start: None,
            context_end: None,
            context_step: None,
            context_mode: StepMode::Linear,
            runs_per_context: 3,
            concurrency: 1,
            max_tokens_output: 128,
            timeout_seconds: 300,
            temperature: 0.0,
            top_p: 1.0,
            seed: Some(42),
            ram_limit: None,
        }
    }
}

impl TestSection {
    pub fn schedule(&self) -> Result<ContextSchedule, ConfigError> {
        if let Some(list) = &self.context_lengths {
            return Ok(ContextSchedule::Explicit(list.clone()));
        }
        let (Some(start), Some(end)) = (self.context_start, self.context_end) else {
            return Err(ConfigError::MissingSchedule);
        };
        match self.context_mode {
            StepMode::Linear => Ok(ContextSchedule::Linear {
                start,
                end,
                step: self.context_step.ok_or(ConfigError::MissingStep)?,
            }),
            StepMode::Geometric => Ok(ContextSchedule::Geometric { start, end }),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub sample_interval_sec: f64,
    pub dashboard_url: Option<String>,
    pub storage_device: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            sample_interval_sec: 1.0,
            dashboard_url: None,
            storage_device: "nvme0n1".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AidaptivSection {
    pub enable_command: Option<String>,
    pub disable_command: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to open {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

#[derive(Clone, Debug)]
pub struct BenchmarkConfig {
    pub endpoint: Url,
    pub model: String,
    pub scenario: ScenarioKind,
    pub contexts: Vec<usize>,
    pub runs_per_context: usize,
    pub concurrency: usize,
    pub max_tokens: u32,
    pub warmup_max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub seed: Option<u64>,
    pub request_timeout: Duration,
    pub headers: HeaderMap,
    pub telemetry: TelemetrySettings,
    pub enable_command: Option<String>,
    pub disable_command: Option<String>,
}

impl BenchmarkConfig {
    pub fn try_new(
        endpoint: impl AsRef<str>,
        api_key: Option<String>,
        model: impl Into<String>,
        contexts: Vec<usize>,
        runs_per_context: usize,
        concurrency: usize,
    ) -> Result<Self> {
        if runs_per_context == 0 {
            return Err(ConfigError::Zero("runs_per_context").into());
        }
        if concurrency == 0 {
            return Err(ConfigError::Zero("concurrency").into());
        }
        validate_contexts(&contexts)?;

        let endpoint = Url::parse(endpoint.as_ref())
            .with_context(|| format!("invalid endpoint URL: {}", endpoint.as_ref()))?;

        let mut headers = HeaderMap::new();
        if let Some(api_key) = api_key {
            if !api_key.is_empty() {
                let auth_value = format!("Bearer {}", api_key);
                let header_value = HeaderValue::from_str(&auth_value)
                    .context("failed to build Authorization header from api_key")?;
                headers.insert(AUTHORIZATION, header_value);
            }
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let model = model.into();
        Ok(Self {
            endpoint,
            telemetry: TelemetrySettings {
                model_name: model.clone(),
                ..TelemetrySettings::default()
            },
            model,
            scenario: ScenarioKind::Synthetic,
            contexts,
            runs_per_context,
            concurrency,
            max_tokens: 128,
            warmup_max_tokens: WARMUP_MAX_TOKENS,
            temperature: 0.0,
            top_p: 1.0,
            seed: Some(42),
            request_timeout: Duration::from_secs(300),
            headers,
            enable_command: None,
            disable_command: None,
        })
    }

    /// Builds a validated config from a parsed YAML file. The API key is taken
    /// from the file or, failing that, from the configured environment variable.
    pub fn from_file(file: &FileConfig) -> Result<Self> {
        let contexts = file.test.schedule()?.contexts()?;
        let api_key = file
            .runtime
            .api_key
            .clone()
            .or_else(|| std::env::var(&file.runtime.api_key_env).ok());

        let sample_interval = Duration::try_from_secs_f64(file.telemetry.sample_interval_sec)
            .context("telemetry.sample_interval_sec must be a non-negative number")?;

        let mut config = Self::try_new(
            &file.runtime.endpoint,
            api_key,
            file.runtime.model_name.clone(),
            contexts,
            file.test.runs_per_context,
            file.test.concurrency,
        )?
        .with_scenario(file.scenario)
        .with_max_tokens(file.test.max_tokens_output)
        .with_sampling(file.test.temperature, file.test.top_p, file.test.seed)
        .with_stage_commands(
            file.aidaptiv.enable_command.clone(),
            file.aidaptiv.disable_command.clone(),
        );

        if file.test.timeout_seconds == 0 {
            return Err(ConfigError::Zero("timeout_seconds").into());
        }
        config = config.with_request_timeout(Duration::from_secs(file.test.timeout_seconds));

        for (name, value) in &file.runtime.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name in runtime.headers: {}", name))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {}", name))?;
            config = config.add_header(name, value);
        }

        config.telemetry = TelemetrySettings {
            sample_interval,
            dashboard_url: file.telemetry.dashboard_url.clone(),
            storage_device: file.telemetry.storage_device.clone(),
            ram_limit_gb: file.test.ram_limit,
            model_name: config.model.clone(),
        };
        Ok(config)
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        if !request_timeout.is_zero() {
            self.request_timeout = request_timeout;
        }
        self
    }

    pub fn with_scenario(mut self, scenario: ScenarioKind) -> Self {
        self.scenario = scenario;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        if max_tokens > 0 {
            self.max_tokens = max_tokens;
        }
        self
    }

    pub fn with_sampling(mut self, temperature: f64, top_p: f64, seed: Option<u64>) -> Self {
        self.temperature = temperature;
        self.top_p = top_p;
        self.seed = seed;
        self
    }

    pub fn with_stage_commands(mut self, enable: Option<String>, disable: Option<String>) -> Self {
        self.enable_command = enable;
        self.disable_command = disable;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySettings) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn add_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// `GET {base}/v1/models`, where `base` is the endpoint up to its last `/v1`.
    pub fn health_url(&self) -> Result<Url> {
        let endpoint = self.endpoint.as_str();
        let base = match endpoint.rfind("/v1") {
            Some(idx) => &endpoint[..idx],
            None => endpoint.trim_end_matches('/'),
        };
        let url = format!("{}/v1/models", base);
        Url::parse(&url).with_context(|| format!("invalid health probe URL: {}", url))
    }
}
