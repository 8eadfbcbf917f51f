use std::error::Error as StdError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};

use crate::config::BenchmarkConfig;
use crate::parser::{parse_chunk, parse_line, ParsedChunk, StreamLine, Usage};
use crate::report::RequestMetrics;
use crate::scenario::{Scenario, CHARS_PER_TOKEN};
use crate::telemetry::TelemetrySink;

/// Longest error message kept on a failed record.
pub const MAX_ERROR_CHARS: usize = 200;

const LIVE_TPS_MIN_ELAPSED: Duration = Duration::from_millis(50);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection error: {0}")]
    Connect(String),
    #[error("HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("stream interrupted: {0}")]
    Stream(String),
    #[error("{0}")]
    Other(String),
}

impl RequestError {
    fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            RequestError::Timeout(timeout)
        } else if err.is_connect() {
            RequestError::Connect(describe(&err))
        } else if err.is_body() || err.is_decode() {
            RequestError::Stream(describe(&err))
        } else {
            RequestError::Other(describe(&err))
        }
    }
}

fn describe(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

pub fn truncate_message(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &message[..idx]),
        None => message.to_string(),
    }
}

/// Executes single benchmark requests. `dry_run` marks warmup calls, which
/// use a small output cap.
#[async_trait]
pub trait RequestRunner: Send + Sync {
    async fn execute(
        &self,
        context_len: usize,
        dry_run: bool,
        telemetry: &dyn TelemetrySink,
    ) -> RequestMetrics;
}

#[derive(Debug, Default)]
struct StreamingSession {
    text: String,
    fragments: u64,
    first_token: Option<Duration>,
    finish_reason: Option<String>,
    usage: Usage,
    chunks: usize,
    malformed_lines: usize,
}

impl StreamingSession {
    /// Returns true once the stream signalled its end.
    fn consume_line(&mut self, line: &str, elapsed: Duration, telemetry: &dyn TelemetrySink) -> bool {
        match parse_line(line) {
            StreamLine::Blank => false,
            StreamLine::Done => true,
            StreamLine::Malformed(err) => {
                self.malformed_lines += 1;
                tracing::debug!("skipping malformed stream line: {}", err);
                false
            }
            StreamLine::Chunk(chunk) => self.apply(chunk, elapsed, telemetry),
        }
    }

    fn apply(&mut self, chunk: ParsedChunk, elapsed: Duration, telemetry: &dyn TelemetrySink) -> bool {
        self.chunks += 1;
        self.usage.merge(chunk.usage);

        if !chunk.content.is_empty() {
            self.fragments += 1;
            if self.first_token.is_none() {
                self.first_token = Some(elapsed);
                telemetry.set_ttft(as_ms(elapsed));
            }
            self.text.push_str(&chunk.content);

            if self.fragments % 2 == 0 && elapsed > LIVE_TPS_MIN_ELAPSED {
                telemetry.set_tps(self.fragments as f64 / elapsed.as_secs_f64());
            }
        }

        match chunk.finish_reason {
            Some(reason) => {
                self.finish_reason = Some(reason);
                true
            }
            None => false,
        }
    }
}

fn as_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Streams completions from one runtime endpoint.
pub struct RequestExecutor {
    client: Client,
    config: Arc<BenchmarkConfig>,
    scenario: Arc<dyn Scenario>,
}

impl RequestExecutor {
    pub fn new(config: Arc<BenchmarkConfig>, scenario: Arc<dyn Scenario>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to construct HTTP client")?;
        Ok(Self {
            client,
            config,
            scenario,
        })
    }

    fn request_body(&self, prompt: &str, dry_run: bool) -> Value {
        let max_tokens = if dry_run {
            self.config.warmup_max_tokens
        } else {
            self.config.max_tokens
        };
        let mut body = json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": true,
            "max_tokens": max_tokens,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
        });
        if let (Some(seed), Some(map)) = (self.config.seed, body.as_object_mut()) {
            map.insert("seed".to_string(), json!(seed));
        }
        body
    }

    async fn stream_completion(
        &self,
        prompt: &str,
        dry_run: bool,
        start: Instant,
        telemetry: &dyn TelemetrySink,
    ) -> Result<StreamingSession, RequestError> {
        let timeout = self.config.request_timeout;
        let mut request = self.client.post(self.config.endpoint.clone());
        for (name, value) in self.config.headers.iter() {
            request = request.header(name, value);
        }
        let response = request
            .json(&self.request_body(prompt, dry_run))
            .send()
            .await
            .map_err(|err| RequestError::from_reqwest(err, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RequestError::Http {
                status,
                body: truncate_message(body.trim(), MAX_ERROR_CHARS),
            });
        }

        if is_plain_json(&response) {
            return read_whole_body(response, timeout, start, telemetry).await;
        }

        let mut session = StreamingSession::default();
        let mut buffer: Vec<u8> = Vec::new();
        let mut finished = false;
        let mut stream = response.bytes_stream();

        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| RequestError::from_reqwest(err, timeout))?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                if session.consume_line(&line, start.elapsed(), telemetry) {
                    finished = true;
                    break 'read;
                }
            }
        }

        if !finished && !buffer.is_empty() {
            let line = String::from_utf8_lossy(&buffer).into_owned();
            session.consume_line(&line, start.elapsed(), telemetry);
        }

        if session.malformed_lines > 0 {
            tracing::debug!(
                malformed = session.malformed_lines,
                "stream contained unparseable lines"
            );
        }
        Ok(session)
    }

    fn finish(
        &self,
        session: StreamingSession,
        prompt: &str,
        timestamp: chrono::DateTime<Utc>,
        context_len: usize,
        total: Duration,
        meta: crate::scenario::Meta,
    ) -> RequestMetrics {
        let total_latency_ms = as_ms(total);
        // a response that arrived as one indivisible chunk has no separate
        // first-token instant
        let ttft_ms = session
            .first_token
            .map(as_ms)
            .unwrap_or(total_latency_ms);

        let prompt_tokens = session
            .usage
            .prompt_tokens
            .unwrap_or((prompt.chars().count() / CHARS_PER_TOKEN) as u64);
        let completion_tokens = session.usage.completion_tokens.unwrap_or(session.fragments);
        let pass_fail = self.scenario.validate(&session.text, &meta);

        let mut metrics = RequestMetrics {
            timestamp,
            context_len,
            success: true,
            ttft_ms,
            total_latency_ms,
            prompt_tokens,
            completion_tokens,
            tps_overall: 0.0,
            tps_prefill: 0.0,
            tps_decode: 0.0,
            error: String::new(),
            pass_fail,
            meta,
            response_chars: session.text.chars().count(),
        };
        metrics.compute_throughput();
        metrics
    }
}

fn is_plain_json(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim_start().starts_with("application/json"))
        .unwrap_or(false)
}

/// Handles servers that ignore `stream: true` and answer with one JSON body.
/// Some label a line-delimited stream `application/json`; a body that is not a
/// single JSON value is therefore split into lines before it counts as
/// undecodable.
async fn read_whole_body(
    response: Response,
    timeout: Duration,
    start: Instant,
    telemetry: &dyn TelemetrySink,
) -> Result<StreamingSession, RequestError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|err| RequestError::from_reqwest(err, timeout))?;
    let value: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => return split_into_lines(&bytes, err, start, telemetry),
    };
    let chunk = parse_chunk(&value);

    let fragments = u64::from(!chunk.content.is_empty());
    Ok(StreamingSession {
        text: chunk.content,
        fragments,
        finish_reason: chunk.finish_reason,
        usage: chunk.usage,
        chunks: 1,
        ..StreamingSession::default()
    })
}

fn split_into_lines(
    bytes: &[u8],
    decode_error: serde_json::Error,
    start: Instant,
    telemetry: &dyn TelemetrySink,
) -> Result<StreamingSession, RequestError> {
    let mut session = StreamingSession::default();
    for line in String::from_utf8_lossy(bytes).lines() {
        if session.consume_line(line, start.elapsed(), telemetry) {
            break;
        }
    }
    if session.chunks == 0 {
        return Err(RequestError::Decode(decode_error.to_string()));
    }
    // the body still arrived in one piece
    session.first_token = None;
    Ok(session)
}

#[async_trait]
impl RequestRunner for RequestExecutor {
    async fn execute(
        &self,
        context_len: usize,
        dry_run: bool,
        telemetry: &dyn TelemetrySink,
    ) -> RequestMetrics {
        let (prompt, meta) = self.scenario.generate_prompt(context_len);
        let timestamp = Utc::now();
        telemetry.start_request();

        let start = Instant::now();
        let outcome = self.stream_completion(&prompt, dry_run, start, telemetry).await;
        let total = start.elapsed();

        let metrics = match outcome {
            Ok(session) => self.finish(session, &prompt, timestamp, context_len, total, meta),
            Err(err) => {
                let message = truncate_message(&err.to_string(), MAX_ERROR_CHARS);
                tracing::warn!(context_len, dry_run, "request failed: {}", message);
                RequestMetrics::failed(timestamp, context_len, as_ms(total), message, meta)
            }
        };

        telemetry.end_request(metrics.total_latency_ms);
        metrics
    }
}

/// Verifies the runtime answers on `{base}/v1/models` before a sweep starts.
/// Any HTTP response counts as reachable.
pub async fn probe_runtime(config: &BenchmarkConfig) -> Result<()> {
    let url = config.health_url()?;
    tracing::info!(%url, "checking runtime");
    let client = Client::builder()
        .timeout(HEALTH_PROBE_TIMEOUT)
        .build()
        .context("failed to construct HTTP client")?;
    let mut request = client.get(url.clone());
    for (name, value) in config.headers.iter() {
        request = request.header(name, value);
    }
    let response = request
        .send()
        .await
        .map_err(|err| anyhow!("runtime not accessible at {}: {}", url, describe(&err)))?;
    tracing::info!(status = %response.status(), "runtime is online");
    Ok(())
}
