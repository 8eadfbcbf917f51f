use serde_json::Value;

/// Token counts reported by the server, when it reports them at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

impl Usage {
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens.is_none() && self.completion_tokens.is_none()
    }

    /// Field-wise merge; values present in `other` win.
    pub fn merge(&mut self, other: Usage) {
        if other.prompt_tokens.is_some() {
            self.prompt_tokens = other.prompt_tokens;
        }
        if other.completion_tokens.is_some() {
            self.completion_tokens = other.completion_tokens;
        }
    }
}

/// One provider chunk reduced to the fields the executor cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedChunk {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamLine {
    Blank,
    Done,
    Chunk(ParsedChunk),
    Malformed(String),
}

/// Normalizes a decoded stream object. The format is detected on every chunk:
/// an Ollama `response` key takes precedence over an OpenAI `choices` array,
/// and anything else yields an empty chunk.
pub fn parse_chunk(value: &Value) -> ParsedChunk {
    if let Some(response) = value.get("response") {
        return parse_ollama(value, response);
    }

    match value.get("choices").and_then(Value::as_array) {
        Some(choices) if !choices.is_empty() => parse_openai(value, &choices[0]),
        _ => ParsedChunk::default(),
    }
}

fn parse_ollama(value: &Value, response: &Value) -> ParsedChunk {
    let content = response.as_str().unwrap_or_default().to_string();
    let done = value.get("done").and_then(Value::as_bool).unwrap_or(false);
    if !done {
        return ParsedChunk {
            content,
            ..ParsedChunk::default()
        };
    }

    ParsedChunk {
        content,
        finish_reason: Some("stop".to_string()),
        usage: Usage {
            prompt_tokens: value.get("prompt_eval_count").and_then(Value::as_u64),
            completion_tokens: value.get("eval_count").and_then(Value::as_u64),
        },
    }
}

fn parse_openai(value: &Value, choice: &Value) -> ParsedChunk {
    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(str::to_string);

    // streamed completions carry `delta`, legacy completions `text`, and a
    // non-streamed chat body `message`
    let content = choice
        .get("delta")
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)
        .or_else(|| choice.get("text").and_then(Value::as_str))
        .or_else(|| {
            choice
                .get("message")
                .and_then(|message| message.get("content"))
                .and_then(Value::as_str)
        })
        .unwrap_or_default()
        .to_string();

    let usage = value
        .get("usage")
        .filter(|usage| usage.is_object())
        .map(|usage| Usage {
            prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_u64),
            completion_tokens: usage.get("completion_tokens").and_then(Value::as_u64),
        })
        .unwrap_or_default();

    ParsedChunk {
        content,
        finish_reason,
        usage,
    }
}

/// Classifies one raw line of a streamed body. SSE `data: ` lines and bare
/// NDJSON lines are both accepted.
pub fn parse_line(line: &str) -> StreamLine {
    let trimmed = line.trim();
    if trimmed.is_empty() || is_sse_field(trimmed) {
        return StreamLine::Blank;
    }

    let payload = trimmed
        .strip_prefix("data:")
        .map(str::trim_start)
        .unwrap_or(trimmed);

    if payload.is_empty() {
        return StreamLine::Blank;
    }
    if payload == "[DONE]" {
        return StreamLine::Done;
    }

    match serde_json::from_str::<Value>(payload) {
        Ok(value) => StreamLine::Chunk(parse_chunk(&value)),
        Err(err) => StreamLine::Malformed(err.to_string()),
    }
}

fn is_sse_field(line: &str) -> bool {
    line.starts_with(':')
        || line.starts_with("event:")
        || line.starts_with("id:")
        || line.starts_with("retry:")
}
