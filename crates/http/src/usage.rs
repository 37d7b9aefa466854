//! Token-usage extraction from upstream responses
//!
//! Works on the captured response buffer after the stream has completed.
//! Plain JSON bodies are tried first; anything else is scanned as an SSE
//! stream. Field names differ per family: Anthropic reports
//! `input_tokens`/`output_tokens`, OpenAI reports
//! `prompt_tokens`/`completion_tokens`. Later events overwrite earlier
//! values field by field, so the trailing usage event of a stream wins.

use paf_core::{Family, UsageMetrics};
use serde_json::Value;

/// Extract usage metrics from a buffered response body
pub fn extract_usage(family: Family, body: &[u8]) -> Option<UsageMetrics> {
    let text = std::str::from_utf8(body).ok()?;

    if let Ok(json) = serde_json::from_str::<Value>(text) {
        let mut usage = UsageMetrics::default();
        if merge_from_event(family, &json, &mut usage) {
            finalize(&mut usage);
            return Some(usage);
        }
        return None;
    }

    extract_from_sse(family, text)
}

fn extract_from_sse(family: Family, stream: &str) -> Option<UsageMetrics> {
    let mut usage = UsageMetrics::default();
    let mut found = false;

    for line in stream.lines() {
        let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        if let Ok(json) = serde_json::from_str::<Value>(data) {
            found |= merge_from_event(family, &json, &mut usage);
        }
    }

    if found {
        finalize(&mut usage);
        Some(usage)
    } else {
        None
    }
}

/// Fold one event's usage object into the accumulator
///
/// Tolerates unknown shapes: events without a usage object are ignored, and
/// usage objects nested under `message` (Anthropic `message_start`) are
/// found too.
fn merge_from_event(family: Family, event: &Value, usage: &mut UsageMetrics) -> bool {
    let object = event
        .get("usage")
        .or_else(|| event.get("message").and_then(|m| m.get("usage")));
    let Some(object) = object else {
        return false;
    };

    let (prompt_key, completion_key) = match family {
        Family::Claude => ("input_tokens", "output_tokens"),
        Family::Codex => ("prompt_tokens", "completion_tokens"),
    };

    let mut found = false;
    if let Some(value) = object.get(prompt_key).and_then(Value::as_u64) {
        usage.prompt_tokens = value;
        found = true;
    }
    if let Some(value) = object.get(completion_key).and_then(Value::as_u64) {
        usage.completion_tokens = value;
        found = true;
    }
    if let Some(value) = object.get("total_tokens").and_then(Value::as_u64) {
        usage.total_tokens = value;
        found = true;
    }
    if let Some(value) = object.get("cache_creation_input_tokens").and_then(Value::as_u64) {
        usage.cache_creation_input_tokens = Some(value);
        found = true;
    }
    if let Some(value) = object.get("cache_read_input_tokens").and_then(Value::as_u64) {
        usage.cache_read_input_tokens = Some(value);
        found = true;
    }
    if let Some(model) = event.get("model").and_then(Value::as_str) {
        usage.model = model.to_string();
    } else if let Some(model) = event
        .get("message")
        .and_then(|m| m.get("model"))
        .and_then(Value::as_str)
    {
        usage.model = model.to_string();
    }
    found
}

fn finalize(usage: &mut UsageMetrics) {
    if usage.total_tokens == 0 {
        usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
    }
}
