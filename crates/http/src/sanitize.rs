//! Request body sanitisation for the Anthropic family
//!
//! Some clients replay assistant thinking blocks back to the upstream;
//! upstream providers reject or double-bill them. The sanitiser walks the
//! message tree and drops those blocks. When nothing matches, the original
//! bytes are forwarded untouched - byte-exact preservation matters for
//! upstreams that hash the payload.

use axum::body::Bytes;
use serde_json::Value;
use tracing::debug;

/// Content-block types removed from outgoing messages
const STRIPPED_TYPES: [&str; 3] = ["thinking", "assistant_thinking", "reasoning"];

/// Result of sanitising a request body
#[derive(Debug)]
pub struct SanitizeOutcome {
    /// Body to forward upstream
    pub body: Bytes,
    /// Number of content blocks removed
    pub removed: u32,
}

/// Strip reasoning content blocks from an Anthropic-style request body
///
/// Non-JSON bodies (and JSON without the expected shape) are forwarded
/// verbatim; sanitisation failure is never fatal to the request.
pub fn strip_reasoning_blocks(raw: &Bytes) -> SanitizeOutcome {
    let mut tree: Value = match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(err) => {
            debug!("Request body is not JSON, forwarding raw bytes: {err}");
            return SanitizeOutcome {
                body: raw.clone(),
                removed: 0,
            };
        }
    };

    let mut removed = 0;
    for key in ["messages", "previous_messages"] {
        if let Some(Value::Array(messages)) = tree.get_mut(key) {
            for message in messages {
                removed += strip_from_message(message);
            }
        }
    }

    if removed == 0 {
        return SanitizeOutcome {
            body: raw.clone(),
            removed: 0,
        };
    }

    match serde_json::to_vec(&tree) {
        Ok(body) => SanitizeOutcome {
            body: Bytes::from(body),
            removed,
        },
        Err(err) => {
            debug!("Failed to re-serialise sanitised body, forwarding raw bytes: {err}");
            SanitizeOutcome {
                body: raw.clone(),
                removed: 0,
            }
        }
    }
}

fn strip_from_message(message: &mut Value) -> u32 {
    let Some(Value::Array(content)) = message.get_mut("content") else {
        return 0;
    };
    let before = content.len();
    content.retain(|block| !is_reasoning_block(block));
    (before - content.len()) as u32
}

fn is_reasoning_block(block: &Value) -> bool {
    block
        .get("type")
        .and_then(Value::as_str)
        .map(|t| {
            STRIPPED_TYPES
                .iter()
                .any(|stripped| t.eq_ignore_ascii_case(stripped))
        })
        .unwrap_or(false)
}
