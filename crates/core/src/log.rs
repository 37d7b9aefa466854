//! Completed-request records and the sink seam
//!
//! The forwarder emits one [`RequestRecord`] per completed request through a
//! [`RequestSink`]. The sink must not block the hot path; the production
//! implementation hands records to a background writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token usage extracted from an upstream response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Anthropic prompt-cache writes, when the upstream reports them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    /// Anthropic prompt-cache reads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    pub model: String,
}

/// One completed (or failed) proxied request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Opaque unique id
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Family identifier ("claude" / "codex")
    pub service: String,
    pub method: String,
    pub path: String,
    /// 0 when the upstream was never reached
    pub status_code: u16,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Name of the endpoint profile that served the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    /// Content blocks removed by the request sanitiser
    #[serde(default)]
    pub stripped_blocks: u32,
    /// Bounded preview of the request body, for the log detail view
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    /// Bounded preview of the response body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageMetrics>,
}

impl RequestRecord {
    /// Skeleton record for a request that is about to be forwarded
    pub fn started(id: impl Into<String>, service: &str, method: &str, path: &str) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now(),
            service: service.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            status_code: 0,
            duration_ms: 0,
            success: false,
            error_message: None,
            config_name: None,
            target_url: None,
            stripped_blocks: 0,
            request_body: None,
            response_body: None,
            usage: None,
        }
    }
}

/// Destination for completed-request records
///
/// Implementations must return quickly; losing records on crash is
/// acceptable, blocking the forwarder is not.
pub trait RequestSink: Send + Sync {
    fn record(&self, record: RequestRecord);
}

/// Aggregate request statistics for the dashboard
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_duration_ms: u64,
    /// Request count per family
    pub per_service: std::collections::HashMap<String, u64>,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_tokens: u64,
}

/// Read side of the request log, consumed by the dashboard API
pub trait RequestLogReader: Send + Sync {
    /// Most recent records first, optionally filtered to one family
    fn logs(
        &self,
        limit: usize,
        offset: usize,
        service: Option<&str>,
    ) -> crate::Result<Vec<RequestRecord>>;
    fn log_by_id(&self, id: &str) -> crate::Result<Option<RequestRecord>>;
    fn clear(&self) -> crate::Result<()>;
    fn stats(&self) -> crate::Result<LogStats>;
}
