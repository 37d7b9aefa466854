//! Shared state for the dashboard and proxy routers

use crate::forward::Forwarder;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paf_core::{EndpointProfile, Family, RequestLogReader};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Outcome of a one-shot credential test against a profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_preview: Option<String>,
    pub completed_at: DateTime<Utc>,
    /// What produced the result ("http" or "cli")
    pub source: String,
    pub method: String,
    pub path: String,
}

/// Runs credential tests for the `POST /api/configs/{name}/test` route
#[async_trait]
pub trait CredentialTester: Send + Sync {
    async fn test(&self, family: Family, profile: &EndpointProfile) -> TestReport;
}

/// State shared by every dashboard/API handler
#[derive(Clone)]
pub struct AppState {
    pub claude: Arc<Forwarder>,
    pub codex: Arc<Forwarder>,
    pub logs: Arc<dyn RequestLogReader>,
    pub tester: Arc<dyn CredentialTester>,
    started: Instant,
    last_results: Arc<Mutex<HashMap<Family, HashMap<String, TestReport>>>>,
}

impl AppState {
    pub fn new(
        claude: Arc<Forwarder>,
        codex: Arc<Forwarder>,
        logs: Arc<dyn RequestLogReader>,
        tester: Arc<dyn CredentialTester>,
    ) -> Self {
        Self {
            claude,
            codex,
            logs,
            tester,
            started: Instant::now(),
            last_results: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The forwarder serving `family`
    pub fn forwarder(&self, family: Family) -> &Arc<Forwarder> {
        match family {
            Family::Claude => &self.claude,
            Family::Codex => &self.codex,
        }
    }

    /// Seconds since the daemon started
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Remember the latest credential-test result for a profile
    pub fn store_test_result(&self, family: Family, name: &str, report: TestReport) {
        self.last_results
            .lock()
            .unwrap()
            .entry(family)
            .or_default()
            .insert(name.to_string(), report);
    }

    /// Latest credential-test results for one family
    pub fn test_results(&self, family: Family) -> HashMap<String, TestReport> {
        self.last_results
            .lock()
            .unwrap()
            .get(&family)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop the remembered result for a deleted profile
    pub fn forget_test_result(&self, family: Family, name: &str) {
        if let Some(results) = self.last_results.lock().unwrap().get_mut(&family) {
            results.remove(name);
        }
    }
}

impl TestReport {
    /// Report for a profile that cannot be tested at all
    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code: None,
            duration_ms: 0,
            message: Some(message.into()),
            response_preview: None,
            completed_at: Utc::now(),
            source: "none".to_string(),
            method: String::new(),
            path: String::new(),
        }
    }
}

/// Truncate a string to at most `max` bytes on a char boundary
pub fn limit_string(input: &str, max: usize) -> String {
    if input.len() <= max {
        return input.to_string();
    }
    let mut truncated = String::new();
    for ch in input.chars() {
        if truncated.len() + ch.len_utf8() > max {
            break;
        }
        truncated.push(ch);
    }
    if truncated.len() < input.len() {
        truncated.push('…');
    }
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_string_respects_char_boundaries() {
        assert_eq!(limit_string("hello", 10), "hello");
        assert_eq!(limit_string("hello", 3), "hel…");
        // multibyte chars are never split
        let s = "héllo";
        let out = limit_string(s, 2);
        assert!(out.starts_with('h'));
        assert!(!out.contains('\u{fffd}'));
    }
}
