//! In-memory per-endpoint health bookkeeping
//!
//! Records are keyed by profile name within a family and rebuilt from
//! scratch at startup; nothing here is persisted. The tracker never writes
//! to the config store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Consecutive success/failure counters for one endpoint
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_checked: None,
        }
    }
}

/// Per-family health tracker
#[derive(Debug, Default)]
pub struct HealthTracker {
    records: Mutex<HashMap<String, HealthRecord>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful upstream interaction
    pub fn mark_success(&self, name: &str, success_threshold: u32) {
        let mut records = self.records.lock().unwrap();
        let record = records.entry(name.to_string()).or_default();
        record.consecutive_failures = 0;
        record.consecutive_successes += 1;
        if record.consecutive_successes >= success_threshold {
            record.healthy = true;
        }
        record.last_checked = Some(Utc::now());
    }

    /// Record a failed upstream interaction
    pub fn mark_failure(&self, name: &str, failure_threshold: u32) {
        let mut records = self.records.lock().unwrap();
        let record = records.entry(name.to_string()).or_default();
        record.consecutive_successes = 0;
        record.consecutive_failures += 1;
        if record.consecutive_failures >= failure_threshold {
            record.healthy = false;
        }
        record.last_checked = Some(Utc::now());
    }

    /// Whether the endpoint has reached the failure threshold
    ///
    /// Absent records count as healthy.
    pub fn exceeded_failure_threshold(&self, name: &str, failure_threshold: u32) -> bool {
        self.records
            .lock()
            .unwrap()
            .get(name)
            .map(|r| r.consecutive_failures >= failure_threshold)
            .unwrap_or(false)
    }

    /// Current record for an endpoint (defaults when never seen)
    pub fn record(&self, name: &str) -> HealthRecord {
        self.records
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop the record entirely (used after profile deletion)
    pub fn reset(&self, name: &str) {
        self.records.lock().unwrap().remove(name);
    }

    /// Copy of every record, for the dashboard
    pub fn all(&self) -> HashMap<String, HealthRecord> {
        self.records.lock().unwrap().clone()
    }
}
