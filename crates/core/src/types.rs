//! Data model for per-family proxy configuration

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// One of the two upstream ecosystems fronted by the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    /// Anthropic-compatible upstreams
    Claude,
    /// OpenAI-compatible upstreams
    Codex,
}

impl Family {
    /// Stable string identifier used in files, URLs and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Claude => "claude",
            Family::Codex => "codex",
        }
    }

    /// File name of this family's persisted configuration
    pub fn config_file(&self) -> String {
        format!("{}.toml", self.as_str())
    }

    /// Parse a family from its string identifier
    pub fn parse(s: &str) -> Option<Family> {
        match s {
            "claude" => Some(Family::Claude),
            "codex" => Some(Family::Codex),
            _ => None,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One upstream entry within a family's pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointProfile {
    /// Unique human name within the family
    pub name: String,
    /// Upstream base URL, e.g. `https://api.anthropic.com`
    pub base_url: String,
    /// Bearer token injected as `Authorization: Bearer <token>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// API key injected as `x-api-key` (and `Authorization`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Selection weight; higher wins, may be fractional
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Disabled profiles are never selected
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Quarantine deadline in epoch milliseconds; absent = not frozen
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeze_until: Option<i64>,
}

impl EndpointProfile {
    /// Create a profile with default weight and enabled flag
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            auth_token: None,
            api_key: None,
            weight: default_weight(),
            enabled: true,
            freeze_until: None,
        }
    }

    /// Whether the profile is under an active freeze at `now_ms`
    pub fn is_frozen(&self, now_ms: i64) -> bool {
        matches!(self.freeze_until, Some(until) if until > now_ms)
    }
}

/// How requests are routed within a family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Only the explicitly activated profile is used
    #[default]
    Manual,
    /// The selector distributes requests across the enabled pool
    LoadBalance,
}

/// Load-balancer selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Strategy {
    #[default]
    #[serde(rename = "weighted")]
    Weighted,
    #[serde(rename = "round-robin")]
    RoundRobin,
}

/// Reference to the manually activated profile
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActiveRef {
    /// Profile name; empty when nothing is activated
    #[serde(default)]
    pub name: String,
}

/// Health-check and probe tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Probe interval in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval: u64,
    /// Probe timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
    /// Consecutive failures before a profile is considered unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive successes before an unhealthy profile recovers
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_interval_ms(),
            timeout: default_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// Per-family load-balancer settings
///
/// Scalar fields stay ahead of the nested table so the TOML writer never
/// emits a value after a sub-table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerSettings {
    #[serde(default)]
    pub strategy: Strategy,
    /// How long a quarantined profile stays frozen, in milliseconds
    #[serde(default = "default_freeze_duration_ms")]
    pub freeze_duration: u64,
    #[serde(default)]
    pub health_check: HealthCheckSettings,
}

impl Default for LoadBalancerSettings {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            freeze_duration: default_freeze_duration_ms(),
            health_check: HealthCheckSettings::default(),
        }
    }
}

/// The whole persisted state of one family
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FamilyState {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub active: ActiveRef,
    #[serde(default)]
    pub configs: Vec<EndpointProfile>,
    #[serde(default)]
    pub loadbalancer: LoadBalancerSettings,
}

impl FamilyState {
    /// Look up a profile by name
    pub fn profile(&self, name: &str) -> Option<&EndpointProfile> {
        self.configs.iter().find(|p| p.name == name)
    }

    /// Mutable lookup by name
    pub fn profile_mut(&mut self, name: &str) -> Option<&mut EndpointProfile> {
        self.configs.iter_mut().find(|p| p.name == name)
    }

    /// The manually activated profile, if any
    pub fn active_profile(&self) -> Option<&EndpointProfile> {
        if self.active.name.is_empty() {
            return None;
        }
        self.profile(&self.active.name)
    }
}

fn default_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    60_000
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

fn default_freeze_duration_ms() -> u64 {
    300_000
}
