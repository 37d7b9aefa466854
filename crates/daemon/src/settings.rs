//! System-wide daemon settings
//!
//! A single small TOML file next to the family configurations. A missing
//! file is replaced with defaults; an unreadable or unparseable file is
//! fatal at startup.

use paf_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Contents of `config.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Dashboard/API listener port
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    /// Anthropic-family proxy port
    #[serde(default = "default_claude_port")]
    pub claude_port: u16,
    /// OpenAI-family proxy port
    #[serde(default = "default_codex_port")]
    pub codex_port: u16,
    /// Default tracing filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Overall upstream request deadline in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Retention cap for the request log
    #[serde(default = "default_max_logs")]
    pub max_logs: usize,
    /// Optional data directory override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            web_port: default_web_port(),
            claude_port: default_claude_port(),
            codex_port: default_codex_port(),
            log_level: default_log_level(),
            request_timeout_secs: default_request_timeout_secs(),
            max_logs: default_max_logs(),
            data_dir: None,
        }
    }
}

impl Settings {
    /// Load settings, writing defaults when the file does not exist
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` when the file exists but cannot be read or parsed;
    /// callers treat this as fatal.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            let settings = Self::default();
            settings.write(path)?;
            info!("Wrote default settings to {}", path.display());
            return Ok(settings);
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config_invalid(path.display().to_string(), e.to_string()))?;
        toml::from_str(&content)
            .map_err(|e| Error::config_invalid(path.display().to_string(), e.to_string()))
    }

    fn write(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| Error::Persist(format!("serialize settings: {e}")))?;
        std::fs::write(path, text)
            .map_err(|e| Error::Persist(format!("write {}: {e}", path.display())))?;
        Ok(())
    }
}

fn default_web_port() -> u16 {
    8800
}

fn default_claude_port() -> u16 {
    8801
}

fn default_codex_port() -> u16 {
    8802
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_max_logs() -> usize {
    1000
}
