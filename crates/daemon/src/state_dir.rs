//! Data directory resolution

use paf_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable overriding the base directory
pub const HOME_ENV: &str = "PAF_HOME";

/// Resolves where configuration and data live
///
/// Precedence: explicit override (CLI flag), `$PAF_HOME`, then `~/.paf`.
#[derive(Debug, Clone)]
pub struct StateDir {
    base: PathBuf,
}

impl StateDir {
    pub fn new(override_dir: Option<PathBuf>) -> Result<Self> {
        let base = match override_dir {
            Some(dir) => dir,
            None => match std::env::var_os(HOME_ENV) {
                Some(dir) => PathBuf::from(dir),
                None => dirs::home_dir()
                    .ok_or_else(|| Error::internal("cannot determine home directory"))?
                    .join(".paf"),
            },
        };
        Ok(Self { base })
    }

    /// Root of the data directory (family config files live here)
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// System-wide settings file
    pub fn config_path(&self) -> PathBuf {
        self.base.join("config.toml")
    }

    /// Directory for runtime data (request log database)
    pub fn data_dir(&self) -> PathBuf {
        self.base.join("data")
    }

    /// Request log database path
    pub fn request_log_path(&self) -> PathBuf {
        self.data_dir().join("proxy_requests.db")
    }

    /// Create every required directory; failures here are fatal at startup
    pub fn create_directories(&self) -> Result<()> {
        for dir in [self.base.clone(), self.data_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::internal(format!("failed to create directory {}: {e}", dir.display()))
            })?;
            debug!("Ensured directory exists: {}", dir.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn override_takes_precedence() {
        let tmp = TempDir::new().unwrap();
        let state = StateDir::new(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(state.base(), tmp.path());
        assert_eq!(state.config_path(), tmp.path().join("config.toml"));
        assert_eq!(
            state.request_log_path(),
            tmp.path().join("data").join("proxy_requests.db")
        );
    }

    #[test]
    fn create_directories_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let state = StateDir::new(Some(tmp.path().join("nested"))).unwrap();
        state.create_directories().unwrap();
        state.create_directories().unwrap();
        assert!(state.data_dir().exists());
    }
}
