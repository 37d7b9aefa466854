//! On-disk store for per-family endpoint configuration
//!
//! Each family persists to a single human-editable TOML file. The in-memory
//! view is an `Arc<FamilyState>` behind an `RwLock`: readers clone the `Arc`
//! and never observe a partially written state; every mutation replaces the
//! whole snapshot after the file has been atomically rewritten.

use crate::error::{Error, Result};
use crate::types::{EndpointProfile, Family, FamilyState, Mode};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Persisted, hot-reloadable configuration for one family
#[derive(Debug)]
pub struct ConfigStore {
    family: Family,
    path: PathBuf,
    state: RwLock<Arc<FamilyState>>,
}

impl ConfigStore {
    /// Load a family's state from `dir`
    ///
    /// # Errors
    ///
    /// `ConfigMissing` if the file does not exist, `ConfigInvalid` if it
    /// cannot be parsed.
    pub fn open(family: Family, dir: &Path) -> Result<Self> {
        let path = dir.join(family.config_file());
        let state = Self::read_file(&path)?;
        debug!(
            "Loaded {} configuration with {} profiles from {}",
            family,
            state.configs.len(),
            path.display()
        );
        Ok(Self {
            family,
            path,
            state: RwLock::new(Arc::new(state)),
        })
    }

    /// Load a family's state, writing a default file when none exists
    pub fn open_or_init(family: Family, dir: &Path) -> Result<Self> {
        match Self::open(family, dir) {
            Ok(store) => Ok(store),
            Err(Error::ConfigMissing { .. }) => {
                let path = dir.join(family.config_file());
                info!("Creating default {} configuration at {}", family, path.display());
                let store = Self {
                    family,
                    path,
                    state: RwLock::new(Arc::new(FamilyState::default())),
                };
                store.save(FamilyState::default())?;
                Ok(store)
            }
            Err(e) => Err(e),
        }
    }

    fn read_file(path: &Path) -> Result<FamilyState> {
        if !path.exists() {
            return Err(Error::config_missing(path.display().to_string()));
        }
        let content = fs::read_to_string(path)
            .map_err(|e| Error::config_invalid(path.display().to_string(), e.to_string()))?;
        let mut state: FamilyState = toml::from_str(&content)
            .map_err(|e| Error::config_invalid(path.display().to_string(), e.to_string()))?;
        normalize(&mut state);
        Ok(state)
    }

    /// The family this store belongs to
    pub fn family(&self) -> Family {
        self.family
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cheap read of the latest fully committed state
    pub fn snapshot(&self) -> Arc<FamilyState> {
        self.state.read().unwrap().clone()
    }

    /// Re-read the backing file, replacing the in-memory snapshot
    pub fn reload(&self) -> Result<()> {
        let state = Self::read_file(&self.path)?;
        *self.state.write().unwrap() = Arc::new(state);
        Ok(())
    }

    /// Normalise, persist and publish a whole new family state
    ///
    /// The file is written to a sibling tempfile and renamed over the
    /// previous version so concurrent readers of the file (and of the
    /// in-memory snapshot) see either the old or the new state, never a mix.
    pub fn save(&self, mut state: FamilyState) -> Result<()> {
        normalize(&mut state);

        let text = toml::to_string_pretty(&state)
            .map_err(|e| Error::Persist(format!("serialize {}: {e}", self.family)))?;

        let parent = self
            .path
            .parent()
            .ok_or_else(|| Error::Persist(format!("no parent dir for {}", self.path.display())))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| Error::Persist(format!("create tempfile in {}: {e}", parent.display())))?;
        tmp.write_all(text.as_bytes())
            .map_err(|e| Error::Persist(format!("write {}: {e}", self.path.display())))?;
        tmp.persist(&self.path)
            .map_err(|e| Error::Persist(format!("rename over {}: {e}", self.path.display())))?;

        *self.state.write().unwrap() = Arc::new(state);
        debug!("Saved {} configuration to {}", self.family, self.path.display());
        Ok(())
    }

    /// Clone the current state, apply `f`, then save the result
    pub fn mutate<F>(&self, f: F) -> Result<Arc<FamilyState>>
    where
        F: FnOnce(&mut FamilyState),
    {
        let mut next = (*self.snapshot()).clone();
        f(&mut next);
        self.save(next)?;
        Ok(self.snapshot())
    }

    /// The slice of profiles the selector may consider
    ///
    /// Manual mode yields at most the enabled active profile; load-balance
    /// mode yields every enabled profile.
    pub fn eligible_pool(&self) -> Vec<EndpointProfile> {
        let state = self.snapshot();
        match state.mode {
            Mode::Manual => state
                .active_profile()
                .filter(|p| p.enabled)
                .cloned()
                .into_iter()
                .collect(),
            Mode::LoadBalance => state
                .configs
                .iter()
                .filter(|p| p.enabled)
                .cloned()
                .collect(),
        }
    }
}

/// Repair a state so it satisfies the persistence invariants
///
/// Duplicate names keep their first occurrence; negative or non-finite
/// weights collapse to 0; `active.name` must refer to an enabled profile or
/// is replaced by the first enabled name (empty when none exists).
fn normalize(state: &mut FamilyState) {
    let mut seen = HashSet::new();
    state.configs.retain(|p| {
        let fresh = seen.insert(p.name.clone());
        if !fresh {
            warn!("Dropping duplicate profile name '{}'", p.name);
        }
        fresh
    });

    for profile in &mut state.configs {
        if !profile.weight.is_finite() || profile.weight < 0.0 {
            profile.weight = 0.0;
        }
    }

    let active_ok = !state.active.name.is_empty()
        && state
            .configs
            .iter()
            .any(|p| p.name == state.active.name && p.enabled);
    if !active_ok {
        state.active.name = state
            .configs
            .iter()
            .find(|p| p.enabled)
            .map(|p| p.name.clone())
            .unwrap_or_default();
    }
}
