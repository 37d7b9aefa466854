//! Freeze lifecycle: bounded quarantine of misbehaving endpoints
//!
//! Freezes are persisted on the profile (`freeze_until`, epoch ms) through
//! the config store, so they survive restarts and are visible to external
//! editors of the family file. Deadlines only ever move forward: a later
//! failure may extend a freeze, never shorten it.

use crate::error::Result;
use crate::store::ConfigStore;
use crate::types::now_ms;
use std::sync::Arc;
use tracing::info;

/// Writes and clears `freeze_until` on a family's profiles
#[derive(Clone)]
pub struct FreezeManager {
    store: Arc<ConfigStore>,
}

impl FreezeManager {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    /// Freeze `name` for `duration_ms` from now, extending monotonically
    ///
    /// Returns the effective deadline. Unknown names are a no-op.
    ///
    /// # Errors
    ///
    /// `Persist` when the family file cannot be rewritten; the in-memory
    /// snapshot is left unchanged in that case and the caller is expected to
    /// log and continue.
    pub fn freeze(&self, name: &str, duration_ms: u64) -> Result<i64> {
        let deadline = now_ms() + duration_ms as i64;
        let mut effective = deadline;
        self.store.mutate(|state| {
            if let Some(profile) = state.profile_mut(name) {
                effective = match profile.freeze_until {
                    Some(existing) if existing > deadline => existing,
                    _ => deadline,
                };
                profile.freeze_until = Some(effective);
            }
        })?;
        info!(
            "Froze {} endpoint '{}' until {}",
            self.store.family(),
            name,
            effective
        );
        Ok(effective)
    }

    /// Clear a freeze after a successful response or probe
    ///
    /// Skips the save entirely when the profile is not frozen.
    pub fn clear(&self, name: &str) -> Result<()> {
        let frozen = self
            .store
            .snapshot()
            .profile(name)
            .map(|p| p.freeze_until.is_some())
            .unwrap_or(false);
        if !frozen {
            return Ok(());
        }
        self.store.mutate(|state| {
            if let Some(profile) = state.profile_mut(name) {
                profile.freeze_until = None;
            }
        })?;
        info!("Unfroze {} endpoint '{}'", self.store.family(), name);
        Ok(())
    }

    /// Names of profiles whose freeze deadline has elapsed
    pub fn thaw_candidates(&self, now: i64) -> Vec<String> {
        self.store
            .snapshot()
            .configs
            .iter()
            .filter(|p| matches!(p.freeze_until, Some(until) if until <= now))
            .map(|p| p.name.clone())
            .collect()
    }
}
