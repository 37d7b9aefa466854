//! Upstream selection
//!
//! Picks one endpoint out of an eligibility-filtered pool. The weighted
//! strategy is sticky: once a profile is chosen, later selections keep
//! returning it until it leaves the pool, freezes, or crosses the failure
//! threshold, so a conversation stays on one upstream and its caches and
//! rate-limit counters co-locate.

use crate::health::HealthTracker;
use crate::types::{EndpointProfile, LoadBalancerSettings, Strategy};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct SelectorState {
    /// Most recent sticky pick
    current: Option<String>,
    /// Monotonic round-robin cursor
    rr_cursor: usize,
    /// Rotation cursor per exact weight value (keyed by the f64 bit pattern)
    bucket_cursors: HashMap<u64, usize>,
}

/// Per-family endpoint selector
#[derive(Debug, Default)]
pub struct Selector {
    state: Mutex<SelectorState>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick one profile from `pool`, or `None` when the pool is empty
    ///
    /// `pool` is expected to be pre-filtered to enabled profiles (manual
    /// mode passes at most the active one). Frozen and over-threshold
    /// profiles are filtered here, each filter falling back to the previous
    /// level when it would empty the set: the proxy must still serve
    /// something when every upstream has misbehaved.
    pub fn select(
        &self,
        pool: &[EndpointProfile],
        settings: &LoadBalancerSettings,
        health: &HealthTracker,
        now_ms: i64,
    ) -> Option<EndpointProfile> {
        if pool.is_empty() {
            self.state.lock().unwrap().current = None;
            return None;
        }

        let threshold = settings.health_check.failure_threshold;

        let unfrozen: Vec<&EndpointProfile> =
            pool.iter().filter(|p| !p.is_frozen(now_ms)).collect();
        let level2: Vec<&EndpointProfile> = if unfrozen.is_empty() {
            pool.iter().collect()
        } else {
            unfrozen
        };

        let under_threshold: Vec<&EndpointProfile> = level2
            .iter()
            .copied()
            .filter(|p| !health.exceeded_failure_threshold(&p.name, threshold))
            .collect();

        match settings.strategy {
            Strategy::RoundRobin => {
                let set = if under_threshold.is_empty() {
                    &level2
                } else {
                    &under_threshold
                };
                let mut state = self.state.lock().unwrap();
                let index = state.rr_cursor % set.len();
                state.rr_cursor = state.rr_cursor.wrapping_add(1);
                let picked = set[index].clone();
                state.current = Some(picked.name.clone());
                Some(picked)
            }
            Strategy::Weighted => self.select_weighted(&level2, &under_threshold),
        }
    }

    fn select_weighted(
        &self,
        level2: &[&EndpointProfile],
        under_threshold: &[&EndpointProfile],
    ) -> Option<EndpointProfile> {
        let mut state = self.state.lock().unwrap();

        // Sticky reuse: the previous pick must still be in the eligible set
        // and under the failure threshold.
        if let Some(current) = state.current.clone() {
            if let Some(profile) = under_threshold.iter().find(|p| p.name == current) {
                return Some((*profile).clone());
            }
        }

        if !under_threshold.is_empty() {
            // Group by exact weight; walk buckets in descending weight
            // order; names sort ascending within a bucket and a per-bucket
            // cursor rotates through ties.
            let mut buckets: Vec<(f64, Vec<&EndpointProfile>)> = Vec::new();
            for profile in under_threshold.iter().copied() {
                match buckets.iter_mut().find(|(w, _)| *w == profile.weight) {
                    Some((_, members)) => members.push(profile),
                    None => buckets.push((profile.weight, vec![profile])),
                }
            }
            buckets.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

            for (weight, mut members) in buckets {
                members.sort_by(|a, b| a.name.cmp(&b.name));
                let cursor = state.bucket_cursors.entry(weight.to_bits()).or_insert(0);
                let picked = members[*cursor % members.len()].clone();
                *cursor = cursor.wrapping_add(1);
                debug!("Selected '{}' (weight {})", picked.name, weight);
                state.current = Some(picked.name.clone());
                return Some(picked);
            }
        }

        // Every candidate is over its failure threshold: fall back to a
        // proportional-random pick and do not mark it sticky.
        state.current = None;
        drop(state);
        let picked = weighted_random(level2)?;
        debug!(
            "All upstreams over failure threshold, random fallback to '{}'",
            picked.name
        );
        Some(picked)
    }

    /// The most recent sticky selection, validated against the live pool
    ///
    /// Returns `None` once the current profile has left the pool or crossed
    /// the failure threshold; the stale name is cleared as a side effect.
    pub fn current(
        &self,
        pool: &[EndpointProfile],
        health: &HealthTracker,
        failure_threshold: u32,
    ) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        if let Some(current) = state.current.clone() {
            let valid = pool.iter().any(|p| p.name == current)
                && !health.exceeded_failure_threshold(&current, failure_threshold);
            if !valid {
                state.current = None;
            }
        }
        state.current.clone()
    }

    /// Forget the sticky selection
    pub fn clear_current(&self) {
        self.state.lock().unwrap().current = None;
    }
}

fn weighted_random(candidates: &[&EndpointProfile]) -> Option<EndpointProfile> {
    if candidates.is_empty() {
        return None;
    }
    let total: f64 = candidates.iter().map(|p| p.weight).sum();
    let mut rng = rand::thread_rng();
    if total <= 0.0 {
        return Some(candidates[rng.gen_range(0..candidates.len())].clone());
    }
    let mut remaining = rng.gen::<f64>() * total;
    for profile in candidates {
        remaining -= profile.weight;
        if remaining <= 0.0 {
            return Some((*profile).clone());
        }
    }
    Some(candidates[candidates.len() - 1].clone())
}
