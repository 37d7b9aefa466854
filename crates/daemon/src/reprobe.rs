//! Background re-probe loop
//!
//! One task per family. Every minute it scans the config store for profiles
//! whose freeze deadline has elapsed and issues one probe each through the
//! forwarder, which updates health and freeze state the same way a proxied
//! request would. An in-flight guard keeps at most one outstanding probe
//! per profile.

use paf_core::now_ms;
use paf_http::Forwarder;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How often the loop scans for thawed profiles
const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the re-probe loop for one family
pub fn spawn_reprobe_loop(forwarder: Arc<Forwarder>) -> JoinHandle<()> {
    let family = forwarder.family();
    info!("{family}: starting re-probe loop");

    tokio::spawn(async move {
        let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut interval = tokio::time::interval(SCAN_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it so a freshly started
        // daemon does not probe before traffic has settled
        interval.tick().await;

        loop {
            interval.tick().await;

            let snapshot = forwarder.store().snapshot();
            if !snapshot.loadbalancer.health_check.enabled {
                continue;
            }

            let due = forwarder.freeze().thaw_candidates(now_ms());
            if due.is_empty() {
                continue;
            }
            debug!("{family}: {} profile(s) due for re-probe", due.len());

            for name in due {
                if !in_flight.lock().unwrap().insert(name.clone()) {
                    continue;
                }
                let forwarder = forwarder.clone();
                let in_flight = in_flight.clone();
                tokio::spawn(async move {
                    let recovered = forwarder.probe(&name).await;
                    if recovered {
                        info!("{}: '{}' recovered after probe", forwarder.family(), name);
                    }
                    in_flight.lock().unwrap().remove(&name);
                });
            }
        }
    })
}
