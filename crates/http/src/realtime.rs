//! Live request feed for the dashboard
//!
//! Each family keeps a hub of in-flight requests and broadcasts lifecycle
//! events to every connected WebSocket. New connections first receive a
//! snapshot of the currently active requests, then the live stream. Event
//! publishing is synchronous and lock-light so the forwarder can emit from
//! anywhere in its pipeline.

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use paf_core::Family;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

/// Active requests kept per family before pruning
const ACTIVE_CAP: usize = 100;

/// How long a finished request stays visible in the snapshot
const LINGER_SECS: u64 = 30;

/// One in-flight (or just-finished) request
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRequest {
    pub request_id: String,
    pub service: String,
    pub method: String,
    pub path: String,
    pub start_time: DateTime<Utc>,
    pub status: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

/// Lifecycle events pushed to dashboard clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "started")]
    Started {
        request_id: String,
        service: String,
        method: String,
        path: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "completed")]
    Completed {
        request_id: String,
        status_code: u16,
        duration_ms: u64,
    },
    #[serde(rename = "failed")]
    Failed {
        request_id: String,
        status_code: u16,
        duration_ms: u64,
    },
}

/// Per-family broadcast hub
#[derive(Clone)]
pub struct RealtimeHub {
    family: Family,
    event_tx: broadcast::Sender<Event>,
    active: Arc<RwLock<HashMap<String, ActiveRequest>>>,
}

impl RealtimeHub {
    pub fn new(family: Family) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        Self {
            family,
            event_tx,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Subscribe to the raw event stream
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Connected dashboard clients
    pub fn connection_count(&self) -> usize {
        self.event_tx.receiver_count()
    }

    /// Note a request entering the pipeline
    pub fn request_started(&self, request_id: &str, method: &str, path: &str) {
        let request = ActiveRequest {
            request_id: request_id.to_string(),
            service: self.family.as_str().to_string(),
            method: method.to_string(),
            path: path.to_string(),
            start_time: Utc::now(),
            status: "PENDING".to_string(),
            duration_ms: 0,
            status_code: None,
        };

        {
            let mut active = self.active.write().unwrap();
            active.insert(request_id.to_string(), request);
            if active.len() > ACTIVE_CAP {
                prune_oldest(&mut active);
            }
        }

        let _ = self.event_tx.send(Event::Started {
            request_id: request_id.to_string(),
            service: self.family.as_str().to_string(),
            method: method.to_string(),
            path: path.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Note a request finishing, successfully or not
    pub fn request_completed(
        &self,
        request_id: &str,
        status_code: u16,
        duration_ms: u64,
        success: bool,
    ) {
        if let Some(request) = self.active.write().unwrap().get_mut(request_id) {
            request.status = if success { "COMPLETED" } else { "FAILED" }.to_string();
            request.status_code = Some(status_code);
            request.duration_ms = duration_ms;
        }

        let event = if success {
            Event::Completed {
                request_id: request_id.to_string(),
                status_code,
                duration_ms,
            }
        } else {
            Event::Failed {
                request_id: request_id.to_string(),
                status_code,
                duration_ms,
            }
        };
        let _ = self.event_tx.send(event);

        // keep it visible briefly, then drop it from the snapshot
        let active = self.active.clone();
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(LINGER_SECS)).await;
            active.write().unwrap().remove(&request_id);
        });
    }

    /// Serve one dashboard WebSocket until it closes
    pub async fn handle_connection(&self, mut socket: WebSocket) {
        let mut rx = self.event_tx.subscribe();

        // snapshot first, so the client can render in-flight requests
        let snapshot: Vec<ActiveRequest> = {
            let active = self.active.read().unwrap();
            active.values().cloned().collect()
        };
        for request in snapshot {
            let event = Event::Started {
                request_id: request.request_id,
                service: request.service,
                method: request.method,
                path: request.path,
                timestamp: request.start_time,
            };
            if send_event(&mut socket, &event).await.is_err() {
                return;
            }
        }

        loop {
            tokio::select! {
                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
                event = rx.recv() => match event {
                    Ok(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("{}: realtime client lagged, skipped {skipped} events", self.family);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("{}: realtime connection closed", self.family);
    }
}

async fn send_event(socket: &mut WebSocket, event: &Event) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).unwrap_or_default();
    socket.send(Message::Text(json.into())).await
}

fn prune_oldest(active: &mut HashMap<String, ActiveRequest>) {
    let mut by_age: Vec<(String, DateTime<Utc>)> = active
        .iter()
        .map(|(id, request)| (id.clone(), request.start_time))
        .collect();
    by_age.sort_by(|a, b| b.1.cmp(&a.1));
    for (id, _) in by_age.into_iter().skip(ACTIVE_CAP) {
        active.remove(&id);
    }
}
