//! Real-time push hub
//!
//! ## Protocol
//!
//! Connect: `ws://localhost:5000/ws?user=<user id>`
//!
//! Messages (server → client):
//! - `connected` - Sent once after the upgrade
//! - `kpi_created` / `kpi_updated` / `kpi_deleted` - KPI lifecycle
//! - `kpi_status_changed` - A member's progress changed
//! - `heartbeat` - Periodic keep-alive while the hub is running
//!
//! Messages (client → server):
//! - `ping` - Answered with `pong`
//!
//! ## Example Messages
//!
//! ```json
//! {
//!   "type": "kpi_status_changed",
//!   "timestamp": "2025-01-15T10:30:00Z",
//!   "kpi_id": "65a4...",
//!   "user_id": "65a1...",
//!   "status": "done",
//!   "progress_percentage": 60
//! }
//! ```
//!
//! Delivery is at-most-once: events published while a client is not
//! subscribed, or that overflow its buffer, are dropped.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::UserId;
use crate::tasks::PeriodicTask;

/// Events buffered per subscriber before the slowest starts lagging
const CHANNEL_CAPACITY: usize = 256;

/// Message sent from server to client
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    Connected {
        timestamp: String,
        client_id: String,
    },
    KpiCreated {
        timestamp: String,
        kpi_id: String,
        title: String,
        target_count: usize,
    },
    KpiUpdated {
        timestamp: String,
        kpi_id: String,
        title: String,
    },
    KpiDeleted {
        timestamp: String,
        kpi_id: String,
    },
    KpiStatusChanged {
        timestamp: String,
        kpi_id: String,
        user_id: String,
        status: String,
        progress_percentage: i64,
    },
    Heartbeat {
        timestamp: String,
        interval_secs: u64,
        clients: usize,
    },
    Pong {
        timestamp: String,
    },
    Error {
        message: String,
    },
}

/// Message received from client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
}

/// Who an event is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    User(UserId),
}

/// An event plus its audience, as carried on the hub channel
#[derive(Debug, Clone)]
pub struct PushEnvelope {
    pub audience: Audience,
    pub event: PushEvent,
}

impl PushEnvelope {
    /// Whether a client logged in as `user` should receive this
    pub fn is_for(&self, user: Option<UserId>) -> bool {
        match self.audience {
            Audience::Everyone => true,
            Audience::User(target) => user == Some(target),
        }
    }
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Fan-out point for push events
pub struct PushHub {
    tx: broadcast::Sender<PushEnvelope>,
    clients: DashMap<Uuid, Option<UserId>>,
    heartbeat_interval: Duration,
    heartbeat: Mutex<Option<PeriodicTask>>,
}

impl PushHub {
    pub fn new(heartbeat_interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            clients: DashMap::new(),
            heartbeat_interval,
            heartbeat: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEnvelope> {
        self.tx.subscribe()
    }

    /// Send to every connected client; returns how many subscribers saw it
    pub fn broadcast(&self, event: PushEvent) -> usize {
        self.publish(PushEnvelope {
            audience: Audience::Everyone,
            event,
        })
    }

    /// Send to the connections of one user
    pub fn send_to_user(&self, user: UserId, event: PushEvent) -> usize {
        self.publish(PushEnvelope {
            audience: Audience::User(user),
            event,
        })
    }

    fn publish(&self, envelope: PushEnvelope) -> usize {
        // No subscribers is not an error
        self.tx.send(envelope).unwrap_or(0)
    }

    /// Track a new connection, returning its id
    pub fn register_client(&self, user: Option<UserId>) -> Uuid {
        let id = Uuid::new_v4();
        self.clients.insert(id, user);
        info!(client = %id, user = ?user, clients = self.clients.len(), "Push client connected");
        id
    }

    pub fn unregister_client(&self, id: &Uuid) {
        if self.clients.remove(id).is_some() {
            info!(client = %id, clients = self.clients.len(), "Push client disconnected");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Start the heartbeat loop (no-op when already running)
    pub async fn start(self: &Arc<Self>) {
        let mut heartbeat = self.heartbeat.lock().await;
        if heartbeat.is_some() {
            return;
        }
        let hub = Arc::clone(self);
        let interval_secs = self.heartbeat_interval.as_secs();
        *heartbeat = Some(PeriodicTask::spawn(
            "push heartbeat",
            self.heartbeat_interval,
            move || {
                let hub = Arc::clone(&hub);
                async move {
                    let seen = hub.broadcast(PushEvent::Heartbeat {
                        timestamp: now_timestamp(),
                        interval_secs,
                        clients: hub.client_count(),
                    });
                    debug!("Heartbeat delivered to {} subscribers", seen);
                }
            },
        ));
    }

    pub async fn stop(&self) {
        if let Some(task) = self.heartbeat.lock().await.take() {
            task.stop().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.heartbeat.lock().await.is_some()
    }
}
