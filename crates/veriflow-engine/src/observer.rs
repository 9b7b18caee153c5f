// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Observer plane: real-time fan-out of state transitions to subscribers.
//!
//! Subscribers join rooms and read frames from a bounded per-connection
//! queue. Delivery is at-most-once and never authoritative; a subscriber
//! that falls behind gets a `lag` marker and is expected to resync against
//! the state store. Connections that stop heartbeating are closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use veriflow_core::config::Config;
use veriflow_core::model::{NotificationEvent, NotificationKind};
use veriflow_core::store::WorkflowStore;

use crate::error::EngineError;

/// A subscription scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    /// Every event.
    Global,
    /// Events for one workflow.
    Workflow(Uuid),
    /// Events addressed to one user.
    User(String),
}

impl Room {
    /// Parse `global`, `workflow:{id}` or `user:{id}`.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw == "global" {
            return Some(Self::Global);
        }
        if let Some(id) = raw.strip_prefix("workflow:") {
            return Uuid::parse_str(id).ok().map(Self::Workflow);
        }
        raw.strip_prefix("user:").map(|u| Self::User(u.to_string()))
    }

    fn matches(&self, event: &NotificationEvent) -> bool {
        match self {
            Self::Global => true,
            Self::Workflow(id) => event.workflow_id == Some(*id),
            Self::User(user) => event
                .payload
                .get("user_id")
                .and_then(Value::as_str)
                .is_some_and(|u| u == user),
        }
    }
}

/// A frame read by a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverFrame {
    /// First frame on every connection.
    Connected {
        /// When the connection was accepted.
        at: chrono::DateTime<Utc>,
    },
    /// A state transition matching the connection's rooms.
    Event(NotificationEvent),
    /// The subscriber fell behind; `missed` events were dropped. Resync
    /// against the state store.
    Lag {
        /// Dropped event count.
        missed: u64,
    },
}

struct ConnectionMeta {
    last_seen: Arc<Mutex<Instant>>,
    close_tx: watch::Sender<bool>,
}

/// Fan-out hub fed by the state store's event channel.
pub struct ObserverHub {
    events: broadcast::Sender<NotificationEvent>,
    connections: Mutex<HashMap<u64, ConnectionMeta>>,
    next_connection: AtomicU64,
    heartbeat: Duration,
}

impl ObserverHub {
    /// Hub with the configured per-subscriber queue size and heartbeat.
    pub fn new(cfg: &Config) -> Arc<Self> {
        let (events, _) = broadcast::channel(cfg.observer_queue_size.max(1));
        Arc::new(Self {
            events,
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            heartbeat: cfg.observer_heartbeat,
        })
    }

    /// Start forwarding store events into the hub and sweeping dead
    /// connections. Runs until `shutdown` is notified.
    pub async fn start(
        self: &Arc<Self>,
        store: &WorkflowStore,
        shutdown: Arc<Notify>,
    ) -> Result<JoinHandle<()>, EngineError> {
        let mut feed = store.subscribe_events().await?;
        let hub = self.clone();
        Ok(tokio::spawn(async move {
            let mut sweep = tokio::time::interval(hub.heartbeat);
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        info!("observer hub shutting down");
                        break;
                    }
                    _ = sweep.tick() => hub.sweep(),
                    received = feed.recv() => match received {
                        Ok(blob) => match serde_json::from_slice::<NotificationEvent>(&blob) {
                            Ok(event) => {
                                // send fails only with zero subscribers
                                let _ = hub.events.send(event);
                            }
                            Err(e) => warn!(error = %e, "undecodable event on channel"),
                        },
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "observer feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }))
    }

    /// Open a connection subscribed to the given rooms.
    pub fn connect(&self, rooms: Vec<Room>) -> ObserverConnection {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let last_seen = Arc::new(Mutex::new(Instant::now()));
        let (close_tx, close_rx) = watch::channel(false);
        self.connections.lock().expect("hub poisoned").insert(
            id,
            ConnectionMeta {
                last_seen: last_seen.clone(),
                close_tx,
            },
        );
        debug!(connection = id, "observer connected");
        ObserverConnection {
            rooms,
            rx: self.events.subscribe(),
            close_rx,
            last_seen,
            sent_connected: false,
        }
    }

    /// Live connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("hub poisoned").len()
    }

    /// Close connections that missed two heartbeats, drop ones whose
    /// subscriber went away.
    fn sweep(&self) {
        let cutoff = self.heartbeat * 2;
        let mut connections = self.connections.lock().expect("hub poisoned");
        connections.retain(|id, meta| {
            if meta.close_tx.is_closed() {
                return false;
            }
            let stale = meta
                .last_seen
                .lock()
                .map(|seen| seen.elapsed() > cutoff)
                .unwrap_or(true);
            if stale {
                debug!(connection = id, "closing stale observer connection");
                let _ = meta.close_tx.send(true);
                return false;
            }
            true
        });
    }
}

/// A subscriber handle. The embedding transport reads frames with
/// [`next`](Self::next) and calls [`heartbeat`](Self::heartbeat) when the
/// peer pings.
pub struct ObserverConnection {
    rooms: Vec<Room>,
    rx: broadcast::Receiver<NotificationEvent>,
    close_rx: watch::Receiver<bool>,
    last_seen: Arc<Mutex<Instant>>,
    sent_connected: bool,
}

impl ObserverConnection {
    /// Next frame, or `None` once the connection is closed.
    pub async fn next(&mut self) -> Option<ObserverFrame> {
        if !self.sent_connected {
            self.sent_connected = true;
            return Some(ObserverFrame::Connected { at: Utc::now() });
        }
        loop {
            if *self.close_rx.borrow() {
                return None;
            }
            tokio::select! {
                changed = self.close_rx.changed() => {
                    if changed.is_err() || *self.close_rx.borrow() {
                        return None;
                    }
                }
                received = self.rx.recv() => match received {
                    Ok(event) if self.matches(&event) => {
                        return Some(ObserverFrame::Event(event));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        return Some(ObserverFrame::Lag { missed });
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Record a peer heartbeat.
    pub fn heartbeat(&self) {
        if let Ok(mut seen) = self.last_seen.lock() {
            *seen = Instant::now();
        }
    }

    /// Join an additional room.
    pub fn join(&mut self, room: Room) {
        if !self.rooms.contains(&room) {
            self.rooms.push(room);
        }
    }

    fn matches(&self, event: &NotificationEvent) -> bool {
        if event.kind == NotificationKind::Lag {
            return true;
        }
        self.rooms.iter().any(|room| room.matches(event))
    }
}
