/**
 * BROADCASTER - Live fan-out to connected clients
 *
 * ROLE :
 * Tracks every live connection with its subscription filter and delivers
 * unicast, full and per-target fan-out messages.
 *
 * DELIVERY :
 * Each connection owns a bounded queue drained by its session task. Sends
 * never wait: a closed or full queue prunes the connection in the same call,
 * under the same lock the iteration runs on.
 */

use crate::models::{CommandOutput, ScheduledOutput, Target};
use crate::scheduler::Notifier;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Per-connection queue depth before a client counts as stalled.
pub const CONNECTION_QUEUE: usize = 256;

/// Sentinel accepted from clients for "everything".
pub const ALL_TARGETS: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    Everything,
    Targets(HashSet<String>),
}

impl Subscription {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: HashSet<String> = names.into_iter().map(Into::into).collect();
        if names.contains(ALL_TARGETS) {
            Subscription::Everything
        } else {
            Subscription::Targets(names)
        }
    }

    pub fn matches(&self, target: &str) -> bool {
        match self {
            Subscription::Everything => true,
            Subscription::Targets(names) => names.contains(target),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

/// Server -> client messages, `{"type": ..., "data": ...}` on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    TargetsList(Vec<Target>),
    TargetUpdate(Target),
    CommandOutput {
        target: String,
        output: CommandOutput,
    },
    ScheduledOutput {
        command_name: String,
        target: String,
        output: ScheduledOutput,
    },
    Error(ErrorBody),
}

impl ServerEvent {
    pub fn error(detail: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorBody { detail: detail.into() })
    }

    pub fn encode(&self) -> Option<Arc<str>> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Arc::from(json)),
            Err(e) => {
                warn!("cannot encode server event: {e}");
                None
            }
        }
    }
}

struct Connection {
    tx: mpsc::Sender<Arc<str>>,
    subscription: Subscription,
}

#[derive(Default)]
pub struct Broadcaster {
    connections: Mutex<HashMap<ConnectionId, Connection>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection subscribed to everything. The receiver is the
    /// connection's outbound queue.
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE);
        let id = Uuid::new_v4();
        let total = {
            let mut connections = self.connections.lock();
            connections.insert(id, Connection { tx, subscription: Subscription::Everything });
            connections.len()
        };
        info!("client {id} connected ({total} live)");
        (id, rx)
    }

    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let (removed, total) = {
            let mut connections = self.connections.lock();
            let removed = connections.remove(&id).is_some();
            (removed, connections.len())
        };
        if removed {
            info!("client {id} disconnected ({total} live)");
        }
        removed
    }

    /// Replaces the connection's filter wholesale.
    pub fn subscribe(&self, id: ConnectionId, subscription: Subscription) -> bool {
        match self.connections.lock().get_mut(&id) {
            Some(conn) => {
                debug!("client {id} subscription -> {subscription:?}");
                conn.subscription = subscription;
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, id: ConnectionId, target: &str) -> bool {
        self.connections
            .lock()
            .get(&id)
            .map(|c| c.subscription.matches(target))
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Returns how many connections accepted the message.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        match event.encode() {
            Some(msg) => self.deliver(msg, |_| true),
            None => 0,
        }
    }

    pub fn broadcast_to_subscribed(&self, event: &ServerEvent, target: &str) -> usize {
        match event.encode() {
            Some(msg) => self.deliver(msg, |sub| sub.matches(target)),
            None => 0,
        }
    }

    pub fn send_to(&self, id: ConnectionId, event: &ServerEvent) -> bool {
        let Some(msg) = event.encode() else {
            return false;
        };
        let mut connections = self.connections.lock();
        let Some(conn) = connections.get(&id) else {
            return false;
        };
        if conn.tx.try_send(msg).is_ok() {
            return true;
        }
        connections.remove(&id);
        warn!("client {id} pruned: send failed");
        false
    }

    fn deliver(&self, msg: Arc<str>, wants: impl Fn(&Subscription) -> bool) -> usize {
        let mut connections = self.connections.lock();
        let mut delivered = 0;
        let mut broken = Vec::new();
        for (id, conn) in connections.iter() {
            if !wants(&conn.subscription) {
                continue;
            }
            match conn.tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => broken.push(*id),
            }
        }
        for id in broken {
            connections.remove(&id);
            warn!("client {id} pruned: send failed");
        }
        delivered
    }
}

#[async_trait]
impl Notifier for Broadcaster {
    async fn scheduled_output(&self, target: &str, output: &ScheduledOutput) -> anyhow::Result<()> {
        let event = ServerEvent::ScheduledOutput {
            command_name: output.command_name.clone(),
            target: target.to_string(),
            output: output.clone(),
        };
        self.broadcast_to_subscribed(&event, target);
        Ok(())
    }
}
