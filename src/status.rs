//! Status event bus.
//!
//! Every branch-state transition and every build log line flows through the
//! [`StatusHub`], a broadcast channel the WebSocket bridge (and anything
//! else) can subscribe to. Publishing is fire-and-forget: the monitors and
//! queue workers never block on, or fail because of, subscriber state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::store::models::RemoteState;

/// Buffered events per subscriber; slow consumers skip missed events.
const CHANNEL_CAPACITY: usize = 256;

/// Snapshot of one tracked remote, published on every state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchStatus {
    pub application_id: i64,
    pub remote: String,
    pub sha: String,
    pub state: RemoteState,
    pub age: Option<DateTime<Utc>>,
    pub seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum StatusEvent {
    /// A tracked remote changed state (Waiting, Building, Done, Failed,
    /// Deleted, ...).
    Branch(BranchStatus),
    /// One line of build runner output.
    BuildLog {
        application_id: i64,
        remote: String,
        line: String,
    },
}

/// Fan-out hub for status events.
///
/// Cheap to clone; every clone publishes into the same channel. Monitors
/// and queue workers hold one, the WebSocket bridge subscribes.
#[derive(Clone)]
pub struct StatusHub {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all current subscribers. Returns silently when
    /// nobody is listening.
    pub fn publish(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn branch(&self, status: BranchStatus) {
        self.publish(StatusEvent::Branch(status));
    }

    pub fn build_log(&self, application_id: i64, remote: &str, line: String) {
        self.publish(StatusEvent::BuildLog {
            application_id,
            remote: remote.to_string(),
            line,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
