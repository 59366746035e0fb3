//! Pending task table
//!
//! Each dispatched task owns one entry until it is resolved, removed by a
//! timeout, or failed because its channel closed. Whichever happens first
//! wins; the others find the entry gone and do nothing.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::protocol::{ExecutionFailure, PeerId};

/// How a pending task was settled
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The node answered with a `result` message
    Completed {
        result: Option<Value>,
        error: Option<ExecutionFailure>,
    },
    /// The direct channel closed before an answer arrived
    ChannelClosed { reason: String },
}

struct PendingEntry {
    node: PeerId,
    tx: oneshot::Sender<Resolution>,
    dispatched_at: Instant,
}

#[derive(Default)]
pub struct PendingTasks {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a task sent to `node`; the receiver yields its resolution
    pub fn register(&self, task_id: &str, node: &str) -> oneshot::Receiver<Resolution> {
        let (tx, rx) = oneshot::channel();
        self.entries.lock().insert(
            task_id.to_string(),
            PendingEntry {
                node: node.to_string(),
                tx,
                dispatched_at: Instant::now(),
            },
        );
        rx
    }

    /// Settle a task. Returns false when the id is unknown or already settled.
    pub fn resolve(&self, task_id: &str, resolution: Resolution) -> bool {
        let Some(entry) = self.entries.lock().remove(task_id) else {
            return false;
        };
        tracing::trace!(
            task_id = %task_id,
            node = %entry.node,
            elapsed_ms = entry.dispatched_at.elapsed().as_millis() as u64,
            "Pending task resolved"
        );
        // The waiter may have given up already; nothing else to do then.
        let _ = entry.tx.send(resolution);
        true
    }

    /// Drop a task without resolving it (used on timeout)
    pub fn remove(&self, task_id: &str) -> bool {
        self.entries.lock().remove(task_id).is_some()
    }

    /// Fail every task dispatched to `node`. Returns how many were failed.
    pub fn fail_peer(&self, node: &str, reason: &str) -> usize {
        let failed: Vec<PendingEntry> = {
            let mut entries = self.entries.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.node == node)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        let count = failed.len();
        for entry in failed {
            let _ = entry.tx.send(Resolution::ChannelClosed {
                reason: reason.to_string(),
            });
        }
        count
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.entries.lock().contains_key(task_id)
    }

    pub fn has_tasks_for(&self, node: &str) -> bool {
        self.entries.lock().values().any(|e| e.node == node)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
