//! Peer registry: the relay's single-authority peer table
//!
//! Every record belongs to exactly one control connection. Mutations carry the
//! caller's `ConnectionId` and are refused when it does not own the record, so
//! a connection displaced by a duplicate registration can never touch (or
//! delete) the newer record.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::protocol::{NodeSummary, PeerId, PeerRole, PeerStatus, RelayMessage};

/// Identifies one accepted control connection
pub type ConnectionId = u64;

/// Outbound queue of a control connection
pub type Outbox = mpsc::Sender<RelayMessage>;

// ─────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────

/// What to do when a second connection registers an identity already in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Last registration wins; the displaced connection is told and stays open
    #[default]
    Replace,
    /// Second registration is refused; the first record is untouched
    Reject,
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicatePolicy::Replace => write!(f, "replace"),
            DuplicatePolicy::Reject => write!(f, "reject"),
        }
    }
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "replace" => Ok(DuplicatePolicy::Replace),
            "reject" => Ok(DuplicatePolicy::Reject),
            other => Err(format!("unknown duplicate policy '{}'", other)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────

/// Public view of one registered peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub identity: PeerId,
    pub role: PeerRole,
    pub status: PeerStatus,
    pub completed_tasks: u64,
    pub registered_at: DateTime<Utc>,
}

struct PeerEntry {
    record: PeerRecord,
    conn: ConnectionId,
    outbox: Outbox,
}

/// Result of a registration attempt
#[derive(Debug)]
pub enum RegisterOutcome {
    /// Record created. `displaced` is the outbox of the connection that lost
    /// the identity, if any.
    Accepted { displaced: Option<Outbox> },
    /// Registration refused; nothing changed
    Rejected { reason: String },
}

// ─────────────────────────────────────────────────────────────────
// Peer Registry
// ─────────────────────────────────────────────────────────────────

/// Thread-safe registry of connected peers
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    policy: DuplicatePolicy,
}

impl PeerRegistry {
    /// Create a new empty registry
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Register `identity` for connection `conn`.
    ///
    /// The record starts idle with zero completed tasks. Any other identity
    /// previously held by `conn` is released.
    pub fn register(
        &self,
        identity: &str,
        role: PeerRole,
        conn: ConnectionId,
        outbox: Outbox,
    ) -> RegisterOutcome {
        if identity.trim().is_empty() {
            return RegisterOutcome::Rejected {
                reason: "peer id must not be empty".to_string(),
            };
        }

        let mut peers = self.peers.write();

        let held_elsewhere = peers
            .get(identity)
            .map(|existing| existing.conn != conn)
            .unwrap_or(false);

        if held_elsewhere && self.policy == DuplicatePolicy::Reject {
            return RegisterOutcome::Rejected {
                reason: format!("peer id '{}' is already registered", identity),
            };
        }

        peers.retain(|id, entry| entry.conn != conn || id == identity);

        let entry = PeerEntry {
            record: PeerRecord {
                identity: identity.to_string(),
                role,
                status: PeerStatus::Idle,
                completed_tasks: 0,
                registered_at: Utc::now(),
            },
            conn,
            outbox,
        };

        let displaced = peers
            .insert(identity.to_string(), entry)
            .filter(|previous| previous.conn != conn)
            .map(|previous| previous.outbox);

        RegisterOutcome::Accepted { displaced }
    }

    /// Look up the outbox for `target` if it is registered and still open
    pub fn route(&self, target: &str) -> Option<Outbox> {
        self.peers
            .read()
            .get(target)
            .filter(|entry| !entry.outbox.is_closed())
            .map(|entry| entry.outbox.clone())
    }

    /// Apply a status report from `conn`. Returns false when `conn` does not
    /// own `identity`.
    pub fn update_status(&self, identity: &str, conn: ConnectionId, status: PeerStatus) -> bool {
        match status {
            PeerStatus::Busy => self.mark_busy(identity, conn),
            PeerStatus::Idle => self.mark_idle_and_record_completion(identity, conn),
        }
    }

    /// Mark a peer busy
    pub fn mark_busy(&self, identity: &str, conn: ConnectionId) -> bool {
        self.with_owned(identity, conn, |record| {
            record.status = PeerStatus::Busy;
        })
    }

    /// Mark a peer idle and, if it was busy, count one completed task.
    ///
    /// Callers must only report idle after actually finishing work. A
    /// repeated idle report does not count.
    pub fn mark_idle_and_record_completion(&self, identity: &str, conn: ConnectionId) -> bool {
        self.with_owned(identity, conn, |record| {
            if record.status == PeerStatus::Busy {
                record.completed_tasks += 1;
            }
            record.status = PeerStatus::Idle;
        })
    }

    /// Remove the record for `identity` if `conn` owns it. Idempotent.
    pub fn remove(&self, identity: &str, conn: ConnectionId) -> bool {
        let mut peers = self.peers.write();
        match peers.get(identity) {
            Some(entry) if entry.conn == conn => {
                peers.remove(identity);
                true
            }
            _ => false,
        }
    }

    /// Point-in-time list of worker peers, ordered by registration time then id
    pub fn worker_snapshot(&self) -> Vec<NodeSummary> {
        let peers = self.peers.read();
        let mut workers: Vec<&PeerRecord> = peers
            .values()
            .map(|entry| &entry.record)
            .filter(|record| record.role == PeerRole::Node)
            .collect();

        workers.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.identity.cmp(&b.identity))
        });

        workers
            .into_iter()
            .map(|record| NodeSummary {
                peer_id: record.identity.clone(),
                status: record.status,
                tasks_completed: record.completed_tasks,
            })
            .collect()
    }

    /// Whether `conn` currently holds `identity`
    pub fn owns(&self, identity: &str, conn: ConnectionId) -> bool {
        self.peers
            .read()
            .get(identity)
            .is_some_and(|entry| entry.conn == conn)
    }

    /// Get a clone of a peer's record
    pub fn get(&self, identity: &str) -> Option<PeerRecord> {
        self.peers.read().get(identity).map(|entry| entry.record.clone())
    }

    /// Get count of registered peers
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    fn with_owned(
        &self,
        identity: &str,
        conn: ConnectionId,
        mutate: impl FnOnce(&mut PeerRecord),
    ) -> bool {
        match self.peers.write().get_mut(identity) {
            Some(entry) if entry.conn == conn => {
                mutate(&mut entry.record);
                true
            }
            _ => false,
        }
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(DuplicatePolicy::default())
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
