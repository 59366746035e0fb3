//! Wire protocol
//!
//! Two message families share this module:
//! - the relay control plane (JSON text frames over WebSocket), and
//! - the direct channel between a coordinator and a node, which the relay
//!   never sees.
//!
//! Field names are camelCase on the wire and the discriminator is `type`.

mod direct;
mod relay;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use direct::*;
pub use relay::*;

/// Self-assigned peer identifier
pub type PeerId = String;

/// Generate an identifier of the form `{prefix}-{9 lowercase alphanumerics}`
pub fn random_peer_id(prefix: &str) -> PeerId {
    use rand::distr::Alphanumeric;
    use rand::Rng;

    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{prefix}-{suffix}")
}

/// Role a peer declares when it registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Worker that executes programs
    Node,
    /// Orchestrator that dispatches programs
    Coordinator,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Node => write!(f, "node"),
            PeerRole::Coordinator => write!(f, "coordinator"),
        }
    }
}

/// Self-reported peer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    #[default]
    Idle,
    Busy,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Idle => write!(f, "idle"),
            PeerStatus::Busy => write!(f, "busy"),
        }
    }
}

/// One worker entry in a directory snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub peer_id: PeerId,
    pub status: PeerStatus,
    #[serde(default)]
    pub tasks_completed: u64,
}

impl NodeSummary {
    pub fn is_idle(&self) -> bool {
        self.status == PeerStatus::Idle
    }
}
