//! Node agent state and counters

use std::fmt;
use std::time::Instant;

/// Where the node agent is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    /// Waiting for the relay to acknowledge registration
    #[default]
    Registering,
    /// Registered, no task running
    Idle,
    /// Handshake in progress with a coordinator
    AwaitingConnection,
    /// A program is running
    Executing,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Registering => write!(f, "registering"),
            NodeState::Idle => write!(f, "idle"),
            NodeState::AwaitingConnection => write!(f, "awaiting-connection"),
            NodeState::Executing => write!(f, "executing"),
        }
    }
}

/// Lifetime counters, logged when the agent stops
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub completed: u64,
    pub failed: u64,
    /// Task requests answered with "node is busy"
    pub rejected_busy: u64,
    /// Results that could not be delivered because the channel had closed
    pub discarded: u64,
    pub started_at: Instant,
}

impl NodeStats {
    pub fn new() -> Self {
        Self {
            completed: 0,
            failed: 0,
            rejected_busy: 0,
            discarded: 0,
            started_at: Instant::now(),
        }
    }

    pub fn record(&mut self, success: bool) {
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.completed + self.failed
    }
}

impl Default for NodeStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_counts() {
        let mut stats = NodeStats::new();
        stats.record(true);
        stats.record(true);
        stats.record(false);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(NodeState::default(), NodeState::Registering);
        assert_eq!(NodeState::AwaitingConnection.to_string(), "awaiting-connection");
    }
}
