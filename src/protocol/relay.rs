//! Relay control-plane messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{NodeSummary, PeerId, PeerRole, PeerStatus};

// ─────────────────────────────────────────────────────────────────
// Peer → Relay
// ─────────────────────────────────────────────────────────────────

/// Messages a peer sends to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Declare identity and role
    #[serde(rename_all = "camelCase")]
    Register { peer_id: PeerId, peer_type: PeerRole },

    /// Forward an opaque handshake payload to `target`
    Signal { target: PeerId, signal: Value },

    /// Report own status
    StatusUpdate { status: PeerStatus },

    /// Ask for the current worker directory
    ListNodes,
}

// ─────────────────────────────────────────────────────────────────
// Relay → Peer
// ─────────────────────────────────────────────────────────────────

/// Messages the relay sends to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Registration accepted
    #[serde(rename_all = "camelCase")]
    Registered { peer_id: PeerId },

    /// Handshake payload forwarded from another peer
    Signal { from: PeerId, signal: Value },

    /// Worker directory snapshot
    NodesList { nodes: Vec<NodeSummary> },

    /// Something the relay could not do for this peer
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<PeerId>,
    },
}

impl RelayMessage {
    /// Build an error reply without a target
    pub fn error(message: impl Into<String>) -> Self {
        RelayMessage::Error {
            message: message.into(),
            target: None,
        }
    }

    /// Build the reply for an unroutable signal
    pub fn target_not_found(target: impl Into<PeerId>) -> Self {
        RelayMessage::Error {
            message: "target not found".to_string(),
            target: Some(target.into()),
        }
    }

    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            RelayMessage::Registered { .. } => "registered",
            RelayMessage::Signal { .. } => "signal",
            RelayMessage::NodesList { .. } => "nodes_list",
            RelayMessage::Error { .. } => "error",
        }
    }
}

impl ClientMessage {
    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::Signal { .. } => "signal",
            ClientMessage::StatusUpdate { .. } => "status_update",
            ClientMessage::ListNodes => "list_nodes",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_wire_shape() {
        let msg = ClientMessage::Register {
            peer_id: "peer-abc".into(),
            peer_type: PeerRole::Node,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "register", "peerId": "peer-abc", "peerType": "node"}));
    }

    #[test]
    fn test_parse_status_update() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"status_update","status":"busy"}"#).unwrap();
        assert_eq!(msg, ClientMessage::StatusUpdate { status: PeerStatus::Busy });
    }

    #[test]
    fn test_parse_list_nodes_without_fields() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"list_nodes"}"#).unwrap();
        assert_eq!(msg, ClientMessage::ListNodes);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"launch"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"peerId":"x"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn test_nodes_list_wire_shape() {
        let msg = RelayMessage::NodesList {
            nodes: vec![NodeSummary {
                peer_id: "peer-a".into(),
                status: PeerStatus::Idle,
                tasks_completed: 3,
            }],
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "nodes_list", "nodes": [{"peerId": "peer-a", "status": "idle", "tasksCompleted": 3}]})
        );
    }

    #[test]
    fn test_error_omits_absent_target() {
        let value = serde_json::to_value(RelayMessage::error("nope")).unwrap();
        assert_eq!(value, json!({"type": "error", "message": "nope"}));

        let value = serde_json::to_value(RelayMessage::target_not_found("peer-x")).unwrap();
        assert_eq!(value["target"], "peer-x");
        assert_eq!(value["message"], "target not found");
    }

    #[test]
    fn test_error_without_target_parses() {
        let msg: RelayMessage =
            serde_json::from_str(r#"{"type":"error","message":"target not found"}"#).unwrap();
        assert_eq!(msg, RelayMessage::error("target not found"));
    }
}
