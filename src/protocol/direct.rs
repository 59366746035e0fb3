//! Direct-channel messages between a coordinator and a node

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured failure produced by the execution collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub message: String,

    /// Diagnostic trace (stderr, backtrace). Accepts `stack` from older peers.
    #[serde(default, alias = "stack", skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl ExecutionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

/// Messages carried over an established direct channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirectMessage {
    /// Coordinator → node: run `code`
    #[serde(rename_all = "camelCase")]
    Task { task_id: String, code: String },

    /// Node → coordinator: outcome for `task_id`. `error` set means failure.
    #[serde(rename_all = "camelCase")]
    Result {
        task_id: String,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<ExecutionFailure>,
    },
}

impl DirectMessage {
    /// Build a result message from an execution outcome
    pub fn from_outcome(
        task_id: impl Into<String>,
        outcome: std::result::Result<Value, ExecutionFailure>,
    ) -> Self {
        let task_id = task_id.into();
        match outcome {
            Ok(value) => DirectMessage::Result {
                task_id,
                result: Some(value),
                error: None,
            },
            Err(failure) => DirectMessage::Result {
                task_id,
                result: None,
                error: Some(failure),
            },
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            DirectMessage::Task { task_id, .. } | DirectMessage::Result { task_id, .. } => task_id,
        }
    }

    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            DirectMessage::Task { .. } => "task",
            DirectMessage::Result { .. } => "result",
        }
    }
}
