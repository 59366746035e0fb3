//! Error types for relaymesh
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - A coarse failure kind so retry policies can tell timeouts, capacity
//!   shortages and execution failures apart
//! - User-friendly messages with suggestions
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for relaymesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    ConnectionLost = 303,
    HandshakeTimeout = 304,
    HandshakeRejected = 305,

    // Protocol errors (4xx)
    ProtocolMalformed = 401,
    ProtocolUnexpected = 402,
    RegistrationRejected = 403,
    RoutingFailed = 404,

    // Execution errors (5xx)
    ExecutionFailed = 500,

    // Task lifecycle errors (6xx)
    TaskTimeout = 600,
    NoCapacity = 601,
    ChannelClosed = 602,
    NotConnected = 603,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            500..=599 => 50,
            600..=699 => 60,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse classification of a failure, as seen by a caller of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Handshake or task exceeded its bound
    Timeout,
    /// No idle node at selection time
    Capacity,
    /// The node ran the program and it failed
    Execution,
    /// Relay or direct channel trouble (refused, lost, closed)
    Transport,
    /// The relay could not route a message to its target
    Routing,
    /// A peer sent something we could not understand
    Protocol,
    /// Bad or missing configuration
    Config,
    /// Anything else
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Capacity => "capacity",
            FailureKind::Execution => "execution",
            FailureKind::Transport => "transport",
            FailureKind::Routing => "routing",
            FailureKind::Protocol => "protocol",
            FailureKind::Config => "config",
            FailureKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Connection failed
    #[error("Failed to connect to {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    /// Connection timeout
    #[error("Connection to {url} timed out after {timeout_secs}s")]
    ConnectionTimeout { url: String, timeout_secs: u64 },

    /// Connection lost
    #[error("Lost connection to relay: {message}")]
    ConnectionLost { message: String },

    /// Direct channel handshake did not complete in time
    #[error("Handshake with {peer} timed out after {timeout_ms}ms")]
    HandshakeTimeout { peer: String, timeout_ms: u64 },

    /// Direct channel handshake was refused or aborted by the remote side
    #[error("Handshake with {peer} failed: {reason}")]
    HandshakeFailed { peer: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Malformed message
    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    /// Well-formed message that makes no sense in the current state
    #[error("Unexpected protocol message: {message}")]
    ProtocolUnexpected { message: String },

    /// The relay refused our registration
    #[error("Registration rejected by relay: {message}")]
    RegistrationRejected { message: String },

    /// The relay could not route a message to its target
    #[error("Relay could not reach {target}: {message}")]
    Routing { target: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────

    /// The node ran the task and the program failed
    #[error("Task {task_id} failed on {node_id}: {message}")]
    Execution {
        task_id: String,
        node_id: String,
        message: String,
        trace: Option<String>,
    },

    // ─────────────────────────────────────────────────────────────
    // Task Lifecycle Errors
    // ─────────────────────────────────────────────────────────────

    /// No result arrived within the task bound
    #[error("Task {task_id} timed out after {timeout_ms}ms")]
    TaskTimeout { task_id: String, timeout_ms: u64 },

    /// No idle node was available at selection time
    #[error("No idle node available ({known} known)")]
    NoCapacity { known: usize },

    /// The direct channel closed while a task was in flight
    #[error("Channel to {peer} closed: {reason}")]
    ChannelClosed { peer: String, reason: String },

    /// Dispatch attempted without a live direct channel
    #[error("No direct channel is open")]
    NotConnected,

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::ProtocolMalformed,
            Error::WebSocket(_) => ErrorCode::ConnectionFailed,

            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::ConnectionLost { .. } => ErrorCode::ConnectionLost,
            Error::HandshakeTimeout { .. } => ErrorCode::HandshakeTimeout,
            Error::HandshakeFailed { .. } => ErrorCode::HandshakeRejected,

            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::ProtocolUnexpected { .. } => ErrorCode::ProtocolUnexpected,
            Error::RegistrationRejected { .. } => ErrorCode::RegistrationRejected,
            Error::Routing { .. } => ErrorCode::RoutingFailed,

            Error::Execution { .. } => ErrorCode::ExecutionFailed,

            Error::TaskTimeout { .. } => ErrorCode::TaskTimeout,
            Error::NoCapacity { .. } => ErrorCode::NoCapacity,
            Error::ChannelClosed { .. } => ErrorCode::ChannelClosed,
            Error::NotConnected => ErrorCode::NotConnected,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Get the failure kind a caller should branch on
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::HandshakeTimeout { .. }
            | Error::TaskTimeout { .. }
            | Error::ConnectionTimeout { .. } => FailureKind::Timeout,

            Error::NoCapacity { .. } => FailureKind::Capacity,

            Error::Execution { .. } => FailureKind::Execution,

            Error::Routing { .. } => FailureKind::Routing,

            Error::ConnectionFailed { .. }
            | Error::ConnectionLost { .. }
            | Error::HandshakeFailed { .. }
            | Error::ChannelClosed { .. }
            | Error::NotConnected
            | Error::WebSocket(_)
            | Error::Io(_) => FailureKind::Transport,

            Error::ProtocolMalformed { .. }
            | Error::ProtocolUnexpected { .. }
            | Error::RegistrationRejected { .. }
            | Error::Json(_) => FailureKind::Protocol,

            Error::ConfigNotFound { .. }
            | Error::ConfigParse { .. }
            | Error::ConfigValidation { .. }
            | Error::Toml(_) => FailureKind::Config,

            Error::IoRead { .. } | Error::IoWrite { .. } | Error::Internal(_) => {
                FailureKind::Internal
            }
        }
    }

    /// Check if retrying the same operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::Timeout | FailureKind::Capacity | FailureKind::Transport | FailureKind::Routing
        )
    }

    /// Check if the error is fatal (process should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::RegistrationRejected { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'relaymesh config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'relaymesh config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),

            Error::ConnectionFailed { .. } => Some(
                "Check that the relay is running and that relay_url points at it."
            ),
            Error::ConnectionTimeout { .. } => Some(
                "The relay may be down or unreachable. Check your firewall settings."
            ),
            Error::ConnectionLost { .. } => Some(
                "The relay connection dropped. The client reconnects automatically."
            ),

            Error::HandshakeTimeout { .. } => Some(
                "The node did not answer in time. Make sure transport.advertise_host is reachable from nodes."
            ),
            Error::HandshakeFailed { .. } => Some(
                "The node refused the channel, usually because another coordinator holds it. Try again."
            ),

            Error::RegistrationRejected { .. } => Some(
                "Another peer already uses this identity. Pick a different id."
            ),
            Error::Routing { .. } => Some(
                "The target peer left the relay. Refresh the node list and try again."
            ),

            Error::TaskTimeout { .. } => Some(
                "The node may still be running the program. Raise coordinator.task_timeout_ms for long tasks."
            ),
            Error::NoCapacity { .. } => Some(
                "Start more nodes or wait for busy nodes to finish. Run 'relaymesh nodes' to inspect."
            ),

            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Error::Execution { trace: Some(trace), .. } = self {
            output.push_str(&format!("\n{}\n", trace.trim_end()));
        }

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors (for ergonomic error creation)
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a config parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Error::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config validation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a malformed-message error
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::ProtocolMalformed {
            message: message.into(),
        }
    }

    /// Create a channel-closed error
    pub fn channel_closed(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ChannelClosed {
            peer: peer.into(),
            reason: reason.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.as_str(), "E100");
        assert_eq!(ErrorCode::ConnectionFailed.as_str(), "E300");
        assert_eq!(ErrorCode::TaskTimeout.as_str(), "E600");
        assert_eq!(ErrorCode::InternalError.as_str(), "E900");
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(ErrorCode::ConfigNotFound.exit_code(), 10);
        assert_eq!(ErrorCode::IoRead.exit_code(), 20);
        assert_eq!(ErrorCode::ConnectionFailed.exit_code(), 30);
        assert_eq!(ErrorCode::RoutingFailed.exit_code(), 40);
        assert_eq!(ErrorCode::ExecutionFailed.exit_code(), 50);
        assert_eq!(ErrorCode::NoCapacity.exit_code(), 60);
        assert_eq!(ErrorCode::InternalError.exit_code(), 90);
    }

    #[test]
    fn test_caller_visible_kinds_are_distinct() {
        let timeout = Error::TaskTimeout { task_id: "t".into(), timeout_ms: 10 };
        let capacity = Error::NoCapacity { known: 0 };
        let execution = Error::Execution {
            task_id: "t".into(),
            node_id: "n".into(),
            message: "boom".into(),
            trace: None,
        };

        assert_eq!(timeout.kind(), FailureKind::Timeout);
        assert_eq!(capacity.kind(), FailureKind::Capacity);
        assert_eq!(execution.kind(), FailureKind::Execution);
        assert_ne!(timeout.kind(), execution.kind());
    }

    #[test]
    fn test_handshake_timeout_is_timeout_kind() {
        let err = Error::HandshakeTimeout { peer: "peer-1".into(), timeout_ms: 10_000 };
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_channel_closed_is_transport() {
        let err = Error::channel_closed("peer-1", "eof");
        assert_eq!(err.kind(), FailureKind::Transport);
        assert_eq!(err.code(), ErrorCode::ChannelClosed);
    }

    #[test]
    fn test_execution_not_retryable() {
        let err = Error::Execution {
            task_id: "t".into(),
            node_id: "n".into(),
            message: "boom".into(),
            trace: None,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_fatal() {
        assert!(Error::config_not_found("/test").is_fatal());
        assert!(Error::RegistrationRejected { message: "dup".into() }.is_fatal());
        assert!(!Error::connection_failed("url", "test").is_fatal());
    }

    #[test]
    fn test_error_suggestions() {
        let err = Error::config_not_found("/test");
        assert!(err.suggestion().unwrap().contains("config init"));

        let err = Error::NoCapacity { known: 2 };
        assert!(err.suggestion().unwrap().contains("relaymesh nodes"));
    }

    #[test]
    fn test_format_for_terminal_includes_trace() {
        let err = Error::Execution {
            task_id: "task-1".into(),
            node_id: "peer-a".into(),
            message: "program exited with status 2".into(),
            trace: Some("line 1: nope\n".into()),
        };
        let formatted = err.format_for_terminal();

        assert!(formatted.contains("E500"));
        assert!(formatted.contains("line 1: nope"));
        assert!(formatted.contains("\x1b[31m"));
    }

    #[test]
    fn test_format_for_log() {
        let err = Error::config_not_found("/test/config.toml");
        let formatted = err.format_for_log();

        assert!(formatted.contains("[E100]"));
        assert!(!formatted.contains("\x1b["));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();

        assert_eq!(err.code(), ErrorCode::IoNotFound);
    }
}
