//! Configuration system for relaymesh
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (RELAYMESH_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values
//!
//! One file serves all three roles; each role reads only its own sections.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::coordinator::SelectionStrategy;
use crate::error::{Error, Result};
use crate::relay::DuplicatePolicy;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Relay server settings
    pub relay: RelaySettings,

    /// Control connection to the relay (node and coordinator)
    pub relay_client: RelayClientSettings,

    /// Node agent settings
    pub node: NodeSettings,

    /// Coordinator settings
    pub coordinator: CoordinatorSettings,

    /// Program execution settings (node)
    pub execution: ExecutionSettings,

    /// Direct-channel transport settings
    pub transport: TransportSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Relay server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Address the relay listens on
    pub bind_addr: String,

    /// Handling of a second registration with an identity already in use
    pub duplicate_policy: DuplicatePolicy,

    /// Per-connection outbound queue length
    pub outbound_queue_size: usize,
}

/// Control connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayClientSettings {
    /// Relay WebSocket URL
    pub url: String,

    /// Initial reconnection interval in milliseconds
    pub reconnect_interval_ms: u64,

    /// Upper bound for the reconnection interval in milliseconds
    pub max_reconnect_interval_ms: u64,

    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,

    /// How long to wait for `registered` in milliseconds
    pub register_timeout_ms: u64,
}

/// Node agent settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Node identity (generated as `peer-xxxxxxxxx` if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Coordinator identity (generated as `coordinator-xxxxxxxxx` if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Node selection strategy
    pub strategy: SelectionStrategy,

    /// Direct-channel handshake bound in milliseconds
    pub connect_timeout_ms: u64,

    /// Task result bound in milliseconds
    pub task_timeout_ms: u64,

    /// Periodic directory refresh interval in milliseconds
    pub refresh_interval_ms: u64,

    /// Wait for a fresh snapshot before selection, in milliseconds
    pub selection_wait_ms: u64,
}

/// Program execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Interpreter and leading arguments; the program is appended last
    pub interpreter: Vec<String>,

    /// Wall-clock bound for one program, in seconds
    pub timeout_secs: u64,

    /// Maximum captured bytes per output stream
    pub max_output_bytes: usize,
}

/// Direct-channel transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Host the initiator binds its ephemeral listener on
    pub bind_host: String,

    /// Host the initiator advertises to nodes in its offer
    pub advertise_host: String,

    /// Maximum frame size in bytes
    pub max_frame_bytes: u32,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            duplicate_policy: DuplicatePolicy::Replace,
            outbound_queue_size: 256,
        }
    }
}

impl Default for RelayClientSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000".to_string(),
            reconnect_interval_ms: 1000,
            max_reconnect_interval_ms: 30000,
            max_reconnect_attempts: 0, // Infinite
            register_timeout_ms: 10000,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            id: None,
            strategy: SelectionStrategy::Random,
            connect_timeout_ms: 10000,
            task_timeout_ms: 30000,
            refresh_interval_ms: 5000,
            selection_wait_ms: 500,
        }
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            interpreter: vec!["sh".to_string(), "-c".to_string()],
            timeout_secs: 60,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_files: 5,
            json_format: false,
        }
    }
}

impl CoordinatorSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn selection_wait(&self) -> Duration {
        Duration::from_millis(self.selection_wait_ms)
    }
}

impl MeshConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                path: path.clone(),
                source: e,
            })?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e.message()),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        // Search in standard locations
        let search_paths = [
            // Current directory
            PathBuf::from("relaymesh.toml"),
            // User config directory
            dirs::config_dir()
                .map(|p| p.join("relaymesh").join("config.toml"))
                .unwrap_or_default(),
            // Home directory
            dirs::home_dir()
                .map(|p| p.join(".relaymesh").join("config.toml"))
                .unwrap_or_default(),
            // System config (Linux)
            PathBuf::from("/etc/relaymesh/config.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Relay settings
        if let Ok(val) = std::env::var("RELAYMESH_BIND_ADDR") {
            self.relay.bind_addr = val;
        }
        if let Ok(val) = std::env::var("RELAYMESH_DUPLICATE_POLICY") {
            if let Ok(policy) = val.parse() {
                self.relay.duplicate_policy = policy;
            }
        }

        // Relay client settings
        if let Ok(val) = std::env::var("RELAYMESH_RELAY_URL") {
            self.relay_client.url = val;
        }
        if let Ok(val) = std::env::var("RELAYMESH_RECONNECT_INTERVAL_MS") {
            if let Ok(n) = val.parse() {
                self.relay_client.reconnect_interval_ms = n;
            }
        }
        if let Ok(val) = std::env::var("RELAYMESH_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                self.relay_client.max_reconnect_attempts = n;
            }
        }

        // Identities
        if let Ok(val) = std::env::var("RELAYMESH_NODE_ID") {
            self.node.id = Some(val);
        }
        if let Ok(val) = std::env::var("RELAYMESH_COORDINATOR_ID") {
            self.coordinator.id = Some(val);
        }

        // Coordinator settings
        if let Ok(val) = std::env::var("RELAYMESH_STRATEGY") {
            if let Ok(strategy) = val.parse() {
                self.coordinator.strategy = strategy;
            }
        }
        if let Ok(val) = std::env::var("RELAYMESH_CONNECT_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.coordinator.connect_timeout_ms = n;
            }
        }
        if let Ok(val) = std::env::var("RELAYMESH_TASK_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.coordinator.task_timeout_ms = n;
            }
        }

        // Execution settings
        if let Ok(val) = std::env::var("RELAYMESH_EXEC_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                self.execution.timeout_secs = n;
            }
        }

        // Transport settings
        if let Ok(val) = std::env::var("RELAYMESH_ADVERTISE_HOST") {
            self.transport.advertise_host = val;
        }

        // Logging settings
        if let Ok(val) = std::env::var("RELAYMESH_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("RELAYMESH_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("RELAYMESH_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        // Validate relay URL
        let url = &self.relay_client.url;
        if url.is_empty() {
            return Err(Error::config_field_invalid(
                "relay_client.url",
                "Relay URL cannot be empty",
            ));
        }
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(Error::config_field_invalid(
                "relay_client.url",
                format!("Relay URL must start with ws:// or wss:// (got '{}')", url),
            ));
        }

        // Validate bind address
        if self.relay.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(Error::config_field_invalid(
                "relay.bind_addr",
                format!("'{}' is not a socket address", self.relay.bind_addr),
            ));
        }
        if self.relay.outbound_queue_size == 0 {
            return Err(Error::config_field_invalid(
                "relay.outbound_queue_size",
                "outbound_queue_size must be greater than 0",
            ));
        }

        // Validate timeouts
        let timeouts = [
            ("relay_client.register_timeout_ms", self.relay_client.register_timeout_ms),
            ("relay_client.reconnect_interval_ms", self.relay_client.reconnect_interval_ms),
            ("coordinator.connect_timeout_ms", self.coordinator.connect_timeout_ms),
            ("coordinator.task_timeout_ms", self.coordinator.task_timeout_ms),
            ("coordinator.refresh_interval_ms", self.coordinator.refresh_interval_ms),
            ("execution.timeout_secs", self.execution.timeout_secs),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(Error::config_field_invalid(
                    field,
                    format!("{} must be greater than 0", field),
                ));
            }
        }

        // Validate identities
        for (field, id) in [("node.id", &self.node.id), ("coordinator.id", &self.coordinator.id)] {
            if matches!(id, Some(id) if id.trim().is_empty()) {
                return Err(Error::config_field_invalid(field, format!("{} cannot be empty", field)));
            }
        }

        // Validate interpreter
        if self.execution.interpreter.first().map_or(true, |cmd| cmd.is_empty()) {
            return Err(Error::config_field_invalid(
                "execution.interpreter",
                "interpreter must name a program",
            ));
        }

        // Validate transport
        if self.transport.advertise_host.is_empty() {
            return Err(Error::config_field_invalid(
                "transport.advertise_host",
                "advertise_host cannot be empty",
            ));
        }
        if self.transport.max_frame_bytes == 0 {
            return Err(Error::config_field_invalid(
                "transport.max_frame_bytes",
                "max_frame_bytes must be greater than 0",
            ));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or(std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Default location for `config init`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".relaymesh")
        .join("config.toml")
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(default_config_path);

    // Check if file exists
    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    // Create parent directories
    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# relaymesh configuration
# Each role reads only the sections it needs.

[relay]
# Address the relay listens on
bind_addr = "0.0.0.0:3000"

# Second registration with an identity already in use: "replace" or "reject"
duplicate_policy = "replace"

# Per-connection outbound queue length
outbound_queue_size = 256

[relay_client]
# Relay WebSocket URL (nodes and coordinators)
url = "ws://localhost:3000"

# Initial / maximum reconnection interval in milliseconds
reconnect_interval_ms = 1000
max_reconnect_interval_ms = 30000

# Maximum reconnection attempts (0 = infinite)
max_reconnect_attempts = 0

# How long to wait for the relay to acknowledge registration
register_timeout_ms = 10000

[node]
# Node identity (generated as peer-xxxxxxxxx if not set)
# id = "peer-build-box"

[coordinator]
# Coordinator identity (generated as coordinator-xxxxxxxxx if not set)
# id = "coordinator-main"

# Node selection: "random", "least-loaded" or "round-robin"
strategy = "random"

# Direct-channel handshake bound in milliseconds
connect_timeout_ms = 10000

# Task result bound in milliseconds
task_timeout_ms = 30000

# Directory refresh interval in milliseconds
refresh_interval_ms = 5000

# Wait for a fresh directory snapshot before each selection
selection_wait_ms = 500

[execution]
# Interpreter; the program text is passed as the last argument
interpreter = ["sh", "-c"]

# Wall-clock bound for one program in seconds
timeout_secs = 60

# Maximum captured bytes per output stream
max_output_bytes = 1048576

[transport]
# Host the coordinator binds its direct-channel listener on
bind_host = "0.0.0.0"

# Host the coordinator advertises to nodes (must be reachable from them)
advertise_host = "127.0.0.1"

# Maximum frame size in bytes
max_frame_bytes = 16777216

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.relaymesh/logs/relaymesh.log"

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
