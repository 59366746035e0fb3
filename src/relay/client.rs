//! WebSocket client for the relay control connection
//!
//! Used by both nodes and coordinators:
//! - Registers the peer's self-chosen identity on every (re)connect
//! - Automatic reconnection with exponential backoff
//! - Remembers the last reported status and restores `busy` after a reconnect
//! - Commands in, events out, so callers never touch the socket

use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::config::RelayClientSettings;
use crate::error::{Error, Result};
use crate::protocol::{ClientMessage, NodeSummary, PeerId, PeerRole, PeerStatus, RelayMessage};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for the relay client
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// WebSocket URL of the relay
    pub url: String,

    /// Identity to register
    pub peer_id: PeerId,

    /// Role to register
    pub role: PeerRole,

    /// How long to wait for `registered`
    pub register_timeout: Duration,

    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,

    /// Initial reconnect delay
    pub initial_reconnect_delay: Duration,

    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,

    /// Command and event queue size
    pub message_queue_size: usize,
}

impl RelayClientConfig {
    pub fn new(url: impl Into<String>, peer_id: impl Into<PeerId>, role: PeerRole) -> Self {
        Self {
            url: url.into(),
            peer_id: peer_id.into(),
            role,
            register_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 0, // Infinite
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            message_queue_size: 256,
        }
    }

    /// Build from the `[relay_client]` config section
    pub fn from_settings(settings: &RelayClientSettings, peer_id: impl Into<PeerId>, role: PeerRole) -> Self {
        Self {
            register_timeout: Duration::from_millis(settings.register_timeout_ms),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            initial_reconnect_delay: Duration::from_millis(settings.reconnect_interval_ms),
            max_reconnect_delay: Duration::from_millis(
                settings.max_reconnect_interval_ms.max(settings.reconnect_interval_ms),
            ),
            ..Self::new(settings.url.clone(), peer_id, role)
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection State
// ─────────────────────────────────────────────────────────────────

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Connected but not registered
    Connected,
    /// Registered and ready
    Registered,
    /// Connection error, will retry
    Reconnecting,
    /// Shutting down
    ShuttingDown,
}

/// Internal client state
#[derive(Debug, Default)]
struct ClientState {
    /// Current connection state
    connection_state: ConnectionState,

    /// Last status the owner reported; restored after reconnect
    status: PeerStatus,

    /// Reconnection attempt count
    reconnect_attempts: u32,
}

// ─────────────────────────────────────────────────────────────────
// Command Channel
// ─────────────────────────────────────────────────────────────────

/// Commands that can be sent to the client
#[derive(Debug)]
pub enum RelayCommand {
    /// Forward an opaque handshake payload to `target`
    Signal { target: PeerId, signal: Value },

    /// Report own status
    UpdateStatus(PeerStatus),

    /// Request a directory snapshot
    ListNodes,

    /// Close the connection and stop reconnecting
    Shutdown,

    /// Get current connection state
    GetState(oneshot::Sender<ConnectionState>),
}

// ─────────────────────────────────────────────────────────────────
// Event Channel
// ─────────────────────────────────────────────────────────────────

/// Events emitted by the client
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// WebSocket connected (not yet registered)
    Connected,

    /// Registration acknowledged
    Registered { peer_id: PeerId },

    /// Handshake payload from another peer
    Signal { from: PeerId, signal: Value },

    /// Directory snapshot
    NodesList(Vec<NodeSummary>),

    /// The relay reported a problem (unroutable signal, displaced identity)
    RelayError { message: String, target: Option<PeerId> },

    /// Connection dropped; a reconnect follows unless shutting down
    Disconnected { reason: String },

    /// Waiting before the next connection attempt
    Reconnecting { attempt: u32 },

    /// The client gave up; no further events follow
    Fatal { message: String },
}

/// How a live connection ended
enum ConnectionEnd {
    Closed,
    Shutdown,
}

// ─────────────────────────────────────────────────────────────────
// Relay Client
// ─────────────────────────────────────────────────────────────────

/// Control connection to the relay. Cheap to clone; clones share the
/// same connection.
#[derive(Clone)]
pub struct RelayClient {
    config: RelayClientConfig,
    state: Arc<RwLock<ClientState>>,
    command_tx: mpsc::Sender<RelayCommand>,
}

impl RelayClient {
    /// Create a new relay client
    pub fn new(config: RelayClientConfig) -> Self {
        let (command_tx, _command_rx) = mpsc::channel(config.message_queue_size);

        Self {
            config,
            state: Arc::new(RwLock::new(ClientState::default())),
            command_tx,
        }
    }

    /// Start the client and return the event receiver
    pub fn start(&mut self) -> mpsc::Receiver<RelayEvent> {
        let (event_tx, event_rx) = mpsc::channel(self.config.message_queue_size);
        let (command_tx, command_rx) = mpsc::channel(self.config.message_queue_size);

        self.command_tx = command_tx;

        let config = self.config.clone();
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            run_client_loop(config, state, command_rx, event_tx).await;
        });

        event_rx
    }

    /// Registered identity
    pub fn peer_id(&self) -> &str {
        &self.config.peer_id
    }

    /// Send a command to the client
    pub async fn send_command(&self, command: RelayCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| Error::ConnectionLost {
                message: "relay client stopped".to_string(),
            })
    }

    /// Forward a handshake payload through the relay
    pub async fn signal(&self, target: impl Into<PeerId>, signal: Value) -> Result<()> {
        self.send_command(RelayCommand::Signal {
            target: target.into(),
            signal,
        })
        .await
    }

    /// Report own status
    pub async fn update_status(&self, status: PeerStatus) -> Result<()> {
        self.send_command(RelayCommand::UpdateStatus(status)).await
    }

    /// Ask for a directory snapshot; the answer arrives as `RelayEvent::NodesList`
    pub async fn list_nodes(&self) -> Result<()> {
        self.send_command(RelayCommand::ListNodes).await
    }

    /// Request graceful shutdown
    pub async fn shutdown(&self) -> Result<()> {
        self.send_command(RelayCommand::Shutdown).await
    }

    /// Get current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().connection_state
    }

    /// Check if connected and registered
    pub fn is_registered(&self) -> bool {
        self.connection_state() == ConnectionState::Registered
    }
}

// ─────────────────────────────────────────────────────────────────
// Client Loop
// ─────────────────────────────────────────────────────────────────

/// Main client loop with reconnection logic
async fn run_client_loop(
    config: RelayClientConfig,
    state: Arc<RwLock<ClientState>>,
    mut command_rx: mpsc::Receiver<RelayCommand>,
    event_tx: mpsc::Sender<RelayEvent>,
) {
    let url = match Url::parse(&config.url) {
        Ok(u) => u,
        Err(e) => {
            error!(url = %config.url, error = %e, "Invalid relay URL");
            state.write().connection_state = ConnectionState::ShuttingDown;
            let _ = event_tx
                .send(RelayEvent::Fatal {
                    message: format!("Invalid URL: {}", e),
                })
                .await;
            return;
        }
    };

    // Create exponential backoff for reconnection
    let mut backoff = ExponentialBackoff {
        initial_interval: config.initial_reconnect_delay,
        max_interval: config.max_reconnect_delay,
        max_elapsed_time: None, // Retry forever
        ..Default::default()
    };

    loop {
        state.write().connection_state = ConnectionState::Connecting;
        debug!(url = %url, peer = %config.peer_id, "Connecting to relay");

        match connect_async(url.clone()).await {
            Ok((ws_stream, _response)) => {
                info!(url = %url, "Relay connection established");

                backoff.reset();
                {
                    let mut s = state.write();
                    s.connection_state = ConnectionState::Connected;
                    s.reconnect_attempts = 0;
                }

                let _ = event_tx.send(RelayEvent::Connected).await;

                let (write, read) = ws_stream.split();

                match handle_connection(&config, &state, &mut command_rx, &event_tx, write, read).await {
                    Ok(ConnectionEnd::Shutdown) => break,
                    Ok(ConnectionEnd::Closed) => {
                        let _ = event_tx
                            .send(RelayEvent::Disconnected {
                                reason: "relay closed the connection".to_string(),
                            })
                            .await;
                    }
                    Err(e @ Error::RegistrationRejected { .. }) => {
                        error!(error = %e, "Registration rejected");
                        let _ = event_tx
                            .send(RelayEvent::Fatal {
                                message: e.to_string(),
                            })
                            .await;
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Relay connection error");
                        let _ = event_tx
                            .send(RelayEvent::Disconnected {
                                reason: e.to_string(),
                            })
                            .await;
                    }
                }
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Failed to connect to relay");
            }
        }

        // Update state to reconnecting
        let attempts = {
            let mut s = state.write();
            s.connection_state = ConnectionState::Reconnecting;
            s.reconnect_attempts += 1;
            s.reconnect_attempts
        };

        // Check max reconnect attempts
        if config.max_reconnect_attempts > 0 && attempts >= config.max_reconnect_attempts {
            error!(
                attempts = attempts,
                max = config.max_reconnect_attempts,
                "Max reconnection attempts reached"
            );
            let _ = event_tx
                .send(RelayEvent::Fatal {
                    message: "Max reconnection attempts reached".to_string(),
                })
                .await;
            break;
        }

        let delay = backoff.next_backoff().unwrap_or(config.max_reconnect_delay);

        let _ = event_tx.send(RelayEvent::Reconnecting { attempt: attempts }).await;

        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = attempts,
            "Waiting before reconnection"
        );

        // Wait before reconnecting; status reports are remembered, the rest is dropped
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);
        let shutdown = loop {
            tokio::select! {
                _ = &mut deadline => break false,
                cmd = command_rx.recv() => match cmd {
                    Some(RelayCommand::Shutdown) | None => break true,
                    Some(RelayCommand::UpdateStatus(status)) => state.write().status = status,
                    Some(RelayCommand::GetState(tx)) => {
                        let _ = tx.send(state.read().connection_state);
                    }
                    Some(other) => debug!(command = ?other, "Dropped command while disconnected"),
                },
            }
        };
        if shutdown {
            break;
        }
    }

    state.write().connection_state = ConnectionState::ShuttingDown;
    info!(peer = %config.peer_id, "Relay client stopped");
}

/// Handle an active WebSocket connection
async fn handle_connection<S, R>(
    config: &RelayClientConfig,
    state: &Arc<RwLock<ClientState>>,
    command_rx: &mut mpsc::Receiver<RelayCommand>,
    event_tx: &mpsc::Sender<RelayEvent>,
    mut write: S,
    mut read: R,
) -> Result<ConnectionEnd>
where
    S: SinkExt<WsMessage, Error = WsError> + Unpin,
    R: StreamExt<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    let register_msg = ClientMessage::Register {
        peer_id: config.peer_id.clone(),
        peer_type: config.role,
    };
    send_message(&mut write, &register_msg).await?;
    debug!(peer = %config.peer_id, role = %config.role, "Sent registration");

    let peer_id = wait_for_registration(&mut read, config).await?;
    state.write().connection_state = ConnectionState::Registered;
    info!(peer = %peer_id, "Registered with relay");
    let _ = event_tx.send(RelayEvent::Registered { peer_id }).await;

    // The relay resets a new record to idle
    let remembered = state.read().status;
    if remembered == PeerStatus::Busy {
        debug!("Restoring busy status after reconnect");
        send_message(&mut write, &ClientMessage::StatusUpdate { status: remembered }).await?;
    }

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<RelayMessage>(&text) {
                            Ok(message) => handle_incoming_message(message, event_tx).await,
                            Err(e) => warn!(error = %e, "Failed to parse relay message"),
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        warn!(len = data.len(), "Unexpected binary frame from relay");
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        write.send(WsMessage::Pong(data)).await?;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(frame = ?frame, "Relay sent close frame");
                        return Ok(ConnectionEnd::Closed);
                    }
                    Some(Err(e)) => {
                        return Err(Error::ConnectionLost { message: e.to_string() });
                    }
                    None => {
                        info!("Relay stream ended");
                        return Ok(ConnectionEnd::Closed);
                    }
                    _ => {}
                }
            }

            cmd = command_rx.recv() => {
                match cmd {
                    Some(RelayCommand::Signal { target, signal }) => {
                        send_message(&mut write, &ClientMessage::Signal { target, signal }).await?;
                    }
                    Some(RelayCommand::UpdateStatus(status)) => {
                        state.write().status = status;
                        send_message(&mut write, &ClientMessage::StatusUpdate { status }).await?;
                    }
                    Some(RelayCommand::ListNodes) => {
                        send_message(&mut write, &ClientMessage::ListNodes).await?;
                    }
                    Some(RelayCommand::GetState(tx)) => {
                        let _ = tx.send(state.read().connection_state);
                    }
                    Some(RelayCommand::Shutdown) | None => {
                        info!("Closing relay connection");
                        let _ = write.send(WsMessage::Close(None)).await;
                        state.write().connection_state = ConnectionState::ShuttingDown;
                        return Ok(ConnectionEnd::Shutdown);
                    }
                }
            }
        }
    }
}

/// Send a control-plane message
async fn send_message<S>(write: &mut S, msg: &ClientMessage) -> Result<()>
where
    S: SinkExt<WsMessage, Error = WsError> + Unpin,
{
    let json = serde_json::to_string(msg)?;
    trace!(msg_type = msg.type_name(), "Sending");
    write
        .send(WsMessage::Text(json))
        .await
        .map_err(|e| Error::ConnectionLost { message: e.to_string() })
}

/// Wait for registration acknowledgment
async fn wait_for_registration<R>(read: &mut R, config: &RelayClientConfig) -> Result<PeerId>
where
    R: StreamExt<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    let wait = tokio::time::timeout(config.register_timeout, async {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<RelayMessage>(&text) {
                    Ok(RelayMessage::Registered { peer_id }) => return Ok(peer_id),
                    Ok(RelayMessage::Error { message, .. }) => {
                        return Err(Error::RegistrationRejected { message });
                    }
                    Ok(other) => debug!(msg_type = other.type_name(), "Ignoring message before registration"),
                    Err(e) => warn!(error = %e, "Failed to parse relay message"),
                },
                Ok(WsMessage::Close(_)) => {
                    return Err(Error::ConnectionLost {
                        message: "connection closed during registration".to_string(),
                    });
                }
                Err(e) => return Err(Error::ConnectionLost { message: e.to_string() }),
                _ => {}
            }
        }
        Err(Error::ConnectionLost {
            message: "stream ended during registration".to_string(),
        })
    });

    wait.await.map_err(|_| Error::ConnectionTimeout {
        url: config.url.clone(),
        timeout_secs: config.register_timeout.as_secs(),
    })?
}

/// Turn a relay message into an event for the owner
async fn handle_incoming_message(message: RelayMessage, event_tx: &mpsc::Sender<RelayEvent>) {
    trace!(msg_type = message.type_name(), "Received");

    let event = match message {
        RelayMessage::Signal { from, signal } => RelayEvent::Signal { from, signal },
        RelayMessage::NodesList { nodes } => RelayEvent::NodesList(nodes),
        RelayMessage::Error { message, target } => {
            warn!(message = %message, target = ?target, "Relay reported an error");
            RelayEvent::RelayError { message, target }
        }
        RelayMessage::Registered { peer_id } => {
            debug!(peer = %peer_id, "Duplicate registration acknowledgment");
            return;
        }
    };

    let _ = event_tx.send(event).await;
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
