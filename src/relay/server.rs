//! Relay server: WebSocket accept loop and per-connection sessions
//!
//! Each accepted connection gets an outbound queue drained by its own writer
//! task. Handlers never await on another peer: forwards use `try_send`, so a
//! slow or dead peer cannot stall the sender's read loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use crate::config::RelaySettings;
use crate::error::{Error, Result};
use crate::protocol::{ClientMessage, PeerId, PeerRole, PeerStatus, RelayMessage};

use super::registry::{ConnectionId, Outbox, PeerRegistry, RegisterOutcome};

// ─────────────────────────────────────────────────────────────────
// Relay Server
// ─────────────────────────────────────────────────────────────────

/// The rendezvous service
pub struct RelayServer {
    listener: TcpListener,
    registry: Arc<PeerRegistry>,
    queue_size: usize,
    next_conn: AtomicU64,
}

impl RelayServer {
    /// Bind the listener described by `settings`
    pub async fn bind(settings: &RelaySettings) -> Result<Self> {
        let listener = TcpListener::bind(&settings.bind_addr)
            .await
            .map_err(|e| Error::connection_failed(&settings.bind_addr, e.to_string()))?;

        Ok(Self {
            listener,
            registry: Arc::new(PeerRegistry::new(settings.duplicate_policy)),
            queue_size: settings.outbound_queue_size.max(1),
            next_conn: AtomicU64::new(1),
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared handle to the peer table
    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!(
            addr = %addr,
            duplicate_policy = %self.registry.policy(),
            "Relay listening"
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
                    debug!(conn, peer_addr = %peer_addr, "Incoming connection");

                    let registry = Arc::clone(&self.registry);
                    let queue_size = self.queue_size;
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, peer_addr, conn, registry, queue_size).await
                        {
                            debug!(conn, error = %e, "Connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection Handling
// ─────────────────────────────────────────────────────────────────

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    conn: ConnectionId,
    registry: Arc<PeerRegistry>,
    queue_size: usize,
) -> Result<()> {
    let ws = accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    let (outbox, mut outbox_rx) = mpsc::channel::<RelayMessage>(queue_size);

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    error!(conn, error = %e, "Failed to encode relay message");
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(text)).await {
                debug!(conn, error = %e, "Write failed");
                break;
            }
        }
        let _ = write.close().await;
    });

    let mut session = Session {
        conn,
        identity: None,
        outbox,
        registry,
    };

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => session.handle_text(&text),
            Ok(Message::Binary(data)) => {
                warn!(conn, len = data.len(), "Binary frame dropped: relay speaks JSON text");
            }
            // tungstenite queues the pong reply itself
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => trace!(conn, "Keepalive"),
            Ok(Message::Close(frame)) => {
                debug!(conn, frame = ?frame, "Peer closed connection");
                break;
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                debug!(conn, error = %e, "Read error");
                break;
            }
        }
    }

    session.disconnect();
    drop(session);
    writer.abort();

    debug!(conn, peer_addr = %peer_addr, "Connection closed");
    Ok(())
}

/// Error text for a connection whose identity was taken over
fn displaced_message(identity: &str) -> String {
    format!("peer id '{}' was registered by another connection", identity)
}

/// Per-connection state: which identity (if any) this connection owns
struct Session {
    conn: ConnectionId,
    identity: Option<PeerId>,
    outbox: Outbox,
    registry: Arc<PeerRegistry>,
}

impl Session {
    fn handle_text(&mut self, text: &str) {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(conn = self.conn, error = %e, "Malformed message dropped");
                return;
            }
        };

        trace!(conn = self.conn, msg_type = msg.type_name(), "Received");

        match msg {
            ClientMessage::Register { peer_id, peer_type } => self.register(peer_id, peer_type),
            ClientMessage::Signal { target, signal } => self.forward(target, signal),
            ClientMessage::StatusUpdate { status } => self.update_status(status),
            ClientMessage::ListNodes => {
                let nodes = self.registry.worker_snapshot();
                self.reply(RelayMessage::NodesList { nodes });
            }
        }
    }

    fn register(&mut self, peer_id: PeerId, role: PeerRole) {
        match self.registry.register(&peer_id, role, self.conn, self.outbox.clone()) {
            RegisterOutcome::Accepted { displaced } => {
                if let Some(old) = displaced {
                    warn!(peer = %peer_id, conn = self.conn, "Identity taken over by a new connection");
                    let _ = old.try_send(RelayMessage::error(displaced_message(&peer_id)));
                }
                info!(peer = %peer_id, role = %role, conn = self.conn, "Peer registered");
                self.identity = Some(peer_id.clone());
                self.reply(RelayMessage::Registered { peer_id });
            }
            RegisterOutcome::Rejected { reason } => {
                warn!(peer = %peer_id, conn = self.conn, reason = %reason, "Registration rejected");
                self.reply(RelayMessage::error(reason));
            }
        }
    }

    fn forward(&self, target: PeerId, signal: Value) {
        let Some(from) = self.identity.clone() else {
            debug!(conn = self.conn, target = %target, "Signal from unregistered connection");
            self.reply(RelayMessage::Error {
                message: "register before sending signals".to_string(),
                target: Some(target),
            });
            return;
        };

        if !self.registry.owns(&from, self.conn) {
            debug!(from = %from, conn = self.conn, target = %target, "Signal from displaced connection refused");
            self.reply(RelayMessage::Error {
                message: displaced_message(&from),
                target: Some(target),
            });
            return;
        }

        let Some(route) = self.registry.route(&target) else {
            debug!(from = %from, target = %target, "Signal target not found");
            self.reply(RelayMessage::target_not_found(target));
            return;
        };

        match route.try_send(RelayMessage::Signal { from: from.clone(), signal }) {
            Ok(()) => trace!(from = %from, target = %target, "Signal forwarded"),
            Err(TrySendError::Closed(_)) => {
                debug!(from = %from, target = %target, "Signal target gone");
                self.reply(RelayMessage::target_not_found(target));
            }
            Err(TrySendError::Full(_)) => {
                warn!(from = %from, target = %target, "Signal target queue full");
                self.reply(RelayMessage::Error {
                    message: "target not reachable".to_string(),
                    target: Some(target),
                });
            }
        }
    }

    fn update_status(&self, status: PeerStatus) {
        let Some(identity) = self.identity.as_deref() else {
            debug!(conn = self.conn, "Status update from unregistered connection ignored");
            return;
        };

        if self.registry.update_status(identity, self.conn, status) {
            debug!(peer = %identity, status = %status, "Status updated");
        } else {
            debug!(peer = %identity, conn = self.conn, "Status update from connection that no longer owns the identity");
            self.reply(RelayMessage::error(displaced_message(identity)));
        }
    }

    fn reply(&self, msg: RelayMessage) {
        if let Err(e) = self.outbox.try_send(msg) {
            warn!(conn = self.conn, error = %e, "Reply dropped");
        }
    }

    fn disconnect(&mut self) {
        if let Some(identity) = self.identity.take() {
            if self.registry.remove(&identity, self.conn) {
                info!(peer = %identity, conn = self.conn, "Peer disconnected");
            }
        }
    }
}
