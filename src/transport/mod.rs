//! Direct-channel transport
//!
//! The coordinator and a node exchange opaque handshake payloads through the
//! relay until a direct channel is up; afterwards task traffic flows over the
//! channel only. `Transport` is the seam; `TcpTransport` is the shipped
//! implementation.

pub mod frame;
mod tcp;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::error::{Error, Result};
use crate::protocol::{DirectMessage, PeerId};

pub use tcp::TcpTransport;

/// Which side of the handshake a link plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Makes the offer (coordinator)
    Initiator,
    /// Answers an offer (node)
    Responder,
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkRole::Initiator => write!(f, "initiator"),
            LinkRole::Responder => write!(f, "responder"),
        }
    }
}

/// Events a link reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Handshake payload the owner must forward to the remote peer via the relay
    Signal(Value),
    /// Direct channel is live
    Connected,
    /// Message received over the direct channel
    Message(DirectMessage),
    /// Channel closed or handshake aborted; always the last event
    Closed { reason: String },
}

/// Commands from a `PeerLink` handle to its driver
#[derive(Debug)]
pub enum LinkCommand {
    /// Handshake payload received from the remote peer
    Signal(Value),
    /// Send over the established channel
    Send(DirectMessage),
}

/// Owner's handle to one direct channel. Dropping it tears the channel down.
#[derive(Debug)]
pub struct PeerLink {
    remote: PeerId,
    role: LinkRole,
    commands: mpsc::Sender<LinkCommand>,
    connected: Arc<AtomicBool>,
    /// Close request, kept apart from `commands` so a full queue cannot swallow it
    shutdown: Arc<Notify>,
}

impl PeerLink {
    /// Wrap a driver's command channel. `connected` is set by the driver;
    /// the driver must also watch `shutdown`.
    pub fn new(
        remote: impl Into<PeerId>,
        role: LinkRole,
        commands: mpsc::Sender<LinkCommand>,
        connected: Arc<AtomicBool>,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            remote: remote.into(),
            role,
            commands,
            connected,
            shutdown,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    /// Whether the direct channel is live
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.commands.is_closed()
    }

    /// Hand a handshake payload from the remote peer to the link
    pub async fn signal(&self, payload: Value) -> Result<()> {
        self.commands
            .send(LinkCommand::Signal(payload))
            .await
            .map_err(|_| Error::channel_closed(&self.remote, "link driver stopped"))
    }

    /// Send a message over the live channel
    pub async fn send(&self, msg: DirectMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.commands
            .send(LinkCommand::Send(msg))
            .await
            .map_err(|_| Error::channel_closed(&self.remote, "link driver stopped"))
    }

    /// Close the channel. A `Closed` event follows.
    pub fn close(&self) {
        self.connected.store(false, Ordering::Release);
        // Stores a permit if the driver is not waiting yet
        self.shutdown.notify_one();
    }
}

/// The transport collaborator
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Start a link with `remote` in the given role. An initiator emits its
    /// offer as the first `LinkEvent::Signal`; a responder waits for the
    /// offer to be handed in through `PeerLink::signal`.
    async fn open(&self, role: LinkRole, remote: &str) -> Result<(PeerLink, mpsc::Receiver<LinkEvent>)>;

    /// Payload a responder sends to refuse a handshake while it is already
    /// holding a channel
    fn busy_signal(&self) -> Value;

    /// Whether `payload` opens a new handshake. Anything else is only
    /// meaningful to a link that already exists.
    fn is_offer(&self, payload: &Value) -> bool;
}
