//! TCP direct channel
//!
//! Handshake (carried through the relay as opaque signals):
//! 1. Initiator binds an ephemeral listener and emits `offer {session, addr}`.
//! 2. Responder emits `answer {session}`, connects to `addr` and sends a
//!    `hello {session}` frame.
//! 3. Initiator accepts, drops streams whose hello does not match, and both
//!    sides report `Connected`.
//!
//! Either side may send `reject {session?, reason}` to abort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::TransportSettings;
use crate::error::{Error, Result};
use crate::protocol::{DirectMessage, PeerId};

use super::frame::{decode, read_frame, read_framed, write_framed};
use super::{LinkCommand, LinkEvent, LinkRole, PeerLink, Transport};

/// Bound on each network step of the handshake (hello read, TCP connect)
const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_QUEUE_SIZE: usize = 64;

// ─────────────────────────────────────────────────────────────────
// Handshake Payloads
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum HandshakeSignal {
    Offer { session: String, addr: String },
    Answer { session: String },
    Reject {
        #[serde(default)]
        session: Option<String>,
        reason: String,
    },
}

impl HandshakeSignal {
    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// First frame on a fresh stream
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    session: String,
}

// ─────────────────────────────────────────────────────────────────
// TCP Transport
// ─────────────────────────────────────────────────────────────────

/// Direct channels over plain TCP
#[derive(Debug, Clone)]
pub struct TcpTransport {
    settings: Arc<TransportSettings>,
}

impl TcpTransport {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn open(&self, role: LinkRole, remote: &str) -> Result<(PeerLink, mpsc::Receiver<LinkEvent>)> {
        let (command_tx, command_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        let listener = match role {
            LinkRole::Initiator => {
                let bind = format!("{}:0", self.settings.bind_host);
                let listener = TcpListener::bind(&bind)
                    .await
                    .map_err(|e| Error::connection_failed(bind, e.to_string()))?;
                Some(listener)
            }
            LinkRole::Responder => None,
        };

        let driver = LinkDriver {
            remote: remote.to_string(),
            settings: Arc::clone(&self.settings),
            commands: command_rx,
            events: event_tx,
            connected: Arc::clone(&connected),
            shutdown: Arc::clone(&shutdown),
        };
        tokio::spawn(driver.run(listener));

        let link = PeerLink::new(remote, role, command_tx, connected, shutdown);
        Ok((link, event_rx))
    }

    fn busy_signal(&self) -> Value {
        HandshakeSignal::Reject {
            session: None,
            reason: "node is busy".to_string(),
        }
        .to_value()
    }

    fn is_offer(&self, payload: &Value) -> bool {
        matches!(HandshakeSignal::deserialize(payload), Ok(HandshakeSignal::Offer { .. }))
    }
}

// ─────────────────────────────────────────────────────────────────
// Link Driver
// ─────────────────────────────────────────────────────────────────

/// Owns one direct channel; runs until the `PeerLink` is dropped or closed or
/// the stream ends
struct LinkDriver {
    remote: PeerId,
    settings: Arc<TransportSettings>,
    commands: mpsc::Receiver<LinkCommand>,
    events: mpsc::Sender<LinkEvent>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

/// Handshake phase result
enum Handshake {
    Established(TcpStream),
    Aborted(String),
}

impl LinkDriver {
    async fn run(mut self, listener: Option<TcpListener>) {
        let handshake = match listener {
            Some(listener) => self.initiate(listener).await,
            None => self.respond().await,
        };

        let reason = match handshake {
            Handshake::Established(stream) => {
                self.connected.store(true, Ordering::Release);
                info!(peer = %self.remote, "Direct channel connected");
                let _ = self.events.send(LinkEvent::Connected).await;
                self.pump(stream).await
            }
            Handshake::Aborted(reason) => reason,
        };

        self.connected.store(false, Ordering::Release);
        debug!(peer = %self.remote, reason = %reason, "Direct channel closed");
        let _ = self.events.send(LinkEvent::Closed { reason }).await;
    }

    /// Offer side: advertise a listener, wait for the matching hello
    async fn initiate(&mut self, listener: TcpListener) -> Handshake {
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => return Handshake::Aborted(format!("listener unavailable: {}", e)),
        };
        let session = Uuid::new_v4().to_string();
        let offer = HandshakeSignal::Offer {
            session: session.clone(),
            addr: format!("{}:{}", self.settings.advertise_host, port),
        };
        debug!(peer = %self.remote, port, "Offering direct channel");
        let _ = self.events.send(LinkEvent::Signal(offer.to_value())).await;

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    return Handshake::Aborted("closed before connect".to_string());
                }

                accepted = listener.accept() => {
                    let (mut stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let hello = tokio::time::timeout(
                        HANDSHAKE_STEP_TIMEOUT,
                        read_framed::<_, Hello>(&mut stream, self.settings.max_frame_bytes),
                    )
                    .await;
                    match hello {
                        Ok(Ok(hello)) if hello.session == session => {
                            return Handshake::Established(stream);
                        }
                        Ok(Ok(_)) => debug!(addr = %addr, "Dropping stream with foreign session"),
                        Ok(Err(e)) => debug!(addr = %addr, error = %e, "Dropping stream without hello"),
                        Err(_) => debug!(addr = %addr, "Dropping stream: hello timed out"),
                    }
                }

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(LinkCommand::Signal(payload)) => match serde_json::from_value(payload) {
                            Ok(HandshakeSignal::Answer { session: answered }) if answered == session => {
                                trace!(peer = %self.remote, "Offer answered");
                            }
                            Ok(HandshakeSignal::Reject { session: rejected, reason })
                                if rejected.as_deref().map_or(true, |s| s == session) =>
                            {
                                return Handshake::Aborted(format!("handshake rejected: {}", reason));
                            }
                            Ok(other) => debug!(signal = ?other, "Ignoring handshake signal"),
                            Err(e) => warn!(error = %e, "Malformed handshake signal dropped"),
                        },
                        Some(LinkCommand::Send(msg)) => {
                            warn!(msg_type = msg.type_name(), "Send before connect dropped");
                        }
                        None => {
                            return Handshake::Aborted("closed before connect".to_string());
                        }
                    }
                }
            }
        }
    }

    /// Answer side: wait for the offer, connect, send hello
    async fn respond(&mut self) -> Handshake {
        let commands = &mut self.commands;
        let shutdown = &self.shutdown;
        let offer = tokio::time::timeout(HANDSHAKE_STEP_TIMEOUT, async {
            loop {
                let cmd = tokio::select! {
                    _ = shutdown.notified() => return Err("closed before connect".to_string()),
                    cmd = commands.recv() => cmd,
                };
                match cmd {
                    Some(LinkCommand::Signal(payload)) => match serde_json::from_value(payload) {
                        Ok(HandshakeSignal::Offer { session, addr }) => return Ok((session, addr)),
                        Ok(HandshakeSignal::Reject { reason, .. }) => {
                            return Err(format!("handshake rejected: {}", reason));
                        }
                        Ok(other) => debug!(signal = ?other, "Ignoring handshake signal"),
                        Err(e) => warn!(error = %e, "Malformed handshake signal dropped"),
                    },
                    Some(LinkCommand::Send(msg)) => {
                        warn!(msg_type = msg.type_name(), "Send before connect dropped");
                    }
                    None => return Err("closed before connect".to_string()),
                }
            }
        })
        .await;

        let (session, addr) = match offer {
            Ok(Ok(offer)) => offer,
            Ok(Err(reason)) => return Handshake::Aborted(reason),
            Err(_) => return Handshake::Aborted("no offer received".to_string()),
        };

        let answer = HandshakeSignal::Answer { session: session.clone() };
        let _ = self.events.send(LinkEvent::Signal(answer.to_value())).await;

        debug!(peer = %self.remote, addr = %addr, "Connecting direct channel");
        let mut stream = match tokio::time::timeout(HANDSHAKE_STEP_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Handshake::Aborted(format!("connect to {} failed: {}", addr, e)),
            Err(_) => return Handshake::Aborted(format!("connect to {} timed out", addr)),
        };

        if let Err(e) = write_framed(&mut stream, &Hello { session }, self.settings.max_frame_bytes).await {
            return Handshake::Aborted(format!("hello failed: {}", e));
        }

        Handshake::Established(stream)
    }

    /// Connected phase: single writer here, reader in its own task
    async fn pump(&mut self, stream: TcpStream) -> String {
        let _ = stream.set_nodelay(true);
        let (read_half, mut write_half) = stream.into_split();

        let mut reader: JoinHandle<String> = tokio::spawn(read_loop(
            self.remote.clone(),
            read_half,
            self.events.clone(),
            self.settings.max_frame_bytes,
        ));

        let reason = loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    let _ = write_half.shutdown().await;
                    break "closed locally".to_string();
                }

                cmd = self.commands.recv() => match cmd {
                    Some(LinkCommand::Send(msg)) => {
                        if let Err(e) = write_framed(&mut write_half, &msg, self.settings.max_frame_bytes).await {
                            break format!("write failed: {}", e);
                        }
                    }
                    Some(LinkCommand::Signal(_)) => {
                        trace!(peer = %self.remote, "Late handshake signal ignored");
                    }
                    None => {
                        let _ = write_half.shutdown().await;
                        break "closed locally".to_string();
                    }
                },

                done = &mut reader => {
                    break done.unwrap_or_else(|e| format!("reader failed: {}", e));
                }
            }
        };

        reader.abort();
        reason
    }
}

/// Reader task: forwards decoded messages, drops undecodable frames,
/// returns the close reason
async fn read_loop(
    peer_id: PeerId,
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<LinkEvent>,
    max_frame_bytes: u32,
) -> String {
    loop {
        let body = match read_frame(&mut reader, max_frame_bytes).await {
            Ok(body) => body,
            Err(e) => {
                let eof = e
                    .downcast_ref::<std::io::Error>()
                    .map_or(false, |io| io.kind() == std::io::ErrorKind::UnexpectedEof);
                return if eof {
                    "closed by peer".to_string()
                } else {
                    format!("read failed: {}", e)
                };
            }
        };

        match decode::<DirectMessage>(&body) {
            Ok(msg) => {
                trace!(peer = %peer_id, msg_type = msg.type_name(), "Direct message received");
                if events.send(LinkEvent::Message(msg)).await.is_err() {
                    return "owner gone".to_string();
                }
            }
            Err(e) => warn!(peer = %peer_id, error = %e, "Malformed direct message dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> TcpTransport {
        TcpTransport::new(TransportSettings {
            bind_host: "127.0.0.1".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            ..Default::default()
        })
    }

    async fn next_signal(events: &mut mpsc::Receiver<LinkEvent>) -> Value {
        match events.recv().await {
            Some(LinkEvent::Signal(payload)) => payload,
            other => panic!("expected signal, got {other:?}"),
        }
    }

    /// Shuttle signals by hand, the way the relay would
    async fn connected_pair() -> (
        PeerLink,
        mpsc::Receiver<LinkEvent>,
        PeerLink,
        mpsc::Receiver<LinkEvent>,
    ) {
        let transport = transport();
        let (initiator, mut init_events) = transport.open(LinkRole::Initiator, "peer-node").await.unwrap();
        let (responder, mut resp_events) = transport.open(LinkRole::Responder, "coordinator-x").await.unwrap();

        let offer = next_signal(&mut init_events).await;
        responder.signal(offer).await.unwrap();
        let answer = next_signal(&mut resp_events).await;
        initiator.signal(answer).await.unwrap();

        assert_eq!(init_events.recv().await, Some(LinkEvent::Connected));
        assert_eq!(resp_events.recv().await, Some(LinkEvent::Connected));

        (initiator, init_events, responder, resp_events)
    }

    #[tokio::test]
    async fn test_handshake_and_exchange() {
        let (initiator, _init_events, responder, mut resp_events) = connected_pair().await;
        assert!(initiator.is_connected());
        assert!(responder.is_connected());

        let task = DirectMessage::Task { task_id: "task-1".into(), code: "echo hi".into() };
        initiator.send(task.clone()).await.unwrap();

        assert_eq!(resp_events.recv().await, Some(LinkEvent::Message(task)));
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (initiator, mut init_events, responder, _resp_events) = connected_pair().await;

        for i in 0..5 {
            let msg = DirectMessage::from_outcome(format!("task-{i}"), Ok(Value::from(i)));
            responder.send(msg).await.unwrap();
        }
        for i in 0..5 {
            match init_events.recv().await {
                Some(LinkEvent::Message(msg)) => assert_eq!(msg.task_id(), format!("task-{i}")),
                other => panic!("unexpected event {other:?}"),
            }
        }
        drop(initiator);
    }

    #[tokio::test]
    async fn test_close_emits_single_closed_on_both_sides() {
        let (initiator, mut init_events, _responder, mut resp_events) = connected_pair().await;

        initiator.close();

        assert!(matches!(init_events.recv().await, Some(LinkEvent::Closed { .. })));
        assert!(init_events.recv().await.is_none());

        match resp_events.recv().await {
            Some(LinkEvent::Closed { reason }) => assert_eq!(reason, "closed by peer"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_busy_signal_aborts_initiator() {
        let transport = transport();
        let (initiator, mut events) = transport.open(LinkRole::Initiator, "peer-node").await.unwrap();
        let _offer = next_signal(&mut events).await;

        initiator.signal(transport.busy_signal()).await.unwrap();

        match events.recv().await {
            Some(LinkEvent::Closed { reason }) => assert!(reason.contains("node is busy")),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!initiator.is_connected());
    }

    #[tokio::test]
    async fn test_malformed_signal_is_dropped() {
        let transport = transport();
        let (responder, mut events) = transport.open(LinkRole::Responder, "coordinator-x").await.unwrap();

        responder.signal(serde_json::json!({"kind": "nonsense"})).await.unwrap();
        responder.close();

        match events.recv().await {
            Some(LinkEvent::Closed { reason }) => assert_eq!(reason, "closed before connect"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_gives_up_without_offer() {
        let transport = transport();
        let (responder, mut events) = transport.open(LinkRole::Responder, "coordinator-x").await.unwrap();

        let answer = HandshakeSignal::Answer { session: "stale".into() }.to_value();
        responder.signal(answer).await.unwrap();

        match events.recv().await {
            Some(LinkEvent::Closed { reason }) => assert_eq!(reason, "no offer received"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_is_not_lost_behind_queued_signals() {
        let transport = transport();
        let (responder, mut events) = transport.open(LinkRole::Responder, "coordinator-x").await.unwrap();

        // Fill the command queue before the driver gets to run
        let stale = HandshakeSignal::Answer { session: "stale".into() }.to_value();
        for _ in 0..EVENT_QUEUE_SIZE {
            responder.signal(stale.clone()).await.unwrap();
        }
        responder.close();

        let closed = tokio::time::timeout(Duration::from_secs(2), events.recv()).await;
        match closed {
            Ok(Some(LinkEvent::Closed { reason })) => assert_eq!(reason, "closed before connect"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_only_offers_open_handshakes() {
        let transport = transport();
        let offer = HandshakeSignal::Offer { session: "s".into(), addr: "127.0.0.1:1".into() }.to_value();
        assert!(transport.is_offer(&offer));

        assert!(!transport.is_offer(&HandshakeSignal::Answer { session: "s".into() }.to_value()));
        assert!(!transport.is_offer(&transport.busy_signal()));
        assert!(!transport.is_offer(&serde_json::json!({"kind": "offer"})));
        assert!(!transport.is_offer(&serde_json::json!("offer")));
    }

    #[test]
    fn test_signal_shapes() {
        let offer = HandshakeSignal::Offer { session: "s".into(), addr: "127.0.0.1:1".into() }.to_value();
        assert_eq!(offer["kind"], "offer");
        let busy = transport().busy_signal();
        assert_eq!(busy["kind"], "reject");
        assert_eq!(busy["reason"], "node is busy");
    }
}
