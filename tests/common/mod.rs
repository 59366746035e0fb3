//! Shared fixtures for integration tests: an in-process relay, raw
//! WebSocket peers, and node agents wired to mock sandboxes.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use relaymesh::config::{RelaySettings, TransportSettings};
use relaymesh::coordinator::{Coordinator, CoordinatorOptions, SelectionStrategy};
use relaymesh::node::{NodeAgent, NodeState, NodeStats, TaskRunner};
use relaymesh::protocol::PeerRole;
use relaymesh::relay::{DuplicatePolicy, PeerRegistry, RelayClientConfig, RelayServer};
use relaymesh::sandbox::Sandbox;
use relaymesh::transport::{TcpTransport, Transport};

pub const STEP: Duration = Duration::from_secs(5);

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A relay bound to an ephemeral localhost port
pub struct TestRelay {
    pub addr: SocketAddr,
    pub registry: Arc<PeerRegistry>,
    handle: JoinHandle<()>,
}

impl TestRelay {
    pub async fn start() -> Self {
        Self::with_policy(DuplicatePolicy::Replace).await
    }

    pub async fn with_policy(policy: DuplicatePolicy) -> Self {
        let settings = RelaySettings {
            bind_addr: "127.0.0.1:0".to_string(),
            duplicate_policy: policy,
            ..Default::default()
        };
        let server = RelayServer::bind(&settings).await.unwrap();
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        let handle = tokio::spawn(async move {
            let _ = server.run().await;
        });
        Self { addr, registry, handle }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Poll the registry until `check` holds
    pub async fn wait_until(&self, check: impl Fn(&PeerRegistry) -> bool) {
        tokio::time::timeout(STEP, async {
            while !check(&self.registry) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("registry never reached the expected state");
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ─────────────────────────────────────────────────────────────────
// Raw WebSocket peers
// ─────────────────────────────────────────────────────────────────

pub async fn ws_connect(relay: &TestRelay) -> Ws {
    let (ws, _) = connect_async(relay.url()).await.unwrap();
    ws
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

pub async fn send_raw(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string())).await.unwrap();
}

/// Next text frame as JSON, skipping control frames
pub async fn recv_json(ws: &mut Ws) -> Value {
    tokio::time::timeout(STEP, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await
    .expect("no message within the step timeout")
}

/// Assert nothing arrives for a short while
pub async fn expect_silence(ws: &mut Ws) {
    let waited = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(waited.is_err(), "unexpected message: {:?}", waited);
}

/// Connect and register, returning the socket after the ack
pub async fn register(relay: &TestRelay, peer_id: &str, peer_type: &str) -> Ws {
    let mut ws = ws_connect(relay).await;
    send_json(
        &mut ws,
        serde_json::json!({"type": "register", "peerId": peer_id, "peerType": peer_type}),
    )
    .await;
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "registered", "unexpected ack {ack}");
    assert_eq!(ack["peerId"], peer_id);
    ws
}

// ─────────────────────────────────────────────────────────────────
// Nodes and coordinators
// ─────────────────────────────────────────────────────────────────

pub fn transport() -> Arc<dyn Transport> {
    Arc::new(TcpTransport::new(TransportSettings {
        bind_host: "127.0.0.1".to_string(),
        advertise_host: "127.0.0.1".to_string(),
        ..Default::default()
    }))
}

pub fn client_config(relay: &TestRelay, peer_id: &str, role: PeerRole) -> RelayClientConfig {
    let mut config = RelayClientConfig::new(relay.url(), peer_id, role);
    config.register_timeout = STEP;
    config.initial_reconnect_delay = Duration::from_millis(50);
    config.max_reconnect_delay = Duration::from_millis(200);
    config
}

/// A node agent running in the background
pub struct TestNode {
    pub peer_id: String,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<relaymesh::Result<NodeStats>>,
}

impl TestNode {
    pub async fn start(relay: &TestRelay, peer_id: &str, sandbox: Arc<dyn Sandbox>) -> Self {
        Self::start_with_timeout(relay, peer_id, sandbox, Duration::from_secs(30)).await
    }

    pub async fn start_with_timeout(
        relay: &TestRelay,
        peer_id: &str,
        sandbox: Arc<dyn Sandbox>,
        exec_timeout: Duration,
    ) -> Self {
        let agent = NodeAgent::start(
            client_config(relay, peer_id, PeerRole::Node),
            transport(),
            TaskRunner::new(sandbox, exec_timeout),
        );
        let mut state = agent.subscribe_state();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(agent.run(async {
            let _ = stopped.await;
        }));

        tokio::time::timeout(STEP, state.wait_for(|s| *s != NodeState::Registering))
            .await
            .expect("node never registered")
            .expect("node agent stopped");

        Self {
            peer_id: peer_id.to_string(),
            stop: Some(stop),
            handle,
        }
    }

    /// Stop gracefully and collect the agent's counters
    pub async fn stop(mut self) -> NodeStats {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(STEP, &mut self.handle)
            .await
            .expect("node did not stop")
            .expect("node task panicked")
            .expect("node returned an error")
    }

    /// Drop the agent without a goodbye, as a crash would
    pub fn kill(self) {
        self.handle.abort();
    }
}

pub fn fast_options(strategy: SelectionStrategy) -> CoordinatorOptions {
    CoordinatorOptions {
        strategy,
        connect_timeout: STEP,
        task_timeout: STEP,
        refresh_interval: Duration::from_millis(200),
        selection_wait: Duration::from_millis(300),
    }
}

pub async fn coordinator(relay: &TestRelay, peer_id: &str, options: CoordinatorOptions) -> Coordinator {
    Coordinator::connect(client_config(relay, peer_id, PeerRole::Coordinator), options, transport())
        .await
        .unwrap()
}
