//! Coordinator dispatch cycle
//!
//! One `submit` call walks Idle → Selecting → Connecting → Dispatched and
//! back to Idle. Background tasks keep the directory fresh and pump events
//! from the relay and the direct channel into the shared tables; the cycle
//! itself only ever waits on bounded, early-returning futures.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::MeshConfig;
use crate::error::{Error, Result};
use crate::protocol::{random_peer_id, DirectMessage, NodeSummary, PeerId, PeerRole, PeerStatus};
use crate::relay::{RelayClient, RelayClientConfig, RelayEvent};
use crate::transport::{LinkEvent, LinkRole, PeerLink, Transport};

use super::directory::DirectoryCache;
use super::ids::TaskIdGenerator;
use super::pending::{PendingTasks, Resolution};
use super::selection::{NodeSelector, SelectionStrategy};

// ─────────────────────────────────────────────────────────────────
// Options and Results
// ─────────────────────────────────────────────────────────────────

/// Timing and selection knobs for a coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub strategy: SelectionStrategy,
    pub connect_timeout: Duration,
    pub task_timeout: Duration,
    pub refresh_interval: Duration,
    pub selection_wait: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            connect_timeout: Duration::from_secs(10),
            task_timeout: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(5),
            selection_wait: Duration::from_millis(500),
        }
    }
}

impl CoordinatorOptions {
    pub fn from_config(config: &MeshConfig) -> Self {
        let settings = &config.coordinator;
        Self {
            strategy: settings.strategy,
            connect_timeout: settings.connect_timeout(),
            task_timeout: settings.task_timeout(),
            refresh_interval: settings.refresh_interval(),
            selection_wait: settings.selection_wait(),
        }
    }
}

/// Outcome of a successful dispatch cycle
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_id: String,
    pub node_id: PeerId,
    pub value: Value,
    pub elapsed: Duration,
}

/// Where the current cycle is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Selecting,
    Connecting { node: PeerId },
    Dispatched { task_id: String, node: PeerId },
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::Idle => write!(f, "idle"),
            CoordinatorState::Selecting => write!(f, "selecting"),
            CoordinatorState::Connecting { node } => write!(f, "connecting to {}", node),
            CoordinatorState::Dispatched { task_id, node } => {
                write!(f, "dispatched {} to {}", task_id, node)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Shared plumbing
// ─────────────────────────────────────────────────────────────────

/// The link currently in handshake or open; the relay pump feeds it
/// handshake payloads from its remote.
type LinkSlot = Arc<RwLock<Option<Arc<PeerLink>>>>;

/// A relay `error` reply, kept for the connect step to inspect
#[derive(Debug, Clone)]
struct RelayFailure {
    message: String,
    target: Option<PeerId>,
}

#[derive(Debug, Clone, PartialEq)]
enum LinkPhase {
    Handshaking,
    Connected,
    Closed(String),
}

struct ActiveLink {
    node: PeerId,
    link: Arc<PeerLink>,
    /// Set when a task goes out, cleared by any result from the node
    in_flight: Arc<AtomicBool>,
}

impl ActiveLink {
    fn is_free(&self) -> bool {
        self.link.is_connected() && !self.in_flight.load(Ordering::Acquire)
    }
}

// ─────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────

pub struct Coordinator {
    options: CoordinatorOptions,
    relay: RelayClient,
    transport: Arc<dyn Transport>,
    directory: Arc<DirectoryCache>,
    pending: Arc<PendingTasks>,
    selector: NodeSelector,
    ids: TaskIdGenerator,
    slot: LinkSlot,
    relay_failures: mpsc::Receiver<RelayFailure>,
    active: Option<ActiveLink>,
    state: CoordinatorState,
    relay_pump: JoinHandle<()>,
}

impl Coordinator {
    /// Build a coordinator from the loaded configuration and connect it
    pub async fn from_config(config: &MeshConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let peer_id = config
            .coordinator
            .id
            .clone()
            .unwrap_or_else(|| random_peer_id("coordinator"));
        let relay = RelayClientConfig::from_settings(&config.relay_client, peer_id, PeerRole::Coordinator);
        Self::connect(relay, CoordinatorOptions::from_config(config), transport).await
    }

    /// Register with the relay, fetch the first snapshot and start the
    /// background refresh
    pub async fn connect(
        relay_config: RelayClientConfig,
        options: CoordinatorOptions,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let register_timeout = relay_config.register_timeout;
        let url = relay_config.url.clone();
        let mut relay = RelayClient::new(relay_config);
        let mut events = relay.start();

        let registered = timeout(register_timeout, async {
            loop {
                match events.recv().await {
                    Some(RelayEvent::Registered { peer_id }) => return Ok(peer_id),
                    Some(RelayEvent::Fatal { message }) => {
                        return Err(Error::connection_failed(&url, message))
                    }
                    Some(other) => debug!(event = ?other, "Relay event before registration"),
                    None => {
                        return Err(Error::ConnectionLost {
                            message: "relay client stopped".to_string(),
                        })
                    }
                }
            }
        })
        .await;

        let peer_id = match registered {
            Ok(Ok(peer_id)) => peer_id,
            Ok(Err(e)) => {
                let _ = relay.shutdown().await;
                return Err(e);
            }
            Err(_) => {
                let _ = relay.shutdown().await;
                return Err(Error::ConnectionTimeout {
                    url,
                    timeout_secs: register_timeout.as_secs(),
                });
            }
        };

        info!(peer_id = %peer_id, transport = transport.name(), "Coordinator registered");

        let directory = Arc::new(DirectoryCache::new());
        let slot: LinkSlot = Arc::new(RwLock::new(None));
        let (failure_tx, relay_failures) = mpsc::channel(16);

        let relay_pump = tokio::spawn(run_relay_pump(
            events,
            relay.clone(),
            Arc::clone(&directory),
            Arc::clone(&slot),
            failure_tx,
            options.refresh_interval,
        ));

        Ok(Self {
            selector: NodeSelector::new(options.strategy),
            options,
            relay,
            transport,
            directory,
            pending: Arc::new(PendingTasks::new()),
            ids: TaskIdGenerator::new(),
            slot,
            relay_failures,
            active: None,
            state: CoordinatorState::Idle,
            relay_pump,
        })
    }

    pub fn peer_id(&self) -> &str {
        self.relay.peer_id()
    }

    pub fn state(&self) -> &CoordinatorState {
        &self.state
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.selector.strategy()
    }

    /// Node the coordinator currently holds an open channel to
    pub fn linked_node(&self) -> Option<&str> {
        self.active
            .as_ref()
            .filter(|a| a.link.is_connected())
            .map(|a| a.node.as_str())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Ask the relay for a fresh directory and return it, or the cached one
    /// if nothing arrives within the connect timeout
    pub async fn list_nodes(&self) -> Result<Vec<NodeSummary>> {
        let generation = self.directory.generation();
        self.relay.list_nodes().await?;
        let snapshot = self
            .directory
            .wait_newer_than(generation, self.options.connect_timeout)
            .await;
        Ok(snapshot.nodes)
    }

    /// Run one full dispatch cycle for `program`
    pub async fn submit(&mut self, program: &str) -> Result<TaskReport> {
        let outcome = self.run_cycle(program).await;
        self.transition(CoordinatorState::Idle);
        outcome
    }

    /// Close the direct channel and the relay connection
    pub async fn shutdown(&mut self) -> Result<()> {
        self.drop_link();
        let _ = self.relay.shutdown().await;
        info!(peer_id = %self.peer_id(), "Coordinator shut down");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Cycle steps
    // ─────────────────────────────────────────────────────────────

    async fn run_cycle(&mut self, program: &str) -> Result<TaskReport> {
        if !self.relay.is_registered() {
            return Err(Error::NotConnected);
        }

        self.transition(CoordinatorState::Selecting);
        let node = self.select_node().await?;

        self.transition(CoordinatorState::Connecting { node: node.clone() });
        self.ensure_link(&node).await?;

        self.dispatch(&node, program).await
    }

    async fn select_node(&mut self) -> Result<PeerId> {
        let generation = self.directory.generation();
        self.relay.list_nodes().await?;
        let snapshot = self
            .directory
            .wait_newer_than(generation, self.options.selection_wait)
            .await;

        let candidates = self.candidates(snapshot.nodes.clone());
        match self.selector.select(&candidates) {
            Some(node) => {
                debug!(
                    node = %node.peer_id,
                    strategy = %self.selector.strategy(),
                    known = snapshot.nodes.len(),
                    "Node selected"
                );
                Ok(node.peer_id)
            }
            None => Err(Error::NoCapacity {
                known: snapshot.nodes.len(),
            }),
        }
    }

    /// The snapshot with the linked node marked idle when it has nothing
    /// in flight; its own `idle` report may not have reached the relay yet
    fn candidates(&self, mut nodes: Vec<NodeSummary>) -> Vec<NodeSummary> {
        if let Some(active) = self.active.as_ref().filter(|a| a.is_free()) {
            for node in nodes.iter_mut().filter(|n| n.peer_id == active.node) {
                node.status = PeerStatus::Idle;
            }
        }
        nodes
    }

    async fn ensure_link(&mut self, node: &str) -> Result<()> {
        if let Some(active) = &self.active {
            if active.node == node && active.link.is_connected() {
                debug!(node = %node, "Reusing open channel");
                return Ok(());
            }
        }
        self.drop_link();
        self.establish(node).await
    }

    async fn establish(&mut self, node: &str) -> Result<()> {
        // Errors from an earlier attempt do not concern this one.
        while self.relay_failures.try_recv().is_ok() {}

        let (link, events) = self.transport.open(LinkRole::Initiator, node).await?;
        let link = Arc::new(link);
        *self.slot.write() = Some(Arc::clone(&link));

        let (phase_tx, mut phase_rx) = watch::channel(LinkPhase::Handshaking);
        let in_flight = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_link_pump(
            node.to_string(),
            events,
            self.relay.clone(),
            Arc::clone(&self.pending),
            phase_tx,
            Arc::clone(&in_flight),
        ));

        self.active = Some(ActiveLink {
            node: node.to_string(),
            link,
            in_flight,
        });

        let started = Instant::now();
        let failures = &mut self.relay_failures;
        let handshake = timeout(self.options.connect_timeout, async {
            loop {
                tokio::select! {
                    changed = phase_rx.changed() => {
                        let phase = phase_rx.borrow_and_update().clone();
                        match phase {
                            LinkPhase::Connected => return Ok(()),
                            LinkPhase::Closed(reason) => {
                                return Err(Error::HandshakeFailed { peer: node.to_string(), reason })
                            }
                            LinkPhase::Handshaking if changed.is_err() => {
                                return Err(Error::HandshakeFailed {
                                    peer: node.to_string(),
                                    reason: "link driver stopped".to_string(),
                                })
                            }
                            LinkPhase::Handshaking => {}
                        }
                    }
                    Some(failure) = failures.recv() => {
                        if failure.target.as_deref().map_or(true, |t| t == node) {
                            return Err(Error::Routing {
                                target: node.to_string(),
                                message: failure.message,
                            });
                        }
                        debug!(target = ?failure.target, "Relay error for another peer ignored");
                    }
                }
            }
        })
        .await;

        let outcome = match handshake {
            Ok(result) => result,
            Err(_) => Err(Error::HandshakeTimeout {
                peer: node.to_string(),
                timeout_ms: self.options.connect_timeout.as_millis() as u64,
            }),
        };

        match &outcome {
            Ok(()) => info!(
                node = %node,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Direct channel open"
            ),
            Err(e) => {
                warn!(node = %node, error = %e, "Connection attempt failed");
                self.drop_link();
            }
        }
        outcome
    }

    async fn dispatch(&mut self, node: &str, program: &str) -> Result<TaskReport> {
        let active = self.active.as_ref().ok_or(Error::NotConnected)?;
        let link = Arc::clone(&active.link);
        let in_flight = Arc::clone(&active.in_flight);

        let task_id = self.ids.next_id();
        self.transition(CoordinatorState::Dispatched {
            task_id: task_id.clone(),
            node: node.to_string(),
        });

        let mut resolution = self.pending.register(&task_id, node);
        in_flight.store(true, Ordering::Release);
        let started = Instant::now();

        let request = DirectMessage::Task {
            task_id: task_id.clone(),
            code: program.to_string(),
        };
        if let Err(e) = link.send(request).await {
            self.pending.remove(&task_id);
            in_flight.store(false, Ordering::Release);
            return Err(e);
        }
        info!(task_id = %task_id, node = %node, "Task dispatched");

        let settled = match timeout(self.options.task_timeout, &mut resolution).await {
            Ok(Ok(settled)) => settled,
            Ok(Err(_)) => {
                return Err(Error::Internal(format!(
                    "pending entry for {} dropped without resolution",
                    task_id
                )))
            }
            Err(_) => {
                if self.pending.remove(&task_id) {
                    warn!(task_id = %task_id, node = %node, "Task timed out");
                    return Err(Error::TaskTimeout {
                        task_id,
                        timeout_ms: self.options.task_timeout.as_millis() as u64,
                    });
                }
                // Settled between the timer firing and the removal.
                resolution.try_recv().map_err(|_| {
                    Error::Internal(format!("resolution for {} lost", task_id))
                })?
            }
        };

        let elapsed = started.elapsed();
        match settled {
            Resolution::Completed { error: Some(failure), .. } => {
                info!(task_id = %task_id, node = %node, error = %failure.message, "Task failed on node");
                Err(Error::Execution {
                    task_id,
                    node_id: node.to_string(),
                    message: failure.message,
                    trace: failure.trace,
                })
            }
            Resolution::Completed { result, error: None } => {
                info!(
                    task_id = %task_id,
                    node = %node,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Task completed"
                );
                Ok(TaskReport {
                    task_id,
                    node_id: node.to_string(),
                    value: result.unwrap_or(Value::Null),
                    elapsed,
                })
            }
            Resolution::ChannelClosed { reason } => Err(Error::ChannelClosed {
                peer: node.to_string(),
                reason,
            }),
        }
    }

    fn drop_link(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(node = %active.node, "Closing direct channel");
            active.link.close();
        }
        *self.slot.write() = None;
    }

    fn transition(&mut self, next: CoordinatorState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Coordinator state");
            self.state = next;
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.link.close();
        }
        self.relay_pump.abort();
    }
}

// ─────────────────────────────────────────────────────────────────
// Background pumps
// ─────────────────────────────────────────────────────────────────

/// Routes relay events into the directory cache and the active link, and
/// re-queries the directory on a fixed interval
async fn run_relay_pump(
    mut events: mpsc::Receiver<RelayEvent>,
    relay: RelayClient,
    directory: Arc<DirectoryCache>,
    slot: LinkSlot,
    failures: mpsc::Sender<RelayFailure>,
    refresh_interval: Duration,
) {
    let mut ticker = interval(refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if relay.is_registered() {
                    if let Err(e) = relay.list_nodes().await {
                        debug!(error = %e, "Directory refresh not sent");
                    }
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    RelayEvent::NodesList(nodes) => {
                        debug!(count = nodes.len(), "Directory snapshot received");
                        directory.update(nodes);
                    }
                    RelayEvent::Signal { from, signal } => {
                        let link = slot.read().clone();
                        match link {
                            Some(link) if link.remote() == from => {
                                if let Err(e) = link.signal(signal).await {
                                    debug!(from = %from, error = %e, "Handshake payload not delivered");
                                }
                            }
                            _ => debug!(from = %from, "Handshake payload with no matching link dropped"),
                        }
                    }
                    RelayEvent::RelayError { message, target } => {
                        warn!(message = %message, target = ?target, "Relay reported an error");
                        let _ = failures.try_send(RelayFailure { message, target });
                    }
                    RelayEvent::Registered { peer_id } => {
                        info!(peer_id = %peer_id, "Re-registered with relay");
                    }
                    RelayEvent::Disconnected { reason } => {
                        warn!(reason = %reason, "Relay connection lost");
                    }
                    RelayEvent::Reconnecting { attempt } => {
                        debug!(attempt, "Reconnecting to relay");
                    }
                    RelayEvent::Connected => debug!("Relay connection up"),
                    RelayEvent::Fatal { message } => {
                        error!(message = %message, "Relay client gave up");
                        break;
                    }
                }
            }
        }
    }
}

/// Forwards the link's handshake payloads through the relay and settles
/// pending tasks from its results
async fn run_link_pump(
    node: PeerId,
    mut events: mpsc::Receiver<LinkEvent>,
    relay: RelayClient,
    pending: Arc<PendingTasks>,
    phase: watch::Sender<LinkPhase>,
    in_flight: Arc<AtomicBool>,
) {
    let mut reason = "link events ended".to_string();

    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Signal(payload) => {
                if let Err(e) = relay.signal(node.clone(), payload).await {
                    warn!(node = %node, error = %e, "Could not relay handshake payload");
                }
            }
            LinkEvent::Connected => {
                phase.send_replace(LinkPhase::Connected);
            }
            LinkEvent::Message(DirectMessage::Result { task_id, result, error }) => {
                in_flight.store(false, Ordering::Release);
                if !pending.resolve(&task_id, Resolution::Completed { result, error }) {
                    debug!(task_id = %task_id, node = %node, "Late or unknown result dropped");
                }
            }
            LinkEvent::Message(other) => {
                warn!(node = %node, kind = other.type_name(), "Unexpected message from node");
            }
            LinkEvent::Closed { reason: why } => {
                reason = why;
                break;
            }
        }
    }

    let failed = pending.fail_peer(&node, &reason);
    if failed > 0 {
        warn!(node = %node, failed, reason = %reason, "Channel closed with tasks in flight");
    } else {
        debug!(node = %node, reason = %reason, "Channel closed");
    }
    phase.send_replace(LinkPhase::Closed(reason));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_config() {
        let mut config = MeshConfig::default();
        config.coordinator.strategy = SelectionStrategy::RoundRobin;
        config.coordinator.task_timeout_ms = 1500;

        let options = CoordinatorOptions::from_config(&config);
        assert_eq!(options.strategy, SelectionStrategy::RoundRobin);
        assert_eq!(options.task_timeout, Duration::from_millis(1500));
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.selection_wait, Duration::from_millis(500));
    }

    #[test]
    fn test_state_display() {
        let state = CoordinatorState::Dispatched {
            task_id: "task-1-abc".into(),
            node: "peer-x".into(),
        };
        assert_eq!(state.to_string(), "dispatched task-1-abc to peer-x");
        assert_eq!(CoordinatorState::Idle.to_string(), "idle");
    }

    #[tokio::test]
    async fn test_link_pump_fails_pending_on_close() {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (phase_tx, phase_rx) = watch::channel(LinkPhase::Handshaking);
        let pending = Arc::new(PendingTasks::new());
        let in_flight = Arc::new(AtomicBool::new(true));
        let relay = RelayClient::new(RelayClientConfig::new("ws://127.0.0.1:1", "c", PeerRole::Coordinator));

        let rx = pending.register("t1", "node-a");
        let pump = tokio::spawn(run_link_pump(
            "node-a".into(),
            event_rx,
            relay,
            Arc::clone(&pending),
            phase_tx,
            Arc::clone(&in_flight),
        ));

        event_tx.send(LinkEvent::Connected).await.unwrap();
        event_tx
            .send(LinkEvent::Closed { reason: "closed by peer".into() })
            .await
            .unwrap();
        pump.await.unwrap();

        assert_eq!(
            rx.await.unwrap(),
            Resolution::ChannelClosed { reason: "closed by peer".into() }
        );
        assert_eq!(*phase_rx.borrow(), LinkPhase::Closed("closed by peer".into()));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_link_pump_resolves_and_clears_in_flight() {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (phase_tx, _phase_rx) = watch::channel(LinkPhase::Connected);
        let pending = Arc::new(PendingTasks::new());
        let in_flight = Arc::new(AtomicBool::new(true));
        let relay = RelayClient::new(RelayClientConfig::new("ws://127.0.0.1:1", "c", PeerRole::Coordinator));

        let rx = pending.register("t1", "node-a");
        let pump = tokio::spawn(run_link_pump(
            "node-a".into(),
            event_rx,
            relay,
            Arc::clone(&pending),
            phase_tx,
            Arc::clone(&in_flight),
        ));

        let answer = DirectMessage::Result {
            task_id: "t1".into(),
            result: Some(serde_json::json!(42)),
            error: None,
        };
        event_tx.send(LinkEvent::Message(answer.clone())).await.unwrap();
        // A duplicate is dropped without effect.
        event_tx.send(LinkEvent::Message(answer)).await.unwrap();
        drop(event_tx);
        pump.await.unwrap();

        match rx.await.unwrap() {
            Resolution::Completed { result, error } => {
                assert_eq!(result, Some(serde_json::json!(42)));
                assert!(error.is_none());
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
        assert!(!in_flight.load(Ordering::Acquire));
    }
}
