//! Node agent event loop
//!
//! A single task owns all node state. It reacts to relay events, direct
//! channel events and finished runs, one at a time, so at most one program
//! executes and every task request gets exactly one result.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    random_peer_id, DirectMessage, ExecutionFailure, PeerId, PeerRole, PeerStatus,
};
use crate::relay::{RelayClient, RelayClientConfig, RelayEvent};
use crate::sandbox::Sandbox;
use crate::transport::{LinkEvent, LinkRole, PeerLink, Transport};

use super::runner::{FinishedTask, TaskRunner};
use super::state::{NodeState, NodeStats};

/// Failure message for a request that arrives while a program runs
pub const BUSY_MESSAGE: &str = "node is busy";

pub struct NodeAgent {
    relay: RelayClient,
    relay_events: mpsc::Receiver<RelayEvent>,
    transport: Arc<dyn Transport>,
    runner: TaskRunner,

    link: Option<PeerLink>,
    link_events: Option<mpsc::Receiver<LinkEvent>>,
    /// Bumped for every new link so results can be matched to their channel
    link_generation: u64,

    /// Task id of the running program
    current: Option<String>,
    done_tx: mpsc::Sender<FinishedTask>,
    done_rx: mpsc::Receiver<FinishedTask>,

    state: watch::Sender<NodeState>,
    stats: NodeStats,
}

impl NodeAgent {
    /// Build an agent from the loaded configuration and start its relay client
    pub fn from_config(
        config: &MeshConfig,
        transport: Arc<dyn Transport>,
        sandbox: Arc<dyn Sandbox>,
    ) -> Self {
        let peer_id = config.node.id.clone().unwrap_or_else(|| random_peer_id("peer"));
        let relay = RelayClientConfig::from_settings(&config.relay_client, peer_id, PeerRole::Node);
        let runner = TaskRunner::new(sandbox, Duration::from_secs(config.execution.timeout_secs));
        Self::start(relay, transport, runner)
    }

    /// Start the relay client and return an agent ready to `run`
    pub fn start(relay_config: RelayClientConfig, transport: Arc<dyn Transport>, runner: TaskRunner) -> Self {
        let mut relay = RelayClient::new(relay_config);
        let relay_events = relay.start();
        let (done_tx, done_rx) = mpsc::channel(4);
        let (state, _) = watch::channel(NodeState::Registering);

        info!(
            peer_id = %relay.peer_id(),
            transport = transport.name(),
            sandbox = runner.sandbox_name(),
            "Node agent starting"
        );

        Self {
            relay,
            relay_events,
            transport,
            runner,
            link: None,
            link_events: None,
            link_generation: 0,
            current: None,
            done_tx,
            done_rx,
            state,
            stats: NodeStats::new(),
        }
    }

    pub fn peer_id(&self) -> &str {
        self.relay.peer_id()
    }

    /// Watch the agent's state from outside the loop
    pub fn subscribe_state(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    /// Drive the agent until `shutdown` resolves or the relay client gives up
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<NodeStats> {
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                event = self.relay_events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.on_relay_event(event).await {
                            break Err(e);
                        }
                    }
                    None => {
                        break Err(Error::ConnectionLost {
                            message: "relay client stopped".to_string(),
                        });
                    }
                },
                event = next_link_event(&mut self.link_events) => {
                    self.on_link_event(event).await;
                }
                Some(finished) = self.done_rx.recv() => {
                    self.on_finished(finished).await;
                }
            }
        };

        self.stop().await;
        outcome.map(|()| self.stats)
    }

    // ─────────────────────────────────────────────────────────────
    // Relay events
    // ─────────────────────────────────────────────────────────────

    async fn on_relay_event(&mut self, event: RelayEvent) -> Result<()> {
        match event {
            RelayEvent::Registered { peer_id } => {
                info!(peer_id = %peer_id, "Registered with relay");
                // The relay client re-announces a remembered busy status itself.
                if *self.state.borrow() == NodeState::Registering {
                    self.set_state(NodeState::Idle);
                }
            }
            RelayEvent::Signal { from, signal } => self.on_handshake_signal(from, signal).await,
            RelayEvent::RelayError { message, target } => {
                warn!(message = %message, target = ?target, "Relay reported an error");
            }
            RelayEvent::NodesList(nodes) => debug!(count = nodes.len(), "Unrequested directory snapshot"),
            RelayEvent::Connected => debug!("Relay connection up"),
            RelayEvent::Disconnected { reason } => warn!(reason = %reason, "Relay connection lost"),
            RelayEvent::Reconnecting { attempt } => debug!(attempt, "Reconnecting to relay"),
            RelayEvent::Fatal { message } => return Err(Error::ConnectionLost { message }),
        }
        Ok(())
    }

    async fn on_handshake_signal(&mut self, from: PeerId, signal: serde_json::Value) {
        let Some(link) = &self.link else {
            if self.transport.is_offer(&signal) {
                self.accept_handshake(from, signal).await;
            } else {
                debug!(from = %from, "Stray handshake payload dropped");
            }
            return;
        };

        if link.remote() == from {
            if let Err(e) = link.signal(signal).await {
                debug!(from = %from, error = %e, "Handshake payload not delivered");
            }
        } else if !self.transport.is_offer(&signal) {
            debug!(from = %from, linked = %link.remote(), "Stray handshake payload dropped");
        } else {
            info!(from = %from, linked = %link.remote(), "Refusing handshake: channel already held");
            if let Err(e) = self.relay.signal(from, self.transport.busy_signal()).await {
                warn!(error = %e, "Could not send busy signal");
            }
        }
    }

    async fn accept_handshake(&mut self, from: PeerId, signal: serde_json::Value) {
        let (link, events) = match self.transport.open(LinkRole::Responder, &from).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(from = %from, error = %e, "Could not open responder link");
                return;
            }
        };
        if let Err(e) = link.signal(signal).await {
            debug!(from = %from, error = %e, "Offer not delivered to new link");
        }

        self.link_generation += 1;
        self.link = Some(link);
        self.link_events = Some(events);
        info!(from = %from, "Accepting direct channel");
        if self.current.is_none() {
            self.set_state(NodeState::AwaitingConnection);
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Direct channel events
    // ─────────────────────────────────────────────────────────────

    async fn on_link_event(&mut self, event: Option<LinkEvent>) {
        let Some(remote) = self.link.as_ref().map(|l| l.remote().to_string()) else {
            return;
        };

        match event {
            Some(LinkEvent::Signal(payload)) => {
                if let Err(e) = self.relay.signal(remote, payload).await {
                    warn!(error = %e, "Could not relay handshake payload");
                }
            }
            Some(LinkEvent::Connected) => {
                info!(peer = %remote, "Direct channel open");
                if self.current.is_none() {
                    self.set_state(NodeState::Idle);
                }
            }
            Some(LinkEvent::Message(DirectMessage::Task { task_id, code })) => {
                self.on_task(task_id, code).await;
            }
            Some(LinkEvent::Message(other)) => {
                warn!(peer = %remote, kind = other.type_name(), "Unexpected message from coordinator");
            }
            Some(LinkEvent::Closed { reason }) => self.forget_link(&remote, &reason),
            None => self.forget_link(&remote, "link events ended"),
        }
    }

    async fn on_task(&mut self, task_id: String, code: String) {
        if let Some(running) = &self.current {
            warn!(task_id = %task_id, running = %running, "Task request while busy");
            self.stats.rejected_busy += 1;
            let reply = DirectMessage::from_outcome(task_id, Err(ExecutionFailure::new(BUSY_MESSAGE)));
            self.send_on_link(reply).await;
            return;
        }

        info!(task_id = %task_id, "Task received");
        if let Err(e) = self.relay.update_status(PeerStatus::Busy).await {
            warn!(error = %e, "Could not report busy");
        }
        self.current = Some(task_id.clone());
        self.set_state(NodeState::Executing);
        self.runner.spawn(task_id, code, self.link_generation, self.done_tx.clone());
    }

    fn forget_link(&mut self, remote: &str, reason: &str) {
        info!(peer = %remote, reason = %reason, "Direct channel closed");
        self.link = None;
        self.link_events = None;
        if self.current.is_none() {
            self.set_state(NodeState::Idle);
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Finished runs
    // ─────────────────────────────────────────────────────────────

    async fn on_finished(&mut self, finished: FinishedTask) {
        let FinishedTask {
            task_id,
            link_generation,
            outcome,
            elapsed,
        } = finished;
        self.stats.record(outcome.is_ok());

        let same_link = link_generation == self.link_generation
            && self.link.as_ref().is_some_and(|l| l.is_connected());
        if same_link {
            info!(
                task_id = %task_id,
                success = outcome.is_ok(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Task finished"
            );
            self.send_on_link(DirectMessage::from_outcome(task_id, outcome)).await;
        } else {
            warn!(task_id = %task_id, "Result discarded: its channel is gone");
            self.stats.discarded += 1;
        }

        if let Err(e) = self.relay.update_status(PeerStatus::Idle).await {
            warn!(error = %e, "Could not report idle");
        }
        self.current = None;
        self.set_state(NodeState::Idle);
    }

    async fn send_on_link(&mut self, msg: DirectMessage) {
        let Some(link) = &self.link else {
            self.stats.discarded += 1;
            return;
        };
        if let Err(e) = link.send(msg).await {
            warn!(peer = %link.remote(), error = %e, "Could not send on direct channel");
            self.stats.discarded += 1;
        }
    }

    // ─────────────────────────────────────────────────────────────

    async fn stop(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        let _ = self.relay.shutdown().await;
        info!(
            completed = self.stats.completed,
            failed = self.stats.failed,
            rejected_busy = self.stats.rejected_busy,
            discarded = self.stats.discarded,
            uptime_secs = self.stats.started_at.elapsed().as_secs(),
            "Node agent stopped"
        );
    }

    fn set_state(&self, next: NodeState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Node state");
        }
    }
}

async fn next_link_event(events: &mut Option<mpsc::Receiver<LinkEvent>>) -> Option<LinkEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
