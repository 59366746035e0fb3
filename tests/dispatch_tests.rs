//! End-to-end dispatch: relay, coordinator and node agents with mock
//! sandboxes over real sockets

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use common::*;
use relaymesh::coordinator::{Coordinator, CoordinatorState, SelectionStrategy};
use relaymesh::protocol::{ExecutionFailure, PeerRole, PeerStatus};
use relaymesh::relay::PeerRegistry;
use relaymesh::sandbox::{ExecutionOutcome, MockBehavior, MockSandbox, Sandbox};
use relaymesh::transport::{LinkEvent, LinkRole, PeerLink, Transport};
use relaymesh::Error;

fn echo() -> Arc<MockSandbox> {
    Arc::new(MockSandbox::echo())
}

/// Wait until the relay has counted `n` completions for `node`
async fn completed(relay: &TestRelay, node: &str, n: u64) {
    relay
        .wait_until(|r| {
            r.get(node)
                .is_some_and(|p| p.completed_tasks == n && p.status == PeerStatus::Idle)
        })
        .await;
}

#[tokio::test]
async fn test_submit_returns_node_value() {
    let relay = TestRelay::start().await;
    let sandbox = echo();
    let node = TestNode::start(&relay, "node-a", sandbox.clone()).await;
    let mut coordinator = coordinator(&relay, "coord-1", fast_options(SelectionStrategy::Random)).await;

    let report = coordinator.submit("1 + 1").await.unwrap();
    assert_eq!(report.value, json!("1 + 1"));
    assert_eq!(report.node_id, "node-a");
    assert!(report.task_id.starts_with("task-"));
    assert_eq!(sandbox.programs(), vec!["1 + 1"]);
    assert_eq!(*coordinator.state(), CoordinatorState::Idle);
    assert_eq!(coordinator.pending_count(), 0);

    completed(&relay, "node-a", 1).await;
    coordinator.shutdown().await.unwrap();

    let stats = node.stop().await;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_no_nodes_is_no_capacity() {
    let relay = TestRelay::start().await;
    let mut coordinator = coordinator(&relay, "coord-1", fast_options(SelectionStrategy::Random)).await;

    let err = coordinator.submit("x").await.unwrap_err();
    assert!(matches!(err, Error::NoCapacity { known: 0 }), "got {err:?}");
    assert_eq!(*coordinator.state(), CoordinatorState::Idle);
}

#[tokio::test]
async fn test_only_busy_nodes_is_no_capacity() {
    let relay = TestRelay::start().await;
    let mut worker = register(&relay, "node-a", "node").await;
    send_json(&mut worker, json!({"type": "status_update", "status": "busy"})).await;
    relay
        .wait_until(|r| r.get("node-a").is_some_and(|p| p.status == PeerStatus::Busy))
        .await;

    let mut coordinator = coordinator(&relay, "coord-1", fast_options(SelectionStrategy::LeastLoaded)).await;
    let err = coordinator.submit("x").await.unwrap_err();
    assert!(matches!(err, Error::NoCapacity { known: 1 }), "got {err:?}");
}

#[tokio::test]
async fn test_execution_failure_is_reported() {
    let relay = TestRelay::start().await;
    let failing = Arc::new(MockSandbox::new(MockBehavior::Fail(
        ExecutionFailure::new("ReferenceError: y is not defined").with_trace("at line 1"),
    )));
    let _node = TestNode::start(&relay, "node-a", failing).await;
    let mut coordinator = coordinator(&relay, "coord-1", fast_options(SelectionStrategy::Random)).await;

    match coordinator.submit("y").await.unwrap_err() {
        Error::Execution { node_id, message, trace, .. } => {
            assert_eq!(node_id, "node-a");
            assert_eq!(message, "ReferenceError: y is not defined");
            assert_eq!(trace.as_deref(), Some("at line 1"));
        }
        other => panic!("expected execution error, got {other:?}"),
    }

    // A failed task still ends the busy period.
    completed(&relay, "node-a", 1).await;
}

#[tokio::test]
async fn test_slow_node_times_out() {
    let relay = TestRelay::start().await;
    let slow = Arc::new(MockSandbox::echo().with_delay(Duration::from_secs(3)));
    let _node = TestNode::start(&relay, "node-a", slow).await;

    let mut options = fast_options(SelectionStrategy::Random);
    options.task_timeout = Duration::from_millis(300);
    let mut coordinator = coordinator(&relay, "coord-1", options).await;

    let err = coordinator.submit("sleep").await.unwrap_err();
    assert!(matches!(err, Error::TaskTimeout { timeout_ms: 300, .. }), "got {err:?}");
    assert_eq!(coordinator.pending_count(), 0);
}

#[tokio::test]
async fn test_node_crash_fails_task_before_timeout() {
    let relay = TestRelay::start().await;
    let slow = Arc::new(MockSandbox::echo().with_delay(Duration::from_secs(3)));
    let node = TestNode::start(&relay, "node-a", slow.clone()).await;
    let mut coordinator = coordinator(&relay, "coord-1", fast_options(SelectionStrategy::Random)).await;

    let started = Instant::now();
    let (outcome, ()) = tokio::join!(coordinator.submit("long job"), async move {
        while slow.call_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        node.kill();
    });

    let err = outcome.unwrap_err();
    assert!(matches!(err, Error::ChannelClosed { ref peer, .. } if peer == "node-a"), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(coordinator.pending_count(), 0);
}

#[tokio::test]
async fn test_channel_is_reused_for_same_node() {
    let relay = TestRelay::start().await;
    let sandbox = echo();
    let _node = TestNode::start(&relay, "node-a", sandbox.clone()).await;
    let mut coordinator = coordinator(&relay, "coord-1", fast_options(SelectionStrategy::LeastLoaded)).await;

    let first = coordinator.submit("first").await.unwrap();
    assert_eq!(coordinator.linked_node(), Some("node-a"));

    // The node's idle report may still be in transit; the open channel
    // with nothing in flight counts as idle.
    let second = coordinator.submit("second").await.unwrap();
    assert_eq!(second.node_id, "node-a");
    assert_ne!(first.task_id, second.task_id);
    assert_eq!(sandbox.programs(), vec!["first", "second"]);
}

#[tokio::test]
async fn test_least_loaded_spreads_work() {
    let relay = TestRelay::start().await;
    let _a = TestNode::start(&relay, "node-a", echo()).await;
    let _b = TestNode::start(&relay, "node-b", echo()).await;
    let mut coordinator = coordinator(&relay, "coord-1", fast_options(SelectionStrategy::LeastLoaded)).await;

    let first = coordinator.submit("one").await.unwrap();
    assert_eq!(first.node_id, "node-a");
    completed(&relay, "node-a", 1).await;

    let second = coordinator.submit("two").await.unwrap();
    assert_eq!(second.node_id, "node-b");
    assert_eq!(coordinator.linked_node(), Some("node-b"));
}

#[tokio::test]
async fn test_round_robin_alternates() {
    let relay = TestRelay::start().await;
    let _a = TestNode::start(&relay, "node-a", echo()).await;
    let _b = TestNode::start(&relay, "node-b", echo()).await;
    let mut coordinator = coordinator(&relay, "coord-1", fast_options(SelectionStrategy::RoundRobin)).await;

    let mut picked = Vec::new();
    for i in 0..3 {
        let report = coordinator.submit(&format!("job {i}")).await.unwrap();
        completed(&relay, &report.node_id, if i == 2 { 2 } else { 1 }).await;
        picked.push(report.node_id);
    }
    assert_eq!(picked, vec!["node-a", "node-b", "node-a"]);
}

#[tokio::test]
async fn test_linked_node_refuses_second_coordinator() {
    let relay = TestRelay::start().await;
    let _node = TestNode::start(&relay, "node-a", echo()).await;

    let mut first = coordinator(&relay, "coord-1", fast_options(SelectionStrategy::Random)).await;
    first.submit("mine").await.unwrap();
    completed(&relay, "node-a", 1).await;

    let mut second = coordinator(&relay, "coord-2", fast_options(SelectionStrategy::Random)).await;
    match second.submit("theirs").await.unwrap_err() {
        Error::HandshakeFailed { peer, reason } => {
            assert_eq!(peer, "node-a");
            assert!(reason.contains("busy"), "reason was {reason}");
        }
        other => panic!("expected handshake failure, got {other:?}"),
    }
    assert_eq!(second.linked_node(), None);

    // The first channel is untouched.
    let report = first.submit("again").await.unwrap();
    assert_eq!(report.value, json!("again"));
}

#[tokio::test]
async fn test_list_nodes_reports_directory() {
    let relay = TestRelay::start().await;
    let _a = TestNode::start(&relay, "node-a", echo()).await;
    let _b = TestNode::start(&relay, "node-b", echo()).await;
    let coordinator = coordinator(&relay, "coord-1", fast_options(SelectionStrategy::Random)).await;

    let nodes = coordinator.list_nodes().await.unwrap();
    let ids: Vec<&str> = nodes.iter().map(|n| n.peer_id.as_str()).collect();
    assert_eq!(ids, vec!["node-a", "node-b"]);
    assert!(nodes.iter().all(|n| n.is_idle() && n.tasks_completed == 0));
}

// ─────────────────────────────────────────────────────────────────
// Connection failures
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_silent_node_is_handshake_timeout() {
    let relay = TestRelay::start().await;
    // Registered, listed as idle, but never answers an offer
    let _silent = register(&relay, "node-silent", "node").await;

    let mut options = fast_options(SelectionStrategy::Random);
    options.connect_timeout = Duration::from_millis(400);
    let mut coordinator = coordinator(&relay, "coord-1", options).await;

    let err = coordinator.submit("x").await.unwrap_err();
    assert!(
        matches!(err, Error::HandshakeTimeout { ref peer, timeout_ms: 400 } if peer == "node-silent"),
        "got {err:?}"
    );
    assert_eq!(coordinator.linked_node(), None);
    assert_eq!(coordinator.pending_count(), 0);
    assert_eq!(*coordinator.state(), CoordinatorState::Idle);
}

/// Disconnects the selected node right before the offer goes out
struct VanishingTarget {
    inner: Arc<dyn Transport>,
    node: Mutex<Option<Ws>>,
    registry: Arc<PeerRegistry>,
}

#[async_trait]
impl Transport for VanishingTarget {
    fn name(&self) -> &'static str {
        "vanishing"
    }

    async fn open(&self, role: LinkRole, remote: &str) -> relaymesh::Result<(PeerLink, mpsc::Receiver<LinkEvent>)> {
        let node = self.node.lock().take();
        drop(node);
        tokio::time::timeout(STEP, async {
            while self.registry.get(remote).is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("node never left the directory");
        self.inner.open(role, remote).await
    }

    fn busy_signal(&self) -> Value {
        self.inner.busy_signal()
    }

    fn is_offer(&self, payload: &Value) -> bool {
        self.inner.is_offer(payload)
    }
}

#[tokio::test]
async fn test_node_gone_before_offer_is_routing_failure() {
    let relay = TestRelay::start().await;
    let node = register(&relay, "node-gone", "node").await;

    let vanishing = VanishingTarget {
        inner: transport(),
        node: Mutex::new(Some(node)),
        registry: Arc::clone(&relay.registry),
    };
    let mut coordinator = Coordinator::connect(
        client_config(&relay, "coord-1", PeerRole::Coordinator),
        fast_options(SelectionStrategy::Random),
        Arc::new(vanishing),
    )
    .await
    .unwrap();

    match coordinator.submit("x").await.unwrap_err() {
        Error::Routing { target, message } => {
            assert_eq!(target, "node-gone");
            assert_eq!(message, "target not found");
        }
        other => panic!("expected routing failure, got {other:?}"),
    }
    assert_eq!(coordinator.linked_node(), None);
    assert_eq!(coordinator.pending_count(), 0);
}

/// Slow on the first program only
#[derive(Default)]
struct SlowFirstRun {
    calls: AtomicUsize,
}

#[async_trait]
impl Sandbox for SlowFirstRun {
    fn name(&self) -> &'static str {
        "slow-first"
    }

    async fn execute(&self, program: &str) -> ExecutionOutcome {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(600)).await;
        }
        Ok(Value::String(program.to_string()))
    }
}

#[tokio::test]
async fn test_late_result_does_not_settle_next_task() {
    let relay = TestRelay::start().await;
    let _node = TestNode::start(&relay, "node-a", Arc::new(SlowFirstRun::default())).await;

    let mut options = fast_options(SelectionStrategy::Random);
    options.task_timeout = Duration::from_millis(300);
    let mut coordinator = coordinator(&relay, "coord-1", options).await;

    let err = coordinator.submit("first").await.unwrap_err();
    assert!(matches!(err, Error::TaskTimeout { timeout_ms: 300, .. }), "got {err:?}");

    // The late result arrives and the node goes idle again.
    completed(&relay, "node-a", 1).await;

    let report = coordinator.submit("second").await.unwrap();
    assert_eq!(report.value, json!("second"));
    assert_eq!(coordinator.pending_count(), 0);
    assert_eq!(coordinator.linked_node(), Some("node-a"));
}

#[tokio::test]
async fn test_stray_answer_does_not_tie_up_node() {
    let relay = TestRelay::start().await;
    let sandbox = echo();
    let _node = TestNode::start(&relay, "node-a", sandbox.clone()).await;

    let mut stray = register(&relay, "coord-stray", "coordinator").await;
    send_json(
        &mut stray,
        json!({"type": "signal", "target": "node-a", "signal": {"kind": "answer", "session": "x"}}),
    )
    .await;
    // No link was opened, so no busy refusal either.
    expect_silence(&mut stray).await;

    let mut coordinator = coordinator(&relay, "coord-1", fast_options(SelectionStrategy::Random)).await;
    let report = coordinator.submit("real work").await.unwrap();
    assert_eq!(report.node_id, "node-a");
    assert_eq!(sandbox.programs(), vec!["real work"]);
}
