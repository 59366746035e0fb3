//! Local cache of the relay's worker directory
//!
//! The relay pump writes every `nodes_list` it receives here; the dispatch
//! cycle reads the newest snapshot and can wait briefly for a fresher one.

use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::protocol::NodeSummary;

/// A directory snapshot together with its generation counter
#[derive(Debug, Clone, Default)]
pub struct DirectorySnapshot {
    pub nodes: Vec<NodeSummary>,
    /// Incremented on every update; 0 means nothing received yet
    pub generation: u64,
    pub received_at: Option<Instant>,
}

impl DirectorySnapshot {
    pub fn idle_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_idle()).count()
    }
}

/// Latest-value cache shared between the relay pump and the dispatcher
#[derive(Debug)]
pub struct DirectoryCache {
    tx: watch::Sender<DirectorySnapshot>,
}

impl DirectoryCache {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(DirectorySnapshot::default());
        Self { tx }
    }

    /// Replace the cached snapshot
    pub fn update(&self, nodes: Vec<NodeSummary>) {
        self.tx.send_modify(|snapshot| {
            snapshot.nodes = nodes;
            snapshot.generation += 1;
            snapshot.received_at = Some(Instant::now());
        });
    }

    pub fn latest(&self) -> DirectorySnapshot {
        self.tx.borrow().clone()
    }

    pub fn generation(&self) -> u64 {
        self.tx.borrow().generation
    }

    /// Wait until a snapshot newer than `generation` arrives, or `timeout`
    /// elapses. Returns whatever is cached at that point.
    pub async fn wait_newer_than(&self, generation: u64, timeout: Duration) -> DirectorySnapshot {
        let mut rx = self.tx.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|s| s.generation > generation)).await;
        self.latest()
    }
}

impl Default for DirectoryCache {
    fn default() -> Self {
        Self::new()
    }
}
