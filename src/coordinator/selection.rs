//! Node selection strategies
//!
//! Selection is a pure function of the latest snapshot plus, for
//! round-robin, a cursor the selector keeps across calls.

use std::fmt;
use std::str::FromStr;

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::protocol::NodeSummary;

/// How the coordinator picks among idle nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Uniform choice among idle nodes
    #[default]
    Random,
    /// Fewest completed tasks; first in snapshot order on ties
    LeastLoaded,
    /// Rotate through idle nodes across calls
    RoundRobin,
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SelectionStrategy::Random => "random",
            SelectionStrategy::LeastLoaded => "least-loaded",
            SelectionStrategy::RoundRobin => "round-robin",
        };
        f.write_str(name)
    }
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "random" => Ok(SelectionStrategy::Random),
            "least-loaded" => Ok(SelectionStrategy::LeastLoaded),
            "round-robin" => Ok(SelectionStrategy::RoundRobin),
            other => Err(format!("unknown selection strategy '{}'", other)),
        }
    }
}

/// Stateful selector; owns the round-robin cursor
#[derive(Debug, Clone)]
pub struct NodeSelector {
    strategy: SelectionStrategy,
    cursor: usize,
}

impl NodeSelector {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self { strategy, cursor: 0 }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Pick one idle node from `snapshot`, or `None` when nothing is idle
    pub fn select(&mut self, snapshot: &[NodeSummary]) -> Option<NodeSummary> {
        let idle: Vec<&NodeSummary> = snapshot.iter().filter(|node| node.is_idle()).collect();
        if idle.is_empty() {
            return None;
        }

        let picked = match self.strategy {
            SelectionStrategy::Random => idle.choose(&mut rand::rng()).copied(),
            // min_by_key keeps the first of equal minima
            SelectionStrategy::LeastLoaded => idle.iter().copied().min_by_key(|node| node.tasks_completed),
            SelectionStrategy::RoundRobin => {
                let node = idle[self.cursor % idle.len()];
                self.cursor = self.cursor.wrapping_add(1);
                Some(node)
            }
        };

        picked.cloned()
    }
}
