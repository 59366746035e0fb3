//! Node agent
//!
//! Registers as a worker, accepts one direct channel at a time and runs the
//! programs that arrive on it through the sandbox.

mod agent;
mod runner;
mod state;

pub use agent::{NodeAgent, BUSY_MESSAGE};
pub use runner::{FinishedTask, TaskRunner};
pub use state::{NodeState, NodeStats};
