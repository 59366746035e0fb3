//! Execution collaborator
//!
//! Runs one opaque program and yields a JSON value or a structured failure.
//! Implementations own their isolation; the node only bounds and contains
//! the call (see `node::runner`).

mod mock;
mod process;

use async_trait::async_trait;
use serde_json::Value;

use crate::protocol::ExecutionFailure;

pub use mock::{MockBehavior, MockSandbox};
pub use process::ProcessSandbox;

/// Outcome of one program run
pub type ExecutionOutcome = std::result::Result<Value, ExecutionFailure>;

/// Something that can run a program
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Run `program` to completion
    async fn execute(&self, program: &str) -> ExecutionOutcome;
}
