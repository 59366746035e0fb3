//! Mock sandbox for tests and demos
//!
//! Deterministic: returns a fixed value, a fixed failure, or echoes the
//! program back, after an optional delay. Records every program it ran.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::protocol::ExecutionFailure;

use super::{ExecutionOutcome, Sandbox};

/// What the mock does with a program
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Return the program text as a JSON string
    Echo,
    /// Always return this value
    Value(Value),
    /// Always fail with this failure
    Fail(ExecutionFailure),
    /// Panic inside execute
    Panic,
}

/// Mock implementation of `Sandbox`
#[derive(Debug)]
pub struct MockSandbox {
    behavior: MockBehavior,
    delay: Duration,
    programs: RwLock<Vec<String>>,
}

impl MockSandbox {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
            programs: RwLock::new(Vec::new()),
        }
    }

    /// Echo sandbox
    pub fn echo() -> Self {
        Self::new(MockBehavior::Echo)
    }

    /// Simulated run time per program
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of programs executed (including ones still running)
    pub fn call_count(&self) -> usize {
        self.programs.read().len()
    }

    /// Programs executed, in order
    pub fn programs(&self) -> Vec<String> {
        self.programs.read().clone()
    }
}

impl Default for MockSandbox {
    fn default() -> Self {
        Self::echo()
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn execute(&self, program: &str) -> ExecutionOutcome {
        self.programs.write().push(program.to_string());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.behavior {
            MockBehavior::Echo => Ok(Value::String(program.to_string())),
            MockBehavior::Value(value) => Ok(value.clone()),
            MockBehavior::Fail(failure) => Err(failure.clone()),
            MockBehavior::Panic => panic!("mock sandbox panicked on purpose"),
        }
    }
}
