//! Isolated execution of one program
//!
//! The sandbox call runs on its own task so a panic or a hang inside it
//! cannot reach the agent's event loop. The runner bounds it with a timeout
//! and turns every way it can end into an `ExecutionOutcome`.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::protocol::ExecutionFailure;
use crate::sandbox::{ExecutionOutcome, Sandbox};

/// Grace on top of the sandbox's own bound, so its message wins when both fire
const RUNNER_GRACE: Duration = Duration::from_secs(1);

/// A finished run, reported back to the agent loop
#[derive(Debug)]
pub struct FinishedTask {
    pub task_id: String,
    /// Which direct channel the request came in on
    pub link_generation: u64,
    pub outcome: ExecutionOutcome,
    pub elapsed: Duration,
}

#[derive(Clone)]
pub struct TaskRunner {
    sandbox: Arc<dyn Sandbox>,
    timeout: Duration,
}

impl TaskRunner {
    pub fn new(sandbox: Arc<dyn Sandbox>, timeout: Duration) -> Self {
        Self { sandbox, timeout }
    }

    pub fn sandbox_name(&self) -> &'static str {
        self.sandbox.name()
    }

    /// Run `program` in the background and report to `done` when finished
    pub fn spawn(
        &self,
        task_id: String,
        program: String,
        link_generation: u64,
        done: mpsc::Sender<FinishedTask>,
    ) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = runner.run(&program).await;
            let finished = FinishedTask {
                task_id,
                link_generation,
                outcome,
                elapsed: started.elapsed(),
            };
            if done.send(finished).await.is_err() {
                debug!("Agent stopped before the result was collected");
            }
        })
    }

    /// Run `program` to completion, containing panics and bounding time
    pub async fn run(&self, program: &str) -> ExecutionOutcome {
        let sandbox = Arc::clone(&self.sandbox);
        let program = program.to_string();
        let mut handle = tokio::spawn(async move { sandbox.execute(&program).await });

        let bound = self.timeout + RUNNER_GRACE;
        match timeout(bound, &mut handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) if join_error.is_panic() => {
                let detail = panic_message(join_error.into_panic());
                warn!(detail = %detail, "Sandbox panicked");
                Err(ExecutionFailure::new("execution panicked").with_trace(detail))
            }
            Ok(Err(_)) => Err(ExecutionFailure::new("execution cancelled")),
            Err(_) => {
                handle.abort();
                warn!(timeout_secs = self.timeout.as_secs(), "Sandbox exceeded its time bound");
                Err(ExecutionFailure::new(format!(
                    "execution timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::sandbox::{MockBehavior, MockSandbox};

    fn runner(sandbox: MockSandbox, timeout: Duration) -> TaskRunner {
        TaskRunner::new(Arc::new(sandbox), timeout)
    }

    #[tokio::test]
    async fn test_run_returns_value() {
        let runner = runner(MockSandbox::new(MockBehavior::Value(json!(4))), Duration::from_secs(5));
        assert_eq!(runner.run("2 + 2").await.unwrap(), json!(4));
        assert_eq!(runner.sandbox_name(), "mock");
    }

    #[tokio::test]
    async fn test_run_carries_failure() {
        let failure = ExecutionFailure::new("boom").with_trace("at line 1");
        let runner = runner(MockSandbox::new(MockBehavior::Fail(failure.clone())), Duration::from_secs(5));
        assert_eq!(runner.run("x").await.unwrap_err(), failure);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let runner = runner(MockSandbox::new(MockBehavior::Panic), Duration::from_secs(5));
        let failure = runner.run("x").await.unwrap_err();
        assert_eq!(failure.message, "execution panicked");
        assert!(failure.trace.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_is_bounded() {
        let sandbox = MockSandbox::echo().with_delay(Duration::from_secs(3600));
        let runner = runner(sandbox, Duration::from_secs(2));
        let failure = runner.run("forever").await.unwrap_err();
        assert_eq!(failure.message, "execution timed out after 2s");
    }

    #[tokio::test]
    async fn test_spawn_reports_to_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        let runner = runner(MockSandbox::echo(), Duration::from_secs(5));
        runner.spawn("t1".into(), "hello".into(), 7, tx);

        let finished = rx.recv().await.unwrap();
        assert_eq!(finished.task_id, "t1");
        assert_eq!(finished.link_generation, 7);
        assert_eq!(finished.outcome.unwrap(), json!("hello"));
    }
}
