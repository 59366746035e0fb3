//! Child-process sandbox
//!
//! The program is handed to a configured interpreter (`sh -c` by default) as
//! its last argument. The child is killed if it outlives the wall-clock bound
//! or floods its output.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, trace};

use crate::config::ExecutionSettings;
use crate::protocol::ExecutionFailure;

use super::{ExecutionOutcome, Sandbox};

/// Runs programs in a child process
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    interpreter: Vec<String>,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ProcessSandbox {
    pub fn new(settings: &ExecutionSettings) -> Self {
        Self {
            interpreter: settings.interpreter.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
            max_output_bytes: settings.max_output_bytes,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn execute(&self, program: &str) -> ExecutionOutcome {
        let Some((cmd, args)) = self.interpreter.split_first() else {
            return Err(ExecutionFailure::new("no interpreter configured"));
        };

        let mut child = Command::new(cmd)
            .args(args)
            .arg(program)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionFailure::new(format!("failed to start {}: {}", cmd, e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let max = self.max_output_bytes;

        let run = async {
            let ((out, out_truncated), (err, err_truncated)) =
                tokio::join!(read_capped(stdout, max), read_capped(stderr, max));
            if out_truncated || err_truncated {
                let _ = child.start_kill();
            }
            let status = child.wait().await;
            (out, out_truncated, err, status)
        };

        // Dropping `run` on timeout leaves the child to kill_on_drop
        let (stdout, truncated, stderr, status) = match tokio::time::timeout(self.timeout, run).await {
            Ok(finished) => finished,
            Err(_) => {
                return Err(ExecutionFailure::new(format!(
                    "execution timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        let status = status.map_err(|e| ExecutionFailure::new(format!("failed to wait for program: {}", e)))?;
        let stderr = String::from_utf8_lossy(&stderr).trim_end().to_string();

        if truncated {
            return Err(ExecutionFailure::new(format!("output exceeded {} bytes", max)));
        }

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let failure = ExecutionFailure::new(format!("program exited with status {}", code));
            return Err(if stderr.is_empty() { failure } else { failure.with_trace(stderr) });
        }

        if !stderr.is_empty() {
            debug!(stderr = %stderr, "Program wrote to stderr");
        }

        let value = parse_output(&stdout);
        trace!(value = %value, "Program finished");
        Ok(value)
    }
}

/// stdout as JSON when it parses, otherwise as a string; empty output is null
fn parse_output(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Read up to `max` bytes; the flag reports whether more was available
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, max: usize) -> (Vec<u8>, bool) {
    let Some(reader) = reader else {
        return (Vec::new(), false);
    };

    let mut buf = Vec::new();
    let mut limited = reader.take(max as u64 + 1);
    let _ = limited.read_to_end(&mut buf).await;

    let truncated = buf.len() > max;
    buf.truncate(max);
    (buf, truncated)
}
