//! One-attempt execution of the instrumented target.
//!
//! [`ExecutionHarness`] isolates the retry loop from process and timeout
//! mechanics: it runs a single payload against the target (one-shot, or
//! through a long-lived [`ProcessSupervisor`]) and folds the outcome into
//! an [`ExecutionRecord`]. Execution-level failures (timeout, spawn
//! failure) are represented as data in the record, never raised.

pub mod coverage;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::supervisor::ProcessSupervisor;

/// Immutable result of one harness invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Exit code of the target, or `None` when it was killed or never ran.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error. Non-empty stderr marks the attempt failed.
    pub stderr: String,
    /// Per-run coverage, when the target reported it.
    pub coverage_percent: Option<f64>,
    /// Maximum coverage, when the target reported it.
    pub coverage_max: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionRecord {
    /// A record for an invocation that produced no output, carrying only
    /// a diagnostic on stderr.
    fn failure(stderr: String) -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr,
            coverage_percent: None,
            coverage_max: None,
            timestamp: Utc::now(),
        }
    }
}

/// Configuration for the harness. All values are explicit; the harness
/// never reads ambient environment state.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Base invocation for the instrumented target runner.
    pub command: Vec<String>,
    /// Working directory for the target, when it must not inherit ours.
    pub working_dir: Option<PathBuf>,
    /// Hard wall-clock limit for a single execution.
    pub timeout: Duration,
}

impl HarnessConfig {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            working_dir: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Runs exactly one attempt's payload against the target.
#[derive(Debug, Clone)]
pub struct ExecutionHarness {
    config: HarnessConfig,
}

impl ExecutionHarness {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run the target once: spawn the base command (plus a `--file`
    /// reference when a target file is given), feed `payload` on stdin,
    /// capture stdout/stderr, and enforce the configured wall-clock
    /// timeout.
    ///
    /// On timeout the child is killed and the record states the timeout
    /// on stderr with no coverage. On spawn failure the record carries a
    /// diagnostic on stderr. This method never returns an error.
    pub async fn execute(&self, payload: &str, target_file: Option<&Path>) -> ExecutionRecord {
        let mut argv = self.config.command.clone();
        if let Some(target) = target_file {
            argv.push("--file".to_string());
            argv.push(target.display().to_string());
        }

        let Some((program, args)) = argv.split_first() else {
            return ExecutionRecord::failure("execution command is empty".to_string());
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionRecord::failure(format!(
                    "failed to spawn target command {program:?}: {e}"
                ));
            }
        };

        let mut stdin_pipe = child.stdin.take();
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        // Feed the payload and close stdin so the target sees end-of-input.
        let write_stdin = async {
            if let Some(ref mut pipe) = stdin_pipe {
                let _ = pipe.write_all(payload.as_bytes()).await;
                let _ = pipe.shutdown().await;
            }
            drop(stdin_pipe.take());
        };

        // Read stdout/stderr concurrently with waiting for the process.
        // This avoids deadlocks if the child fills the pipe buffer.
        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        match tokio::time::timeout(self.config.timeout, async {
            let (wait_result, _, stdout, stderr) =
                tokio::join!(child.wait(), write_stdin, read_stdout, read_stderr);
            (wait_result, stdout, stderr)
        })
        .await
        {
            Ok((Ok(status), stdout, stderr)) => {
                let (coverage_percent, coverage_max) = coverage::extract_coverage(&stdout);
                debug!(
                    exit_code = ?status.code(),
                    coverage = ?coverage_percent,
                    "target execution completed"
                );
                ExecutionRecord {
                    exit_code: status.code(),
                    stdout,
                    stderr,
                    coverage_percent,
                    coverage_max,
                    timestamp: Utc::now(),
                }
            }
            Ok((Err(e), _, _)) => {
                ExecutionRecord::failure(format!("failed to wait on target process: {e}"))
            }
            Err(_) => {
                let _ = child.kill().await;
                ExecutionRecord::failure(format!(
                    "target execution timed out after {}s",
                    self.config.timeout.as_secs()
                ))
            }
        }
    }

    /// Run one attempt through a long-lived supervised target: deliver the
    /// payload line on the child's input and accumulate output until the
    /// per-run coverage report ([`coverage::RUN_REPORT_MARKER`]) appears
    /// or the configured timeout elapses.
    ///
    /// The supervised stream is merged, so everything lands in `stdout`;
    /// `stderr` carries a diagnostic only when the payload could not be
    /// delivered or the run produced no coverage report in time.
    pub async fn execute_supervised(
        &self,
        supervisor: &mut ProcessSupervisor,
        payload: &str,
    ) -> ExecutionRecord {
        if let Err(e) = supervisor.send(payload, true).await {
            return ExecutionRecord::failure(format!("failed to deliver payload: {e}"));
        }

        let output = supervisor
            .read_until(coverage::RUN_REPORT_MARKER, self.config.timeout)
            .await;
        let (coverage_percent, coverage_max) = coverage::extract_coverage(&output);

        let stderr = if output.contains(coverage::RUN_REPORT_MARKER) {
            String::new()
        } else {
            format!(
                "supervised target produced no coverage report within {}s",
                self.config.timeout.as_secs()
            )
        };

        ExecutionRecord {
            exit_code: None,
            stdout: output,
            stderr,
            coverage_percent,
            coverage_max,
            timestamp: Utc::now(),
        }
    }
}
