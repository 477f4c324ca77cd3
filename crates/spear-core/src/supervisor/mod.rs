//! Interactive supervision of a single target process.
//!
//! [`ProcessSupervisor`] owns one child process's stdin/stdout lifecycle.
//! A dedicated background task continuously drains the child's merged
//! output so the OS pipe buffer never fills and stalls the child; the
//! controlling side consumes that output through bounded-time read
//! primitives ([`ProcessSupervisor::read_available`],
//! [`ProcessSupervisor::read_until`]).

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// Sub-timeout for each poll inside [`ProcessSupervisor::read_until`].
const READ_UNTIL_STEP: Duration = Duration::from_millis(200);

/// Idle pause between empty polls in [`ProcessSupervisor::read_until`].
const READ_UNTIL_IDLE: Duration = Duration::from_millis(50);

/// Errors surfaced by the supervisor. These are contract violations or
/// channel failures; they are never folded into attempt data.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// `start` was called while a supervised process is still alive.
    #[error("a supervised process is already running")]
    AlreadyRunning,

    /// A read/write primitive was called with no process started or with
    /// the child's input already closed.
    #[error("no supervised process is running")]
    NotRunning,

    /// The write to the child's input failed; the child has most likely
    /// exited.
    #[error("write to supervised process failed: {0}")]
    BrokenChannel(#[source] std::io::Error),

    /// The command slice handed to `start` was empty.
    #[error("supervised command is empty")]
    EmptyCommand,

    /// The child process could not be spawned.
    #[error("failed to spawn supervised command {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Tuning knobs for a supervisor instance.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Maximum retained transcript size in bytes. When exceeded, only the
    /// most recent suffix of this size is kept.
    pub transcript_cap: usize,
    /// Size of each chunk pulled off the child's output pipes.
    pub read_chunk: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            transcript_cap: 10_000,
            read_chunk: 1024,
        }
    }
}

/// Output accumulated from a supervised process, capped to a fixed number
/// of bytes. The retained content is always a suffix of everything pushed
/// so far; the oldest data is dropped silently.
#[derive(Debug)]
struct Transcript {
    buf: String,
    cap: usize,
}

impl Transcript {
    fn new(cap: usize) -> Self {
        Self {
            buf: String::new(),
            cap,
        }
    }

    fn push(&mut self, chunk: &str) {
        self.buf.push_str(chunk);
        if self.buf.len() > self.cap {
            let mut cut = self.buf.len() - self.cap;
            // Stay on a UTF-8 boundary; trimming a byte or two extra is
            // preferable to splitting a code point.
            while cut < self.buf.len() && !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
    }

    fn contents(&self) -> &str {
        &self.buf
    }
}

/// Supervises exactly one child process at a time.
///
/// The controller is expected to issue at most one outstanding
/// send/read cycle against the child; `send`, `is_alive` and `terminate`
/// never block beyond `terminate`'s bounded grace wait.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    transcript: Arc<Mutex<Transcript>>,
    chunks: Option<UnboundedReceiver<String>>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let cap = config.transcript_cap;
        Self {
            config,
            child: None,
            stdin: None,
            transcript: Arc::new(Mutex::new(Transcript::new(cap))),
            chunks: None,
        }
    }

    /// Spawn `command` with piped stdin and merged stdout/stderr, and
    /// launch the background reader that drains its output for the
    /// lifetime of the process.
    ///
    /// Fails with [`SupervisorError::AlreadyRunning`] while a previously
    /// started process is still alive.
    pub fn start(
        &mut self,
        command: &[String],
        working_dir: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<(), SupervisorError> {
        if self.is_alive() {
            return Err(SupervisorError::AlreadyRunning);
        }

        let (program, args) = command.split_first().ok_or(SupervisorError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            command: program.clone(),
            source,
        })?;

        self.stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::unbounded_channel();
        let transcript = Arc::clone(&self.transcript);
        let chunk_size = self.config.read_chunk.max(1);
        // The reader runs detached; it exits on its own when both output
        // streams reach end-of-stream.
        tokio::spawn(async move {
            drain_output(stdout, stderr, transcript, tx, chunk_size).await;
        });
        self.chunks = Some(rx);
        self.child = Some(child);

        debug!(program = %program, "supervised process started");
        Ok(())
    }

    /// Write `text` (plus a trailing newline when requested) to the
    /// child's input and flush it.
    pub async fn send(&mut self, text: &str, append_newline: bool) -> Result<(), SupervisorError> {
        let stdin = self.stdin.as_mut().ok_or(SupervisorError::NotRunning)?;

        stdin
            .write_all(text.as_bytes())
            .await
            .map_err(SupervisorError::BrokenChannel)?;
        if append_newline {
            stdin
                .write_all(b"\n")
                .await
                .map_err(SupervisorError::BrokenChannel)?;
        }
        stdin.flush().await.map_err(SupervisorError::BrokenChannel)?;
        Ok(())
    }

    /// Drain everything currently queued from the background reader.
    ///
    /// Blocks up to `timeout` for the first chunk only, then drains any
    /// further chunks without blocking. Returns the concatenation, or an
    /// empty string when nothing arrived in time. Never blocks longer
    /// than `timeout`.
    pub async fn read_available(&mut self, timeout: Duration) -> String {
        let Some(rx) = self.chunks.as_mut() else {
            return String::new();
        };

        let mut out = String::new();
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(first)) => {
                out.push_str(&first);
                while let Ok(chunk) = rx.try_recv() {
                    out.push_str(&chunk);
                }
            }
            // Channel closed (reader finished) or nothing within timeout.
            Ok(None) | Err(_) => {}
        }
        out
    }

    /// Accumulate output until it contains `marker` or `timeout` elapses.
    ///
    /// Returns the accumulated buffer in either case; callers must check
    /// for the marker themselves.
    pub async fn read_until(&mut self, marker: &str, timeout: Duration) -> String {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = String::new();

        loop {
            if buf.contains(marker) {
                return buf;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return buf;
            }
            let step = READ_UNTIL_STEP.min(deadline - now);
            let chunk = self.read_available(step).await;
            if chunk.is_empty() {
                // The reader may have already closed the channel; pause so
                // the wait is bounded by the deadline, not a busy loop.
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                tokio::time::sleep(READ_UNTIL_IDLE.min(remaining)).await;
            } else {
                buf.push_str(&chunk);
            }
        }
    }

    /// The capped transcript of everything the child has emitted so far.
    pub fn transcript(&self) -> String {
        self.transcript
            .lock()
            .map(|t| t.contents().to_owned())
            .unwrap_or_default()
    }

    /// Non-blocking liveness probe.
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Request graceful termination, escalating to a hard kill after
    /// `grace`. Idempotent: safe to call from cleanup paths whether or
    /// not a process is running, and always leaves the supervisor
    /// not-alive.
    pub async fn terminate(&mut self, grace: Duration) {
        // Close the child's input so line-readers see end-of-input.
        self.stdin = None;

        let Some(mut child) = self.child.take() else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid refers to a child this supervisor spawned.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                debug!(pid, "SIGTERM failed, falling through to SIGKILL");
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(?status, "supervised process exited");
            }
            _ => {
                debug!("supervised process did not exit within the grace period, killing");
                let _ = child.kill().await;
            }
        }
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

/// Background reader: pulls fixed-size chunks off the child's stdout and
/// stderr until both reach end-of-stream, appending each chunk to the
/// capped transcript and forwarding it onto the delivery queue.
async fn drain_output<O, E>(
    stdout: Option<O>,
    stderr: Option<E>,
    transcript: Arc<Mutex<Transcript>>,
    tx: UnboundedSender<String>,
    chunk_size: usize,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out = stdout;
    let mut err = stderr;
    let mut out_buf = vec![0u8; chunk_size];
    let mut err_buf = vec![0u8; chunk_size];

    while out.is_some() || err.is_some() {
        tokio::select! {
            read = next_chunk(&mut out, &mut out_buf) => {
                match read {
                    Some(n) => deliver(&transcript, &tx, &out_buf[..n]),
                    None => out = None,
                }
            }
            read = next_chunk(&mut err, &mut err_buf) => {
                match read {
                    Some(n) => deliver(&transcript, &tx, &err_buf[..n]),
                    None => err = None,
                }
            }
        }
    }

    debug!("supervised output streams closed");
    // Dropping `tx` closes the delivery queue, which `read_available`
    // observes as end-of-stream.
}

/// Read one chunk from `pipe`. Returns `None` at end-of-stream or on a
/// read error (either way the pipe is finished). A pipe that is already
/// finished pends forever so the other arm of the select keeps draining.
async fn next_chunk<R: AsyncRead + Unpin>(pipe: &mut Option<R>, buf: &mut [u8]) -> Option<usize> {
    let Some(reader) = pipe.as_mut() else {
        return std::future::pending().await;
    };
    match reader.read(buf).await {
        Ok(0) => None,
        Ok(n) => Some(n),
        Err(e) => {
            warn!(error = %e, "read from supervised process failed");
            None
        }
    }
}

fn deliver(transcript: &Arc<Mutex<Transcript>>, tx: &UnboundedSender<String>, bytes: &[u8]) {
    let chunk = String::from_utf8_lossy(bytes).into_owned();
    if let Ok(mut t) = transcript.lock() {
        t.push(&chunk);
    }
    // The receiver may be gone if the supervisor was dropped; the reader
    // still drains the pipes so the child is never stalled.
    let _ = tx.send(chunk);
}
