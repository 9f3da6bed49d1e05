//! Worker process management
//!
//! Spawns the worker subprocess with piped stdio, runs one reader task per
//! output stream, and writes envelopes to its stdin. Decoded stdout lines are
//! handed to a [`WorkerListener`]; stderr is drained into the log.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::codec::LineCodec;
use crate::error::SendError;
use crate::{Error, Result};

/// Receives what the worker writes on stdout.
///
/// Both methods are called from the stdout reader task, concurrently with
/// whatever the host is doing; implementations must not block for long.
pub trait WorkerListener: Send + Sync {
    /// One complete, non-empty line from the worker's stdout
    fn on_line(&self, line: &str);

    /// The worker's stdout closed without `stop` being called. Called at most
    /// once per started worker.
    fn on_exit(&self, reason: &str);
}

/// How to launch the worker
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Executable to run
    pub program: PathBuf,

    /// Arguments, including the script path when there is one
    pub args: Vec<String>,

    /// Working directory for the child
    pub working_dir: Option<PathBuf>,
}

/// Snapshot of the worker's state
#[derive(Debug, Clone, Copy)]
pub struct WorkerStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub uptime: Option<Duration>,
}

struct RunningWorker {
    child: Child,
    pid: Option<u32>,
    started_at: Instant,
    cancel: CancellationToken,
    output_task: JoinHandle<()>,
    error_task: JoinHandle<()>,
}

/// Owns the worker subprocess and its pipes
pub struct WorkerProcess {
    /// Child handle and reader tasks
    process: Mutex<Option<RunningWorker>>,

    /// Kept apart from `process` so a write stuck on a full pipe does not
    /// block `stop`
    stdin: Mutex<Option<ChildStdin>>,

    /// Cleared by the stdout reader when the stream closes
    alive: Arc<AtomicBool>,
}

impl Default for WorkerProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerProcess {
    pub fn new() -> Self {
        Self {
            process: Mutex::new(None),
            stdin: Mutex::new(None),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the worker. Does nothing if it is already running.
    pub async fn start(&self, spec: &LaunchSpec, listener: Arc<dyn WorkerListener>) -> Result<()> {
        let mut process = self.process.lock().await;

        if process.is_some() && self.is_running() {
            tracing::debug!("Worker already running");
            return Ok(());
        }

        // A worker that exited on its own still holds its tasks and handle
        if let Some(stale) = process.take() {
            Self::shutdown(stale).await;
            self.stdin.lock().await.take();
        }

        tracing::info!("Spawning worker: {:?} {:?}", spec.program, spec.args);

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        // std opens the parent's pipe ends close-on-exec (non-inheritable on
        // Windows), so later children never hold them.
        let mut child = command
            .spawn()
            .map_err(|e| Error::Start(format!("{}: {}", spec.program.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Start("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Start("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Start("Failed to capture stderr".to_string()))?;

        let pid = child.id();
        let cancel = CancellationToken::new();
        self.alive.store(true, Ordering::SeqCst);

        let output_task = tokio::spawn(run_output_reader(
            stdout,
            listener,
            self.alive.clone(),
            cancel.clone(),
        ));
        let error_task = tokio::spawn(run_error_reader(stderr, cancel.clone()));

        *self.stdin.lock().await = Some(stdin);
        *process = Some(RunningWorker {
            child,
            pid,
            started_at: Instant::now(),
            cancel,
            output_task,
            error_task,
        });

        tracing::info!("Worker started (pid {:?})", pid);
        Ok(())
    }

    /// Kill the worker and wait for both reader tasks to finish.
    ///
    /// No listener callback runs after this returns. Safe to call when the
    /// worker was never started or is already stopped.
    pub async fn stop(&self) {
        let mut process = self.process.lock().await;
        self.alive.store(false, Ordering::SeqCst);

        let Some(running) = process.take() else {
            return;
        };

        Self::shutdown(running).await;
        self.stdin.lock().await.take();
        tracing::info!("Worker stopped");
    }

    async fn shutdown(mut running: RunningWorker) {
        // Cancel first so the reader sees the token before the EOF that the
        // kill produces.
        running.cancel.cancel();

        if let Err(e) = running.child.start_kill() {
            tracing::debug!("Worker already exited: {}", e);
        }
        match running.child.wait().await {
            Ok(status) => tracing::info!("Worker exited with status: {:?}", status),
            Err(e) => tracing::warn!("Failed to reap worker: {}", e),
        }

        if let Err(e) = running.output_task.await {
            tracing::warn!("Worker stdout reader panicked: {}", e);
        }
        if let Err(e) = running.error_task.await {
            tracing::warn!("Worker stderr reader panicked: {}", e);
        }
    }

    /// Write one envelope line to the worker's stdin.
    pub async fn send(&self, line: &str) -> std::result::Result<(), SendError> {
        if !self.is_running() {
            return Err(SendError::NotRunning);
        }

        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or(SendError::NotRunning)?;

        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');

        stdin
            .write_all(&bytes)
            .await
            .map_err(SendError::WriteFailed)?;
        stdin.flush().await.map_err(SendError::WriteFailed)?;

        tracing::trace!("Sent to worker: {}", line);
        Ok(())
    }

    /// Check if the worker's stdout is still open
    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> WorkerStatus {
        let process = self.process.lock().await;
        WorkerStatus {
            running: self.is_running(),
            pid: process.as_ref().and_then(|p| p.pid),
            uptime: process.as_ref().map(|p| p.started_at.elapsed()),
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // Can't await here; kill_on_drop(true) takes care of the child once
        // the handle goes, and the readers end on the token.
        if let Some(running) = self.process.get_mut().as_ref() {
            running.cancel.cancel();
        }
    }
}

/// Read newline-delimited output and hand each line to `listener`.
///
/// Ends on cancellation (silently) or when the stream closes, in which case
/// the worker is marked dead and `on_exit` is called.
pub(crate) async fn run_output_reader<R>(
    stdout: R,
    listener: Arc<dyn WorkerListener>,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(stdout, LineCodec::new());

    let reason = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                tracing::debug!("Worker stdout reader cancelled");
                return;
            }

            item = framed.next() => match item {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    listener.on_line(&line);
                }
                Some(Err(e)) => {
                    tracing::error!("Error reading from worker stdout: {}", e);
                    break format!("stdout read error: {}", e);
                }
                None => {
                    tracing::info!("Worker stdout closed (EOF)");
                    break "worker stdout closed".to_string();
                }
            }
        }
    };

    alive.store(false, Ordering::SeqCst);
    listener.on_exit(&reason);
}

/// Drain the worker's stderr into the log, one line per record. Never
/// interpreted as protocol data.
pub(crate) async fn run_error_reader<R>(stderr: R, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(stderr, LineCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            item = framed.next() => match item {
                Some(Ok(line)) => {
                    let line = line.trim_end();
                    if !line.is_empty() {
                        tracing::warn!(target: "mcp_channel::worker::stderr", "{}", line);
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!("Error reading from worker stderr: {}", e);
                    break;
                }
                None => break,
            }
        }
    }
}
