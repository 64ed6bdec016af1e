//! Worker subprocess lifecycle.
//!
//! Flow:
//! 1. Spawn the worker with piped stdin/stdout/stderr
//! 2. Hand stdin to a [`ChannelWriter`], stdout to the engine's reader task
//! 3. Forward stderr lines into tracing
//! 4. Supervise the child until it exits or shutdown is requested

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::SinkExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::bytes::Bytes;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::FrameCodec;

/// Why the channel stopped being usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The worker exited with a status code.
    Exited { code: i32 },
    /// The worker was terminated by a signal.
    Signaled { signal: i32 },
    /// The worker closed its output stream.
    ChannelClosed,
    /// The worker stopped reading its input mid-frame.
    InputStalled,
    /// The engine was closed by its owner.
    Closed,
    /// Waiting on the child failed; its fate is unknown.
    WaitFailed(String),
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "worker exited with code {code}"),
            Self::Signaled { signal } => write!(f, "worker killed by signal {signal}"),
            Self::ChannelClosed => f.write_str("worker closed its output stream"),
            Self::InputStalled => f.write_str("worker stopped reading its input"),
            Self::Closed => f.write_str("engine closed"),
            Self::WaitFailed(e) => write!(f, "failed to wait for worker: {e}"),
        }
    }
}

impl From<ExitStatus> for ExitReason {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited { code };
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled { signal };
            }
        }
        Self::WaitFailed(format!("unrecognised exit status: {status}"))
    }
}

/// How to launch the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("worker executable not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("permission denied launching worker: {}", .0.display())]
    PermissionDenied(PathBuf),
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("worker {0} was not captured")]
    MissingPipe(&'static str),
    #[error("spawn failed: {0}")]
    Other(String),
}

impl SpawnError {
    fn from_io(executable: &Path, error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => Self::NotFound(executable.to_path_buf()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(executable.to_path_buf()),
            _ => Self::Spawn(error),
        }
    }
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError>;
}

/// Plain subprocess with all three stdio streams piped.
pub struct ProcessSpawner;

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError> {
        let mut cmd = Command::new(&command.executable);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }
        cmd.spawn()
            .map_err(|e| SpawnError::from_io(&command.executable, e))
    }
}

/// A started worker with its pipes taken.
pub struct SpawnedWorker {
    pub child: Child,
    pub pid: Option<u32>,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
}

pub fn spawn_worker(
    spawner: &dyn WorkerSpawner,
    command: &WorkerCommand,
) -> Result<SpawnedWorker, SpawnError> {
    tracing::info!(executable = %command.executable.display(), args = ?command.args, "Spawning worker subprocess");
    let mut child = spawner.spawn(command)?;

    let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or(SpawnError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take();
    let pid = child.id();

    tracing::debug!(?pid, "Worker started");
    Ok(SpawnedWorker {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("channel is closed")]
    Closed,
    #[error("failed to write frame: {0}")]
    Io(#[from] io::Error),
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type WriterSlot = Option<FramedWrite<BoxedWriter, FrameCodec>>;

/// Serialised writer for the worker's input stream.
///
/// A send that fails or does not run to completion leaves the stream in an
/// unknown state, so the writer is discarded and every later send fails
/// with `Closed`.
pub struct ChannelWriter {
    inner: Mutex<WriterSlot>,
    closing: CancellationToken,
}

/// Discards the writer unless the send it guards completes cleanly.
struct InFlightSend<'a> {
    slot: MutexGuard<'a, WriterSlot>,
    closing: &'a CancellationToken,
    completed: bool,
}

impl Drop for InFlightSend<'_> {
    fn drop(&mut self) {
        if !self.completed && self.slot.take().is_some() {
            tracing::debug!("Frame write did not complete, discarding channel writer");
            self.closing.cancel();
        }
    }
}

impl ChannelWriter {
    /// `closing` is cancelled once the writer is discarded; cancelling it
    /// from outside interrupts any send in progress.
    pub fn new<W>(writer: W, closing: CancellationToken) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: BoxedWriter = Box::new(writer);
        Self {
            inner: Mutex::new(Some(FramedWrite::new(boxed, FrameCodec::new()))),
            closing,
        }
    }

    /// Write one whole frame and flush it.
    pub async fn send(&self, frame: Bytes) -> Result<(), WriteError> {
        let slot = tokio::select! {
            biased;
            _ = self.closing.cancelled() => return Err(WriteError::Closed),
            slot = self.inner.lock() => slot,
        };
        let mut send = InFlightSend {
            slot,
            closing: &self.closing,
            completed: false,
        };
        let writer = send.slot.as_mut().ok_or(WriteError::Closed)?;

        let result = tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(WriteError::Closed),
            written = writer.send(frame) => written.map_err(WriteError::Io),
        };
        match &result {
            Ok(()) => send.completed = true,
            Err(e) => tracing::warn!(error = %e, "Write to worker failed"),
        }
        result
    }

    /// Interrupt any send in progress and drop the underlying stream.
    /// Safe to call more than once.
    pub async fn close(&self) {
        self.closing.cancel();
        let Some(mut writer) = self.inner.lock().await.take() else {
            return;
        };
        if let Err(e) = writer.close().await {
            tracing::debug!(error = %e, "Error closing worker input");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }
}

/// Forward each stderr line from the worker into tracing.
pub fn forward_stderr<R>(stderr: R, pid: Option<u32>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::info!(target: "snakelet::worker", ?pid, "{}", line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(target: "snakelet::worker", ?pid, error = %e, "Stopped reading worker stderr");
                    break;
                }
            }
        }
    })
}

/// Own the child until it exits.
///
/// Returns as soon as the child exits on its own. Once `shutdown` fires, the
/// child gets `grace` to exit after its input closed, then SIGTERM and another
/// `grace`, then a hard kill.
pub async fn supervise(
    mut child: Child,
    shutdown: CancellationToken,
    grace: Duration,
) -> ExitReason {
    let pid = child.id();

    tokio::select! {
        status = child.wait() => {
            let reason = wait_result(status);
            tracing::info!(?pid, %reason, "Worker exited");
            return reason;
        }
        _ = shutdown.cancelled() => {
            tracing::debug!(?pid, "Shutdown requested, waiting for worker to exit");
        }
    }

    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return wait_result(status);
    }

    #[cfg(unix)]
    {
        if let Some(raw) = pid {
            terminate(raw);
            if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                return wait_result(status);
            }
        }
    }

    tracing::warn!(?pid, "Worker did not exit in time, killing");
    if let Err(e) = child.kill().await {
        tracing::error!(?pid, error = %e, "Failed to kill worker");
        return ExitReason::WaitFailed(e.to_string());
    }
    wait_result(child.wait().await)
}

fn wait_result(status: io::Result<ExitStatus>) -> ExitReason {
    match status {
        Ok(status) => ExitReason::from(status),
        Err(e) => ExitReason::WaitFailed(e.to_string()),
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    tracing::debug!(pid, "Sending SIGTERM to worker");
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "SIGTERM failed");
    }
}
