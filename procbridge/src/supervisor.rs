//! Worker process supervisor - owns one subprocess at a time.
//!
//! Flow:
//! 1. Spawn the worker with piped stdio
//! 2. Read stdout until the alive token arrives (or fail and signal it)
//! 3. Hand stdout, stderr and the child to the event loop task
//! 4. Event loop decodes frames and resolves them through the correlator
//! 5. On exit: fail pending requests, publish the exit, clear the handle

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::SinkExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::FramedWrite;

use crate::config::BridgeConfig;
use crate::correlator::Correlator;
use crate::error::{BridgeError, SpawnError};
use crate::events::{BridgeEvent, EventSink};
use crate::wire::codec::find;
use crate::wire::{Envelope, FrameEncoder, FrameReader, PROCESS_ALIVE};

const READ_CHUNK: usize = 8 * 1024;

/// How long to keep reading stdout after the worker exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    /// Same as `NotStarted` for every operation; keeps the last exit around.
    Stopped { last_exit: Option<ExitInfo> },
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped { .. } => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StopSignal {
    Interrupt,
    Kill,
}

type StdinWriter = Arc<Mutex<FramedWrite<ChildStdin, FrameEncoder>>>;

/// Live worker. Exists from a successful handshake until exit is observed.
struct ChildHandle {
    generation: u64,
    pid: Option<u32>,
    writer: StdinWriter,
    signal_tx: mpsc::UnboundedSender<StopSignal>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    stopping: Arc<AtomicBool>,
}

impl ChildHandle {
    fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    fn signal(&self, signal: StopSignal) {
        if self.signal_tx.send(signal).is_err() {
            tracing::debug!(?signal, "Event loop already gone, signal not delivered");
        }
    }

    async fn wait_exit(&mut self) -> ExitInfo {
        match self.exit_rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or_else(ExitInfo::unknown),
            // Event loop dropped without publishing: treat as gone.
            Err(_) => ExitInfo::unknown(),
        }
    }
}

struct Shared {
    config: BridgeConfig,
    correlator: Arc<Correlator>,
    events: EventSink,
    state: watch::Sender<ProcessState>,
    /// At most one worker per supervisor. Held across start and stop so
    /// lifecycle transitions never interleave.
    child: Mutex<Option<ChildHandle>>,
    generation: AtomicU64,
}

/// Lifecycle owner for a single worker process.
#[derive(Clone)]
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    pub fn new(config: BridgeConfig, correlator: Arc<Correlator>) -> Self {
        let events = EventSink::new(config.event_capacity);
        let (state, _) = watch::channel(ProcessState::NotStarted);
        Self {
            shared: Arc::new(Shared {
                config,
                correlator,
                events,
                state,
                child: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ProcessState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.shared.events.subscribe()
    }

    pub async fn pid(&self) -> Option<u32> {
        let slot = self.shared.child.lock().await;
        slot.as_ref().filter(|h| !h.has_exited()).and_then(|h| h.pid)
    }

    /// Spawn the worker and wait for its handshake.
    ///
    /// Returns immediately when a worker is already running. Concurrent
    /// callers wait for an in-progress start instead of spawning twice.
    pub async fn start(&self) -> Result<(), BridgeError> {
        self.start_unless(|| false).await.map(|_| ())
    }

    /// Like [`start`](Self::start), but spawns nothing when `abandoned`
    /// returns true once the lifecycle lock is held. Returns whether a worker
    /// is running.
    pub(crate) async fn start_unless(
        &self,
        abandoned: impl Fn() -> bool,
    ) -> Result<bool, BridgeError> {
        let mut slot = self.shared.child.lock().await;
        if let Some(handle) = slot.as_ref() {
            if !handle.has_exited() {
                return Ok(true);
            }
            // Exited but its event loop hasn't cleaned up yet.
            let last_exit = *handle.exit_rx.borrow();
            *slot = None;
            self.shared
                .state
                .send_replace(ProcessState::Stopped { last_exit });
        }
        if abandoned() {
            tracing::debug!("Caller gave up while waiting for the lifecycle lock, not spawning");
            return Ok(false);
        }

        let previous = self.shared.state.send_replace(ProcessState::Starting);
        match self.launch().await {
            Ok(handle) => {
                tracing::info!(pid = ?handle.pid, generation = handle.generation, "Worker ready");
                *slot = Some(handle);
                self.shared.state.send_replace(ProcessState::Running);
                Ok(true)
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker failed to start");
                let restored = match previous {
                    ProcessState::Stopped { last_exit } => ProcessState::Stopped { last_exit },
                    _ => ProcessState::NotStarted,
                };
                self.shared.state.send_replace(restored);
                Err(e)
            }
        }
    }

    /// Write one framed envelope to the worker's stdin.
    ///
    /// Fails with `NotStarted` when no worker is running; nothing is queued.
    /// Blocks while the pipe is full.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), BridgeError> {
        let writer = {
            let slot = self.shared.child.lock().await;
            match slot.as_ref() {
                Some(handle) if !handle.has_exited() => Arc::clone(&handle.writer),
                _ => {
                    return Err(BridgeError::NotStarted {
                        id: envelope.id().clone(),
                    });
                }
            }
        };

        let mut writer = writer.lock().await;
        writer.send(envelope).await.map_err(|e| {
            let message = format!("failed to write message {}: {}", envelope.id(), e);
            self.shared.events.emit(BridgeEvent::ProcessError {
                message: message.clone(),
            });
            BridgeError::Process(message)
        })
    }

    /// Interrupt the worker and wait for it to exit.
    ///
    /// Escalates to a forced kill after the grace period. Pending requests
    /// are rejected with `Stopped`. Returns `None` when nothing was running.
    pub async fn stop(&self) -> Option<ExitInfo> {
        let mut slot = self.shared.child.lock().await;
        let mut handle = slot.take()?;

        if handle.has_exited() {
            let exit = handle.wait_exit().await;
            self.shared.state.send_replace(ProcessState::Stopped {
                last_exit: Some(exit),
            });
            return Some(exit);
        }

        self.shared.state.send_replace(ProcessState::Stopping);
        handle.stopping.store(true, Ordering::SeqCst);
        tracing::info!(pid = ?handle.pid, "Stopping worker");
        handle.signal(StopSignal::Interrupt);

        let grace = self.shared.config.stop_grace_period;
        let exit = match tokio::time::timeout(grace, handle.wait_exit()).await {
            Ok(exit) => exit,
            Err(_) => {
                tracing::warn!(pid = ?handle.pid, ?grace, "Worker ignored interrupt, killing");
                handle.signal(StopSignal::Kill);
                handle.wait_exit().await
            }
        };

        tracing::info!(%exit, "Worker stopped");
        // The event loop does the same, but callers of stop() must not see
        // requests still pending once it returns.
        self.shared.correlator.fail_all(|| BridgeError::Stopped);
        self.shared.state.send_replace(ProcessState::Stopped {
            last_exit: Some(exit),
        });
        Some(exit)
    }

    async fn launch(&self) -> Result<ChildHandle, BridgeError> {
        let config = &self.shared.config;
        tracing::info!(program = ?config.command.program, args = ?config.command.args, "Spawning worker subprocess");

        let mut child = config.spawner.spawn(&config.command)?;
        let stdin = child
            .stdin
            .take()
            .ok_or(SpawnError::MissingPipe("stdin"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take();
        let pid = child.id();

        tracing::debug!(?pid, "Waiting for worker handshake");
        let handshake =
            tokio::time::timeout(config.handshake_timeout, read_handshake(&mut stdout)).await;
        let leftover = match handshake {
            Ok(Ok(leftover)) => leftover,
            Ok(Err(e)) => {
                abort_child(child, config.stop_grace_period);
                return Err(e);
            }
            Err(_) => {
                abort_child(child, config.stop_grace_period);
                return Err(BridgeError::HandshakeTimeout(config.handshake_timeout));
            }
        };

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let stopping = Arc::new(AtomicBool::new(false));

        self.shared.events.emit(BridgeEvent::Started { pid });

        let event_loop = EventLoop {
            shared: Arc::downgrade(&self.shared),
            correlator: Arc::clone(&self.shared.correlator),
            events: self.shared.events.clone(),
            fail_pending_on_exit: config.fail_pending_on_exit,
            generation,
            stopping: Arc::clone(&stopping),
            exit_tx,
        };
        tokio::spawn(event_loop.run(child, stdout, leftover, stderr, signal_rx));

        Ok(ChildHandle {
            generation,
            pid,
            writer: Arc::new(Mutex::new(FramedWrite::new(stdin, FrameEncoder))),
            signal_tx,
            exit_rx,
            stopping,
        })
    }
}

/// Read stdout until the alive token shows up.
///
/// Returns whatever followed the token in the same read. Keeps reading only
/// while the bytes so far could still be the start of the token.
async fn read_handshake(stdout: &mut ChildStdout) -> Result<BytesMut, BridgeError> {
    let token = PROCESS_ALIVE.as_bytes();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        let n = stdout
            .read_buf(&mut buf)
            .await
            .map_err(|e| BridgeError::Process(format!("failed to read worker stdout: {}", e)))?;

        if let Some(pos) = find(&buf, token) {
            return Ok(buf.split_off(pos + token.len()));
        }
        if n == 0 || buf.len() >= token.len() || !token.starts_with(&buf) {
            return Err(BridgeError::Handshake {
                received: String::from_utf8_lossy(&buf).into_owned(),
            });
        }
    }
}

/// Signal a worker that failed its handshake and reap it in the background.
fn abort_child(mut child: Child, grace: Duration) {
    tracing::warn!(pid = ?child.id(), "Interrupting worker that failed to start");
    deliver(&mut child, StopSignal::Interrupt);
    tokio::spawn(async move {
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            tracing::warn!(pid = ?child.id(), "Worker ignored interrupt, killing");
            let _ = child.kill().await;
        }
    });
}

fn deliver(child: &mut Child, signal: StopSignal) {
    match signal {
        StopSignal::Interrupt => interrupt(child),
        StopSignal::Kill => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "Kill failed (already exited?)");
            }
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    // id() is None once the child has been reaped, so a recycled pid is never hit.
    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        tracing::debug!(pid, error = %e, "Failed to send SIGINT");
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    let _ = child.start_kill();
}

/// Single dispatch path for one worker generation.
struct EventLoop {
    shared: Weak<Shared>,
    correlator: Arc<Correlator>,
    events: EventSink,
    fail_pending_on_exit: bool,
    generation: u64,
    stopping: Arc<AtomicBool>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
}

impl EventLoop {
    async fn run(
        self,
        mut child: Child,
        mut stdout: ChildStdout,
        leftover: BytesMut,
        stderr: Option<ChildStderr>,
        mut signal_rx: mpsc::UnboundedReceiver<StopSignal>,
    ) {
        let mut reader = FrameReader::new();
        reader.read(&leftover, |frame| self.dispatch(frame));

        let mut stderr_lines = stderr.map(|s| BufReader::new(s).lines());
        let mut chunk = BytesMut::with_capacity(READ_CHUNK);
        let mut stdout_open = true;
        let mut orphaned = false;

        let status = loop {
            tokio::select! {
                biased;

                signal = signal_rx.recv(), if !orphaned => {
                    match signal {
                        Some(signal) => deliver(&mut child, signal),
                        None => {
                            tracing::debug!(generation = self.generation, "Supervisor dropped, killing worker");
                            orphaned = true;
                            deliver(&mut child, StopSignal::Kill);
                        }
                    }
                }

                read = stdout.read_buf(&mut chunk), if stdout_open => {
                    match read {
                        Ok(0) => {
                            tracing::debug!("Worker stdout closed");
                            stdout_open = false;
                        }
                        Ok(_) => {
                            reader.read(&chunk, |frame| self.dispatch(frame));
                            chunk.clear();
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to read worker stdout");
                            self.events.emit(BridgeEvent::ProcessError {
                                message: format!("failed to read worker stdout: {}", e),
                            });
                            stdout_open = false;
                        }
                    }
                }

                line = next_line(&mut stderr_lines) => {
                    match line {
                        Ok(Some(line)) => {
                            tracing::info!(target: "procbridge::worker", "{}", line);
                            self.events.emit(BridgeEvent::Stderr { line });
                        }
                        Ok(None) => {
                            tracing::debug!("Worker stderr closed");
                            stderr_lines = None;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to read worker stderr");
                            stderr_lines = None;
                        }
                    }
                }

                status = child.wait() => break status,
            }
        };

        if stdout_open {
            self.drain(&mut stdout, &mut reader, &mut chunk).await;
        }

        let exit = match status {
            Ok(status) => ExitInfo::from(status),
            Err(e) => {
                tracing::error!(error = %e, "Failed to wait for worker");
                ExitInfo::unknown()
            }
        };
        self.finish(exit).await;
    }

    /// Frames the worker wrote right before exiting are still delivered.
    async fn drain(&self, stdout: &mut ChildStdout, reader: &mut FrameReader, chunk: &mut BytesMut) {
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            loop {
                chunk.clear();
                match stdout.read_buf(&mut *chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => reader.read(&chunk[..], |frame| self.dispatch(frame)),
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::debug!("Worker stdout still open after exit, giving up on drain");
        }
    }

    async fn finish(self, exit: ExitInfo) {
        // Publish first so no new send targets this child while pending
        // requests are being failed.
        self.exit_tx.send_replace(Some(exit));

        let solicited = self.stopping.load(Ordering::SeqCst);
        if solicited {
            tracing::debug!(%exit, "Worker exited after stop request");
            self.correlator.fail_all(|| BridgeError::Stopped);
        } else {
            tracing::warn!(%exit, pending = self.correlator.len(), "Worker exited unexpectedly");
            if self.fail_pending_on_exit {
                self.correlator
                    .fail_all(|| BridgeError::ProcessExited(exit));
            }
        }

        self.events.emit(BridgeEvent::Exited { exit, solicited });

        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut slot = shared.child.lock().await;
        if slot.as_ref().map(|h| h.generation) == Some(self.generation) {
            *slot = None;
            shared.state.send_replace(ProcessState::Stopped {
                last_exit: Some(exit),
            });
        }
        tracing::info!(generation = self.generation, "Event loop exiting");
    }

    fn dispatch(&self, frame: String) {
        match Envelope::from_frame(&frame) {
            Ok(envelope) => {
                tracing::trace!(id = %envelope.id(), "Received response");
                self.correlator.resolve(envelope);
            }
            Err(e) => {
                tracing::warn!(error = %e, frame_len = frame.len(), "Dropping malformed frame");
                self.events.emit(BridgeEvent::ParseError {
                    frame,
                    error: e.to_string(),
                });
            }
        }
    }
}

async fn next_line(
    lines: &mut Option<Lines<BufReader<ChildStderr>>>,
) -> std::io::Result<Option<String>> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_info_display() {
        let code = ExitInfo {
            code: Some(3),
            signal: None,
        };
        let signal = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert_eq!(code.to_string(), "exit code 3");
        assert_eq!(signal.to_string(), "signal 9");
        assert_eq!(ExitInfo::unknown().to_string(), "unknown status");
        assert!(!code.success());
    }

    #[test]
    fn state_names() {
        assert_eq!(ProcessState::NotStarted.as_str(), "not_started");
        assert_eq!(
            ProcessState::Stopped { last_exit: None }.as_str(),
            "stopped"
        );
        assert!(ProcessState::Running.is_running());
        assert!(!ProcessState::Stopping.is_running());
    }

    #[tokio::test]
    async fn send_before_start_fails_fast() {
        let supervisor = ProcessSupervisor::new(BridgeConfig::new("true"), Correlator::new());
        let envelope = crate::wire::EnvelopeBuilder::new("abc".into()).finish().unwrap();
        let err = supervisor.send(&envelope).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotStarted { .. }));
        assert_eq!(supervisor.state(), ProcessState::NotStarted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_is_visible_before_pending_requests_fail() {
        let correlator = Correlator::new();
        let config = BridgeConfig::new("sh").with_args(["-c", "printf '#proc-alive'; sleep 0.2"]);
        let supervisor = ProcessSupervisor::new(config, Arc::clone(&correlator));
        supervisor.start().await.unwrap();

        let pending = correlator.register("x".into()).unwrap();
        let err = pending.wait(Some(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(err, BridgeError::ProcessExited(_)));

        // Whoever sees the rejection must also see the worker as gone.
        let envelope = crate::wire::EnvelopeBuilder::new("y".into()).finish().unwrap();
        let err = supervisor.send(&envelope).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotStarted { .. }));
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let supervisor = ProcessSupervisor::new(BridgeConfig::new("true"), Correlator::new());
        assert_eq!(supervisor.stop().await, None);
        assert_eq!(supervisor.state(), ProcessState::NotStarted);
    }
}
