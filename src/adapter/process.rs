//! Shared process shell used by every adapter.
//!
//! Spawns the agent with piped stdio and `kill_on_drop(true)`, then runs
//! four tasks around it: a stdin writer, a stdout reader that feeds each
//! line to the adapter's [`LineHandler`], a stderr reader, and an exit
//! monitor that emits [`AdapterEvent::Exited`] last.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::NdjsonCodec;
use super::{AdapterEvent, KillSignal, ProcessControl, ProcessHandle};
use crate::logsink::StreamTag;
use crate::models::event::EventPayload;
use crate::{AppError, Result};

/// Variable carrying the supervised session id into the child.
pub const SESSION_ID_ENV: &str = "AGENT_SUPERVISOR_SESSION_ID";

/// Exit code reported when the initialization handshake fails.
pub const INIT_FAILURE_EXIT_CODE: i32 = 1;

/// How long the readers together may keep draining after the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ── Environment ──────────────────────────────────────────────────────────────

/// Whether `name` is covered by `denylist` (exact or `PREFIX*`).
#[must_use]
pub fn is_denied(name: &str, denylist: &[String]) -> bool {
    denylist.iter().any(|entry| match entry.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => name == entry,
    })
}

/// Copy `parent` without the variables named in `denylist`.
#[must_use]
pub fn sanitize_env<I, K, V>(parent: I, denylist: &[String]) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    parent
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .filter(|(k, _)| !is_denied(k, denylist))
        .collect()
}

/// Sanitized environment for a session's agent process.
#[must_use]
pub fn child_env<I, K, V>(
    parent: I,
    denylist: &[String],
    session_id: &str,
) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut env = sanitize_env(parent, denylist);
    env.insert(SESSION_ID_ENV.to_owned(), session_id.to_owned());
    env
}

// ── Signals ──────────────────────────────────────────────────────────────────

/// Signal delivery by pid, disabled once the exit monitor has reaped the
/// child so a reused pid is never hit.
pub struct SignalControl {
    pid: Option<u32>,
    exited: AtomicBool,
}

impl SignalControl {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            exited: AtomicBool::new(false),
        }
    }

    fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    /// Whether the child has been reaped.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

impl ProcessControl for SignalControl {
    fn signal(&self, kind: KillSignal) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let raw = i32::try_from(pid)
            .map_err(|_| AppError::Adapter(format!("pid {pid} out of range")))?;
        let sig = match kind {
            KillSignal::Terminate => Signal::SIGTERM,
            KillSignal::Kill => Signal::SIGKILL,
        };
        signal::kill(Pid::from_raw(raw), sig)
            .map_err(|e| AppError::Adapter(format!("failed to signal pid {pid}: {e}")))
    }
}

// ── Shell ────────────────────────────────────────────────────────────────────

/// Program, arguments, directory, and environment of an agent process.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Binary name or path.
    pub program: String,
    /// Full argument list.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Complete environment; nothing else is inherited.
    pub env: BTreeMap<String, String>,
}

/// Per-protocol stdout line processing.
pub trait LineHandler: Send + 'static {
    /// Handle one decoded stdout line.
    fn handle_line(&mut self, line: String) -> BoxFuture<'_, ()>;
}

/// Handles shared between an adapter, its line handler, and its tasks.
#[derive(Clone)]
pub struct ShellContext {
    session_id: String,
    outbound: mpsc::UnboundedSender<Value>,
    events: mpsc::UnboundedSender<AdapterEvent>,
    exit_code: Arc<OnceLock<i32>>,
    control: Arc<SignalControl>,
    exited: CancellationToken,
}

impl ShellContext {
    /// Session this process serves.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queue one JSON message for the child's stdin.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Adapter` if the writer has stopped.
    pub fn send(&self, message: Value) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| AppError::Adapter("agent stdin is closed".into()))
    }

    /// Publish a normalized payload to the supervisor.
    pub fn emit(&self, payload: EventPayload) {
        if self.events.send(AdapterEvent::Event(payload)).is_err() {
            debug!(session_id = %self.session_id, "event receiver dropped");
        }
    }

    /// Whether the process is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.control.has_exited()
    }

    /// Resolves once the process has been reaped.
    pub async fn exited(&self) {
        self.exited.cancelled().await;
    }

    /// Report a failed handshake: emit a diagnostic, force a non-zero exit
    /// code, and kill the process so the exit path runs.
    pub fn fail_init(&self, err: &AppError) {
        warn!(session_id = %self.session_id, error = %err, "agent initialization failed");
        self.emit(EventPayload::error(format!("agent initialization failed: {err}")));
        let _ = self.exit_code.set(INIT_FAILURE_EXIT_CODE);
        if let Err(kill_err) = self.control.signal(KillSignal::Kill) {
            warn!(session_id = %self.session_id, error = %kill_err, "failed to kill agent");
        }
    }
}

/// Spawn `spec` and wire up its tasks.
///
/// `make_handler` receives the [`ShellContext`] before any output is read.
///
/// # Errors
///
/// Returns `AppError::Adapter` if the process cannot be spawned or its
/// stdio cannot be captured.
pub fn launch<H, F>(
    spec: CommandSpec,
    session_id: &str,
    make_handler: F,
) -> Result<(ProcessHandle, ShellContext)>
where
    H: LineHandler,
    F: FnOnce(ShellContext) -> H,
{
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .env_clear()
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Adapter(format!("failed to spawn {}: {err}", spec.program)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Adapter("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Adapter("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Adapter("failed to capture agent stderr".into()))?;

    let pid = child.id();
    info!(session_id, ?pid, program = %spec.program, "agent process spawned");

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    let control = Arc::new(SignalControl::new(pid));
    let cancel = CancellationToken::new();

    let ctx = ShellContext {
        session_id: session_id.to_owned(),
        outbound: out_tx,
        events: ev_tx.clone(),
        exit_code: Arc::new(OnceLock::new()),
        control: Arc::clone(&control),
        exited: cancel.clone(),
    };

    let handler = make_handler(ctx.clone());

    tokio::spawn(run_writer(
        session_id.to_owned(),
        stdin,
        out_rx,
        cancel.clone(),
    ));
    let stdout_task = tokio::spawn(run_stdout_reader(
        session_id.to_owned(),
        stdout,
        handler,
        ev_tx.clone(),
    ));
    let stderr_task = tokio::spawn(run_stderr_reader(stderr, ev_tx.clone()));

    tokio::spawn(monitor_exit(ExitMonitor {
        session_id: session_id.to_owned(),
        child,
        readers: [stdout_task, stderr_task],
        events: ev_tx,
        exit_code: Arc::clone(&ctx.exit_code),
        control: Arc::clone(&control),
        cancel,
    }));

    Ok((ProcessHandle::new(pid, ev_rx, control), ctx))
}

// ── Tasks ────────────────────────────────────────────────────────────────────

async fn run_writer(
    session_id: String,
    mut stdin: ChildStdin,
    mut msg_rx: mpsc::UnboundedReceiver<Value>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "writer: process exited, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                let Some(value) = msg else {
                    debug!(session_id, "writer: channel closed, stopping");
                    break;
                };

                let mut bytes = match serde_json::to_vec(&value) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(session_id, error = %err, "writer: failed to encode message");
                        continue;
                    }
                };
                bytes.push(b'\n');

                if let Err(err) = stdin.write_all(&bytes).await {
                    warn!(session_id, error = %err, "writer: write to stdin failed");
                    break;
                }
                if let Err(err) = stdin.flush().await {
                    warn!(session_id, error = %err, "writer: flush failed");
                    break;
                }
            }
        }
    }
}

async fn run_stdout_reader<R, H>(
    session_id: String,
    stdout: R,
    mut handler: H,
    events: mpsc::UnboundedSender<AdapterEvent>,
) where
    R: AsyncRead + Unpin + Send,
    H: LineHandler,
{
    let mut framed = FramedRead::new(stdout, NdjsonCodec::new());

    while let Some(item) = framed.next().await {
        match item {
            Ok(line) => {
                let _ = events.send(AdapterEvent::Output {
                    stream: StreamTag::Stdout,
                    text: line.clone(),
                });
                if line.trim().is_empty() {
                    continue;
                }
                handler.handle_line(line).await;
            }
            Err(AppError::Protocol(msg)) => {
                warn!(session_id, error = %msg, "reader: framing error, skipping line");
            }
            Err(err) => {
                warn!(session_id, error = %err, "reader: stdout failed, stopping");
                break;
            }
        }
    }
    debug!(session_id, "reader: stdout closed");
}

async fn run_stderr_reader<R>(stderr: R, events: mpsc::UnboundedSender<AdapterEvent>)
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stderr, NdjsonCodec::new());
    while let Some(item) = framed.next().await {
        match item {
            Ok(text) => {
                let _ = events.send(AdapterEvent::Output {
                    stream: StreamTag::Stderr,
                    text,
                });
            }
            Err(AppError::Protocol(_)) => {}
            Err(_) => break,
        }
    }
}

struct ExitMonitor {
    session_id: String,
    child: Child,
    readers: [JoinHandle<()>; 2],
    events: mpsc::UnboundedSender<AdapterEvent>,
    exit_code: Arc<OnceLock<i32>>,
    control: Arc<SignalControl>,
    cancel: CancellationToken,
}

async fn monitor_exit(mut monitor: ExitMonitor) {
    let status = monitor.child.wait().await;
    monitor.control.mark_exited();
    monitor.cancel.cancel();

    // One deadline for both readers: a grandchild holding the pipes open
    // must not delay the exit report by more than DRAIN_TIMEOUT.
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    for reader in &mut monitor.readers {
        if tokio::time::timeout_at(deadline, &mut *reader).await.is_err() {
            reader.abort();
        }
    }

    let reported = match status {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(session_id = %monitor.session_id, error = %err, "error waiting for agent");
            None
        }
    };
    let code = monitor.exit_code.get().copied().or(reported);

    info!(session_id = %monitor.session_id, ?code, "agent process exited");
    if monitor.events.send(AdapterEvent::Exited { code }).is_err() {
        debug!(session_id = %monitor.session_id, "exit event dropped: receiver gone");
    }
}
