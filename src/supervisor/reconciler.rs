//! Startup reconciliation of records a previous worker process left behind.
//!
//! A worker that dies without running its exit path leaves sessions in
//! `active`/`awaiting_input` and executions in `running`/`cancelling`, still
//! owned by its worker id. On the next start the same worker id sweeps them:
//! live orphans are terminated, every record is released, and sessions that
//! were mid-turn are queued for resume.

use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{info, info_span, warn, Instrument};

use crate::models::session::{SessionPatch, SessionStatus};
use crate::persistence::{ExecutionStore, SessionStore};
use crate::queue::JobQueue;
use crate::{AppError, Result};

/// Prompt injected into sessions that were mid-turn when the worker died.
pub const RESUME_AFTER_RESTART_PROMPT: &str =
    "The worker running this session restarted. Please continue where you left off.";

const ORPHAN_ERROR: &str = "worker restarted while the agent process was running";

/// Liveness probe and terminator for orphaned pids.
pub trait ProcessProbe: Send + Sync {
    /// Whether `pid` refers to a running process.
    fn is_alive(&self, pid: u32) -> bool;

    /// Ask `pid` to exit.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Adapter` if the signal cannot be delivered.
    fn terminate(&self, pid: u32) -> Result<()>;
}

/// Probe backed by POSIX signals.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProbe;

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().map(Pid::from_raw)
}

impl ProcessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        to_pid(pid).is_some_and(|pid| signal::kill(pid, None).is_ok())
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        let target = to_pid(pid).ok_or_else(|| AppError::Adapter(format!("invalid pid {pid}")))?;
        signal::kill(target, Signal::SIGTERM)
            .map_err(|err| AppError::Adapter(format!("failed to terminate pid {pid}: {err}")))
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Sessions released to `idle`.
    pub sessions_released: usize,
    /// Executions marked failed.
    pub executions_failed: usize,
    /// Orphan processes that were still alive and got terminated.
    pub processes_terminated: usize,
    /// Sessions queued for resume.
    pub sessions_requeued: Vec<String>,
}

/// Sweep every live record owned by `worker_id`.
///
/// One grace delay is shared by all terminated orphans. Per-record failures
/// are logged and skipped; only the listing queries are fatal.
///
/// # Errors
///
/// Returns an error if owned sessions or executions cannot be listed.
pub async fn reconcile(
    worker_id: &str,
    sessions: &dyn SessionStore,
    executions: &dyn ExecutionStore,
    queue: &dyn JobQueue,
    probe: &dyn ProcessProbe,
    grace: Duration,
) -> Result<ReconcileReport> {
    sweep(worker_id, sessions, executions, queue, probe, grace)
        .instrument(info_span!("reconcile", worker_id))
        .await
}

async fn sweep(
    worker_id: &str,
    sessions: &dyn SessionStore,
    executions: &dyn ExecutionStore,
    queue: &dyn JobQueue,
    probe: &dyn ProcessProbe,
    grace: Duration,
) -> Result<ReconcileReport> {
    let orphan_sessions = sessions.list_owned_live(worker_id).await?;
    let orphan_executions = executions.list_owned_running(worker_id).await?;
    let mut report = ReconcileReport::default();

    if orphan_sessions.is_empty() && orphan_executions.is_empty() {
        info!("no orphaned records found");
        return Ok(report);
    }

    let pids = orphan_sessions
        .iter()
        .filter_map(|session| session.pid)
        .chain(orphan_executions.iter().filter_map(|execution| execution.pid));
    for pid in pids {
        if !probe.is_alive(pid) {
            continue;
        }
        match probe.terminate(pid) {
            Ok(()) => {
                info!(pid, "terminated orphaned agent process");
                report.processes_terminated += 1;
            }
            Err(err) => warn!(pid, error = %err, "failed to terminate orphaned process"),
        }
    }
    if report.processes_terminated > 0 {
        tokio::time::sleep(grace).await;
    }

    for session in &orphan_sessions {
        let resume = session.status == SessionStatus::Active && session.resume_ref.is_some();
        let patch = SessionPatch {
            status: Some(SessionStatus::Idle),
            owner_worker: Some(None),
            pid: Some(None),
            ended_at: Some(Utc::now()),
            error: Some(Some(ORPHAN_ERROR.to_owned())),
            prompt: resume.then(|| RESUME_AFTER_RESTART_PROMPT.to_owned()),
            ..SessionPatch::default()
        };
        if let Err(err) = sessions.update(&session.id, patch).await {
            warn!(session_id = %session.id, error = %err, "failed to release orphaned session");
            continue;
        }
        report.sessions_released += 1;

        if resume {
            match queue.enqueue(&session.id, session.resume_ref.clone()).await {
                Ok(()) => report.sessions_requeued.push(session.id.clone()),
                Err(err) => {
                    warn!(session_id = %session.id, error = %err, "failed to requeue orphaned session");
                }
            }
        }
    }

    for execution in &orphan_executions {
        match executions.mark_failed(&execution.id, ORPHAN_ERROR).await {
            Ok(()) => report.executions_failed += 1,
            Err(err) => {
                warn!(execution_id = %execution.id, error = %err, "failed to fail orphaned execution");
            }
        }
    }

    info!(
        sessions = report.sessions_released,
        executions = report.executions_failed,
        terminated = report.processes_terminated,
        requeued = report.sessions_requeued.len(),
        "reconciliation complete"
    );
    Ok(report)
}
