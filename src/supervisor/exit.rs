//! Pure mapping from how a process ended to the session's next state.

use crate::models::session::SessionStatus;

/// Why a run should be started again after the process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restart {
    /// Re-enqueue with the resume reference (permission mode change, queued
    /// message).
    Resume,
    /// Re-enqueue without a resume reference (clear context).
    Fresh,
}

/// Everything known about a run when its process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitContext {
    /// Exit code; `None` when the process died from a signal.
    pub exit_code: Option<i32>,
    /// The human cancelled the session.
    pub cancelled: bool,
    /// The supervisor terminated the process on purpose, not as a failure.
    pub gracefully_terminated: bool,
    /// The idle timeout retired the process.
    pub idle_timed_out: bool,
    /// The human interrupted the current turn.
    pub interrupted: bool,
    /// Status right before the exit.
    pub current_status: SessionStatus,
    /// Restart requested during the run.
    pub restart: Option<Restart>,
}

/// Next state of a session after its process exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitResolution {
    /// Status to persist.
    pub status: SessionStatus,
    /// Diagnostic to publish and persist, for crashes.
    pub diagnostic: Option<String>,
    /// Re-enqueue to perform, if any.
    pub restart: Option<Restart>,
}

/// Decide the post-exit status, diagnostic, and restart.
///
/// A cancel always ends the session and suppresses restarts. A clean exit
/// or an exit the supervisor caused leaves it idle and resumable; anything
/// else is a crash.
#[must_use]
pub fn compute_exit_resolution(ctx: &ExitContext) -> ExitResolution {
    if ctx.cancelled {
        return ExitResolution {
            status: SessionStatus::Ended,
            diagnostic: None,
            restart: None,
        };
    }

    let expected = ctx.exit_code == Some(0)
        || ctx.idle_timed_out
        || ctx.interrupted
        || ctx.gracefully_terminated;

    if expected {
        return ExitResolution {
            status: SessionStatus::Idle,
            diagnostic: None,
            restart: ctx.restart,
        };
    }

    let cause = ctx
        .exit_code
        .map_or_else(|| "signal".to_owned(), |code| format!("exit code {code}"));
    ExitResolution {
        status: SessionStatus::Ended,
        diagnostic: Some(format!("agent process exited unexpectedly ({cause})")),
        restart: None,
    }
}
