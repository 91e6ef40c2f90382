//! Session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppError, Result};

/// Lifecycle status for a supervised agent session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// The agent process is working on a turn.
    Active,
    /// The agent process is idle and waiting on the human.
    AwaitingInput,
    /// No process is running; the session can be resumed.
    Idle,
    /// Terminal for the current run.
    Ended,
}

impl SessionStatus {
    /// Wire and storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::AwaitingInput => "awaiting_input",
            Self::Idle => "idle",
            Self::Ended => "ended",
        }
    }

    /// Parse the storage representation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` for an unknown status string.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "active" => Ok(Self::Active),
            "awaiting_input" => Ok(Self::AwaitingInput),
            "idle" => Ok(Self::Idle),
            "ended" => Ok(Self::Ended),
            other => Err(AppError::Db(format!("invalid session status: {other}"))),
        }
    }

    /// Whether a process is expected to be attached in this status.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::AwaitingInput)
    }

    /// Statuses from which a worker may claim the session.
    pub const CLAIMABLE: [Self; 3] = [Self::Idle, Self::Active, Self::Ended];
}

/// Auto-approval policy applied by the approval gate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Every gated tool requires a human decision.
    #[default]
    Default,
    /// File edits are approved automatically.
    #[serde(alias = "acceptEdits")]
    AcceptEdits,
    /// Every tool is approved automatically.
    #[serde(alias = "bypassPermissions")]
    BypassPermissions,
    /// The agent plans without executing tools.
    Plan,
}

impl PermissionMode {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "accept_edits",
            Self::BypassPermissions => "bypass_permissions",
            Self::Plan => "plan",
        }
    }

    /// Camel-case spelling used by the agent CLIs on their wire.
    #[must_use]
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
            Self::Plan => "plan",
        }
    }

    /// Parse the storage representation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` for an unknown mode string.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "default" => Ok(Self::Default),
            "accept_edits" | "acceptEdits" => Ok(Self::AcceptEdits),
            "bypass_permissions" | "bypassPermissions" => Ok(Self::BypassPermissions),
            "plan" => Ok(Self::Plan),
            other => Err(AppError::Db(format!("invalid permission mode: {other}"))),
        }
    }
}

/// Which agent CLI a session runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Line-delimited stream-json CLI.
    Claude,
    /// Agent-client-protocol CLI over JSON-RPC.
    Acp,
    /// Thread/turn app-server CLI over JSON-RPC.
    Codex,
}

impl AgentKind {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Acp => "acp",
            Self::Codex => "codex",
        }
    }

    /// Parse the storage representation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` for an unknown agent string.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "claude" => Ok(Self::Claude),
            "acp" => Ok(Self::Acp),
            "codex" => Ok(Self::Codex),
            other => Err(AppError::Db(format!("invalid agent kind: {other}"))),
        }
    }
}

/// Session domain entity persisted in `SQLite`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Unique record identifier.
    pub id: String,
    /// Agent CLI driving this session.
    pub agent: AgentKind,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Worker currently holding the session, if any.
    pub owner_worker: Option<String>,
    /// Pid of the attached agent process.
    pub pid: Option<u32>,
    /// Agent-specific token for cold resume.
    pub resume_ref: Option<String>,
    /// Prompt for the next (re)start.
    pub prompt: Option<String>,
    /// Working directory of the agent process.
    pub cwd: Option<String>,
    /// Requested model, if overridden.
    pub model: Option<String>,
    /// Auto-approval policy.
    pub permission_mode: PermissionMode,
    /// Tool-name patterns approved for the whole session.
    pub allowed_tools: Vec<String>,
    /// Seconds in `awaiting_input` before the process is retired.
    pub idle_timeout_secs: u64,
    /// Last sequence number assigned to a published event.
    pub event_seq: u64,
    /// Last liveness stamp from the owning worker.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Start of the current run.
    pub started_at: Option<DateTime<Utc>>,
    /// End of the most recent run.
    pub ended_at: Option<DateTime<Utc>>,
    /// Log file for the most recent run.
    pub log_path: Option<String>,
    /// Size of the log file at close.
    pub log_bytes: u64,
    /// Line count of the log file at close.
    pub log_lines: u64,
    /// Last diagnostic attached to the session.
    pub error: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Construct a new, unclaimed session in `idle` status.
    #[must_use]
    pub fn new(agent: AgentKind, prompt: Option<String>, cwd: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            agent,
            status: SessionStatus::Idle,
            owner_worker: None,
            pid: None,
            resume_ref: None,
            prompt,
            cwd,
            model: None,
            permission_mode: PermissionMode::Default,
            allowed_tools: Vec::new(),
            idle_timeout_secs: 1800,
            event_seq: 0,
            heartbeat_at: None,
            started_at: None,
            ended_at: None,
            log_path: None,
            log_bytes: 0,
            log_lines: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `worker_id` may claim this session right now.
    ///
    /// Mirrors the conditional update used by the store; the store never
    /// relies on this check alone.
    #[must_use]
    pub fn claimable_by(&self, worker_id: &str) -> bool {
        SessionStatus::CLAIMABLE.contains(&self.status)
            && self
                .owner_worker
                .as_deref()
                .is_none_or(|owner| owner == worker_id)
    }
}

/// Partial update applied to a stored session. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    /// New status.
    pub status: Option<SessionStatus>,
    /// New owner; `Some(None)` clears it.
    pub owner_worker: Option<Option<String>>,
    /// New pid; `Some(None)` clears it.
    pub pid: Option<Option<u32>>,
    /// New resume reference; `Some(None)` clears it.
    pub resume_ref: Option<Option<String>>,
    /// New prompt.
    pub prompt: Option<String>,
    /// New model.
    pub model: Option<String>,
    /// New permission mode.
    pub permission_mode: Option<PermissionMode>,
    /// Replacement allow-list.
    pub allowed_tools: Option<Vec<String>>,
    /// New event sequence counter.
    pub event_seq: Option<u64>,
    /// Liveness stamp.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Run start.
    pub started_at: Option<DateTime<Utc>>,
    /// Run end.
    pub ended_at: Option<DateTime<Utc>>,
    /// Log location.
    pub log_path: Option<String>,
    /// Log byte size and line count.
    pub log_stats: Option<(u64, u64)>,
    /// Diagnostic; `Some(None)` clears it.
    pub error: Option<Option<String>>,
}
