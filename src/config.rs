//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::session::AgentKind;
use crate::{AppError, Result};

/// Command line used to launch one agent CLI.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentCommand {
    /// Binary name or absolute path.
    pub command: String,
    /// Arguments placed before the adapter's own protocol flags.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Commands for every supported agent CLI.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentsConfig {
    /// Line-delimited stream-json CLI.
    #[serde(default = "default_claude")]
    pub claude: AgentCommand,
    /// Agent-client-protocol CLI.
    #[serde(default = "default_acp")]
    pub acp: AgentCommand,
    /// Thread/turn app-server CLI.
    #[serde(default = "default_codex")]
    pub codex: AgentCommand,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            claude: default_claude(),
            acp: default_acp(),
            codex: default_codex(),
        }
    }
}

impl AgentsConfig {
    /// Command configured for `kind`.
    #[must_use]
    pub fn command_for(&self, kind: AgentKind) -> &AgentCommand {
        match kind {
            AgentKind::Claude => &self.claude,
            AgentKind::Acp => &self.acp,
            AgentKind::Codex => &self.codex,
        }
    }
}

fn default_claude() -> AgentCommand {
    AgentCommand {
        command: "claude".into(),
        args: Vec::new(),
    }
}

fn default_acp() -> AgentCommand {
    AgentCommand {
        command: "gemini".into(),
        args: vec!["--experimental-acp".into()],
    }
}

fn default_codex() -> AgentCommand {
    AgentCommand {
        command: "codex".into(),
        args: vec!["app-server".into()],
    }
}

/// Timer values (seconds) driving supervision policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Interval between liveness stamps.
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,
    /// Default idle timeout applied to sessions without their own.
    #[serde(default = "default_idle_seconds")]
    pub idle_seconds: u64,
    /// Grace period between a graceful terminate and a forceful kill.
    #[serde(default = "default_kill_grace_seconds")]
    pub kill_grace_seconds: u64,
    /// Grace period after a soft interrupt before the session is kept warm.
    #[serde(default = "default_interrupt_grace_seconds")]
    pub interrupt_grace_seconds: u64,
    /// Window for answering an ask-user question before it is denied.
    #[serde(default = "default_ask_user_seconds")]
    pub ask_user_seconds: u64,
    /// Maximum time for a protocol handshake round trip.
    #[serde(default = "default_handshake_seconds")]
    pub handshake_seconds: u64,
    /// Delay between signalling an orphan and marking its record idle.
    #[serde(default = "default_reconcile_grace_seconds")]
    pub reconcile_grace_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            heartbeat_seconds: default_heartbeat_seconds(),
            idle_seconds: default_idle_seconds(),
            kill_grace_seconds: default_kill_grace_seconds(),
            interrupt_grace_seconds: default_interrupt_grace_seconds(),
            ask_user_seconds: default_ask_user_seconds(),
            handshake_seconds: default_handshake_seconds(),
            reconcile_grace_seconds: default_reconcile_grace_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// Heartbeat interval.
    #[must_use]
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_seconds)
    }

    /// Forceful-kill grace period.
    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_seconds)
    }

    /// Soft-interrupt grace period.
    #[must_use]
    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_secs(self.interrupt_grace_seconds)
    }

    /// Ask-user answer window.
    #[must_use]
    pub fn ask_user(&self) -> Duration {
        Duration::from_secs(self.ask_user_seconds)
    }

    /// Handshake round-trip limit.
    #[must_use]
    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_seconds)
    }

    /// Reconciler grace delay.
    #[must_use]
    pub fn reconcile_grace(&self) -> Duration {
        Duration::from_secs(self.reconcile_grace_seconds)
    }
}

fn default_heartbeat_seconds() -> u64 {
    30
}

fn default_idle_seconds() -> u64 {
    1800
}

fn default_kill_grace_seconds() -> u64 {
    5
}

fn default_interrupt_grace_seconds() -> u64 {
    3
}

fn default_ask_user_seconds() -> u64 {
    300
}

fn default_handshake_seconds() -> u64 {
    30
}

fn default_reconcile_grace_seconds() -> u64 {
    2
}

/// Child environment policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EnvConfig {
    /// Variables stripped from the child environment. A trailing `*`
    /// matches by prefix.
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            denylist: default_denylist(),
        }
    }
}

fn default_denylist() -> Vec<String> {
    [
        "CLAUDECODE",
        "CLAUDE_CODE_ENTRYPOINT",
        "DATABASE_URL",
        "REDIS_URL",
        "AUTH_SECRET",
        "SESSION_SECRET",
        "AGENT_SUPERVISOR_*",
        "NODE_OPTIONS",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

fn default_worker_id() -> String {
    format!("worker-{}", uuid::Uuid::new_v4().simple())
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".agent-supervisor").join("sessions.db")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".agent-supervisor").join("logs")
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Identifier stamped into the owner column of claimed sessions.
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
    /// `SQLite` database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Directory for per-session log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Agent CLI commands.
    #[serde(default)]
    pub agents: AgentsConfig,
    /// Supervision timers.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Child environment policy.
    #[serde(default)]
    pub env: EnvConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(AppError::Config("worker_id must not be empty".into()));
        }

        if self.timeouts.heartbeat_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.heartbeat_seconds must be greater than zero".into(),
            ));
        }

        if self.timeouts.kill_grace_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.kill_grace_seconds must be greater than zero".into(),
            ));
        }

        for (name, agent) in [
            ("claude", &self.agents.claude),
            ("acp", &self.agents.acp),
            ("codex", &self.agents.codex),
        ] {
            if agent.command.trim().is_empty() {
                return Err(AppError::Config(format!(
                    "agents.{name}.command must not be empty"
                )));
            }
        }

        Ok(())
    }
}
