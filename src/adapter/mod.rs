//! Agent adapters: one trait over three stdio wire protocols.
//!
//! An adapter instance drives one agent process at a time. The supervisor
//! only sees [`ProcessHandle`] events and the uniform [`EventPayload`]
//! stream; protocol details stay inside the variant modules.
//!
//! Optional capabilities are exposed through accessors returning
//! `Option<&dyn Capability>` so callers detect support at the call site.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::approval::{ApprovalDecision, ApprovalRequest};
use crate::config::AgentsConfig;
use crate::logsink::StreamTag;
use crate::models::control::ImageAttachment;
use crate::models::event::EventPayload;
use crate::models::session::{AgentKind, PermissionMode};
use crate::Result;

pub mod acp;
pub mod claude;
pub mod codec;
pub mod codex;
pub mod jsonrpc;
pub mod process;

/// Callback the adapter awaits for every gated tool call.
pub type ApprovalHook =
    Arc<dyn Fn(ApprovalRequest) -> BoxFuture<'static, ApprovalDecision> + Send + Sync>;

/// Everything an adapter needs to launch a process.
#[derive(Clone)]
pub struct SpawnOptions {
    /// Supervised session id.
    pub session_id: String,
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
    /// Complete, already sanitized child environment.
    pub env: BTreeMap<String, String>,
    /// Model override.
    pub model: Option<String>,
    /// Initial auto-approval policy.
    pub permission_mode: PermissionMode,
    /// Gate consulted for tool calls.
    pub approval_hook: ApprovalHook,
    /// Upper bound for each handshake round trip.
    pub handshake_timeout: Duration,
}

/// Something observed on a process.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// Raw text written by the process, one line per event.
    Output {
        /// Stream the text came from.
        stream: StreamTag,
        /// Line content without the trailing newline.
        text: String,
    },
    /// Normalized payload parsed from the process output.
    Event(EventPayload),
    /// The process is gone; always the last event.
    Exited {
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
    },
}

/// Signal used by [`ProcessHandle::kill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// Graceful (`SIGTERM`).
    Terminate,
    /// Forceful (`SIGKILL`).
    Kill,
}

/// Signal delivery for one process.
pub trait ProcessControl: Send + Sync {
    /// Deliver `signal`; a no-op once the process has exited.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Adapter` if the signal cannot be delivered.
    fn signal(&self, signal: KillSignal) -> Result<()>;
}

/// Ownership wrapper around one child process. Never reused.
pub struct ProcessHandle {
    pid: Option<u32>,
    events: Option<mpsc::UnboundedReceiver<AdapterEvent>>,
    control: Arc<dyn ProcessControl>,
}

impl ProcessHandle {
    /// Wrap a launched process.
    #[must_use]
    pub fn new(
        pid: Option<u32>,
        events: mpsc::UnboundedReceiver<AdapterEvent>,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            pid,
            events: Some(events),
            control,
        }
    }

    /// Operating-system process id.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the event receiver. Only the first call returns `Some`.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<AdapterEvent>> {
        self.events.take()
    }

    /// Signal the process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Adapter` if the signal cannot be delivered.
    pub fn kill(&self, signal: KillSignal) -> Result<()> {
        self.control.signal(signal)
    }
}

/// Required surface of every agent adapter.
pub trait AgentAdapter: Send + Sync {
    /// Which protocol this adapter speaks.
    fn kind(&self) -> AgentKind;

    /// Launch a fresh conversation with `prompt`.
    fn spawn<'a>(&'a self, prompt: &'a str, opts: SpawnOptions)
        -> BoxFuture<'a, Result<ProcessHandle>>;

    /// Launch a process continuing the conversation `resume_ref`.
    fn resume<'a>(
        &'a self,
        resume_ref: &'a str,
        prompt: &'a str,
        opts: SpawnOptions,
    ) -> BoxFuture<'a, Result<ProcessHandle>>;

    /// Send a user turn to the running process.
    fn send_message<'a>(
        &'a self,
        text: &'a str,
        image: Option<&'a ImageAttachment>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Stop the current turn without ending the process.
    fn interrupt(&self) -> BoxFuture<'_, Result<()>>;

    /// Pull a resume reference out of one raw output line, if it carries one.
    fn extract_session_id(&self, line: &str) -> Option<String>;

    /// In-place permission mode switching, if supported.
    fn permission_mode_control(&self) -> Option<&dyn PermissionModeControl> {
        None
    }

    /// In-place model switching, if supported.
    fn model_control(&self) -> Option<&dyn ModelControl> {
        None
    }

    /// Direct tool-result delivery, if supported.
    fn tool_result_sink(&self) -> Option<&dyn ToolResultSink> {
        None
    }
}

/// Optional capability: switch permission mode without restarting.
pub trait PermissionModeControl: Send + Sync {
    /// Apply `mode` to the running process.
    fn set_permission_mode(&self, mode: PermissionMode) -> BoxFuture<'_, Result<()>>;
}

/// Optional capability: switch model without restarting.
pub trait ModelControl: Send + Sync {
    /// Apply `model` to the running process.
    fn set_model<'a>(&'a self, model: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Optional capability: answer a tool call directly.
pub trait ToolResultSink: Send + Sync {
    /// Deliver `content` as the result of `tool_use_id`.
    fn send_tool_result<'a>(
        &'a self,
        tool_use_id: &'a str,
        content: &'a str,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Creates a fresh adapter per supervised run.
pub trait AdapterFactory: Send + Sync {
    /// Build an adapter for `kind`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unsupported` if `kind` cannot be served.
    fn create(&self, kind: AgentKind) -> Result<Box<dyn AgentAdapter>>;
}

/// Factory backed by the configured agent CLI commands.
pub struct CliAdapterFactory {
    agents: AgentsConfig,
}

impl CliAdapterFactory {
    /// Construct a factory from configuration.
    #[must_use]
    pub fn new(agents: AgentsConfig) -> Self {
        Self { agents }
    }
}

impl AdapterFactory for CliAdapterFactory {
    fn create(&self, kind: AgentKind) -> Result<Box<dyn AgentAdapter>> {
        let command = self.agents.command_for(kind).clone();
        Ok(match kind {
            AgentKind::Claude => Box::new(claude::ClaudeAdapter::new(command)),
            AgentKind::Acp => Box::new(acp::AcpAdapter::new(command)),
            AgentKind::Codex => Box::new(codex::CodexAdapter::new(command)),
        })
    }
}
