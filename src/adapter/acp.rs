//! Adapter for agents speaking the agent-client protocol (JSON-RPC 2.0).
//!
//! Handshake: `initialize` → `session/new` (or `session/load` on resume) →
//! `session/prompt`. Streaming output arrives as `session/update`
//! notifications; the prompt response carries the turn's `stopReason`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::jsonrpc::{classify, Incoming, RpcClient, METHOD_NOT_FOUND};
use super::process::{launch, CommandSpec, LineHandler};
use super::{AgentAdapter, ApprovalHook, PermissionModeControl, ProcessHandle, SpawnOptions};
use crate::approval::{ApprovalDecision, ApprovalRequest};
use crate::config::AgentCommand;
use crate::models::control::ImageAttachment;
use crate::models::event::EventPayload;
use crate::models::session::{AgentKind, PermissionMode};
use crate::{AppError, Result};

/// Protocol version sent in `initialize`.
pub const PROTOCOL_VERSION: u64 = 1;

/// Agent-client-protocol adapter. One instance drives one process at a time.
pub struct AcpAdapter {
    command: AgentCommand,
    link: Mutex<Option<Arc<AcpLink>>>,
}

struct AcpLink {
    rpc: Arc<RpcClient>,
    session: Mutex<Option<String>>,
    timeout: Duration,
}

impl AcpAdapter {
    /// Create an adapter launching `command`.
    #[must_use]
    pub fn new(command: AgentCommand) -> Self {
        Self {
            command,
            link: Mutex::new(None),
        }
    }

    async fn start(
        &self,
        prompt: &str,
        resume_ref: Option<&str>,
        opts: SpawnOptions,
    ) -> Result<ProcessHandle> {
        let cwd = match &opts.cwd {
            Some(cwd) => cwd.clone(),
            None => std::env::current_dir()?,
        };
        let spec = CommandSpec {
            program: self.command.command.clone(),
            args: self.command.args.clone(),
            cwd: Some(cwd.clone()),
            env: opts.env.clone(),
        };

        let hook = Arc::clone(&opts.approval_hook);
        let mut shared = None;
        let (handle, _ctx) = launch(spec, &opts.session_id, |ctx| {
            let rpc = Arc::new(RpcClient::new(ctx));
            shared = Some(Arc::clone(&rpc));
            AcpHandler { rpc, hook }
        })?;
        let rpc = shared.ok_or_else(|| AppError::Adapter("rpc client not initialized".into()))?;

        let link = Arc::new(AcpLink {
            rpc,
            session: Mutex::new(None),
            timeout: opts.handshake_timeout,
        });
        *self.link.lock().await = Some(Arc::clone(&link));

        let prompt = prompt.to_owned();
        let resume_ref = resume_ref.map(str::to_owned);
        let mode = opts.permission_mode;
        tokio::spawn(async move {
            if let Err(err) = link.handshake(&prompt, resume_ref, cwd, mode).await {
                link.rpc.context().fail_init(&err);
            }
        });

        Ok(handle)
    }

    async fn active_link(&self) -> Result<Arc<AcpLink>> {
        self.link
            .lock()
            .await
            .as_ref()
            .filter(|link| link.rpc.context().is_running())
            .cloned()
            .ok_or_else(|| AppError::Adapter("no active agent session".into()))
    }
}

impl AcpLink {
    async fn handshake(
        &self,
        prompt: &str,
        resume_ref: Option<String>,
        cwd: PathBuf,
        mode: PermissionMode,
    ) -> Result<()> {
        let timeout = Some(self.timeout);
        self.rpc
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "clientCapabilities": {
                        "fs": {"readTextFile": false, "writeTextFile": false},
                        "terminal": false,
                    },
                }),
                timeout,
            )
            .await?;

        let cwd = cwd.display().to_string();
        let session_id = match resume_ref {
            Some(resume_ref) => {
                self.rpc
                    .request(
                        "session/load",
                        json!({"sessionId": resume_ref, "cwd": cwd, "mcpServers": []}),
                        timeout,
                    )
                    .await?;
                resume_ref
            }
            None => {
                let result = self
                    .rpc
                    .request("session/new", json!({"cwd": cwd, "mcpServers": []}), timeout)
                    .await?;
                result
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .ok_or_else(|| AppError::Protocol("session/new returned no sessionId".into()))?
            }
        };

        *self.session.lock().await = Some(session_id.clone());
        self.rpc.context().emit(EventPayload::SessionInit {
            session_ref: session_id,
            model: None,
            tools: Vec::new(),
        });

        if mode != PermissionMode::Default {
            if let Err(err) = self.set_mode(mode).await {
                warn!(error = %err, "agent rejected initial permission mode");
            }
        }

        self.prompt(vec![json!({"type": "text", "text": prompt})])
            .await
    }

    async fn session_id(&self) -> Result<String> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or_else(|| AppError::Adapter("no active agent session".into()))
    }

    /// Start a turn; its completion is reported asynchronously.
    async fn prompt(&self, content: Vec<Value>) -> Result<()> {
        let session_id = self.session_id().await?;
        let rpc = Arc::clone(&self.rpc);
        tokio::spawn(async move {
            let outcome = rpc
                .request(
                    "session/prompt",
                    json!({"sessionId": session_id, "prompt": content}),
                    None,
                )
                .await;
            match outcome {
                Ok(result) => rpc.context().emit(map_prompt_result(&result)),
                Err(AppError::Adapter(msg)) => debug!(error = %msg, "prompt abandoned"),
                Err(err) => {
                    rpc.context().emit(EventPayload::error(err.to_string()));
                    rpc.context().emit(EventPayload::AgentResult {
                        is_error: true,
                        subtype: Some("error".into()),
                        result: Some(err.to_string()),
                        total_cost_usd: None,
                        num_turns: None,
                        duration_ms: None,
                        model_usage: None,
                        permission_denials: Vec::new(),
                    });
                }
            }
        });
        Ok(())
    }

    async fn set_mode(&self, mode: PermissionMode) -> Result<()> {
        let session_id = self.session_id().await?;
        self.rpc
            .request(
                "session/set_mode",
                json!({"sessionId": session_id, "modeId": mode.as_wire()}),
                Some(self.timeout),
            )
            .await
            .map(|_| ())
    }
}

impl AgentAdapter for AcpAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Acp
    }

    fn spawn<'a>(
        &'a self,
        prompt: &'a str,
        opts: SpawnOptions,
    ) -> BoxFuture<'a, Result<ProcessHandle>> {
        Box::pin(self.start(prompt, None, opts))
    }

    fn resume<'a>(
        &'a self,
        resume_ref: &'a str,
        prompt: &'a str,
        opts: SpawnOptions,
    ) -> BoxFuture<'a, Result<ProcessHandle>> {
        Box::pin(self.start(prompt, Some(resume_ref), opts))
    }

    fn send_message<'a>(
        &'a self,
        text: &'a str,
        image: Option<&'a ImageAttachment>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let link = self.active_link().await?;
            let mut content = vec![json!({"type": "text", "text": text})];
            if let Some(image) = image {
                content.push(json!({
                    "type": "image",
                    "mimeType": image.media_type,
                    "data": image.data,
                }));
            }
            link.prompt(content).await
        })
    }

    fn interrupt(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let link = self.active_link().await?;
            let session_id = link.session_id().await?;
            link.rpc
                .notify("session/cancel", json!({"sessionId": session_id}))
        })
    }

    fn extract_session_id(&self, line: &str) -> Option<String> {
        match classify(line)? {
            Incoming::Response {
                outcome: Ok(result),
                ..
            } => result
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_owned),
            _ => None,
        }
    }

    fn permission_mode_control(&self) -> Option<&dyn PermissionModeControl> {
        Some(self)
    }
}

impl PermissionModeControl for AcpAdapter {
    fn set_permission_mode(&self, mode: PermissionMode) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.active_link().await?.set_mode(mode).await })
    }
}

// ── Line handling ────────────────────────────────────────────────────────────

struct AcpHandler {
    rpc: Arc<RpcClient>,
    hook: ApprovalHook,
}

impl AcpHandler {
    fn on_permission_request(&self, id: Value, params: &Value) {
        let tool_call = params.get("toolCall").cloned().unwrap_or(Value::Null);
        let options = params
            .get("options")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let tool_use_id = tool_call
            .get("toolCallId")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let request = ApprovalRequest {
            approval_id: tool_use_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            tool_name: tool_name(&tool_call),
            input: tool_call.get("rawInput").cloned().unwrap_or(Value::Null),
            tool_use_id,
        };

        let hook = Arc::clone(&self.hook);
        let rpc = Arc::clone(&self.rpc);
        tokio::spawn(async move {
            let decision = hook(request).await;
            if let Err(err) = rpc.respond(id, select_option(&options, &decision)) {
                warn!(error = %err, "failed to answer permission request");
            }
        });
    }
}

impl LineHandler for AcpHandler {
    fn handle_line(&mut self, line: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match classify(&line) {
                Some(Incoming::Response { id, outcome }) => {
                    if !self.rpc.resolve(id, outcome).await {
                        self.rpc.context().emit(EventPayload::info(line));
                    }
                }
                Some(Incoming::Notification { method, params }) => {
                    if method == "session/update" {
                        for payload in map_session_update(&params) {
                            self.rpc.context().emit(payload);
                        }
                    } else {
                        debug!(method, "ignoring notification");
                    }
                }
                Some(Incoming::Request { id, method, params }) => {
                    if method == "session/request_permission" {
                        self.on_permission_request(id, &params);
                    } else if let Err(err) = self.rpc.respond_error(
                        id,
                        METHOD_NOT_FOUND,
                        &format!("method not found: {method}"),
                    ) {
                        warn!(error = %err, "failed to reject request");
                    }
                }
                None => self.rpc.context().emit(EventPayload::info(line)),
            }
        })
    }
}

// ── Pure mapping ─────────────────────────────────────────────────────────────

/// Tool name used for gating; tool kinds map onto the common tool names so
/// allow-lists and permission modes behave the same across agents.
#[must_use]
pub fn tool_name(tool_call: &Value) -> String {
    let kind = tool_call.get("kind").and_then(Value::as_str);
    match kind {
        Some("edit") => "Edit".into(),
        Some("execute") => "Bash".into(),
        _ => tool_call
            .get("title")
            .and_then(Value::as_str)
            .or(kind)
            .unwrap_or("unknown")
            .to_owned(),
    }
}

/// Permission response body for `decision` given the offered options.
#[must_use]
pub fn select_option(options: &[Value], decision: &ApprovalDecision) -> Value {
    let preferred: &[&str] = match decision {
        ApprovalDecision::Allow { remember: true, .. } => &["allow_always", "allow_once"],
        ApprovalDecision::Allow { .. } => &["allow_once", "allow_always"],
        ApprovalDecision::Deny { .. } => &["reject_once", "reject_always"],
    };

    let chosen = preferred.iter().find_map(|kind| {
        options
            .iter()
            .find(|option| option.get("kind").and_then(Value::as_str) == Some(*kind))
            .and_then(|option| option.get("optionId"))
            .cloned()
    });

    match chosen {
        Some(option_id) => json!({"outcome": {"outcome": "selected", "optionId": option_id}}),
        None => json!({"outcome": {"outcome": "cancelled"}}),
    }
}

/// Map a `session/update` notification's params to normalized payloads.
#[must_use]
pub fn map_session_update(params: &Value) -> Vec<EventPayload> {
    let Some(update) = params.get("update") else {
        return Vec::new();
    };
    let text_of = |update: &Value| {
        update
            .get("content")
            .filter(|c| c.get("type").and_then(Value::as_str) == Some("text"))
            .and_then(|c| c.get("text"))
            .and_then(Value::as_str)
            .map(str::to_owned)
    };

    match update.get("sessionUpdate").and_then(Value::as_str) {
        Some("agent_message_chunk") => text_of(update)
            .map(|text| EventPayload::AgentTextDelta { text })
            .into_iter()
            .collect(),
        Some("agent_thought_chunk") => text_of(update)
            .map(|text| EventPayload::AgentThinkingDelta { text })
            .into_iter()
            .collect(),
        Some("tool_call") => map_tool_call(update),
        Some("tool_call_update") => map_tool_call_end(update).into_iter().collect(),
        Some("plan") => vec![EventPayload::info(render_plan(update))],
        Some("current_mode_update") => update
            .get("currentModeId")
            .and_then(Value::as_str)
            .map(|mode| EventPayload::info(format!("mode: {mode}")))
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

fn map_tool_call(update: &Value) -> Vec<EventPayload> {
    let Some(id) = update.get("toolCallId").and_then(Value::as_str) else {
        return Vec::new();
    };
    let mut payloads = vec![EventPayload::AgentToolStart {
        tool_call_id: id.to_owned(),
        tool_name: tool_name(update),
        input: update.get("rawInput").cloned().unwrap_or(Value::Null),
    }];
    payloads.extend(map_tool_call_end(update));
    payloads
}

fn map_tool_call_end(update: &Value) -> Option<EventPayload> {
    let status = update.get("status").and_then(Value::as_str)?;
    if status != "completed" && status != "failed" {
        return None;
    }
    Some(EventPayload::AgentToolEnd {
        tool_call_id: update.get("toolCallId")?.as_str()?.to_owned(),
        content: render_content(update.get("content")),
        is_error: status == "failed",
    })
}

fn render_content(content: Option<&Value>) -> String {
    let Some(items) = content.and_then(Value::as_array) else {
        return String::new();
    };
    items
        .iter()
        .map(|item| match item.get("type").and_then(Value::as_str) {
            Some("content") => item
                .get("content")
                .and_then(|c| c.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_owned(),
            Some("diff") => format!(
                "diff: {}",
                item.get("path").and_then(Value::as_str).unwrap_or("?")
            ),
            _ => item.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_plan(update: &Value) -> String {
    let entries = update
        .get("entries")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let mut lines = vec!["Plan:".to_owned()];
    for entry in entries {
        lines.push(format!(
            "[{}] {}",
            entry.get("status").and_then(Value::as_str).unwrap_or("pending"),
            entry.get("content").and_then(Value::as_str).unwrap_or("")
        ));
    }
    lines.join("\n")
}

/// Map a `session/prompt` result to the turn's `agent:result`.
#[must_use]
pub fn map_prompt_result(result: &Value) -> EventPayload {
    let stop_reason = result
        .get("stopReason")
        .and_then(Value::as_str)
        .unwrap_or("end_turn");
    EventPayload::AgentResult {
        is_error: stop_reason == "refusal",
        subtype: Some(stop_reason.to_owned()),
        result: None,
        total_cost_usd: None,
        num_turns: None,
        duration_ms: None,
        model_usage: None,
        permission_denials: Vec::new(),
    }
}
