//! Adapter for the thread/turn app-server protocol (JSON-RPC 2.0).
//!
//! Handshake: `initialize` → `initialized` notification → `thread/start`
//! (or `thread/resume`) → `turn/start`. Items stream as `item/*`
//! notifications and each turn ends with `turn/completed`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::jsonrpc::{classify, Incoming, RpcClient, METHOD_NOT_FOUND};
use super::process::{launch, CommandSpec, LineHandler};
use super::{AgentAdapter, ApprovalHook, ModelControl, ProcessHandle, SpawnOptions};
use crate::approval::{ApprovalDecision, ApprovalRequest};
use crate::config::AgentCommand;
use crate::models::control::ImageAttachment;
use crate::models::event::EventPayload;
use crate::models::session::{AgentKind, PermissionMode};
use crate::{AppError, Result};

type TurnSlot = Arc<Mutex<Option<String>>>;

/// App-server adapter. One instance drives one process at a time.
pub struct CodexAdapter {
    command: AgentCommand,
    link: Mutex<Option<Arc<CodexLink>>>,
}

struct CodexLink {
    rpc: Arc<RpcClient>,
    thread: Mutex<Option<String>>,
    turn: TurnSlot,
    model: Mutex<Option<String>>,
    timeout: Duration,
}

struct Launch {
    prompt: String,
    resume_ref: Option<String>,
    cwd: PathBuf,
    mode: PermissionMode,
}

impl CodexAdapter {
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
        let turn: TurnSlot = Arc::new(Mutex::new(None));
        let handler_turn = Arc::clone(&turn);
        let mut shared = None;
        let (handle, _ctx) = launch(spec, &opts.session_id, |ctx| {
            let rpc = Arc::new(RpcClient::new(ctx));
            shared = Some(Arc::clone(&rpc));
            CodexHandler {
                rpc,
                hook,
                turn: handler_turn,
            }
        })?;
        let rpc = shared.ok_or_else(|| AppError::Adapter("rpc client not initialized".into()))?;

        let link = Arc::new(CodexLink {
            rpc,
            thread: Mutex::new(None),
            turn,
            model: Mutex::new(opts.model.clone()),
            timeout: opts.handshake_timeout,
        });
        *self.link.lock().await = Some(Arc::clone(&link));

        let launch_args = Launch {
            prompt: prompt.to_owned(),
            resume_ref: resume_ref.map(str::to_owned),
            cwd,
            mode: opts.permission_mode,
        };
        tokio::spawn(async move {
            if let Err(err) = link.handshake(launch_args).await {
                link.rpc.context().fail_init(&err);
            }
        });

        Ok(handle)
    }

    async fn active_link(&self) -> Result<Arc<CodexLink>> {
        self.link
            .lock()
            .await
            .as_ref()
            .filter(|link| link.rpc.context().is_running())
            .cloned()
            .ok_or_else(|| AppError::Adapter("no active agent thread".into()))
    }
}

impl CodexLink {
    async fn handshake(&self, launch: Launch) -> Result<()> {
        let timeout = Some(self.timeout);
        self.rpc
            .request(
                "initialize",
                json!({
                    "clientInfo": {
                        "name": "agent_supervisor",
                        "title": "Agent Supervisor",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
                timeout,
            )
            .await?;
        self.rpc.notify("initialized", json!({}))?;

        let model = self.model.lock().await.clone();
        let result = match &launch.resume_ref {
            Some(thread_id) => {
                self.rpc
                    .request("thread/resume", json!({"threadId": thread_id}), timeout)
                    .await?
            }
            None => {
                self.rpc
                    .request(
                        "thread/start",
                        json!({
                            "cwd": launch.cwd.display().to_string(),
                            "approvalPolicy": approval_policy(launch.mode),
                            "sandbox": sandbox_mode(launch.mode),
                            "model": model,
                        }),
                        timeout,
                    )
                    .await?
            }
        };

        let thread_id = result
            .get("thread")
            .and_then(|t| t.get("id"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or(launch.resume_ref)
            .ok_or_else(|| AppError::Protocol("thread response carried no thread id".into()))?;

        *self.thread.lock().await = Some(thread_id.clone());
        self.rpc.context().emit(EventPayload::SessionInit {
            session_ref: thread_id,
            model: result
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_owned),
            tools: Vec::new(),
        });

        self.start_turn(vec![json!({"type": "text", "text": launch.prompt})])
            .await
    }

    async fn start_turn(&self, input: Vec<Value>) -> Result<()> {
        let thread_id = self
            .thread
            .lock()
            .await
            .clone()
            .ok_or_else(|| AppError::Adapter("no active agent thread".into()))?;

        let mut params = json!({"threadId": thread_id, "input": input});
        if let Some(model) = self.model.lock().await.clone() {
            params["model"] = Value::String(model);
        }

        let result = self
            .rpc
            .request("turn/start", params, Some(self.timeout))
            .await?;
        if let Some(turn_id) = result
            .get("turn")
            .and_then(|t| t.get("id"))
            .and_then(Value::as_str)
        {
            *self.turn.lock().await = Some(turn_id.to_owned());
        }
        Ok(())
    }
}

impl AgentAdapter for CodexAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Codex
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
            if link.thread.lock().await.is_none() {
                return Err(AppError::Adapter("no active agent thread".into()));
            }

            let mut input = vec![json!({"type": "text", "text": text})];
            if let Some(image) = image {
                input.push(json!({
                    "type": "image",
                    "url": format!("data:{};base64,{}", image.media_type, image.data),
                }));
            }

            tokio::spawn(async move {
                if let Err(err) = link.start_turn(input).await {
                    warn!(error = %err, "turn/start failed");
                    link.rpc
                        .context()
                        .emit(EventPayload::error(format!("failed to start turn: {err}")));
                }
            });
            Ok(())
        })
    }

    fn interrupt(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let link = self.active_link().await?;
            let thread_id = link.thread.lock().await.clone();
            let turn_id = link.turn.lock().await.clone();
            let (Some(thread_id), Some(turn_id)) = (thread_id, turn_id) else {
                debug!("no turn in progress to interrupt");
                return Ok(());
            };
            link.rpc
                .request(
                    "turn/interrupt",
                    json!({"threadId": thread_id, "turnId": turn_id}),
                    Some(link.timeout),
                )
                .await
                .map(|_| ())
        })
    }

    fn extract_session_id(&self, line: &str) -> Option<String> {
        let thread = match classify(line)? {
            Incoming::Response {
                outcome: Ok(result),
                ..
            } => result.get("thread").cloned(),
            Incoming::Notification { method, params } if method == "thread/started" => {
                params.get("thread").cloned()
            }
            _ => None,
        }?;
        thread.get("id").and_then(Value::as_str).map(str::to_owned)
    }

    fn model_control(&self) -> Option<&dyn ModelControl> {
        Some(self)
    }
}

impl ModelControl for CodexAdapter {
    fn set_model<'a>(&'a self, model: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let link = self.active_link().await?;
            *link.model.lock().await = Some(model.to_owned());
            Ok(())
        })
    }
}

// ── Line handling ────────────────────────────────────────────────────────────

struct CodexHandler {
    rpc: Arc<RpcClient>,
    hook: ApprovalHook,
    turn: TurnSlot,
}

impl CodexHandler {
    fn on_approval_request(&self, id: Value, tool_name: &str, params: Value) {
        let item_id = params
            .get("itemId")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let request = ApprovalRequest {
            approval_id: item_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            tool_name: tool_name.to_owned(),
            input: params,
            tool_use_id: item_id,
        };

        let hook = Arc::clone(&self.hook);
        let rpc = Arc::clone(&self.rpc);
        tokio::spawn(async move {
            let decision = hook(request).await;
            let reply = json!({"decision": approval_decision(&decision)});
            if let Err(err) = rpc.respond(id, reply) {
                warn!(error = %err, "failed to answer approval request");
            }
        });
    }
}

impl LineHandler for CodexHandler {
    fn handle_line(&mut self, line: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match classify(&line) {
                Some(Incoming::Response { id, outcome }) => {
                    if !self.rpc.resolve(id, outcome).await {
                        self.rpc.context().emit(EventPayload::info(line));
                    }
                }
                Some(Incoming::Notification { method, params }) => {
                    match method.as_str() {
                        "turn/started" => {
                            if let Some(turn_id) = params
                                .get("turn")
                                .and_then(|t| t.get("id"))
                                .and_then(Value::as_str)
                            {
                                *self.turn.lock().await = Some(turn_id.to_owned());
                            }
                        }
                        "turn/completed" => {
                            *self.turn.lock().await = None;
                        }
                        _ => {}
                    }
                    for payload in map_notification(&method, &params) {
                        self.rpc.context().emit(payload);
                    }
                }
                Some(Incoming::Request { id, method, params }) => match method.as_str() {
                    "item/commandExecution/requestApproval" => {
                        self.on_approval_request(id, "Bash", params);
                    }
                    "item/fileChange/requestApproval" => {
                        self.on_approval_request(id, "Edit", params);
                    }
                    _ => {
                        if let Err(err) = self.rpc.respond_error(
                            id,
                            METHOD_NOT_FOUND,
                            &format!("method not found: {method}"),
                        ) {
                            warn!(error = %err, "failed to reject request");
                        }
                    }
                },
                None => self.rpc.context().emit(EventPayload::info(line)),
            }
        })
    }
}

// ── Pure mapping ─────────────────────────────────────────────────────────────

/// `approvalPolicy` sent with `thread/start`.
#[must_use]
pub fn approval_policy(mode: PermissionMode) -> &'static str {
    match mode {
        PermissionMode::Default | PermissionMode::Plan => "untrusted",
        PermissionMode::AcceptEdits => "on-request",
        PermissionMode::BypassPermissions => "never",
    }
}

/// `sandbox` sent with `thread/start`.
#[must_use]
pub fn sandbox_mode(mode: PermissionMode) -> &'static str {
    match mode {
        PermissionMode::Plan => "read-only",
        PermissionMode::Default | PermissionMode::AcceptEdits => "workspace-write",
        PermissionMode::BypassPermissions => "danger-full-access",
    }
}

/// Wire decision for an approval request.
#[must_use]
pub fn approval_decision(decision: &ApprovalDecision) -> &'static str {
    match decision {
        ApprovalDecision::Allow { remember: true, .. } => "acceptForSession",
        ApprovalDecision::Allow { .. } => "accept",
        ApprovalDecision::Deny { .. } => "decline",
    }
}

/// Map one server notification to normalized payloads.
#[must_use]
pub fn map_notification(method: &str, params: &Value) -> Vec<EventPayload> {
    let delta = || {
        params
            .get("delta")
            .and_then(Value::as_str)
            .map(str::to_owned)
    };

    match method {
        "item/started" => params
            .get("item")
            .and_then(map_item_started)
            .into_iter()
            .collect(),
        "item/completed" => params
            .get("item")
            .and_then(map_item_completed)
            .into_iter()
            .collect(),
        "item/agentMessage/delta" => delta()
            .map(|text| EventPayload::AgentTextDelta { text })
            .into_iter()
            .collect(),
        "item/reasoning/textDelta" | "item/reasoning/summaryTextDelta" => delta()
            .map(|text| EventPayload::AgentThinkingDelta { text })
            .into_iter()
            .collect(),
        "turn/completed" => vec![map_turn_completed(params)],
        "error" => {
            let message = params
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("agent reported an error");
            vec![EventPayload::error(message)]
        }
        _ => Vec::new(),
    }
}

fn map_turn_completed(params: &Value) -> EventPayload {
    let turn = params.get("turn").unwrap_or(&Value::Null);
    let status = turn
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("completed");
    EventPayload::AgentResult {
        is_error: status == "failed",
        subtype: Some(status.to_owned()),
        result: turn
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .map(str::to_owned),
        total_cost_usd: None,
        num_turns: None,
        duration_ms: None,
        model_usage: None,
        permission_denials: Vec::new(),
    }
}

fn item_tool(item: &Value) -> Option<(String, Value)> {
    match item.get("type").and_then(Value::as_str)? {
        "commandExecution" => Some((
            "Bash".into(),
            json!({
                "command": item.get("command").cloned().unwrap_or(Value::Null),
                "cwd": item.get("cwd").cloned().unwrap_or(Value::Null),
            }),
        )),
        "fileChange" => Some((
            "Edit".into(),
            json!({"changes": item.get("changes").cloned().unwrap_or(Value::Null)}),
        )),
        "mcpToolCall" => Some((
            format!(
                "mcp__{}__{}",
                item.get("server").and_then(Value::as_str).unwrap_or("unknown"),
                item.get("tool").and_then(Value::as_str).unwrap_or("unknown")
            ),
            item.get("arguments").cloned().unwrap_or(Value::Null),
        )),
        "webSearch" => Some((
            "WebSearch".into(),
            json!({"query": item.get("query").cloned().unwrap_or(Value::Null)}),
        )),
        _ => None,
    }
}

fn map_item_started(item: &Value) -> Option<EventPayload> {
    let (tool_name, input) = item_tool(item)?;
    Some(EventPayload::AgentToolStart {
        tool_call_id: item.get("id")?.as_str()?.to_owned(),
        tool_name,
        input,
    })
}

fn map_item_completed(item: &Value) -> Option<EventPayload> {
    let strings = |key: &str| -> Vec<String> {
        item.get(key)
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    };

    match item.get("type").and_then(Value::as_str)? {
        "agentMessage" => Some(EventPayload::AgentText {
            text: item.get("text")?.as_str()?.to_owned(),
        }),
        "reasoning" => {
            let mut parts = strings("summary");
            parts.extend(strings("content"));
            (!parts.is_empty()).then(|| EventPayload::AgentThinking {
                text: parts.join("\n"),
            })
        }
        _ => {
            item_tool(item)?;
            let status = item.get("status").and_then(Value::as_str).unwrap_or("");
            let failed = matches!(status, "failed" | "declined")
                || item
                    .get("exitCode")
                    .and_then(Value::as_i64)
                    .is_some_and(|code| code != 0);
            let content = item
                .get("aggregatedOutput")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .or_else(|| item.get("result").map(Value::to_string))
                .unwrap_or_else(|| status.to_owned());
            Some(EventPayload::AgentToolEnd {
                tool_call_id: item.get("id")?.as_str()?.to_owned(),
                content,
                is_error: failed,
            })
        }
    }
}
