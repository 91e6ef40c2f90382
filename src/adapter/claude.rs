//! Adapter for CLIs speaking line-delimited stream-json.
//!
//! The process is launched with `--input-format stream-json
//! --output-format stream-json --permission-prompt-tool stdio`, so user
//! turns, control requests, and tool permission prompts all travel over
//! stdio as one JSON object per line.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use super::process::{launch, CommandSpec, LineHandler, ShellContext};
use super::{
    AgentAdapter, ApprovalHook, ModelControl, PermissionModeControl, ProcessHandle, SpawnOptions,
    ToolResultSink,
};
use crate::approval::{ApprovalDecision, ApprovalRequest};
use crate::config::AgentCommand;
use crate::models::control::ImageAttachment;
use crate::models::event::EventPayload;
use crate::models::session::{AgentKind, PermissionMode};
use crate::{AppError, Result};

type ControlReply = oneshot::Sender<Result<Value>>;

/// Stream-json adapter. One instance drives one process at a time.
pub struct ClaudeAdapter {
    command: AgentCommand,
    link: Mutex<Option<Arc<ClaudeLink>>>,
}

struct ClaudeLink {
    ctx: ShellContext,
    requests: Arc<ControlRequests>,
    timeout: Duration,
}

#[derive(Default)]
struct ControlRequests {
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, ControlReply>>,
}

impl ClaudeAdapter {
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
        let spec = CommandSpec {
            program: self.command.command.clone(),
            args: build_args(
                &self.command.args,
                opts.permission_mode,
                resume_ref,
                opts.model.as_deref(),
            ),
            cwd: opts.cwd.clone(),
            env: opts.env.clone(),
        };

        let requests = Arc::new(ControlRequests::default());
        let hook = Arc::clone(&opts.approval_hook);
        let handler_requests = Arc::clone(&requests);
        let (handle, ctx) = launch(spec, &opts.session_id, move |ctx| ClaudeHandler {
            ctx,
            requests: handler_requests,
            hook,
        })?;

        let link = Arc::new(ClaudeLink {
            ctx,
            requests,
            timeout: opts.handshake_timeout,
        });
        *self.link.lock().await = Some(Arc::clone(&link));

        let prompt = prompt.to_owned();
        tokio::spawn(async move {
            let handshake = async {
                link.control(json!({"subtype": "initialize"})).await?;
                link.send_user(vec![text_block(&prompt)])
            };
            if let Err(err) = handshake.await {
                link.ctx.fail_init(&err);
            }
        });

        Ok(handle)
    }

    async fn active_link(&self) -> Result<Arc<ClaudeLink>> {
        self.link
            .lock()
            .await
            .as_ref()
            .filter(|link| link.ctx.is_running())
            .cloned()
            .ok_or_else(|| AppError::Adapter("no active agent session".into()))
    }
}

impl ClaudeLink {
    async fn control(&self, request: Value) -> Result<Value> {
        let n = self.requests.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request_id = format!("req_{n}");
        let (tx, rx) = oneshot::channel();
        self.requests
            .pending
            .lock()
            .await
            .insert(request_id.clone(), tx);

        let subtype = request
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        self.ctx.send(json!({
            "type": "control_request",
            "request_id": request_id,
            "request": request,
        }))?;

        let wait = async {
            tokio::select! {
                biased;
                reply = rx => reply.ok(),
                () = self.ctx.exited() => None,
            }
        };
        match tokio::time::timeout(self.timeout, wait).await {
            Ok(Some(reply)) => reply,
            Ok(None) => Err(AppError::Adapter(format!(
                "{subtype} abandoned: agent process exited"
            ))),
            Err(_) => {
                self.requests.pending.lock().await.remove(&request_id);
                Err(AppError::Protocol(format!(
                    "{subtype} control request timed out"
                )))
            }
        }
    }

    fn send_user(&self, content: Vec<Value>) -> Result<()> {
        self.ctx.send(json!({
            "type": "user",
            "message": {"role": "user", "content": content},
        }))
    }
}

impl AgentAdapter for ClaudeAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Claude
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
            let mut content = Vec::with_capacity(2);
            if let Some(image) = image {
                content.push(json!({
                    "type": "image",
                    "source": {"type": "base64", "media_type": image.media_type, "data": image.data},
                }));
            }
            content.push(text_block(text));
            link.send_user(content)
        })
    }

    fn interrupt(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let link = self.active_link().await?;
            link.control(json!({"subtype": "interrupt"})).await.map(|_| ())
        })
    }

    fn extract_session_id(&self, line: &str) -> Option<String> {
        let value: Value = serde_json::from_str(line).ok()?;
        if value.get("type").and_then(Value::as_str) != Some("system")
            || value.get("subtype").and_then(Value::as_str) != Some("init")
        {
            return None;
        }
        value
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    fn permission_mode_control(&self) -> Option<&dyn PermissionModeControl> {
        Some(self)
    }

    fn model_control(&self) -> Option<&dyn ModelControl> {
        Some(self)
    }

    fn tool_result_sink(&self) -> Option<&dyn ToolResultSink> {
        Some(self)
    }
}

impl PermissionModeControl for ClaudeAdapter {
    fn set_permission_mode(&self, mode: PermissionMode) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let link = self.active_link().await?;
            link.control(json!({"subtype": "set_permission_mode", "mode": mode.as_wire()}))
                .await
                .map(|_| ())
        })
    }
}

impl ModelControl for ClaudeAdapter {
    fn set_model<'a>(&'a self, model: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let link = self.active_link().await?;
            link.control(json!({"subtype": "set_model", "model": model}))
                .await
                .map(|_| ())
        })
    }
}

impl ToolResultSink for ClaudeAdapter {
    fn send_tool_result<'a>(
        &'a self,
        tool_use_id: &'a str,
        content: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let link = self.active_link().await?;
            link.send_user(vec![json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
            })])
        })
    }
}

// ── Line handling ────────────────────────────────────────────────────────────

struct ClaudeHandler {
    ctx: ShellContext,
    requests: Arc<ControlRequests>,
    hook: ApprovalHook,
}

impl ClaudeHandler {
    async fn on_control_response(&self, value: &Value) {
        let Some(response) = value.get("response") else {
            return;
        };
        let Some(request_id) = response.get("request_id").and_then(Value::as_str) else {
            return;
        };
        let Some(tx) = self.requests.pending.lock().await.remove(request_id) else {
            debug!(request_id, "control response for unknown request");
            return;
        };

        let outcome = if response.get("subtype").and_then(Value::as_str) == Some("error") {
            Err(AppError::Protocol(
                response
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("control request failed")
                    .to_owned(),
            ))
        } else {
            Ok(response.get("response").cloned().unwrap_or(Value::Null))
        };
        let _ = tx.send(outcome);
    }

    fn on_control_request(&self, value: &Value) {
        let Some(request_id) = value.get("request_id").and_then(Value::as_str) else {
            return;
        };
        let request = value.get("request").cloned().unwrap_or(Value::Null);
        let subtype = request.get("subtype").and_then(Value::as_str).unwrap_or("");

        if subtype != "can_use_tool" {
            let reply = json!({
                "type": "control_response",
                "response": {
                    "subtype": "error",
                    "request_id": request_id,
                    "error": format!("unsupported control request: {subtype}"),
                },
            });
            if let Err(err) = self.ctx.send(reply) {
                warn!(error = %err, "failed to reject control request");
            }
            return;
        }

        let approval = ApprovalRequest {
            approval_id: request_id.to_owned(),
            tool_name: request
                .get("tool_name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_owned(),
            input: request.get("input").cloned().unwrap_or(Value::Null),
            tool_use_id: request
                .get("tool_use_id")
                .and_then(Value::as_str)
                .map(str::to_owned),
        };

        let hook = Arc::clone(&self.hook);
        let ctx = self.ctx.clone();
        let request_id = request_id.to_owned();
        tokio::spawn(async move {
            let input = approval.input.clone();
            let decision = hook(approval).await;
            let reply = json!({
                "type": "control_response",
                "response": {
                    "subtype": "success",
                    "request_id": request_id,
                    "response": permission_response(&decision, &input),
                },
            });
            if let Err(err) = ctx.send(reply) {
                warn!(request_id, error = %err, "failed to answer permission request");
            }
        });
    }
}

impl LineHandler for ClaudeHandler {
    fn handle_line(&mut self, line: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Ok(value) = serde_json::from_str::<Value>(&line) else {
                debug!(session_id = %self.ctx.session_id(), "skipping non-json line");
                return;
            };
            match value.get("type").and_then(Value::as_str) {
                Some("control_response") => self.on_control_response(&value).await,
                Some("control_request") => self.on_control_request(&value),
                _ => {
                    for payload in map_message(&value) {
                        self.ctx.emit(payload);
                    }
                }
            }
        })
    }
}

// ── Pure mapping ─────────────────────────────────────────────────────────────

/// Command-line arguments for a launch.
#[must_use]
pub fn build_args(
    base: &[String],
    mode: PermissionMode,
    resume_ref: Option<&str>,
    model: Option<&str>,
) -> Vec<String> {
    let mut args: Vec<String> = base.to_vec();
    args.extend(
        [
            "--print",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
            "--permission-prompt-tool",
            "stdio",
            "--permission-mode",
            mode.as_wire(),
        ]
        .map(str::to_owned),
    );
    if let Some(resume_ref) = resume_ref {
        args.push("--resume".into());
        args.push(resume_ref.to_owned());
    }
    if let Some(model) = model {
        args.push("--model".into());
        args.push(model.to_owned());
    }
    args
}

/// Body of a `can_use_tool` answer.
#[must_use]
pub fn permission_response(decision: &ApprovalDecision, input: &Value) -> Value {
    match decision {
        ApprovalDecision::Allow { updated_input, .. } => json!({
            "behavior": "allow",
            "updatedInput": updated_input.clone().unwrap_or_else(|| input.clone()),
        }),
        ApprovalDecision::Deny { reason } => json!({
            "behavior": "deny",
            "message": reason,
        }),
    }
}

/// Map one stdout line to normalized payloads. Malformed lines map to none.
#[must_use]
pub fn parse_line(line: &str) -> Vec<EventPayload> {
    serde_json::from_str::<Value>(line)
        .map(|value| map_message(&value))
        .unwrap_or_default()
}

fn map_message(value: &Value) -> Vec<EventPayload> {
    match value.get("type").and_then(Value::as_str) {
        Some("system") => map_system(value).into_iter().collect(),
        Some("assistant") => map_assistant(value),
        Some("user") => map_tool_results(value),
        Some("result") => vec![map_result(value)],
        Some("stream_event") => map_stream_event(value).into_iter().collect(),
        Some("rate_limit_event") => vec![map_rate_limit(value)],
        _ => Vec::new(),
    }
}

fn map_system(value: &Value) -> Option<EventPayload> {
    let subtype = value.get("subtype").and_then(Value::as_str).unwrap_or("");
    if subtype == "init" {
        let session_ref = value.get("session_id").and_then(Value::as_str)?;
        return Some(EventPayload::SessionInit {
            session_ref: session_ref.to_owned(),
            model: value
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_owned),
            tools: value
                .get("tools")
                .and_then(Value::as_array)
                .map(|tools| {
                    tools
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
        });
    }

    let message = value
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| format!("system: {subtype}"), str::to_owned);
    Some(EventPayload::info(message))
}

fn content_blocks(value: &Value) -> &[Value] {
    value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn map_assistant(value: &Value) -> Vec<EventPayload> {
    content_blocks(value)
        .iter()
        .filter_map(|block| match block.get("type").and_then(Value::as_str)? {
            "text" => Some(EventPayload::AgentText {
                text: block.get("text")?.as_str()?.to_owned(),
            }),
            "thinking" => Some(EventPayload::AgentThinking {
                text: block.get("thinking")?.as_str()?.to_owned(),
            }),
            "tool_use" => Some(EventPayload::AgentToolStart {
                tool_call_id: block.get("id")?.as_str()?.to_owned(),
                tool_name: block.get("name")?.as_str()?.to_owned(),
                input: block.get("input").cloned().unwrap_or(Value::Null),
            }),
            _ => None,
        })
        .collect()
}

fn map_tool_results(value: &Value) -> Vec<EventPayload> {
    content_blocks(value)
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
        .filter_map(|block| {
            Some(EventPayload::AgentToolEnd {
                tool_call_id: block.get("tool_use_id")?.as_str()?.to_owned(),
                content: render_tool_content(block.get("content").unwrap_or(&Value::Null)),
                is_error: block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        })
        .collect()
}

/// Flatten tool result content (string or block list) to text.
#[must_use]
pub fn render_tool_content(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .map(|block| match block.get("type").and_then(Value::as_str) {
                Some("text") => block
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_owned(),
                Some("image") => "[image]".to_owned(),
                _ => block.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn map_result(value: &Value) -> EventPayload {
    EventPayload::AgentResult {
        is_error: value
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        subtype: value
            .get("subtype")
            .and_then(Value::as_str)
            .map(str::to_owned),
        result: value
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_owned),
        total_cost_usd: value.get("total_cost_usd").and_then(Value::as_f64),
        num_turns: value.get("num_turns").and_then(Value::as_u64),
        duration_ms: value.get("duration_ms").and_then(Value::as_u64),
        model_usage: value.get("modelUsage").cloned(),
        permission_denials: value
            .get("permission_denials")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
    }
}

fn map_stream_event(value: &Value) -> Option<EventPayload> {
    let event = value.get("event")?;
    if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
        return None;
    }
    let delta = event.get("delta")?;
    match delta.get("type").and_then(Value::as_str)? {
        "text_delta" => Some(EventPayload::AgentTextDelta {
            text: delta.get("text")?.as_str()?.to_owned(),
        }),
        "thinking_delta" => Some(EventPayload::AgentThinkingDelta {
            text: delta.get("thinking")?.as_str()?.to_owned(),
        }),
        _ => None,
    }
}

fn map_rate_limit(value: &Value) -> EventPayload {
    let info = value.get("rate_limit_info").unwrap_or(value);
    let status = info
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("limited");
    let resets_at = info.get("resetsAt").and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    EventPayload::SystemRateLimit {
        message: format!("rate limit: {status}"),
        resets_at,
    }
}

fn text_block(text: &str) -> Value {
    json!({"type": "text", "text": text})
}
