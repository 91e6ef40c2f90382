//! Session supervisor: one task per claimed session.
//!
//! The supervisor owns the adapter, the approval gate, and the log sink of
//! a single run. Everything that touches session state happens inside one
//! `tokio::select!` loop, so process output, control messages, approval
//! requests, and timers are handled strictly one at a time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

use super::exit::{compute_exit_resolution, ExitContext, Restart};
use crate::adapter::process::child_env;
use crate::adapter::{
    AdapterEvent, AdapterFactory, AgentAdapter, ApprovalHook, KillSignal, ProcessHandle,
    SpawnOptions,
};
use crate::approval::{ApprovalDecision, ApprovalGate, ApprovalRequest, ASK_USER_TOOL};
use crate::bus::{control_channel, events_channel, EventBus, Subscription};
use crate::config::GlobalConfig;
use crate::logsink::{LogSink, LogSinkFactory, LogStats, StreamTag};
use crate::models::control::{ControlMessage, ImageAttachment};
use crate::models::event::{Event, EventPayload};
use crate::models::session::{PermissionMode, SessionPatch, SessionStatus};
use crate::persistence::SessionStore;
use crate::queue::JobQueue;
use crate::{AppError, Result};

/// Exit code reported when the agent process could not be spawned.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Content of the synthetic tool end sent on cancel, interrupt, and redirect.
pub const INTERRUPTED_CONTENT: &str = "[Interrupted by user]";

/// Content of the synthetic tool end sent when the process exits mid-call.
pub const PROCESS_EXITED_CONTENT: &str = "[Process exited]";

/// Prompt used when a run restarts to apply a setting.
pub const CONTINUE_PROMPT: &str = "Please continue where you left off.";

const UNANSWERED_QUESTION: &str =
    "The user did not answer in time. Treat the question as declined and continue.";

/// Shared collaborators handed to every supervisor.
#[derive(Clone)]
pub struct SupervisorDeps {
    /// Session persistence.
    pub sessions: Arc<dyn SessionStore>,
    /// Event and control transport.
    pub bus: Arc<dyn EventBus>,
    /// Queue used for restarts.
    pub queue: Arc<dyn JobQueue>,
    /// Log sink factory.
    pub logs: Arc<dyn LogSinkFactory>,
    /// Adapter factory.
    pub adapters: Arc<dyn AdapterFactory>,
    /// Worker configuration.
    pub config: Arc<GlobalConfig>,
}

/// Arguments of [`SessionSupervisor::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// Prompt for the first turn.
    pub prompt: String,
    /// Conversation to resume; `None` starts fresh.
    pub resume_ref: Option<String>,
    /// Working directory override.
    pub cwd: Option<String>,
}

/// How a supervised run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Persisted final status.
    pub status: SessionStatus,
    /// Exit code of the process, synthetic on spawn or init failure.
    pub exit_code: Option<i32>,
    /// Restart that was enqueued.
    pub restart: Option<Restart>,
    /// Crash diagnostic, if any.
    pub diagnostic: Option<String>,
}

/// Entry point for supervising one session.
pub struct SessionSupervisor {
    session_id: String,
    deps: SupervisorDeps,
}

impl SessionSupervisor {
    /// Create a supervisor for `session_id`.
    #[must_use]
    pub fn new(session_id: impl Into<String>, deps: SupervisorDeps) -> Self {
        Self {
            session_id: session_id.into(),
            deps,
        }
    }

    /// Claim the session and supervise one run until its process exits.
    ///
    /// Returns `Ok(None)` when the claim is refused because another worker
    /// owns the session or its status forbids a claim.
    ///
    /// # Errors
    ///
    /// Returns an error if the claim query fails or the run cannot be set up
    /// (log sink, control subscription). Setup failures release the claim
    /// and mark the session `ended` first.
    pub async fn start(&self, request: StartRequest) -> Result<Option<RunOutcome>> {
        let worker_id = self.deps.config.worker_id.as_str();
        if !self.deps.sessions.claim(&self.session_id, worker_id).await? {
            info!(session_id = %self.session_id, worker_id, "claim refused");
            return Ok(None);
        }

        let span = info_span!("session", session_id = %self.session_id, worker_id);
        async {
            info!("session claimed");
            match self.prepare(&request).await {
                Ok((run, control)) => Ok(Some(run.drive(request, control).await)),
                Err(err) => {
                    self.abandon(&err).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn prepare(&self, request: &StartRequest) -> Result<(Run, Subscription)> {
        let session = self.deps.sessions.get(&self.session_id).await?;
        let adapter = self.deps.adapters.create(session.agent)?;
        let (sink, log_path) = self.deps.logs.open(&self.session_id)?;

        self.deps
            .sessions
            .update(
                &self.session_id,
                SessionPatch {
                    log_path: Some(log_path),
                    prompt: Some(request.prompt.clone()),
                    ..SessionPatch::default()
                },
            )
            .await?;

        let control = self
            .deps
            .bus
            .subscribe(&control_channel(&self.session_id))
            .await?;

        let run = Run {
            session_id: self.session_id.clone(),
            events_channel: events_channel(&self.session_id),
            deps: self.deps.clone(),
            adapter,
            sink,
            gate: ApprovalGate::new(session.allowed_tools.clone(), session.permission_mode),
            seq: session.event_seq,
            status: SessionStatus::Active,
            resume_ref: request.resume_ref.clone(),
            cwd: request.cwd.clone().or(session.cwd.clone()),
            model: session.model.clone(),
            permission_mode: session.permission_mode,
            idle_timeout: Duration::from_secs(session.idle_timeout_secs),
            in_flight: Vec::new(),
            flags: ExitFlags::default(),
            restart: None,
            queued_prompt: false,
            terminating: false,
            handle: None,
            idle_deadline: None,
            kill_deadline: None,
            warm_deadline: None,
        };
        Ok((run, control))
    }

    async fn abandon(&self, err: &AppError) {
        warn!(error = %err, "failed to set up run; releasing session");
        let patch = SessionPatch {
            status: Some(SessionStatus::Ended),
            owner_worker: Some(None),
            pid: Some(None),
            ended_at: Some(Utc::now()),
            error: Some(Some(err.to_string())),
            ..SessionPatch::default()
        };
        if let Err(release_err) = self.deps.sessions.update(&self.session_id, patch).await {
            warn!(error = %release_err, "failed to release session");
        }
    }
}

/// Deliver a message to a session with no live process: persist it as the
/// next prompt and enqueue a claim-and-resume.
///
/// Returns `false` without changes if the session is live, in which case
/// the message belongs on its control channel.
///
/// # Errors
///
/// Returns an error if the session cannot be loaded or updated, or the
/// enqueue fails.
pub async fn route_cold_message(
    sessions: &dyn SessionStore,
    queue: &dyn JobQueue,
    session_id: &str,
    text: &str,
) -> Result<bool> {
    let session = sessions.get(session_id).await?;
    if session.status.is_live() && session.owner_worker.is_some() {
        return Ok(false);
    }

    sessions
        .update(
            session_id,
            SessionPatch {
                prompt: Some(text.to_owned()),
                ..SessionPatch::default()
            },
        )
        .await?;
    queue.enqueue(session_id, session.resume_ref.clone()).await?;
    info!(session_id, "queued message for cold session");
    Ok(true)
}

// ── Run state ────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
struct ExitFlags {
    cancelled: bool,
    gracefully_terminated: bool,
    idle_timed_out: bool,
    interrupted: bool,
}

struct ApprovalNotice {
    request: ApprovalRequest,
    reply: oneshot::Sender<ApprovalDecision>,
}

struct Run {
    session_id: String,
    events_channel: String,
    deps: SupervisorDeps,
    adapter: Box<dyn AgentAdapter>,
    sink: Box<dyn LogSink>,
    gate: ApprovalGate,
    seq: u64,
    status: SessionStatus,
    resume_ref: Option<String>,
    cwd: Option<String>,
    model: Option<String>,
    permission_mode: PermissionMode,
    idle_timeout: Duration,
    in_flight: Vec<String>,
    flags: ExitFlags,
    restart: Option<Restart>,
    queued_prompt: bool,
    terminating: bool,
    handle: Option<ProcessHandle>,
    idle_deadline: Option<Instant>,
    kill_deadline: Option<Instant>,
    warm_deadline: Option<Instant>,
}

fn approval_hook(tx: mpsc::UnboundedSender<ApprovalNotice>) -> ApprovalHook {
    Arc::new(move |request: ApprovalRequest| -> BoxFuture<'static, ApprovalDecision> {
        let tx = tx.clone();
        Box::pin(async move {
            let (reply, rx) = oneshot::channel();
            if tx.send(ApprovalNotice { request, reply }).is_err() {
                return ApprovalDecision::deny("session is shutting down");
            }
            rx.await
                .unwrap_or_else(|_| ApprovalDecision::deny("session is shutting down"))
        })
    })
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Run {
    async fn drive(mut self, request: StartRequest, control: Subscription) -> RunOutcome {
        let config = Arc::clone(&self.deps.config);
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let opts = SpawnOptions {
            session_id: self.session_id.clone(),
            cwd: self.cwd.clone().map(PathBuf::from),
            env: child_env(std::env::vars(), &config.env.denylist, &self.session_id),
            model: self.model.clone(),
            permission_mode: self.permission_mode,
            approval_hook: approval_hook(notice_tx),
            handshake_timeout: config.timeouts.handshake(),
        };

        self.emit(EventPayload::SessionState {
            status: SessionStatus::Active,
        })
        .await;
        self.echo_user(&request.prompt, false).await;

        let launched = match request.resume_ref.as_deref() {
            Some(resume_ref) => {
                info!(resume_ref, "resuming agent");
                self.adapter.resume(resume_ref, &request.prompt, opts).await
            }
            None => {
                info!("spawning agent");
                self.adapter.spawn(&request.prompt, opts).await
            }
        };

        let exit_code = match launched {
            Ok(mut handle) => match handle.take_events() {
                Some(events) => {
                    let pid = handle.pid();
                    info!(?pid, "agent running");
                    self.patch(SessionPatch {
                        pid: Some(pid),
                        ..SessionPatch::default()
                    })
                    .await;
                    self.handle = Some(handle);
                    self.supervise(events, control, notices).await
                }
                None => Some(SPAWN_FAILURE_EXIT_CODE),
            },
            Err(err) => {
                warn!(error = %err, "failed to start agent");
                self.emit(EventPayload::error(format!("failed to start agent: {err}")))
                    .await;
                Some(SPAWN_FAILURE_EXIT_CODE)
            }
        };

        self.finish(exit_code).await
    }

    async fn supervise(
        &mut self,
        mut events: mpsc::UnboundedReceiver<AdapterEvent>,
        mut control: Subscription,
        mut notices: mpsc::UnboundedReceiver<ApprovalNotice>,
    ) -> Option<i32> {
        let every = self.deps.config.timeouts.heartbeat();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = sleep_until_opt(self.kill_deadline) => self.on_kill_deadline(),

                event = events.recv() => match event {
                    Some(AdapterEvent::Exited { code }) => return code,
                    Some(AdapterEvent::Output { stream, text }) => self.on_output(stream, &text).await,
                    Some(AdapterEvent::Event(payload)) => self.on_agent_event(payload).await,
                    None => {
                        warn!("adapter event stream closed without an exit");
                        return None;
                    }
                },

                Some(notice) = notices.recv() => self.on_approval_notice(notice).await,

                Some(message) = control.recv() => self.on_control(message).await,

                () = sleep_until_opt(self.warm_deadline) => self.on_warm_deadline().await,

                () = sleep_until_opt(self.idle_deadline) => self.on_idle_timeout().await,

                () = sleep_until_opt(self.gate.next_question_deadline()) => {
                    self.expire_questions().await;
                }

                _ = heartbeat.tick() => self.stamp_heartbeat().await,
            }
        }
    }

    // ── Events ───────────────────────────────────────────────────────────────

    /// Sequence, persist, log, then publish one payload.
    async fn emit(&mut self, payload: EventPayload) {
        self.seq += 1;
        let event = Event {
            seq: self.seq,
            timestamp: Utc::now(),
            payload,
        };

        self.patch(SessionPatch {
            event_seq: Some(self.seq),
            ..SessionPatch::default()
        })
        .await;

        if let Err(err) = self.sink.write_event(&event) {
            warn!(seq = event.seq, error = %err, "failed to log event");
        }

        match serde_json::to_value(&event) {
            Ok(value) => {
                if let Err(err) = self.deps.bus.publish(&self.events_channel, value).await {
                    warn!(seq = event.seq, error = %err, "failed to publish event");
                }
            }
            Err(err) => warn!(seq = event.seq, error = %err, "failed to encode event"),
        }
    }

    async fn patch(&self, patch: SessionPatch) {
        if let Err(err) = self.deps.sessions.update(&self.session_id, patch).await {
            warn!(error = %err, "failed to persist session update");
        }
    }

    async fn set_status(&mut self, status: SessionStatus) {
        if self.status == status {
            return;
        }
        self.status = status;
        self.patch(SessionPatch {
            status: Some(status),
            ..SessionPatch::default()
        })
        .await;
        self.emit(EventPayload::SessionState { status }).await;
    }

    async fn echo_user(&mut self, text: &str, has_image: bool) {
        if let Err(err) = self.sink.write(StreamTag::User, text) {
            warn!(error = %err, "failed to log user message");
        }
        self.emit(EventPayload::UserMessage {
            text: text.to_owned(),
            has_image,
        })
        .await;
    }

    async fn on_output(&mut self, stream: StreamTag, text: &str) {
        if let Err(err) = self.sink.write(stream, text) {
            warn!(error = %err, "failed to log agent output");
        }
        if stream == StreamTag::Stdout && self.resume_ref.is_none() {
            if let Some(resume_ref) = self.adapter.extract_session_id(text) {
                self.remember_resume_ref(resume_ref).await;
            }
        }
    }

    async fn remember_resume_ref(&mut self, resume_ref: String) {
        if self.resume_ref.as_deref() == Some(resume_ref.as_str()) {
            return;
        }
        debug!(resume_ref = %resume_ref, "resume reference recorded");
        self.resume_ref = Some(resume_ref.clone());
        self.patch(SessionPatch {
            resume_ref: Some(Some(resume_ref)),
            ..SessionPatch::default()
        })
        .await;
    }

    async fn on_agent_event(&mut self, payload: EventPayload) {
        match &payload {
            EventPayload::SessionInit { session_ref, .. } => {
                self.remember_resume_ref(session_ref.clone()).await;
            }
            EventPayload::AgentToolStart { tool_call_id, .. } => {
                self.in_flight.push(tool_call_id.clone());
            }
            EventPayload::AgentToolEnd { tool_call_id, .. } => {
                self.in_flight.retain(|id| id != tool_call_id);
            }
            _ => {}
        }

        let turn_finished = matches!(payload, EventPayload::AgentResult { .. });
        self.emit(payload).await;

        if turn_finished && !self.terminating {
            self.set_status(SessionStatus::AwaitingInput).await;
            self.arm_idle_timer();
        }
    }

    async fn synthesize_tool_ends(&mut self, content: &str) {
        for tool_call_id in std::mem::take(&mut self.in_flight) {
            self.emit(EventPayload::AgentToolEnd {
                tool_call_id,
                content: content.to_owned(),
                is_error: true,
            })
            .await;
        }
    }

    // ── Approvals ────────────────────────────────────────────────────────────

    async fn on_approval_notice(&mut self, notice: ApprovalNotice) {
        let ApprovalNotice { request, reply } = notice;

        if self.terminating {
            let _ = reply.send(ApprovalDecision::deny("session is shutting down"));
            return;
        }

        if let Some(decision) = self.gate.check(&request.tool_name, &request.input) {
            if request.tool_name == ASK_USER_TOOL {
                let approval_id = request
                    .tool_use_id
                    .clone()
                    .unwrap_or_else(|| request.approval_id.clone());
                let deadline = Instant::now() + self.deps.config.timeouts.ask_user();
                self.gate.register_question(&approval_id, deadline);
                let questions = request
                    .input
                    .get("questions")
                    .cloned()
                    .unwrap_or_else(|| request.input.clone());
                self.emit(EventPayload::AgentAskUser {
                    approval_id,
                    questions,
                })
                .await;
            }
            let _ = reply.send(decision);
            return;
        }

        let superseded = self
            .gate
            .register(&request.approval_id, &request.tool_name, reply);
        if !superseded.is_empty() {
            debug!(tool_name = %request.tool_name, ?superseded, "stale approvals denied");
        }
        self.emit(EventPayload::AgentToolApproval {
            approval_id: request.approval_id,
            tool_name: request.tool_name,
            input: request.input,
        })
        .await;
    }

    async fn expire_questions(&mut self) {
        for approval_id in self.gate.expire_questions(Instant::now()) {
            info!(approval_id = %approval_id, "question expired without an answer");
            self.emit(EventPayload::info(format!(
                "Question {approval_id} expired without an answer"
            )))
            .await;
            self.deliver_answer(&approval_id, UNANSWERED_QUESTION).await;
        }
    }

    async fn deliver_answer(&mut self, approval_id: &str, answer: &str) {
        let delivered = match self.adapter.tool_result_sink() {
            Some(sink) => sink.send_tool_result(approval_id, answer).await,
            None => self.adapter.send_message(answer, None).await,
        };
        if let Err(err) = delivered {
            self.emit(EventPayload::error(format!("failed to deliver answer: {err}")))
                .await;
        }
    }

    // ── Control ──────────────────────────────────────────────────────────────

    async fn on_control(&mut self, raw: Value) {
        let message: ControlMessage = match serde_json::from_value(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "ignoring malformed control message");
                return;
            }
        };
        debug!(kind = message.kind(), "control message");

        if self.status == SessionStatus::AwaitingInput && self.idle_deadline.is_some() {
            self.arm_idle_timer();
        }

        match message {
            ControlMessage::Message { text, image } => {
                if self.accepts_input() {
                    self.deliver_message(&text, image.as_ref()).await;
                } else {
                    self.queue_prompt(text).await;
                }
            }
            ControlMessage::Redirect { new_prompt } => self.on_redirect(new_prompt).await,
            ControlMessage::Cancel => self.on_cancel().await,
            ControlMessage::Interrupt => self.on_interrupt().await,
            ControlMessage::ToolApproval {
                approval_id,
                decision,
                updated_input,
                ..
            } => {
                match self.gate.resolve(&approval_id, decision, updated_input) {
                    None => debug!(approval_id = %approval_id, "no pending approval with this id"),
                    Some(resolved) => {
                        info!(
                            approval_id = %approval_id,
                            tool_name = %resolved.tool_name,
                            ?decision,
                            "approval resolved"
                        );
                        if resolved.allow_list_changed {
                            self.patch(SessionPatch {
                                allowed_tools: Some(self.gate.allowed_tools().to_vec()),
                                ..SessionPatch::default()
                            })
                            .await;
                        }
                    }
                }
            }
            ControlMessage::AskUserAnswer {
                approval_id,
                answer,
            } => {
                if !self.gate.answer_question(&approval_id) {
                    debug!(approval_id = %approval_id, "no open question with this id");
                    return;
                }
                self.echo_user(&answer, false).await;
                self.deliver_answer(&approval_id, &answer).await;
                self.set_status(SessionStatus::Active).await;
            }
            ControlMessage::SetModel { model } => self.on_set_model(model).await,
            ControlMessage::SetPermissionMode { mode } => self.on_set_permission_mode(mode).await,
            ControlMessage::ClearContext => {
                self.restart_with(Restart::Fresh, "clearing conversation context")
                    .await;
            }
        }
    }

    fn accepts_input(&self) -> bool {
        self.status.is_live() && !self.terminating
    }

    async fn deliver_message(&mut self, text: &str, image: Option<&ImageAttachment>) {
        self.echo_user(text, image.is_some()).await;
        match self.adapter.send_message(text, image).await {
            Ok(()) => {
                self.idle_deadline = None;
                self.set_status(SessionStatus::Active).await;
            }
            Err(err) => {
                warn!(error = %err, "failed to deliver message");
                self.emit(EventPayload::error(format!("failed to deliver message: {err}")))
                    .await;
            }
        }
    }

    async fn queue_prompt(&mut self, text: String) {
        self.echo_user(&text, false).await;
        self.patch(SessionPatch {
            prompt: Some(text),
            ..SessionPatch::default()
        })
        .await;
        self.queued_prompt = true;
        self.emit(EventPayload::info(
            "Agent is stopping; the message will be sent when the session resumes",
        ))
        .await;
    }

    async fn on_redirect(&mut self, new_prompt: String) {
        if !self.accepts_input() {
            self.queue_prompt(new_prompt).await;
            return;
        }

        self.synthesize_tool_ends(INTERRUPTED_CONTENT).await;
        self.gate.drain("redirected by user");
        let limit = self.deps.config.timeouts.interrupt_grace();
        if let Err(err) = self.interrupt_within(limit).await {
            warn!(error = %err, "interrupt before redirect failed");
        }
        self.patch(SessionPatch {
            prompt: Some(new_prompt.clone()),
            ..SessionPatch::default()
        })
        .await;
        self.deliver_message(&new_prompt, None).await;
    }

    async fn on_cancel(&mut self) {
        if self.flags.cancelled {
            return;
        }
        info!("cancel requested");
        self.flags.cancelled = true;
        self.terminating = true;
        self.idle_deadline = None;
        self.warm_deadline = None;

        self.synthesize_tool_ends(INTERRUPTED_CONTENT).await;
        let drained = self.gate.drain("session cancelled");
        debug!(drained, "approvals drained");

        let grace = self.deps.config.timeouts.kill_grace();
        self.kill_deadline = Some(Instant::now() + grace);
        if let Err(err) = self.interrupt_within(grace).await {
            debug!(error = %err, "interrupt failed; waiting for forced kill");
        }
    }

    async fn on_interrupt(&mut self) {
        if self.terminating {
            return;
        }
        info!("interrupt requested");
        self.flags.interrupted = true;

        self.synthesize_tool_ends(INTERRUPTED_CONTENT).await;
        self.gate.drain("turn interrupted");

        let grace = self.deps.config.timeouts.interrupt_grace();
        self.warm_deadline = Some(Instant::now() + grace);
        if let Err(err) = self.interrupt_within(grace).await {
            warn!(error = %err, "interrupt failed");
            self.emit(EventPayload::error(format!("failed to interrupt agent: {err}")))
                .await;
        }
    }

    /// Ask the agent to stop its turn. The loop is parked meanwhile, so the
    /// request is bounded by `limit`.
    async fn interrupt_within(&self, limit: Duration) -> Result<()> {
        match tokio::time::timeout(limit, self.adapter.interrupt()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Adapter(format!(
                "agent did not acknowledge the interrupt within {}s",
                limit.as_secs()
            ))),
        }
    }

    async fn on_warm_deadline(&mut self) {
        self.warm_deadline = None;
        if self.terminating {
            return;
        }
        // The process outlived the interrupt: keep it.
        self.flags.interrupted = false;
        self.set_status(SessionStatus::AwaitingInput).await;
        self.arm_idle_timer();
    }

    async fn on_set_model(&mut self, model: String) {
        let Some(control) = self.adapter.model_control() else {
            self.patch(SessionPatch {
                model: Some(model.clone()),
                ..SessionPatch::default()
            })
            .await;
            self.emit(EventPayload::error(format!(
                "this agent cannot switch models while running; {model} applies on the next start"
            )))
            .await;
            return;
        };

        match control.set_model(&model).await {
            Ok(()) => {
                self.model = Some(model.clone());
                self.patch(SessionPatch {
                    model: Some(model.clone()),
                    ..SessionPatch::default()
                })
                .await;
                self.emit(EventPayload::info(format!("Model set to {model}")))
                    .await;
            }
            Err(err) => {
                self.emit(EventPayload::error(format!("failed to set model: {err}")))
                    .await;
            }
        }
    }

    async fn on_set_permission_mode(&mut self, mode: PermissionMode) {
        self.gate.set_mode(mode);
        self.permission_mode = mode;
        self.patch(SessionPatch {
            permission_mode: Some(mode),
            ..SessionPatch::default()
        })
        .await;

        let applied = match self.adapter.permission_mode_control() {
            Some(control) => match control.set_permission_mode(mode).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(error = %err, "in-place permission mode switch failed");
                    false
                }
            },
            None => false,
        };

        if applied {
            self.emit(EventPayload::info(format!(
                "Permission mode set to {}",
                mode.as_str()
            )))
            .await;
        } else {
            self.restart_with(Restart::Resume, "applying permission mode")
                .await;
        }
    }

    /// Terminate gracefully and re-enqueue once the process is gone.
    async fn restart_with(&mut self, restart: Restart, reason: &str) {
        if self.terminating {
            return;
        }
        info!(?restart, reason, "restarting agent");
        self.restart = Some(restart);
        self.flags.gracefully_terminated = true;
        self.terminating = true;
        self.idle_deadline = None;
        self.gate.drain("agent restarting");

        if restart == Restart::Resume {
            self.patch(SessionPatch {
                prompt: Some(CONTINUE_PROMPT.to_owned()),
                ..SessionPatch::default()
            })
            .await;
        }
        self.emit(EventPayload::info(format!("Restarting agent: {reason}")))
            .await;
        self.signal(KillSignal::Terminate);
        self.kill_deadline = Some(Instant::now() + self.deps.config.timeouts.kill_grace());
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    fn arm_idle_timer(&mut self) {
        self.idle_deadline =
            (!self.idle_timeout.is_zero()).then(|| Instant::now() + self.idle_timeout);
    }

    async fn on_idle_timeout(&mut self) {
        self.idle_deadline = None;
        if self.status != SessionStatus::AwaitingInput || self.terminating {
            return;
        }
        info!(idle_timeout = ?self.idle_timeout, "idle timeout reached");
        self.flags.idle_timed_out = true;
        self.terminating = true;
        self.emit(EventPayload::info("Idle timeout reached; stopping agent"))
            .await;
        self.signal(KillSignal::Terminate);
        self.kill_deadline = Some(Instant::now() + self.deps.config.timeouts.kill_grace());
    }

    fn on_kill_deadline(&mut self) {
        self.kill_deadline = None;
        warn!("grace period elapsed; killing agent");
        self.signal(KillSignal::Kill);
    }

    fn signal(&self, signal: KillSignal) {
        if let Some(handle) = &self.handle {
            if let Err(err) = handle.kill(signal) {
                warn!(?signal, error = %err, "failed to signal agent");
            }
        }
    }

    async fn stamp_heartbeat(&self) {
        if let Err(err) = self
            .deps
            .sessions
            .heartbeat(&self.session_id, &self.deps.config.worker_id)
            .await
        {
            warn!(error = %err, "failed to stamp heartbeat");
        }
    }

    // ── Exit ─────────────────────────────────────────────────────────────────

    async fn finish(mut self, exit_code: Option<i32>) -> RunOutcome {
        self.kill_deadline = None;
        self.warm_deadline = None;
        self.idle_deadline = None;

        self.synthesize_tool_ends(PROCESS_EXITED_CONTENT).await;
        let drained = self.gate.drain("agent process exited");
        if drained > 0 {
            debug!(drained, "approvals drained on exit");
        }

        let resolution = compute_exit_resolution(&ExitContext {
            exit_code,
            cancelled: self.flags.cancelled,
            gracefully_terminated: self.flags.gracefully_terminated,
            idle_timed_out: self.flags.idle_timed_out,
            interrupted: self.flags.interrupted,
            current_status: self.status,
            restart: self.restart,
        });
        // A queued prompt only adds a resume; it never turns a fresh restart back into one.
        let restart = resolution
            .restart
            .or(self.queued_prompt.then_some(Restart::Resume));

        if let Some(diagnostic) = &resolution.diagnostic {
            warn!(?exit_code, diagnostic = %diagnostic, "agent crashed");
            self.emit(EventPayload::error(diagnostic.clone())).await;
        }
        self.status = resolution.status;
        self.emit(EventPayload::SessionState {
            status: resolution.status,
        })
        .await;

        let stats = self.sink.close().unwrap_or_else(|err| {
            warn!(error = %err, "failed to close log");
            LogStats::default()
        });

        let resume_ref = match restart {
            Some(Restart::Fresh) => None,
            _ => self.resume_ref.clone(),
        };
        self.patch(SessionPatch {
            status: Some(resolution.status),
            owner_worker: Some(None),
            pid: Some(None),
            ended_at: Some(Utc::now()),
            error: Some(resolution.diagnostic.clone()),
            log_stats: Some((stats.byte_size, stats.line_count)),
            resume_ref: (restart == Some(Restart::Fresh)).then_some(None),
            ..SessionPatch::default()
        })
        .await;

        if restart.is_some() {
            self.spawn_reenqueue(resume_ref);
        }

        info!(status = resolution.status.as_str(), ?exit_code, ?restart, "run finished");
        RunOutcome {
            status: resolution.status,
            exit_code,
            restart,
            diagnostic: resolution.diagnostic,
        }
    }

    fn spawn_reenqueue(&self, resume_ref: Option<String>) {
        let queue = Arc::clone(&self.deps.queue);
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            if let Err(err) = queue.enqueue(&session_id, resume_ref).await {
                warn!(session_id = %session_id, error = %err, "failed to re-enqueue session");
            }
        });
    }
}
