//! Shared fixtures for supervisor-level integration tests.
//!
//! [`ScriptedAdapter`] stands in for an agent CLI: tests push adapter events
//! through its [`Script`] and inspect the calls the supervisor made.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use agent_supervisor::adapter::{
    AdapterEvent, AdapterFactory, AgentAdapter, ApprovalHook, KillSignal, ModelControl,
    PermissionModeControl, ProcessControl, ProcessHandle, SpawnOptions, ToolResultSink,
};
use agent_supervisor::approval::{ApprovalDecision, ApprovalRequest};
use agent_supervisor::bus::local::LocalBus;
use agent_supervisor::bus::{control_channel, events_channel, EventBus, Subscription};
use agent_supervisor::config::GlobalConfig;
use agent_supervisor::logsink::{FileLogSinkFactory, StreamTag};
use agent_supervisor::models::control::ImageAttachment;
use agent_supervisor::models::event::{Event, EventPayload};
use agent_supervisor::models::session::{AgentKind, PermissionMode, Session};
use agent_supervisor::persistence::db;
use agent_supervisor::persistence::session_repo::SessionRepo;
use agent_supervisor::queue::{Job, LocalQueue};
use agent_supervisor::supervisor::{
    ProcessProbe, RunOutcome, SessionSupervisor, StartRequest, SupervisorDeps,
};
use agent_supervisor::{AppError, Result};

pub const WORKER_ID: &str = "test-worker";
pub const SCRIPTED_PID: u32 = 4242;
const WAIT: Duration = Duration::from_secs(5);

/// How the scripted agent answers an in-place permission mode switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSupport {
    /// No in-place capability.
    Unsupported,
    /// Capability present and succeeds.
    Succeeds,
    /// Capability present but fails.
    Fails,
}

/// Test-side control of the scripted agent.
pub struct Script {
    calls: Mutex<Vec<String>>,
    events: Mutex<Option<mpsc::UnboundedSender<AdapterEvent>>>,
    hook: Mutex<Option<ApprovalHook>>,
    interrupt_snapshots: Mutex<Vec<Vec<Value>>>,
    bus: Arc<LocalBus>,
    pub fail_spawn: AtomicBool,
    pub exit_on_interrupt: AtomicBool,
    pub exit_on_signal: AtomicBool,
    pub mode_support: Mutex<ModeSupport>,
    pub model_support: AtomicBool,
}

impl Script {
    fn new(bus: Arc<LocalBus>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            hook: Mutex::new(None),
            interrupt_snapshots: Mutex::new(Vec::new()),
            bus,
            fail_spawn: AtomicBool::new(false),
            exit_on_interrupt: AtomicBool::new(false),
            exit_on_signal: AtomicBool::new(true),
            mode_support: Mutex::new(ModeSupport::Unsupported),
            model_support: AtomicBool::new(false),
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    /// Every adapter call so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Wait until a recorded call starts with `prefix`.
    pub async fn called(&self, prefix: &str) -> String {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(call) = self.calls().into_iter().find(|c| c.starts_with(prefix)) {
                    return call;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no call starting with {prefix:?}"))
    }

    /// Published events observed at each `interrupt()` call.
    pub fn interrupt_snapshots(&self) -> Vec<Vec<Value>> {
        self.interrupt_snapshots.lock().unwrap().clone()
    }

    /// Wait until the supervisor has launched the scripted process.
    pub async fn spawned(&self) {
        tokio::time::timeout(WAIT, async {
            while self.events.lock().unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("agent was never spawned");
    }

    /// Emit a normalized payload from the agent.
    pub fn emit(&self, payload: EventPayload) {
        self.send(AdapterEvent::Event(payload));
    }

    /// Emit raw stdout.
    pub fn stdout(&self, text: &str) {
        self.send(AdapterEvent::Output {
            stream: StreamTag::Stdout,
            text: text.to_owned(),
        });
    }

    /// Make the process exit.
    pub fn exit(&self, code: Option<i32>) {
        self.send(AdapterEvent::Exited { code });
        self.events.lock().unwrap().take();
    }

    fn send(&self, event: AdapterEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Ask the supervisor for a tool decision, as the agent would.
    pub fn request_approval(
        &self,
        approval_id: &str,
        tool_name: &str,
        input: Value,
        tool_use_id: Option<&str>,
    ) -> JoinHandle<ApprovalDecision> {
        let hook = self
            .hook
            .lock()
            .unwrap()
            .clone()
            .expect("agent must be spawned before requesting approval");
        let request = ApprovalRequest {
            approval_id: approval_id.to_owned(),
            tool_name: tool_name.to_owned(),
            input,
            tool_use_id: tool_use_id.map(str::to_owned),
        };
        tokio::spawn(hook(request))
    }
}

struct ScriptedControl {
    script: Arc<Script>,
}

impl ProcessControl for ScriptedControl {
    fn signal(&self, signal: KillSignal) -> Result<()> {
        self.script.record(format!("signal:{signal:?}"));
        if self.script.exit_on_signal.load(Ordering::SeqCst) {
            self.script.exit(None);
        }
        Ok(())
    }
}

/// Adapter double driven by a shared [`Script`].
pub struct ScriptedAdapter {
    script: Arc<Script>,
    session_id: Mutex<String>,
}

impl ScriptedAdapter {
    fn launch(&self, call: String, opts: SpawnOptions) -> Result<ProcessHandle> {
        self.script.record(call);
        if self.script.fail_spawn.load(Ordering::SeqCst) {
            return Err(AppError::Adapter("scripted spawn failure".into()));
        }
        *self.session_id.lock().unwrap() = opts.session_id.clone();
        *self.script.hook.lock().unwrap() = Some(opts.approval_hook);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.script.events.lock().unwrap() = Some(tx);
        Ok(ProcessHandle::new(
            Some(SCRIPTED_PID),
            rx,
            Arc::new(ScriptedControl {
                script: Arc::clone(&self.script),
            }),
        ))
    }
}

impl AgentAdapter for ScriptedAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Claude
    }

    fn spawn<'a>(
        &'a self,
        prompt: &'a str,
        opts: SpawnOptions,
    ) -> BoxFuture<'a, Result<ProcessHandle>> {
        Box::pin(async move { self.launch(format!("spawn:{prompt}"), opts) })
    }

    fn resume<'a>(
        &'a self,
        resume_ref: &'a str,
        prompt: &'a str,
        opts: SpawnOptions,
    ) -> BoxFuture<'a, Result<ProcessHandle>> {
        Box::pin(async move { self.launch(format!("resume:{resume_ref}:{prompt}"), opts) })
    }

    fn send_message<'a>(
        &'a self,
        text: &'a str,
        image: Option<&'a ImageAttachment>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let suffix = if image.is_some() { " +image" } else { "" };
            self.script.record(format!("send:{text}{suffix}"));
            Ok(())
        })
    }

    fn interrupt(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let session_id = self.session_id.lock().unwrap().clone();
            let published = self.script.bus.history(&events_channel(&session_id)).await;
            self.script.interrupt_snapshots.lock().unwrap().push(published);
            self.script.record("interrupt");
            if self.script.exit_on_interrupt.load(Ordering::SeqCst) {
                self.script.exit(None);
            }
            Ok(())
        })
    }

    fn extract_session_id(&self, line: &str) -> Option<String> {
        line.strip_prefix("session=").map(str::to_owned)
    }

    fn permission_mode_control(&self) -> Option<&dyn PermissionModeControl> {
        match *self.script.mode_support.lock().unwrap() {
            ModeSupport::Unsupported => None,
            ModeSupport::Succeeds | ModeSupport::Fails => Some(self),
        }
    }

    fn model_control(&self) -> Option<&dyn ModelControl> {
        self.script
            .model_support
            .load(Ordering::SeqCst)
            .then_some(self as &dyn ModelControl)
    }

    fn tool_result_sink(&self) -> Option<&dyn ToolResultSink> {
        Some(self)
    }
}

impl PermissionModeControl for ScriptedAdapter {
    fn set_permission_mode(&self, mode: PermissionMode) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.script.record(format!("set_mode:{}", mode.as_str()));
            match *self.script.mode_support.lock().unwrap() {
                ModeSupport::Fails => Err(AppError::Protocol("mode rejected".into())),
                _ => Ok(()),
            }
        })
    }
}

impl ModelControl for ScriptedAdapter {
    fn set_model<'a>(&'a self, model: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.script.record(format!("set_model:{model}"));
            Ok(())
        })
    }
}

impl ToolResultSink for ScriptedAdapter {
    fn send_tool_result<'a>(
        &'a self,
        tool_use_id: &'a str,
        content: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.script.record(format!("tool_result:{tool_use_id}:{content}"));
            Ok(())
        })
    }
}

struct ScriptedFactory {
    script: Arc<Script>,
}

impl AdapterFactory for ScriptedFactory {
    fn create(&self, _kind: AgentKind) -> Result<Box<dyn AgentAdapter>> {
        Ok(Box::new(ScriptedAdapter {
            script: Arc::clone(&self.script),
            session_id: Mutex::new(String::new()),
        }))
    }
}

/// A supervisor environment backed by in-memory storage and a scripted agent.
pub struct Harness {
    pub deps: SupervisorDeps,
    pub sessions: Arc<SessionRepo>,
    pub bus: Arc<LocalBus>,
    pub queue: Arc<LocalQueue>,
    pub jobs: mpsc::UnboundedReceiver<Job>,
    pub script: Arc<Script>,
    pub db: Arc<db::Database>,
    pub log_dir: std::path::PathBuf,
    _logs: tempfile::TempDir,
}

/// Config with short grace periods.
pub fn test_config() -> GlobalConfig {
    GlobalConfig::from_toml_str(&format!(
        r#"
worker_id = "{WORKER_ID}"

[timeouts]
kill_grace_seconds = 1
interrupt_grace_seconds = 1
ask_user_seconds = 1
reconcile_grace_seconds = 1
"#
    ))
    .expect("valid test config")
}

pub async fn harness() -> Harness {
    let db = Arc::new(db::connect_memory().await.expect("db connect"));
    let sessions = Arc::new(SessionRepo::new(Arc::clone(&db)));
    let bus = Arc::new(LocalBus::default());
    let (queue, jobs) = LocalQueue::new();
    let queue = Arc::new(queue);
    let logs = tempfile::tempdir().expect("log dir");
    let script = Arc::new(Script::new(Arc::clone(&bus)));

    let deps = SupervisorDeps {
        sessions: sessions.clone(),
        bus: bus.clone(),
        queue: queue.clone(),
        logs: Arc::new(FileLogSinkFactory::new(logs.path().to_path_buf())),
        adapters: Arc::new(ScriptedFactory {
            script: Arc::clone(&script),
        }),
        config: Arc::new(test_config()),
    };

    Harness {
        log_dir: logs.path().to_path_buf(),
        deps,
        sessions,
        bus,
        queue,
        jobs,
        script,
        db,
        _logs: logs,
    }
}

impl Harness {
    /// Insert an idle session, adjusted by `edit`.
    pub async fn create_session(&self, edit: impl FnOnce(&mut Session)) -> String {
        let mut session = Session::new(AgentKind::Claude, Some("fix the bug".into()), None);
        edit(&mut session);
        self.sessions.create(&session).await.expect("create session");
        session.id
    }

    /// Subscribe to a session's events before starting it.
    pub async fn events(&self, session_id: &str) -> Subscription {
        self.bus
            .subscribe(&events_channel(session_id))
            .await
            .expect("subscribe events")
    }

    /// Start a supervisor for `session_id` in the background.
    pub fn start(
        &self,
        session_id: &str,
        resume_ref: Option<&str>,
    ) -> JoinHandle<Result<Option<RunOutcome>>> {
        let supervisor = SessionSupervisor::new(session_id, self.deps.clone());
        let request = StartRequest {
            prompt: "fix the bug".into(),
            resume_ref: resume_ref.map(str::to_owned),
            cwd: None,
        };
        tokio::spawn(async move { supervisor.start(request).await })
    }

    /// Publish a control message to a running supervisor.
    pub async fn control(&self, session_id: &str, message: Value) {
        self.bus
            .publish(&control_channel(session_id), message)
            .await
            .expect("publish control");
    }

    /// Next job on the queue, waiting for fire-and-forget enqueues.
    pub async fn next_job(&mut self) -> Job {
        tokio::time::timeout(WAIT, self.jobs.recv())
            .await
            .expect("timed out waiting for job")
            .expect("queue open")
    }
}

/// Next event on `sub`, decoded.
pub async fn next_event(sub: &mut Subscription) -> Event {
    let raw = tokio::time::timeout(WAIT, sub.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel open");
    serde_json::from_value(raw).expect("well-formed event")
}

/// Skip events until one satisfies `pred`; returns it.
pub async fn wait_for(sub: &mut Subscription, pred: impl Fn(&EventPayload) -> bool) -> Event {
    loop {
        let event = next_event(sub).await;
        if pred(&event.payload) {
            return event;
        }
    }
}

/// Wait for the supervisor task to finish.
pub async fn finished(handle: JoinHandle<Result<Option<RunOutcome>>>) -> RunOutcome {
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("supervisor did not finish")
        .expect("supervisor task panicked")
        .expect("supervisor failed")
        .expect("claim refused")
}

/// Start a session and consume its opening events.
pub async fn started(
    h: &Harness,
    edit: impl FnOnce(&mut Session),
) -> (String, Subscription, JoinHandle<Result<Option<RunOutcome>>>) {
    let id = h.create_session(edit).await;
    let mut events = h.events(&id).await;
    let handle = h.start(&id, None);

    let first = next_event(&mut events).await;
    assert_eq!(first.seq, 1);
    assert!(matches!(first.payload, EventPayload::SessionState { .. }));
    let second = next_event(&mut events).await;
    assert!(matches!(second.payload, EventPayload::UserMessage { .. }));
    h.script.spawned().await;
    (id, events, handle)
}

/// Probe reporting a fixed set of live pids and recording terminations.
#[derive(Default)]
pub struct FakeProbe {
    alive: HashSet<u32>,
    terminated: Mutex<Vec<u32>>,
}

impl FakeProbe {
    pub fn with_alive(pids: &[u32]) -> Self {
        Self {
            alive: pids.iter().copied().collect(),
            terminated: Mutex::new(Vec::new()),
        }
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().unwrap().clone()
    }
}

impl ProcessProbe for FakeProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.contains(&pid)
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        self.terminated.lock().unwrap().push(pid);
        Ok(())
    }
}
