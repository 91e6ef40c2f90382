#![forbid(unsafe_code)]

//! `agent-supervisor`: worker binary for supervised agent sessions.
//!
//! `serve` runs a worker that claims sessions fed to it as job lines on
//! stdin. `launch` creates a session, supervises it in-process, prints its
//! events as JSON lines, and forwards stdin lines as control messages.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_supervisor::adapter::CliAdapterFactory;
use agent_supervisor::bus::local::LocalBus;
use agent_supervisor::bus::{control_channel, events_channel, EventBus};
use agent_supervisor::logsink::FileLogSinkFactory;
use agent_supervisor::models::event::{Event, EventPayload};
use agent_supervisor::models::session::{AgentKind, PermissionMode, Session, SessionStatus};
use agent_supervisor::persistence::execution_repo::ExecutionRepo;
use agent_supervisor::persistence::session_repo::SessionRepo;
use agent_supervisor::persistence::{db, SessionStore};
use agent_supervisor::queue::{Job, JobQueue, LocalQueue};
use agent_supervisor::supervisor::{route_cold_message, SignalProbe, SupervisorDeps};
use agent_supervisor::worker::Worker;
use agent_supervisor::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-supervisor", about = "Supervise interactive agent CLI sessions", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a worker fed with job lines (`<session-id>` or `{"sessionId", "resumeRef"}`) on stdin.
    Serve,
    /// Create a session and supervise it in the foreground.
    Launch {
        /// Agent CLI to run (claude, acp, codex).
        #[arg(long, value_parser = parse_agent)]
        agent: AgentKind,
        /// First prompt.
        #[arg(long)]
        prompt: String,
        /// Working directory of the agent.
        #[arg(long)]
        cwd: Option<String>,
        /// Model override.
        #[arg(long)]
        model: Option<String>,
        /// Initial permission mode.
        #[arg(long, value_parser = parse_mode, default_value = "default")]
        mode: PermissionMode,
    },
}

fn parse_agent(raw: &str) -> std::result::Result<AgentKind, String> {
    AgentKind::parse(raw).map_err(|err| err.to_string())
}

fn parse_mode(raw: &str) -> std::result::Result<PermissionMode, String> {
    PermissionMode::parse(raw).map_err(|err| err.to_string())
}

/// Job line accepted by `serve`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobLine {
    session_id: String,
    #[serde(default)]
    resume_ref: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-supervisor bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

/// Everything a worker process shares across supervisors.
struct Runtime {
    deps: SupervisorDeps,
    sessions: Arc<SessionRepo>,
    bus: Arc<LocalBus>,
    queue: Arc<LocalQueue>,
    worker: Worker,
}

async fn build_runtime(config: GlobalConfig) -> Result<Runtime> {
    let config = Arc::new(config);
    let db = Arc::new(db::connect(&config.db_path).await?);
    info!(db_path = %config.db_path.display(), "database connected");

    let sessions = Arc::new(SessionRepo::new(Arc::clone(&db)));
    let executions = Arc::new(ExecutionRepo::new(db));
    let bus = Arc::new(LocalBus::default());
    let (queue, jobs) = LocalQueue::new();
    let queue = Arc::new(queue);

    let deps = SupervisorDeps {
        sessions: sessions.clone(),
        bus: bus.clone(),
        queue: queue.clone(),
        logs: Arc::new(FileLogSinkFactory::new(config.log_dir.clone())),
        adapters: Arc::new(CliAdapterFactory::new(config.agents.clone())),
        config,
    };
    let worker = Worker::new(deps.clone(), executions, Arc::new(SignalProbe), jobs);

    Ok(Runtime {
        deps,
        sessions,
        bus,
        queue,
        worker,
    })
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::from_toml_str("")?,
    };
    info!(worker_id = %config.worker_id, "configuration loaded");

    let runtime = build_runtime(config).await?;
    match args.command {
        Command::Serve => serve(runtime).await,
        Command::Launch {
            agent,
            prompt,
            cwd,
            model,
            mode,
        } => {
            let mut session = Session::new(agent, Some(prompt), cwd);
            session.model = model;
            session.permission_mode = mode;
            session.idle_timeout_secs = runtime.deps.config.timeouts.idle_seconds;
            launch(runtime, session).await
        }
    }
}

async fn serve(runtime: Runtime) -> Result<()> {
    let ct = CancellationToken::new();
    let worker_ct = ct.clone();
    let worker_handle = tokio::spawn(runtime.worker.run(worker_ct));

    let mut stdin = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    info!("worker serving; reading jobs from stdin");

    loop {
        tokio::select! {
            () = shutdown_signal() => {
                info!("shutdown signal received");
                break;
            }
            line = stdin.next() => match line {
                Some(Ok(line)) => enqueue_job_line(runtime.queue.as_ref(), &line).await,
                Some(Err(err)) => warn!(error = %err, "unreadable job line"),
                None => {
                    info!("stdin closed; waiting for shutdown signal");
                    shutdown_signal().await;
                    break;
                }
            },
        }
    }

    ct.cancel();
    match worker_handle.await {
        Ok(result) => result?,
        Err(err) => error!(error = %err, "worker task failed"),
    }
    info!("agent-supervisor shut down");
    Ok(())
}

async fn enqueue_job_line(queue: &dyn JobQueue, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let job = if line.starts_with('{') {
        match serde_json::from_str::<JobLine>(line) {
            Ok(parsed) => Job {
                session_id: parsed.session_id,
                resume_ref: parsed.resume_ref,
            },
            Err(err) => {
                warn!(error = %err, "ignoring malformed job line");
                return;
            }
        }
    } else {
        Job {
            session_id: line.to_owned(),
            resume_ref: None,
        }
    };

    if let Err(err) = queue.enqueue(&job.session_id, job.resume_ref).await {
        error!(session_id = %job.session_id, error = %err, "failed to enqueue job");
    }
}

async fn launch(runtime: Runtime, session: Session) -> Result<()> {
    let Runtime {
        sessions,
        bus,
        queue,
        worker,
        ..
    } = runtime;

    sessions.create(&session).await?;
    let session_id = session.id.clone();
    info!(session_id = %session_id, agent = session.agent.as_str(), "session created");

    let mut events = bus.subscribe(&events_channel(&session_id)).await?;
    queue.enqueue(&session_id, None).await?;

    let ct = CancellationToken::new();
    let worker_handle = tokio::spawn(worker.run(ct.clone()));

    let (line_tx, mut lines) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut stdin = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
        while let Some(Ok(line)) = stdin.next().await {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            () = shutdown_signal() => {
                info!("shutdown signal received");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{event}");
                if is_terminal_state(&event) {
                    info!(session_id = %session_id, "session ended");
                    break;
                }
            }
            Some(line) = lines.recv() => {
                if let Err(err) = forward_line(
                    sessions.as_ref(),
                    queue.as_ref(),
                    bus.as_ref(),
                    &session_id,
                    &line,
                )
                .await
                {
                    warn!(error = %err, "failed to forward input");
                }
            }
        }
    }

    ct.cancel();
    match worker_handle.await {
        Ok(result) => result?,
        Err(err) => error!(error = %err, "worker task failed"),
    }
    Ok(())
}

fn is_terminal_state(raw: &Value) -> bool {
    serde_json::from_value::<Event>(raw.clone()).is_ok_and(|event| {
        matches!(
            event.payload,
            EventPayload::SessionState {
                status: SessionStatus::Ended
            }
        )
    })
}

/// Forward one stdin line: JSON control messages verbatim, anything else as
/// a `message`. Messages for a session with no live process resume it.
async fn forward_line(
    sessions: &dyn SessionStore,
    queue: &dyn JobQueue,
    bus: &dyn EventBus,
    session_id: &str,
    line: &str,
) -> Result<()> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }

    let message: Value = serde_json::from_str(line)
        .ok()
        .filter(Value::is_object)
        .unwrap_or_else(|| json!({ "type": "message", "text": line }));

    if message.get("type").and_then(Value::as_str) == Some("message") {
        if let Some(text) = message.get("text").and_then(Value::as_str) {
            if route_cold_message(sessions, queue, session_id, text).await? {
                return Ok(());
            }
        }
    }

    bus.publish(&control_channel(session_id), message).await
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
