//! Worker loop: reconcile once, then run one supervisor per queued job.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::persistence::ExecutionStore;
use crate::queue::Job;
use crate::supervisor::session::CONTINUE_PROMPT;
use crate::supervisor::{reconcile, ProcessProbe, SessionSupervisor, StartRequest, SupervisorDeps};
use crate::Result;

/// Consumes claim-and-resume jobs for one worker id.
pub struct Worker {
    deps: SupervisorDeps,
    executions: Arc<dyn ExecutionStore>,
    probe: Arc<dyn ProcessProbe>,
    jobs: mpsc::UnboundedReceiver<Job>,
}

impl Worker {
    /// Build a worker over `jobs`, the receiving side of the queue in `deps`.
    #[must_use]
    pub fn new(
        deps: SupervisorDeps,
        executions: Arc<dyn ExecutionStore>,
        probe: Arc<dyn ProcessProbe>,
        jobs: mpsc::UnboundedReceiver<Job>,
    ) -> Self {
        Self {
            deps,
            executions,
            probe,
            jobs,
        }
    }

    /// Reconcile orphans, then supervise jobs until `ct` is cancelled or the
    /// queue closes.
    ///
    /// At most one supervisor runs per session. A job for a session that is
    /// already running here is held back and started once that run ends;
    /// several such jobs collapse into the latest one.
    ///
    /// On cancellation, running supervisors are aborted; their child
    /// processes are killed on drop and the next start reconciles the
    /// records.
    ///
    /// # Errors
    ///
    /// Returns an error if reconciliation cannot list owned records.
    pub async fn run(mut self, ct: CancellationToken) -> Result<()> {
        let config = Arc::clone(&self.deps.config);
        reconcile(
            &config.worker_id,
            self.deps.sessions.as_ref(),
            self.executions.as_ref(),
            self.deps.queue.as_ref(),
            self.probe.as_ref(),
            config.timeouts.reconcile_grace(),
        )
        .await?;

        info!(worker_id = %config.worker_id, "worker ready");
        let mut runs = Runs::new(self.deps.clone());

        loop {
            tokio::select! {
                () = ct.cancelled() => {
                    info!(running = runs.tasks.len(), "worker shutting down");
                    runs.tasks.shutdown().await;
                    return Ok(());
                }
                job = self.jobs.recv() => {
                    let Some(job) = job else {
                        info!("job queue closed");
                        break;
                    };
                    runs.submit(job);
                }
                Some(joined) = runs.tasks.join_next(), if !runs.tasks.is_empty() => {
                    runs.finished(joined);
                }
            }
        }

        while let Some(joined) = runs.tasks.join_next().await {
            runs.finished(joined);
        }
        Ok(())
    }
}

/// Supervisor tasks of this worker, keyed by session.
struct Runs {
    deps: SupervisorDeps,
    tasks: JoinSet<String>,
    /// Sessions with a live task, each with the job held back for it.
    in_flight: HashMap<String, Option<Job>>,
}

impl Runs {
    fn new(deps: SupervisorDeps) -> Self {
        Self {
            deps,
            tasks: JoinSet::new(),
            in_flight: HashMap::new(),
        }
    }

    fn submit(&mut self, job: Job) {
        if let Some(held) = self.in_flight.get_mut(&job.session_id) {
            debug!(session_id = %job.session_id, "session already running here; holding job");
            *held = Some(job);
            return;
        }
        self.in_flight.insert(job.session_id.clone(), None);
        self.tasks.spawn(run_job(self.deps.clone(), job));
    }

    fn finished(&mut self, joined: std::result::Result<String, JoinError>) {
        let session_id = match joined {
            Ok(session_id) => session_id,
            Err(err) => {
                warn!(error = %err, "supervisor task panicked or was aborted");
                return;
            }
        };
        if let Some(next) = self.in_flight.remove(&session_id).flatten() {
            self.submit(next);
        }
    }
}

async fn run_job(deps: SupervisorDeps, job: Job) -> String {
    let session = match deps.sessions.get(&job.session_id).await {
        Ok(session) => session,
        Err(err) => {
            warn!(session_id = %job.session_id, error = %err, "dropping job for unknown session");
            return job.session_id;
        }
    };

    let prompt = session
        .prompt
        .filter(|prompt| !prompt.trim().is_empty())
        .unwrap_or_else(|| CONTINUE_PROMPT.to_owned());
    let request = StartRequest {
        prompt,
        resume_ref: job.resume_ref,
        cwd: None,
    };

    match SessionSupervisor::new(job.session_id.clone(), deps)
        .start(request)
        .await
    {
        Ok(Some(outcome)) => {
            debug!(session_id = %job.session_id, status = outcome.status.as_str(), "job finished");
        }
        Ok(None) => debug!(session_id = %job.session_id, "job skipped; claim refused"),
        Err(err) => warn!(session_id = %job.session_id, error = %err, "supervisor failed"),
    }
    job.session_id
}
