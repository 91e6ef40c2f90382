//! Job queue seam used to hand sessions back to a worker for resume.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::{AppError, Result};

/// One unit of work: claim `session_id` and start or resume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Session to claim.
    pub session_id: String,
    /// Resume reference to continue from; `None` starts fresh.
    pub resume_ref: Option<String>,
}

/// Durable queue the supervisor re-enqueues sessions onto.
pub trait JobQueue: Send + Sync {
    /// Enqueue a claim-and-resume job.
    fn enqueue<'a>(
        &'a self,
        session_id: &'a str,
        resume_ref: Option<String>,
    ) -> BoxFuture<'a, Result<()>>;
}

/// In-process queue backed by an unbounded channel.
#[derive(Clone)]
pub struct LocalQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl LocalQueue {
    /// Create a queue and the receiver the worker consumes.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl JobQueue for LocalQueue {
    fn enqueue<'a>(
        &'a self,
        session_id: &'a str,
        resume_ref: Option<String>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.tx
                .send(Job {
                    session_id: session_id.to_owned(),
                    resume_ref,
                })
                .map_err(|_| AppError::Queue("job queue receiver closed".into()))
        })
    }
}
