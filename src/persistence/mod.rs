//! Persistence layer modules.
//!
//! The supervisor and reconciler talk to storage through the
//! [`SessionStore`] and [`ExecutionStore`] traits so tests can swap in
//! doubles; the `SQLite` repositories are the production implementations.

use futures_util::future::BoxFuture;

use crate::models::execution::Execution;
use crate::models::session::{Session, SessionPatch};
use crate::Result;

pub mod db;
pub mod execution_repo;
pub mod schema;
pub mod session_repo;

/// Session record operations needed by supervision.
pub trait SessionStore: Send + Sync {
    /// Atomically claim the session for `worker_id`; `false` if refused.
    fn claim<'a>(&'a self, id: &'a str, worker_id: &'a str) -> BoxFuture<'a, Result<bool>>;

    /// Load a session.
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Session>>;

    /// Apply a partial update.
    fn update<'a>(&'a self, id: &'a str, patch: SessionPatch) -> BoxFuture<'a, Result<()>>;

    /// Refresh the liveness stamp of a session owned by `worker_id`.
    fn heartbeat<'a>(&'a self, id: &'a str, worker_id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Sessions owned by `worker_id` in `active` or `awaiting_input`.
    fn list_owned_live<'a>(&'a self, worker_id: &'a str) -> BoxFuture<'a, Result<Vec<Session>>>;
}

/// Execution record operations needed by the reconciler.
pub trait ExecutionStore: Send + Sync {
    /// Executions owned by `worker_id` in `running` or `cancelling`.
    fn list_owned_running<'a>(
        &'a self,
        worker_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Execution>>>;

    /// Mark an execution failed.
    fn mark_failed<'a>(&'a self, id: &'a str, error: &'a str) -> BoxFuture<'a, Result<()>>;
}
