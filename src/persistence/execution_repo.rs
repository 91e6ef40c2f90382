//! Execution repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;

use crate::models::execution::{Execution, ExecutionStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::ExecutionStore;

/// Repository wrapper around `SQLite` for execution records.
#[derive(Clone)]
pub struct ExecutionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    session_id: Option<String>,
    owner_worker: Option<String>,
    pid: Option<i64>,
    status: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ExecutionRow {
    fn into_execution(self) -> Result<Execution> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
            .map_err(|e| AppError::Db(format!("invalid updated_at: {e}")))?
            .with_timezone(&Utc);

        Ok(Execution {
            id: self.id,
            session_id: self.session_id,
            owner_worker: self.owner_worker,
            pid: self.pid.and_then(|pid| u32::try_from(pid).ok()),
            status: ExecutionStatus::parse(&self.status)?,
            error: self.error,
            created_at,
            updated_at,
        })
    }
}

impl ExecutionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new execution record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, execution: &Execution) -> Result<Execution> {
        sqlx::query(
            "INSERT INTO execution (id, session_id, owner_worker, pid, status, error, \
             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&execution.id)
        .bind(&execution.session_id)
        .bind(&execution.owner_worker)
        .bind(execution.pid.map(i64::from))
        .bind(execution.status.as_str())
        .bind(&execution.error)
        .bind(execution.created_at.to_rfc3339())
        .bind(execution.updated_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(execution.clone())
    }

    /// Retrieve an execution by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the execution does not exist.
    pub async fn get_by_id(&self, id: &str) -> Result<Execution> {
        let row: Option<ExecutionRow> = sqlx::query_as(
            "SELECT id, session_id, owner_worker, pid, status, error, created_at, updated_at \
             FROM execution WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.ok_or_else(|| AppError::NotFound(format!("execution {id} not found")))?
            .into_execution()
    }

    /// List executions owned by `worker_id` still running or cancelling.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_owned_running(&self, worker_id: &str) -> Result<Vec<Execution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            "SELECT id, session_id, owner_worker, pid, status, error, created_at, updated_at \
             FROM execution WHERE owner_worker = ?1 AND status IN ('running', 'cancelling') \
             ORDER BY created_at ASC",
        )
        .bind(worker_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    /// Mark an execution failed with `error`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the execution does not exist.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE execution SET status = 'failed', error = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("execution {id} not found")));
        }
        Ok(())
    }
}

impl ExecutionStore for ExecutionRepo {
    fn list_owned_running<'a>(
        &'a self,
        worker_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Execution>>> {
        Box::pin(ExecutionRepo::list_owned_running(self, worker_id))
    }

    fn mark_failed<'a>(&'a self, id: &'a str, error: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(ExecutionRepo::mark_failed(self, id, error))
    }
}
