//! Execution model: a non-conversational process run owned by a worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppError, Result};

/// Lifecycle status for an execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Process running.
    Running,
    /// Cancellation requested, process not yet gone.
    Cancelling,
    /// Process finished successfully.
    Completed,
    /// Process failed or was orphaned.
    Failed,
}

impl ExecutionStatus {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse the storage representation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` for an unknown status string.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "running" => Ok(Self::Running),
            "cancelling" => Ok(Self::Cancelling),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(AppError::Db(format!("invalid execution status: {other}"))),
        }
    }
}

/// Execution record persisted in `SQLite`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Execution {
    /// Unique record identifier.
    pub id: String,
    /// Session the execution belongs to, if any.
    pub session_id: Option<String>,
    /// Worker that started the process.
    pub owner_worker: Option<String>,
    /// Process id.
    pub pid: Option<u32>,
    /// Current status.
    pub status: ExecutionStatus,
    /// Failure description.
    pub error: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// Construct a running execution owned by `owner_worker`.
    #[must_use]
    pub fn running(session_id: Option<String>, owner_worker: &str, pid: Option<u32>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            owner_worker: Some(owner_worker.to_owned()),
            pid,
            status: ExecutionStatus::Running,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
