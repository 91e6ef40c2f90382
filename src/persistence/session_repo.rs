//! Session repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use sqlx::{QueryBuilder, Sqlite};

use crate::models::session::{AgentKind, PermissionMode, Session, SessionPatch, SessionStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::SessionStore;

/// Repository wrapper around `SQLite` for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    agent: String,
    status: String,
    owner_worker: Option<String>,
    pid: Option<i64>,
    resume_ref: Option<String>,
    prompt: Option<String>,
    cwd: Option<String>,
    model: Option<String>,
    permission_mode: String,
    allowed_tools: String,
    idle_timeout_secs: i64,
    event_seq: i64,
    heartbeat_at: Option<String>,
    started_at: Option<String>,
    ended_at: Option<String>,
    log_path: Option<String>,
    log_bytes: i64,
    log_lines: i64,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    /// Convert a database row into the domain model.
    fn into_session(self) -> Result<Session> {
        let allowed_tools: Vec<String> = serde_json::from_str(&self.allowed_tools)
            .map_err(|e| AppError::Db(format!("invalid allowed_tools: {e}")))?;

        Ok(Session {
            id: self.id,
            agent: AgentKind::parse(&self.agent)?,
            status: SessionStatus::parse(&self.status)?,
            owner_worker: self.owner_worker,
            pid: self.pid.and_then(|pid| u32::try_from(pid).ok()),
            resume_ref: self.resume_ref,
            prompt: self.prompt,
            cwd: self.cwd,
            model: self.model,
            permission_mode: PermissionMode::parse(&self.permission_mode)?,
            allowed_tools,
            idle_timeout_secs: to_u64(self.idle_timeout_secs),
            event_seq: to_u64(self.event_seq),
            heartbeat_at: parse_opt_ts(self.heartbeat_at.as_deref(), "heartbeat_at")?,
            started_at: parse_opt_ts(self.started_at.as_deref(), "started_at")?,
            ended_at: parse_opt_ts(self.ended_at.as_deref(), "ended_at")?,
            log_path: self.log_path,
            log_bytes: to_u64(self.log_bytes),
            log_lines: to_u64(self.log_lines),
            error: self.error,
            created_at: parse_ts(&self.created_at, "created_at")?,
            updated_at: parse_ts(&self.updated_at, "updated_at")?,
        })
    }
}

fn parse_ts(raw: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

fn parse_opt_ts(raw: Option<&str>, field: &str) -> Result<Option<DateTime<Utc>>> {
    raw.map(|value| parse_ts(value, field)).transpose()
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

const SELECT_COLUMNS: &str = "SELECT id, agent, status, owner_worker, pid, resume_ref, prompt, \
     cwd, model, permission_mode, allowed_tools, idle_timeout_secs, event_seq, heartbeat_at, \
     started_at, ended_at, log_path, log_bytes, log_lines, error, created_at, updated_at \
     FROM session";

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, session: &Session) -> Result<Session> {
        let allowed_tools = serde_json::to_string(&session.allowed_tools)
            .map_err(|e| AppError::Db(format!("failed to encode allowed_tools: {e}")))?;

        sqlx::query(
            "INSERT INTO session (id, agent, status, owner_worker, pid, resume_ref, prompt, cwd, \
             model, permission_mode, allowed_tools, idle_timeout_secs, event_seq, heartbeat_at, \
             started_at, ended_at, log_path, log_bytes, log_lines, error, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
             ?18, ?19, ?20, ?21, ?22)",
        )
        .bind(&session.id)
        .bind(session.agent.as_str())
        .bind(session.status.as_str())
        .bind(&session.owner_worker)
        .bind(session.pid.map(i64::from))
        .bind(&session.resume_ref)
        .bind(&session.prompt)
        .bind(&session.cwd)
        .bind(&session.model)
        .bind(session.permission_mode.as_str())
        .bind(allowed_tools)
        .bind(to_i64(session.idle_timeout_secs))
        .bind(to_i64(session.event_seq))
        .bind(session.heartbeat_at.map(|ts| ts.to_rfc3339()))
        .bind(session.started_at.map(|ts| ts.to_rfc3339()))
        .bind(session.ended_at.map(|ts| ts.to_rfc3339()))
        .bind(&session.log_path)
        .bind(to_i64(session.log_bytes))
        .bind(to_i64(session.log_lines))
        .bind(&session.error)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(session.clone())
    }

    /// Retrieve a session by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn get_by_id(&self, id: &str) -> Result<Session> {
        let row: Option<SessionRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.ok_or_else(|| AppError::NotFound(format!("session {id} not found")))?
            .into_session()
    }

    /// Atomically take ownership of a session for `worker_id`.
    ///
    /// A single conditional update: the session must be in a claimable
    /// status and either unowned or already owned by `worker_id`. Returns
    /// `false` when another worker holds it or the status forbids it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn claim(&self, id: &str, worker_id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE session SET owner_worker = ?1, status = 'active', started_at = ?2, \
             heartbeat_at = ?2, ended_at = NULL, error = NULL, updated_at = ?2 \
             WHERE id = ?3 AND status IN ('idle', 'active', 'ended') \
             AND (owner_worker IS NULL OR owner_worker = ?1)",
        )
        .bind(worker_id)
        .bind(&now)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Apply a partial update to a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist, or
    /// `AppError::Db` if the update fails.
    pub async fn apply_patch(&self, id: &str, patch: SessionPatch) -> Result<()> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("UPDATE session SET updated_at = ");
        qb.push_bind(Utc::now().to_rfc3339());

        if let Some(status) = patch.status {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(owner) = patch.owner_worker {
            qb.push(", owner_worker = ").push_bind(owner);
        }
        if let Some(pid) = patch.pid {
            qb.push(", pid = ").push_bind(pid.map(i64::from));
        }
        if let Some(resume_ref) = patch.resume_ref {
            qb.push(", resume_ref = ").push_bind(resume_ref);
        }
        if let Some(prompt) = patch.prompt {
            qb.push(", prompt = ").push_bind(prompt);
        }
        if let Some(model) = patch.model {
            qb.push(", model = ").push_bind(model);
        }
        if let Some(mode) = patch.permission_mode {
            qb.push(", permission_mode = ").push_bind(mode.as_str());
        }
        if let Some(tools) = patch.allowed_tools {
            let encoded = serde_json::to_string(&tools)
                .map_err(|e| AppError::Db(format!("failed to encode allowed_tools: {e}")))?;
            qb.push(", allowed_tools = ").push_bind(encoded);
        }
        if let Some(seq) = patch.event_seq {
            qb.push(", event_seq = ").push_bind(to_i64(seq));
        }
        if let Some(ts) = patch.heartbeat_at {
            qb.push(", heartbeat_at = ").push_bind(ts.to_rfc3339());
        }
        if let Some(ts) = patch.started_at {
            qb.push(", started_at = ").push_bind(ts.to_rfc3339());
        }
        if let Some(ts) = patch.ended_at {
            qb.push(", ended_at = ").push_bind(ts.to_rfc3339());
        }
        if let Some(path) = patch.log_path {
            qb.push(", log_path = ").push_bind(path);
        }
        if let Some((bytes, lines)) = patch.log_stats {
            qb.push(", log_bytes = ").push_bind(to_i64(bytes));
            qb.push(", log_lines = ").push_bind(to_i64(lines));
        }
        if let Some(error) = patch.error {
            qb.push(", error = ").push_bind(error);
        }

        qb.push(" WHERE id = ").push_bind(id.to_owned());

        let result = qb.build().execute(self.db.as_ref()).await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {id} not found")));
        }
        Ok(())
    }

    /// Stamp the heartbeat of a session owned by `worker_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn touch_heartbeat(&self, id: &str, worker_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE session SET heartbeat_at = ?1, updated_at = ?1 \
             WHERE id = ?2 AND owner_worker = ?3",
        )
        .bind(&now)
        .bind(id)
        .bind(worker_id)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// List sessions owned by `worker_id` that still claim a live process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_owned_live(&self, worker_id: &str) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE owner_worker = ?1 \
             AND status IN ('active', 'awaiting_input') ORDER BY created_at ASC"
        ))
        .bind(worker_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }
}

impl SessionStore for SessionRepo {
    fn claim<'a>(&'a self, id: &'a str, worker_id: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(SessionRepo::claim(self, id, worker_id))
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Session>> {
        Box::pin(self.get_by_id(id))
    }

    fn update<'a>(&'a self, id: &'a str, patch: SessionPatch) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.apply_patch(id, patch))
    }

    fn heartbeat<'a>(&'a self, id: &'a str, worker_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.touch_heartbeat(id, worker_id))
    }

    fn list_owned_live<'a>(&'a self, worker_id: &'a str) -> BoxFuture<'a, Result<Vec<Session>>> {
        Box::pin(SessionRepo::list_owned_live(self, worker_id))
    }
}
