//! `SQLite` schema bootstrap logic.
//!
//! Every statement is idempotent and runs on each worker startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS session (
    id                TEXT PRIMARY KEY NOT NULL,
    agent             TEXT NOT NULL CHECK(agent IN ('claude','acp','codex')),
    status            TEXT NOT NULL CHECK(status IN ('active','awaiting_input','idle','ended')),
    owner_worker      TEXT,
    pid               INTEGER,
    resume_ref        TEXT,
    prompt            TEXT,
    cwd               TEXT,
    model             TEXT,
    permission_mode   TEXT NOT NULL DEFAULT 'default',
    allowed_tools     TEXT NOT NULL DEFAULT '[]',
    idle_timeout_secs INTEGER NOT NULL DEFAULT 1800,
    event_seq         INTEGER NOT NULL DEFAULT 0,
    heartbeat_at      TEXT,
    started_at        TEXT,
    ended_at          TEXT,
    log_path          TEXT,
    log_bytes         INTEGER NOT NULL DEFAULT 0,
    log_lines         INTEGER NOT NULL DEFAULT 0,
    error             TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS execution (
    id              TEXT PRIMARY KEY NOT NULL,
    session_id      TEXT,
    owner_worker    TEXT,
    pid             INTEGER,
    status          TEXT NOT NULL CHECK(status IN ('running','cancelling','completed','failed')),
    error           TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_session_owner ON session(owner_worker, status);
CREATE INDEX IF NOT EXISTS idx_execution_owner ON execution(owner_worker, status);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
