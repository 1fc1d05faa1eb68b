//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` — safe to
//! re-run on every server startup. Produces a convergent result.

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
    chat_id         TEXT NOT NULL,
    source          TEXT NOT NULL,
    active_task_id  TEXT,
    task_queue      TEXT NOT NULL DEFAULT '[]',
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (chat_id, source)
);

CREATE TABLE IF NOT EXISTS task (
    task_id         TEXT PRIMARY KEY NOT NULL,
    chat_id         TEXT NOT NULL,
    source          TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN (
        'planning','reading_files','generating_code','diff_ready',
        'writing_files','completed','failed','rolled_back')),
    user_input      TEXT NOT NULL,
    dry_run         INTEGER NOT NULL DEFAULT 0,
    test_mode       INTEGER NOT NULL DEFAULT 0,
    webhook_url     TEXT,
    plan            TEXT,
    diffs           TEXT NOT NULL DEFAULT '{}',
    new_contents    TEXT NOT NULL DEFAULT '{}',
    written_files   TEXT NOT NULL DEFAULT '{}',
    errors          TEXT NOT NULL DEFAULT '[]',
    retry_count     INTEGER NOT NULL DEFAULT 0,
    awaiting_response INTEGER NOT NULL DEFAULT 0,
    awaiting_type   TEXT CHECK(awaiting_type IS NULL OR awaiting_type IN (
        'approval','deploy_approval','continue_operation','answer_questions')),
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    completed_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_task_session ON task(chat_id, source);
CREATE INDEX IF NOT EXISTS idx_session_updated ON session(updated_at);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
