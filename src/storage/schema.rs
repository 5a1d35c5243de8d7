//! Database schema for the conversation store
//!
//! Creates tables for:
//! - conversations: one row per provider conversation
//! - evaluations: append-only evaluation history
//! - sync_state: the single-row sync watermark
//! - evaluation_attempts: failure bookkeeping for bounded evaluation retries
//! - transcript_fetches: failure bookkeeping for transcript backfill

use crate::error::{ConvaiError, Result};
use libsql::Connection;
use tracing::debug;

/// Schema statements, applied in order; every statement is idempotent
pub const SCHEMA_STATEMENTS: &[(&str, &str)] = &[
    (
        "conversations",
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT UNIQUE NOT NULL,
            agent_id TEXT NOT NULL,
            agent_name TEXT NOT NULL,
            start_time_unix_secs INTEGER NOT NULL,
            call_duration_secs INTEGER NOT NULL,
            message_count INTEGER NOT NULL,
            status TEXT NOT NULL CHECK(status IN (
                'initiated', 'in-progress', 'processing', 'done', 'failed'
            )),
            call_successful TEXT NOT NULL CHECK(call_successful IN (
                'success', 'failure', 'unknown'
            )),
            direction TEXT,
            transcript_summary TEXT,
            call_summary_title TEXT,
            transcript_json TEXT,
            processed_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL DEFAULT (unixepoch())
        )
        "#,
    ),
    (
        "idx_start_time",
        "CREATE INDEX IF NOT EXISTS idx_start_time ON conversations(start_time_unix_secs DESC)",
    ),
    (
        "idx_agent_id",
        "CREATE INDEX IF NOT EXISTS idx_agent_id ON conversations(agent_id)",
    ),
    (
        "evaluations",
        r#"
        CREATE TABLE IF NOT EXISTS evaluations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL,
            evaluation_json TEXT NOT NULL,
            score REAL NOT NULL CHECK(score BETWEEN 0 AND 100),
            summary TEXT NOT NULL,
            created_at INTEGER NOT NULL DEFAULT (unixepoch()),
            FOREIGN KEY (conversation_id) REFERENCES conversations(conversation_id)
        )
        "#,
    ),
    (
        "idx_eval_conversation_id",
        "CREATE INDEX IF NOT EXISTS idx_eval_conversation_id ON evaluations(conversation_id, created_at DESC)",
    ),
    (
        "idx_eval_score",
        "CREATE INDEX IF NOT EXISTS idx_eval_score ON evaluations(score DESC)",
    ),
    (
        "sync_state",
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_sync_timestamp INTEGER NOT NULL
        )
        "#,
    ),
    (
        "evaluation_attempts",
        r#"
        CREATE TABLE IF NOT EXISTS evaluation_attempts (
            conversation_id TEXT PRIMARY KEY NOT NULL,
            attempts INTEGER NOT NULL,
            last_error TEXT NOT NULL,
            last_attempt_at INTEGER NOT NULL,
            next_attempt_at INTEGER NOT NULL,
            quarantined INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (conversation_id) REFERENCES conversations(conversation_id)
        )
        "#,
    ),
    (
        "transcript_fetches",
        r#"
        CREATE TABLE IF NOT EXISTS transcript_fetches (
            conversation_id TEXT PRIMARY KEY NOT NULL,
            attempts INTEGER NOT NULL,
            last_error TEXT NOT NULL,
            last_attempt_at INTEGER NOT NULL,
            next_fetch_at INTEGER NOT NULL,
            abandoned INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (conversation_id) REFERENCES conversations(conversation_id)
        )
        "#,
    ),
];

/// Create every table and index that does not exist yet
pub async fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", ())
        .await
        .map_err(|e| ConvaiError::Migration(format!("Failed to enable foreign keys: {}", e)))?;

    for (name, statement) in SCHEMA_STATEMENTS {
        conn.execute(statement, ()).await.map_err(|e| {
            ConvaiError::Migration(format!("Failed to create {}: {}", name, e))
        })?;
        debug!("Schema object ready: {}", name);
    }

    Ok(())
}
