//! LibSQL storage backend implementation
//!
//! One local libSQL database holds conversations, evaluations, the sync
//! watermark and evaluation retry state. A single connection is shared by
//! every caller so that `:memory:` databases stay visible across calls.

use crate::error::{ConvaiError, Result};
use crate::storage::schema::init_schema;
use crate::storage::{ConversationStore, EvaluationStore, QueryStore};
use crate::types::{
    CallOutcome, ConversationRecord, ConversationStats, ConversationStatus,
    ConversationWithEvaluation, Direction, EvaluationAttempt, EvaluationResult, NewEvaluation,
    TranscriptFetchAttempt, TranscriptMessage,
};
use async_trait::async_trait;
use libsql::params::IntoParams;
use libsql::{params, Builder, Connection, Database, Row};
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

/// Conversation columns in the order `row_to_conversation` reads them
const CONVERSATION_COLUMNS: &str = "c.conversation_id, c.agent_id, c.agent_name, \
    c.start_time_unix_secs, c.call_duration_secs, c.message_count, c.status, \
    c.call_successful, c.direction, c.transcript_summary, c.call_summary_title, \
    c.transcript_json, c.processed_at, c.created_at";

const CONVERSATION_COLUMN_COUNT: usize = 14;

/// Evaluation columns in the order `row_to_evaluation` reads them
const EVALUATION_COLUMNS: &str =
    "e.id, e.conversation_id, e.score, e.summary, e.evaluation_json, e.created_at";

/// Done, transcribed, never evaluated, and not waiting on a retry
const ELIGIBLE_PREDICATE: &str = "c.status = 'done' \
    AND c.transcript_json IS NOT NULL \
    AND NOT EXISTS (SELECT 1 FROM evaluations ev WHERE ev.conversation_id = c.conversation_id) \
    AND NOT EXISTS ( \
        SELECT 1 FROM evaluation_attempts a \
        WHERE a.conversation_id = c.conversation_id \
          AND (a.quarantined = 1 OR a.next_attempt_at > ?) \
    )";

/// Transcript-fetch bookkeeping columns in the order `row_to_transcript_fetch` reads them
const TRANSCRIPT_FETCH_COLUMNS: &str =
    "conversation_id, attempts, last_error, last_attempt_at, next_fetch_at, abandoned";

/// SQLite file header magic
const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// Join condition selecting the current evaluation of `c`
const CURRENT_EVALUATION_JOIN: &str = "LEFT JOIN evaluations e ON e.id = ( \
    SELECT e2.id FROM evaluations e2 \
    WHERE e2.conversation_id = c.conversation_id \
    ORDER BY e2.created_at DESC, e2.id DESC LIMIT 1 \
)";

/// LibSQL-backed conversation and evaluation store
pub struct LibsqlStore {
    // Kept alive for the lifetime of the shared connection
    _db: Database,
    conn: Connection,
}

impl LibsqlStore {
    /// Open (creating if needed) a local database file and apply the schema
    pub async fn open(path: &str) -> Result<Self> {
        if path == ":memory:" {
            return Self::in_memory().await;
        }

        info!("Opening conversation store: {}", path);
        Self::prepare_database_file(path)?;

        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ConvaiError::Database(format!("Failed to open database {}: {}", path, e)))?;

        Self::from_database(db).await
    }

    /// In-memory store, used by tests and one-off runs
    pub async fn in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| ConvaiError::Database(format!("Failed to create in-memory database: {}", e)))?;

        Self::from_database(db).await
    }

    async fn from_database(db: Database) -> Result<Self> {
        let conn = db
            .connect()
            .map_err(|e| ConvaiError::Database(format!("Failed to get connection: {}", e)))?;

        let store = Self { _db: db, conn };
        store.check_health().await?;
        init_schema(&store.conn).await?;
        debug!("Conversation store ready");
        Ok(store)
    }

    /// Refuse files that exist but are not SQLite databases; create parent dirs
    fn prepare_database_file(db_path: &str) -> Result<()> {
        let path = Path::new(db_path);

        if path.exists() {
            let unreadable = |e: std::io::Error| {
                ConvaiError::Database(format!("Cannot read database file at '{}': {}", db_path, e))
            };
            let mut file = std::fs::File::open(path).map_err(unreadable)?;
            let len = file.metadata().map_err(unreadable)?.len();

            // Zero-length files are valid: SQLite initializes them on first write
            if len == 0 {
                return Ok(());
            }

            let mut header = [0u8; 16];
            if len < header.len() as u64
                || file.read_exact(&mut header).is_err()
                || &header != SQLITE_HEADER
            {
                return Err(ConvaiError::Database(format!(
                    "File at '{}' is not a valid SQLite database",
                    db_path
                )));
            }
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ConvaiError::Database(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        Ok(())
    }

    /// Cheap liveness check
    pub async fn check_health(&self) -> Result<()> {
        let mut rows = self
            .conn
            .query("SELECT 1", params![])
            .await
            .map_err(|e| ConvaiError::Database(format!("Database health check failed: {}", e)))?;
        rows.next().await?;
        Ok(())
    }

    async fn clear_transcript_fetch(&self, conversation_id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM transcript_fetches WHERE conversation_id = ?",
                params![conversation_id],
            )
            .await?;
        Ok(())
    }

    async fn query_conversations(&self, sql: &str, params: impl IntoParams) -> Result<Vec<ConversationRecord>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_conversation(&row)?);
        }
        Ok(records)
    }

    async fn query_evaluations(&self, sql: &str, params: impl IntoParams) -> Result<Vec<EvaluationResult>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await? {
            results.push(row_to_evaluation(&row, 0)?);
        }
        Ok(results)
    }

    async fn query_with_evaluation(
        &self,
        sql: &str,
        params: impl IntoParams,
    ) -> Result<Vec<ConversationWithEvaluation>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await? {
            let conversation = row_to_conversation(&row)?;
            let evaluation_id: Option<i64> = row.get(CONVERSATION_COLUMN_COUNT as i32)?;
            let evaluation = match evaluation_id {
                Some(_) => Some(row_to_evaluation(&row, CONVERSATION_COLUMN_COUNT)?),
                None => None,
            };
            results.push(ConversationWithEvaluation {
                conversation,
                evaluation,
            });
        }
        Ok(results)
    }
}

fn parse_column<T>(value: &str, column: &str) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| ConvaiError::Database(format!("Invalid {} value: {}", column, e)))
}

/// Convert a libsql row selected with `CONVERSATION_COLUMNS`
fn row_to_conversation(row: &Row) -> Result<ConversationRecord> {
    let status: String = row.get(6)?;
    let call_successful: String = row.get(7)?;
    let direction: Option<String> = row.get(8)?;

    let transcript_json: Option<String> = row.get(11)?;
    let transcript = transcript_json
        .map(|json| serde_json::from_str::<Vec<TranscriptMessage>>(&json))
        .transpose()?;

    Ok(ConversationRecord {
        conversation_id: row.get(0)?,
        agent_id: row.get(1)?,
        agent_name: row.get(2)?,
        start_time_unix_secs: row.get(3)?,
        call_duration_secs: row.get(4)?,
        message_count: row.get(5)?,
        status: parse_column::<ConversationStatus>(&status, "status")?,
        call_successful: parse_column::<CallOutcome>(&call_successful, "call_successful")?,
        direction: direction
            .map(|d| parse_column::<Direction>(&d, "direction"))
            .transpose()?,
        transcript_summary: row.get(9)?,
        call_summary_title: row.get(10)?,
        transcript,
        processed_at: row.get(12)?,
        created_at: row.get(13)?,
    })
}

/// Convert evaluation columns starting at `offset`
fn row_to_evaluation(row: &Row, offset: usize) -> Result<EvaluationResult> {
    let idx = |i: usize| (offset + i) as i32;
    let payload: String = row.get(idx(4))?;

    Ok(EvaluationResult {
        id: row.get(idx(0))?,
        conversation_id: row.get(idx(1))?,
        score: row.get(idx(2))?,
        summary: row.get(idx(3))?,
        payload: serde_json::from_str(&payload)?,
        created_at: row.get(idx(5))?,
    })
}

fn row_to_transcript_fetch(row: &Row) -> Result<TranscriptFetchAttempt> {
    let attempts: i64 = row.get(1)?;
    let abandoned: i64 = row.get(5)?;

    Ok(TranscriptFetchAttempt {
        conversation_id: row.get(0)?,
        attempts: attempts.max(0) as u32,
        last_error: row.get(2)?,
        last_attempt_at: row.get(3)?,
        next_fetch_at: row.get(4)?,
        abandoned: abandoned != 0,
    })
}

fn row_to_attempt(row: &Row) -> Result<EvaluationAttempt> {
    let attempts: i64 = row.get(1)?;
    let quarantined: i64 = row.get(5)?;

    Ok(EvaluationAttempt {
        conversation_id: row.get(0)?,
        attempts: attempts.max(0) as u32,
        last_error: row.get(2)?,
        last_attempt_at: row.get(3)?,
        next_attempt_at: row.get(4)?,
        quarantined: quarantined != 0,
    })
}

#[async_trait]
impl ConversationStore for LibsqlStore {
    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<ConversationRecord>> {
        let sql = format!(
            "SELECT {} FROM conversations c WHERE c.conversation_id = ?",
            CONVERSATION_COLUMNS
        );
        let mut found = self
            .query_conversations(&sql, params![conversation_id])
            .await?;
        Ok(found.pop())
    }

    async fn upsert_conversation(&self, record: &ConversationRecord) -> Result<()> {
        let transcript_json = record
            .transcript
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        // Once a transcript is stored its detail-level duration wins over list values
        self.conn
            .execute(
                r#"
                INSERT INTO conversations (
                    conversation_id, agent_id, agent_name, start_time_unix_secs,
                    call_duration_secs, message_count, status, call_successful,
                    direction, transcript_summary, call_summary_title,
                    transcript_json, processed_at, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(conversation_id) DO UPDATE SET
                    status = excluded.status,
                    call_successful = excluded.call_successful,
                    message_count = excluded.message_count,
                    direction = COALESCE(excluded.direction, conversations.direction),
                    transcript_summary = COALESCE(excluded.transcript_summary, conversations.transcript_summary),
                    call_summary_title = COALESCE(excluded.call_summary_title, conversations.call_summary_title),
                    call_duration_secs = CASE
                        WHEN excluded.transcript_json IS NOT NULL OR conversations.transcript_json IS NULL
                        THEN excluded.call_duration_secs
                        ELSE conversations.call_duration_secs
                    END,
                    transcript_json = COALESCE(conversations.transcript_json, excluded.transcript_json),
                    processed_at = excluded.processed_at
                "#,
                params![
                    record.conversation_id.as_str(),
                    record.agent_id.as_str(),
                    record.agent_name.as_str(),
                    record.start_time_unix_secs,
                    record.call_duration_secs,
                    record.message_count,
                    record.status.as_str(),
                    record.call_successful.as_str(),
                    record.direction.map(|d| d.as_str().to_string()),
                    record.transcript_summary.clone(),
                    record.call_summary_title.clone(),
                    transcript_json,
                    record.processed_at,
                    record.created_at
                ],
            )
            .await?;

        if record.transcript.is_some() {
            self.clear_transcript_fetch(&record.conversation_id).await?;
        }

        debug!(
            "Upserted conversation {} ({})",
            record.conversation_id, record.status
        );
        Ok(())
    }

    async fn attach_transcript(
        &self,
        conversation_id: &str,
        transcript: &[TranscriptMessage],
        call_duration_secs: Option<i64>,
        processed_at: i64,
    ) -> Result<bool> {
        let transcript_json = serde_json::to_string(transcript)?;

        let changed = self
            .conn
            .execute(
                "UPDATE conversations \
                 SET transcript_json = ?, \
                     call_duration_secs = COALESCE(?, call_duration_secs), \
                     processed_at = ? \
                 WHERE conversation_id = ? AND transcript_json IS NULL",
                params![transcript_json, call_duration_secs, processed_at, conversation_id],
            )
            .await?;

        if changed > 0 {
            self.clear_transcript_fetch(conversation_id).await?;
        }
        Ok(changed > 0)
    }

    async fn conversations_missing_transcript(
        &self,
        now: i64,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>> {
        let sql = format!(
            "SELECT {} FROM conversations c \
             LEFT JOIN transcript_fetches f ON f.conversation_id = c.conversation_id \
             WHERE c.status = 'done' AND c.transcript_json IS NULL \
               AND (f.conversation_id IS NULL OR (f.abandoned = 0 AND f.next_fetch_at <= ?)) \
             ORDER BY COALESCE(f.attempts, 0) ASC, c.start_time_unix_secs ASC, c.id ASC LIMIT ?",
            CONVERSATION_COLUMNS
        );
        self.query_conversations(&sql, params![now, limit as i64]).await
    }

    async fn get_transcript_fetch(&self, conversation_id: &str) -> Result<Option<TranscriptFetchAttempt>> {
        let sql = format!(
            "SELECT {} FROM transcript_fetches WHERE conversation_id = ?",
            TRANSCRIPT_FETCH_COLUMNS
        );
        let mut rows = self.conn.query(&sql, params![conversation_id]).await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_transcript_fetch(&row)?)),
            None => Ok(None),
        }
    }

    async fn record_transcript_fetch(&self, attempt: &TranscriptFetchAttempt) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO transcript_fetches \
                     (conversation_id, attempts, last_error, last_attempt_at, next_fetch_at, abandoned) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(conversation_id) DO UPDATE SET \
                     attempts = excluded.attempts, \
                     last_error = excluded.last_error, \
                     last_attempt_at = excluded.last_attempt_at, \
                     next_fetch_at = excluded.next_fetch_at, \
                     abandoned = excluded.abandoned",
                params![
                    attempt.conversation_id.as_str(),
                    attempt.attempts as i64,
                    attempt.last_error.as_str(),
                    attempt.last_attempt_at,
                    attempt.next_fetch_at,
                    if attempt.abandoned { 1i64 } else { 0i64 }
                ],
            )
            .await?;
        Ok(())
    }

    async fn abandoned_transcripts(&self) -> Result<Vec<TranscriptFetchAttempt>> {
        let sql = format!(
            "SELECT {} FROM transcript_fetches WHERE abandoned = 1 ORDER BY last_attempt_at DESC",
            TRANSCRIPT_FETCH_COLUMNS
        );
        let mut rows = self.conn.query(&sql, params![]).await?;

        let mut attempts = Vec::new();
        while let Some(row) = rows.next().await? {
            attempts.push(row_to_transcript_fetch(&row)?);
        }
        Ok(attempts)
    }

    async fn watermark(&self) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query("SELECT last_sync_timestamp FROM sync_state WHERE id = 1", params![])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn advance_watermark(&self, timestamp: i64) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO sync_state (id, last_sync_timestamp) VALUES (1, ?) \
                 ON CONFLICT(id) DO UPDATE SET last_sync_timestamp = \
                     MAX(sync_state.last_sync_timestamp, excluded.last_sync_timestamp)",
                params![timestamp],
            )
            .await?;

        self.watermark()
            .await?
            .ok_or_else(|| ConvaiError::Database("Watermark missing after write".to_string()))
    }
}

#[async_trait]
impl EvaluationStore for LibsqlStore {
    async fn eligible_for_evaluation(&self, now: i64, limit: usize) -> Result<Vec<ConversationRecord>> {
        let sql = format!(
            "SELECT {} FROM conversations c WHERE {} \
             ORDER BY c.start_time_unix_secs ASC, c.id ASC LIMIT ?",
            CONVERSATION_COLUMNS, ELIGIBLE_PREDICATE
        );
        self.query_conversations(&sql, params![now, limit as i64]).await
    }

    async fn is_eligible(&self, conversation_id: &str, now: i64) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM conversations c WHERE {} AND c.conversation_id = ?",
            ELIGIBLE_PREDICATE
        );
        let mut rows = self.conn.query(&sql, params![now, conversation_id]).await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(count > 0)
    }

    async fn insert_evaluation(&self, evaluation: &NewEvaluation) -> Result<i64> {
        let payload = serde_json::to_string(&evaluation.evaluation)?;

        self.conn
            .execute(
                "INSERT INTO evaluations (conversation_id, evaluation_json, score, summary, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    evaluation.conversation_id.as_str(),
                    payload,
                    evaluation.evaluation.score,
                    evaluation.evaluation.summary.as_str(),
                    evaluation.created_at
                ],
            )
            .await?;

        let id = self.conn.last_insert_rowid();
        debug!(
            "Stored evaluation {} for {} (score {:.1})",
            id, evaluation.conversation_id, evaluation.evaluation.score
        );
        Ok(id)
    }

    async fn latest_evaluation(&self, conversation_id: &str) -> Result<Option<EvaluationResult>> {
        let sql = format!(
            "SELECT {} FROM evaluations e WHERE e.conversation_id = ? \
             ORDER BY e.created_at DESC, e.id DESC LIMIT 1",
            EVALUATION_COLUMNS
        );
        let mut found = self.query_evaluations(&sql, params![conversation_id]).await?;
        Ok(found.pop())
    }

    async fn evaluation_history(&self, conversation_id: &str) -> Result<Vec<EvaluationResult>> {
        let sql = format!(
            "SELECT {} FROM evaluations e WHERE e.conversation_id = ? \
             ORDER BY e.created_at DESC, e.id DESC",
            EVALUATION_COLUMNS
        );
        self.query_evaluations(&sql, params![conversation_id]).await
    }

    async fn get_attempt(&self, conversation_id: &str) -> Result<Option<EvaluationAttempt>> {
        let mut rows = self
            .conn
            .query(
                "SELECT conversation_id, attempts, last_error, last_attempt_at, next_attempt_at, quarantined \
                 FROM evaluation_attempts WHERE conversation_id = ?",
                params![conversation_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_attempt(&row)?)),
            None => Ok(None),
        }
    }

    async fn record_attempt(&self, attempt: &EvaluationAttempt) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO evaluation_attempts \
                     (conversation_id, attempts, last_error, last_attempt_at, next_attempt_at, quarantined) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(conversation_id) DO UPDATE SET \
                     attempts = excluded.attempts, \
                     last_error = excluded.last_error, \
                     last_attempt_at = excluded.last_attempt_at, \
                     next_attempt_at = excluded.next_attempt_at, \
                     quarantined = excluded.quarantined",
                params![
                    attempt.conversation_id.as_str(),
                    attempt.attempts as i64,
                    attempt.last_error.as_str(),
                    attempt.last_attempt_at,
                    attempt.next_attempt_at,
                    if attempt.quarantined { 1i64 } else { 0i64 }
                ],
            )
            .await?;
        Ok(())
    }

    async fn clear_attempt(&self, conversation_id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM evaluation_attempts WHERE conversation_id = ?",
                params![conversation_id],
            )
            .await?;
        Ok(())
    }

    async fn quarantined_conversations(&self) -> Result<Vec<EvaluationAttempt>> {
        let mut rows = self
            .conn
            .query(
                "SELECT conversation_id, attempts, last_error, last_attempt_at, next_attempt_at, quarantined \
                 FROM evaluation_attempts WHERE quarantined = 1 ORDER BY last_attempt_at DESC",
                params![],
            )
            .await?;

        let mut attempts = Vec::new();
        while let Some(row) = rows.next().await? {
            attempts.push(row_to_attempt(&row)?);
        }
        Ok(attempts)
    }
}

#[async_trait]
impl QueryStore for LibsqlStore {
    async fn list_conversations(&self, limit: usize) -> Result<Vec<ConversationWithEvaluation>> {
        let sql = format!(
            "SELECT {}, {} FROM conversations c {} \
             ORDER BY c.start_time_unix_secs DESC, c.id DESC LIMIT ?",
            CONVERSATION_COLUMNS, EVALUATION_COLUMNS, CURRENT_EVALUATION_JOIN
        );
        self.query_with_evaluation(&sql, params![limit as i64]).await
    }

    async fn conversation_with_evaluation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationWithEvaluation>> {
        let sql = format!(
            "SELECT {}, {} FROM conversations c {} WHERE c.conversation_id = ?",
            CONVERSATION_COLUMNS, EVALUATION_COLUMNS, CURRENT_EVALUATION_JOIN
        );
        let mut found = self
            .query_with_evaluation(&sql, params![conversation_id])
            .await?;
        Ok(found.pop())
    }

    async fn stats(&self) -> Result<ConversationStats> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM conversations),
                    (SELECT COUNT(*) FROM conversations WHERE call_successful = 'success'),
                    COUNT(*),
                    AVG(e.score)
                FROM evaluations e
                WHERE e.id = (
                    SELECT e2.id FROM evaluations e2
                    WHERE e2.conversation_id = e.conversation_id
                    ORDER BY e2.created_at DESC, e2.id DESC LIMIT 1
                )
                "#,
                params![],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| ConvaiError::Database("Stats query returned no rows".to_string()))?;

        let total: i64 = row.get(0)?;
        let successful: i64 = row.get(1)?;
        let evaluated: i64 = row.get(2)?;
        let average_score: Option<f64> = row.get(3)?;

        Ok(ConversationStats {
            total_conversations: total.max(0) as u64,
            evaluated_count: evaluated.max(0) as u64,
            successful_calls: successful.max(0) as u64,
            average_score,
        })
    }
}
