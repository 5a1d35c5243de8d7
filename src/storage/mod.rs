//! Storage layer for the conversation evaluator
//!
//! Provides the persistence contracts used by the two pipeline drivers and
//! the read API:
//! - [`ConversationStore`]: conversation rows and the sync watermark (written by sync only)
//! - [`EvaluationStore`]: append-only evaluations and retry bookkeeping (written by evaluation only)
//! - [`QueryStore`]: read projections for the HTTP API
//!
//! The merge policy that decides what a freshly fetched entry does to the
//! stored row lives in [`plan_merge`].

pub mod libsql;
pub mod schema;

pub use self::libsql::LibsqlStore;

use crate::error::Result;
use crate::types::{
    ConversationMetadata, ConversationRecord, ConversationStats, ConversationStatus,
    ConversationWithEvaluation, EvaluationAttempt, EvaluationResult, NewEvaluation,
    TranscriptFetchAttempt, TranscriptMessage,
};
use async_trait::async_trait;

/// Conversation rows plus the sync watermark
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Look up a conversation by provider id
    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<ConversationRecord>>;

    /// Insert or update keyed by `conversation_id`
    ///
    /// Never touches `created_at` or identity columns on update, and never
    /// clears a stored transcript.
    async fn upsert_conversation(&self, record: &ConversationRecord) -> Result<()>;

    /// Attach a transcript to a row that has none yet
    ///
    /// Returns false if the row is missing or already has a transcript.
    /// A successful attach also drops the row's fetch-failure bookkeeping.
    async fn attach_transcript(
        &self,
        conversation_id: &str,
        transcript: &[TranscriptMessage],
        call_duration_secs: Option<i64>,
        processed_at: i64,
    ) -> Result<bool>;

    /// Done conversations stored without a transcript that are due for a fetch at `now`
    ///
    /// Abandoned rows and rows still in their retry backoff are excluded.
    /// Rows with fewer failed fetches come first, then oldest start time.
    async fn conversations_missing_transcript(
        &self,
        now: i64,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>>;

    async fn get_transcript_fetch(&self, conversation_id: &str) -> Result<Option<TranscriptFetchAttempt>>;

    /// Persist the fetch-failure state computed by the sync driver
    async fn record_transcript_fetch(&self, attempt: &TranscriptFetchAttempt) -> Result<()>;

    /// Conversations whose transcript fetch was given up on
    async fn abandoned_transcripts(&self) -> Result<Vec<TranscriptFetchAttempt>>;

    /// Current watermark, `None` before the first successful sync
    async fn watermark(&self) -> Result<Option<i64>>;

    /// Move the watermark forward; a lower value leaves it unchanged
    ///
    /// Returns the stored value after the write.
    async fn advance_watermark(&self, timestamp: i64) -> Result<i64>;
}

/// Evaluation history and the retry state of failing conversations
#[async_trait]
pub trait EvaluationStore: Send + Sync {
    /// Conversations ready for evaluation at `now`, oldest start time first
    async fn eligible_for_evaluation(&self, now: i64, limit: usize) -> Result<Vec<ConversationRecord>>;

    /// Re-check eligibility of a single conversation
    async fn is_eligible(&self, conversation_id: &str, now: i64) -> Result<bool>;

    /// Append an evaluation row, returning its id
    async fn insert_evaluation(&self, evaluation: &NewEvaluation) -> Result<i64>;

    /// Current evaluation: latest `created_at`, ties broken by row id
    async fn latest_evaluation(&self, conversation_id: &str) -> Result<Option<EvaluationResult>>;

    /// Every evaluation of a conversation, newest first
    async fn evaluation_history(&self, conversation_id: &str) -> Result<Vec<EvaluationResult>>;

    async fn get_attempt(&self, conversation_id: &str) -> Result<Option<EvaluationAttempt>>;

    /// Persist the failure state computed by the evaluation driver
    async fn record_attempt(&self, attempt: &EvaluationAttempt) -> Result<()>;

    async fn clear_attempt(&self, conversation_id: &str) -> Result<()>;

    /// Conversations that exhausted their evaluation attempts
    async fn quarantined_conversations(&self) -> Result<Vec<EvaluationAttempt>>;
}

/// Read-only projections backing the HTTP API
#[async_trait]
pub trait QueryStore: Send + Sync {
    /// Newest conversations first, each with its current evaluation
    async fn list_conversations(&self, limit: usize) -> Result<Vec<ConversationWithEvaluation>>;

    async fn conversation_with_evaluation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationWithEvaluation>>;

    async fn stats(&self) -> Result<ConversationStats>;
}

/// What a freshly fetched list entry does to the stored row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePlan {
    /// First sighting
    Insert { fetch_transcript: bool },

    /// Status changed since the last merge
    Update { fetch_transcript: bool },

    /// Same status as stored; the row is left untouched
    Unchanged { missing_transcript: bool },
}

impl MergePlan {
    pub fn fetch_transcript(&self) -> bool {
        match self {
            MergePlan::Insert { fetch_transcript } | MergePlan::Update { fetch_transcript } => {
                *fetch_transcript
            }
            MergePlan::Unchanged { .. } => false,
        }
    }
}

/// Decide how to merge `incoming` into `existing`
///
/// Status is the only change signal: an entry whose status matches the
/// stored one is ignored even if other fields differ. Transcripts are only
/// fetched for `done` conversations that do not have one yet.
pub fn plan_merge(existing: Option<&ConversationRecord>, incoming: &ConversationMetadata) -> MergePlan {
    let is_done = incoming.status == ConversationStatus::Done;

    match existing {
        None => MergePlan::Insert {
            fetch_transcript: is_done,
        },
        Some(stored) if stored.status == incoming.status => MergePlan::Unchanged {
            missing_transcript: is_done && !stored.has_transcript(),
        },
        Some(stored) => MergePlan::Update {
            fetch_transcript: is_done && !stored.has_transcript(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallOutcome, SpeakerRole};

    fn incoming(status: ConversationStatus) -> ConversationMetadata {
        ConversationMetadata {
            conversation_id: "abc123".to_string(),
            agent_id: "agent_1".to_string(),
            agent_name: "Support".to_string(),
            start_time_unix_secs: 1_700_000_000,
            call_duration_secs: 12,
            message_count: 5,
            status,
            call_successful: CallOutcome::Unknown,
            direction: None,
            transcript_summary: None,
            call_summary_title: None,
        }
    }

    fn stored(status: ConversationStatus, with_transcript: bool) -> ConversationRecord {
        let mut record = ConversationRecord::from_metadata(&incoming(status), None, 1_700_000_100);
        if with_transcript {
            record.transcript = Some(vec![TranscriptMessage {
                role: SpeakerRole::Agent,
                time_in_call_secs: 0.0,
                message: "Hi".to_string(),
            }]);
        }
        record
    }

    #[test]
    fn test_new_conversation_is_inserted() {
        assert_eq!(
            plan_merge(None, &incoming(ConversationStatus::InProgress)),
            MergePlan::Insert { fetch_transcript: false }
        );
        assert_eq!(
            plan_merge(None, &incoming(ConversationStatus::Done)),
            MergePlan::Insert { fetch_transcript: true }
        );
    }

    #[test]
    fn test_same_status_is_noop() {
        let existing = stored(ConversationStatus::Processing, false);
        assert_eq!(
            plan_merge(Some(&existing), &incoming(ConversationStatus::Processing)),
            MergePlan::Unchanged { missing_transcript: false }
        );
    }

    #[test]
    fn test_done_without_transcript_is_flagged() {
        let existing = stored(ConversationStatus::Done, false);
        let plan = plan_merge(Some(&existing), &incoming(ConversationStatus::Done));
        assert_eq!(plan, MergePlan::Unchanged { missing_transcript: true });
        assert!(!plan.fetch_transcript());
    }

    #[test]
    fn test_status_change_to_done_fetches_transcript_once() {
        let existing = stored(ConversationStatus::Initiated, false);
        assert_eq!(
            plan_merge(Some(&existing), &incoming(ConversationStatus::Done)),
            MergePlan::Update { fetch_transcript: true }
        );

        let with_transcript = stored(ConversationStatus::Processing, true);
        assert_eq!(
            plan_merge(Some(&with_transcript), &incoming(ConversationStatus::Done)),
            MergePlan::Update { fetch_transcript: false }
        );
    }

    #[test]
    fn test_failed_never_fetches() {
        let existing = stored(ConversationStatus::Processing, false);
        assert_eq!(
            plan_merge(Some(&existing), &incoming(ConversationStatus::Failed)),
            MergePlan::Update { fetch_transcript: false }
        );
    }
}
