//! Core data types for the conversation evaluator
//!
//! This module defines the data structures shared by the remote client, the
//! store, the evaluators and the read API: provider payloads, persisted
//! conversation and evaluation records, and the evaluation payload itself.

use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

/// Deserialize `null` as the type's default instead of failing the record
fn null_to_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Conversation lifecycle as reported by the provider
///
/// Progresses `initiated → in-progress → processing → {done | failed}`. The
/// provider is the source of truth; we only observe transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationStatus {
    Initiated,
    InProgress,
    Processing,
    Done,
    Failed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Initiated => "initiated",
            ConversationStatus::InProgress => "in-progress",
            ConversationStatus::Processing => "processing",
            ConversationStatus::Done => "done",
            ConversationStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(ConversationStatus::Initiated),
            "in-progress" => Ok(ConversationStatus::InProgress),
            "processing" => Ok(ConversationStatus::Processing),
            "done" => Ok(ConversationStatus::Done),
            "failed" => Ok(ConversationStatus::Failed),
            other => Err(format!("Unknown conversation status: {}", other)),
        }
    }
}

/// Provider's verdict on whether the call achieved its goal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    Failure,
    Unknown,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Failure => "failure",
            CallOutcome::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CallOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(CallOutcome::Success),
            "failure" => Ok(CallOutcome::Failure),
            "unknown" => Ok(CallOutcome::Unknown),
            other => Err(format!("Unknown call outcome: {}", other)),
        }
    }
}

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(format!("Unknown direction: {}", other)),
        }
    }
}

/// Who spoke a transcript line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerRole {
    User,
    Agent,
}

/// One line of a conversation transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: SpeakerRole,

    /// Offset from call start, in seconds
    #[serde(default, deserialize_with = "null_to_default")]
    pub time_in_call_secs: f64,

    /// Spoken text (tool-call turns carry no text)
    #[serde(default, deserialize_with = "null_to_default")]
    pub message: String,
}

/// Summary-level conversation entry returned by the provider's list call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMetadata {
    pub conversation_id: String,
    pub agent_id: String,
    #[serde(default, deserialize_with = "null_to_default")]
    pub agent_name: String,
    pub start_time_unix_secs: i64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub call_duration_secs: i64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub message_count: i64,
    pub status: ConversationStatus,
    pub call_successful: CallOutcome,
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub transcript_summary: Option<String>,
    #[serde(default)]
    pub call_summary_title: Option<String>,
}

/// Detail-level metadata; its duration is authoritative over the list call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailsMetadata {
    pub start_time_unix_secs: i64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub call_duration_secs: i64,
}

/// Full conversation as returned by the provider's detail call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationDetails {
    pub conversation_id: String,
    pub agent_id: String,
    pub status: ConversationStatus,
    #[serde(default, deserialize_with = "null_to_default")]
    pub transcript: Vec<TranscriptMessage>,
    pub metadata: DetailsMetadata,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub analysis: Option<serde_json::Value>,
}

/// A conversation as persisted locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub start_time_unix_secs: i64,
    pub call_duration_secs: i64,
    pub message_count: i64,
    pub status: ConversationStatus,
    pub call_successful: CallOutcome,
    pub direction: Option<Direction>,
    pub transcript_summary: Option<String>,
    pub call_summary_title: Option<String>,

    /// Never cleared once set
    pub transcript: Option<Vec<TranscriptMessage>>,

    /// Last local merge time (unix seconds)
    pub processed_at: i64,

    /// First local sighting (unix seconds), immutable
    pub created_at: i64,
}

impl ConversationRecord {
    /// Build the record to upsert for a freshly fetched list entry
    ///
    /// When `details` are available their duration replaces the list-level
    /// duration and their transcript is attached.
    pub fn from_metadata(
        metadata: &ConversationMetadata,
        details: Option<&ConversationDetails>,
        processed_at: i64,
    ) -> Self {
        let (call_duration_secs, transcript) = match details {
            Some(d) => (d.metadata.call_duration_secs, Some(d.transcript.clone())),
            None => (metadata.call_duration_secs, None),
        };

        Self {
            conversation_id: metadata.conversation_id.clone(),
            agent_id: metadata.agent_id.clone(),
            agent_name: metadata.agent_name.clone(),
            start_time_unix_secs: metadata.start_time_unix_secs,
            call_duration_secs,
            message_count: metadata.message_count,
            status: metadata.status,
            call_successful: metadata.call_successful,
            direction: metadata.direction,
            transcript_summary: metadata.transcript_summary.clone(),
            call_summary_title: metadata.call_summary_title.clone(),
            transcript,
            processed_at,
            created_at: processed_at,
        }
    }

    pub fn has_transcript(&self) -> bool {
        self.transcript.is_some()
    }

    /// Done with a transcript: the precondition for evaluation
    pub fn is_evaluable(&self) -> bool {
        self.status == ConversationStatus::Done && self.has_transcript()
    }

    /// Best available one-line summary
    pub fn display_summary(&self) -> Option<&str> {
        self.transcript_summary
            .as_deref()
            .or(self.call_summary_title.as_deref())
    }
}

/// Overall tone of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    /// Map a 0-100 score onto a sentiment bucket
    pub fn from_score(score: f64) -> Self {
        if score > 70.0 {
            Sentiment::Positive
        } else if score > 40.0 {
            Sentiment::Neutral
        } else {
            Sentiment::Negative
        }
    }
}

/// Per-dimension agent ratings, each 0-10
///
/// Decoding accepts any number and rounds it into range, so an LLM reply
/// of `7.5` or `11` still yields a usable rating.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentPerformance {
    #[serde(deserialize_with = "lenient_rating")]
    pub responsiveness: u8,
    #[serde(deserialize_with = "lenient_rating")]
    pub accuracy: u8,
    #[serde(deserialize_with = "lenient_rating")]
    pub helpfulness: u8,
}

impl AgentPerformance {
    pub const MAX_RATING: u8 = 10;

    /// Round and clamp a raw rating into `0..=MAX_RATING`
    pub fn clamp_rating(value: f64) -> u8 {
        value.round().clamp(0.0, Self::MAX_RATING as f64) as u8
    }
}

fn lenient_rating<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() {
        return Err(serde::de::Error::custom(format!("invalid rating: {}", value)));
    }
    Ok(AgentPerformance::clamp_rating(value))
}

/// Structured result produced by an evaluator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Overall quality, 0-100
    pub score: f64,
    pub summary: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    pub sentiment: Sentiment,
    #[serde(default)]
    pub key_topics: Vec<String>,
    pub agent_performance: AgentPerformance,
}

/// Conversation metadata handed to an evaluator alongside the transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    pub conversation_id: String,
    pub agent_name: String,
    pub duration_secs: i64,
    pub call_successful: CallOutcome,
    pub message_count: i64,
}

impl From<&ConversationRecord> for EvaluationContext {
    fn from(record: &ConversationRecord) -> Self {
        Self {
            conversation_id: record.conversation_id.clone(),
            agent_name: record.agent_name.clone(),
            duration_secs: record.call_duration_secs,
            call_successful: record.call_successful,
            message_count: record.message_count,
        }
    }
}

/// Evaluation row about to be appended
#[derive(Debug, Clone)]
pub struct NewEvaluation {
    pub conversation_id: String,
    pub evaluation: Evaluation,
    pub created_at: i64,
}

/// A persisted evaluation row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub id: i64,
    pub conversation_id: String,
    pub score: f64,
    pub summary: String,
    /// Full evaluator output as stored
    pub payload: serde_json::Value,
    pub created_at: i64,
}

/// Failure bookkeeping for a conversation whose evaluation keeps failing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationAttempt {
    pub conversation_id: String,
    pub attempts: u32,
    pub last_error: String,
    pub last_attempt_at: i64,
    pub next_attempt_at: i64,
    pub quarantined: bool,
}

/// Failure bookkeeping for a done conversation whose transcript fetch keeps failing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptFetchAttempt {
    pub conversation_id: String,
    pub attempts: u32,
    pub last_error: String,
    pub last_attempt_at: i64,
    /// Earliest time the backfill may request details again
    pub next_fetch_at: i64,
    /// No further fetches are made once set
    pub abandoned: bool,
}

/// A conversation joined with its current evaluation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationWithEvaluation {
    pub conversation: ConversationRecord,
    pub evaluation: Option<EvaluationResult>,
}

/// Aggregate statistics over the store
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConversationStats {
    pub total_conversations: u64,
    pub evaluated_count: u64,
    pub successful_calls: u64,
    /// Mean of current scores; `None` when nothing is evaluated
    pub average_score: Option<f64>,
}

impl ConversationStats {
    pub fn unevaluated_count(&self) -> u64 {
        self.total_conversations.saturating_sub(self.evaluated_count)
    }

    /// Percent of calls the provider marked successful, 0 when empty
    pub fn success_rate(&self) -> u64 {
        if self.total_conversations == 0 {
            return 0;
        }
        ((self.successful_calls as f64 / self.total_conversations as f64) * 100.0).round() as u64
    }
}
