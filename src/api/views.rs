//! JSON projections served by the read API

use crate::types::{
    CallOutcome, ConversationStats, ConversationStatus, ConversationWithEvaluation, Direction,
    TranscriptMessage,
};
use serde::Serialize;

/// One row of the conversation list
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummaryView {
    pub id: String,
    pub agent_name: String,
    pub start_time: i64,
    pub duration: i64,
    pub message_count: i64,
    pub status: ConversationStatus,
    pub call_successful: CallOutcome,
    pub direction: Option<Direction>,
    pub summary: Option<String>,
    pub evaluation: Option<serde_json::Value>,
    pub score: Option<f64>,
}

impl From<ConversationWithEvaluation> for ConversationSummaryView {
    fn from(item: ConversationWithEvaluation) -> Self {
        let conversation = item.conversation;
        let summary = conversation.display_summary().map(str::to_string);
        let (evaluation, score) = match item.evaluation {
            Some(e) => (Some(e.payload), Some(e.score)),
            None => (None, None),
        };

        Self {
            id: conversation.conversation_id,
            agent_name: conversation.agent_name,
            start_time: conversation.start_time_unix_secs,
            duration: conversation.call_duration_secs,
            message_count: conversation.message_count,
            status: conversation.status,
            call_successful: conversation.call_successful,
            direction: conversation.direction,
            summary,
            evaluation,
            score,
        }
    }
}

/// Envelope of `GET /api/conversations`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationListView {
    pub conversations: Vec<ConversationSummaryView>,
}

/// Full conversation including transcript
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDetailView {
    pub id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub start_time: i64,
    pub duration: i64,
    pub message_count: i64,
    pub status: ConversationStatus,
    pub call_successful: CallOutcome,
    pub direction: Option<Direction>,
    pub summary: Option<String>,
    pub transcript: Option<Vec<TranscriptMessage>>,
    pub evaluation: Option<serde_json::Value>,
    pub score: Option<f64>,
}

impl From<ConversationWithEvaluation> for ConversationDetailView {
    fn from(item: ConversationWithEvaluation) -> Self {
        let conversation = item.conversation;
        let summary = conversation.display_summary().map(str::to_string);
        let (evaluation, score) = match item.evaluation {
            Some(e) => (Some(e.payload), Some(e.score)),
            None => (None, None),
        };

        Self {
            id: conversation.conversation_id,
            agent_id: conversation.agent_id,
            agent_name: conversation.agent_name,
            start_time: conversation.start_time_unix_secs,
            duration: conversation.call_duration_secs,
            message_count: conversation.message_count,
            status: conversation.status,
            call_successful: conversation.call_successful,
            direction: conversation.direction,
            summary,
            transcript: conversation.transcript,
            evaluation,
            score,
        }
    }
}

/// Aggregate counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsView {
    pub total_conversations: u64,
    pub evaluated_count: u64,
    pub unevaluated_count: u64,
    /// Rounded to one decimal, 0 when nothing is evaluated
    pub average_score: f64,
    /// Integer percent, 0 when there are no conversations
    pub success_rate: u64,
}

impl From<ConversationStats> for StatsView {
    fn from(stats: ConversationStats) -> Self {
        let average = stats.average_score.unwrap_or(0.0);

        Self {
            total_conversations: stats.total_conversations,
            evaluated_count: stats.evaluated_count,
            unevaluated_count: stats.unevaluated_count(),
            average_score: (average * 10.0).round() / 10.0,
            success_rate: stats.success_rate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_view_rounding() {
        let view = StatsView::from(ConversationStats {
            total_conversations: 3,
            evaluated_count: 2,
            successful_calls: 1,
            average_score: Some(66.666),
        });

        assert_eq!(view.average_score, 66.7);
        assert_eq!(view.unevaluated_count, 1);
        assert_eq!(view.success_rate, 33);

        let json = serde_json::to_value(view).unwrap();
        assert_eq!(json["totalConversations"], 3);
        assert_eq!(json["unevaluatedCount"], 1);
    }

    #[test]
    fn test_empty_stats_view() {
        let view = StatsView::from(ConversationStats {
            total_conversations: 0,
            evaluated_count: 0,
            successful_calls: 0,
            average_score: None,
        });
        assert_eq!(view.average_score, 0.0);
        assert_eq!(view.success_rate, 0);
    }
}
