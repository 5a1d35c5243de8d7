//! Transcript-shape heuristic evaluator
//!
//! Scores a conversation from turn counts and turn balance alone. The same
//! transcript and context always produce the same evaluation.

use super::Evaluator;
use crate::error::Result;
use crate::types::{
    AgentPerformance, CallOutcome, Evaluation, EvaluationContext, Sentiment, SpeakerRole,
    TranscriptMessage,
};
use async_trait::async_trait;
use std::collections::HashMap;

/// Points per transcript turn
const POINTS_PER_TURN: f64 = 10.0;

/// Max bonus for a balanced user/agent exchange
const BALANCE_BONUS: f64 = 30.0;

/// Penalty when the provider marked the call unsuccessful
const FAILURE_PENALTY: f64 = 15.0;

const MAX_TOPICS: usize = 3;
const MIN_TOPIC_WORD_LEN: usize = 5;

const STOPWORDS: &[&str] = &[
    "about", "after", "again", "could", "doing", "hello", "their", "there", "these", "thing",
    "think", "those", "thank", "thanks", "today", "until", "wanted", "where", "which", "while",
    "would", "yeah", "right", "please", "really", "something",
];

/// Deterministic evaluator driven by transcript statistics
#[derive(Debug, Default, Clone)]
pub struct HeuristicEvaluator;

impl HeuristicEvaluator {
    pub fn new() -> Self {
        Self
    }
}

struct TurnCounts {
    user: usize,
    agent: usize,
}

impl TurnCounts {
    fn of(transcript: &[TranscriptMessage]) -> Self {
        let user = transcript
            .iter()
            .filter(|m| m.role == SpeakerRole::User)
            .count();
        Self {
            user,
            agent: transcript.len() - user,
        }
    }

    fn total(&self) -> usize {
        self.user + self.agent
    }

    /// 1.0 for an even exchange, 0.0 when one side never spoke
    fn balance(&self) -> f64 {
        let max = self.user.max(self.agent);
        if max == 0 {
            return 0.0;
        }
        self.user.min(self.agent) as f64 / max as f64
    }
}

fn rating(value: f64) -> u8 {
    AgentPerformance::clamp_rating(value)
}

/// Most frequent longer words spoken by the user
fn key_topics(transcript: &[TranscriptMessage]) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();

    for message in transcript.iter().filter(|m| m.role == SpeakerRole::User) {
        for word in message
            .message
            .split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
            .filter(|w| w.chars().count() >= MIN_TOPIC_WORD_LEN)
            .filter(|w| !STOPWORDS.contains(&w.as_str()))
        {
            *counts.entry(word).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<_> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let topics: Vec<String> = ranked
        .into_iter()
        .take(MAX_TOPICS)
        .map(|(word, _)| word)
        .collect();

    if topics.is_empty() {
        vec!["general inquiry".to_string()]
    } else {
        topics
    }
}

#[async_trait]
impl Evaluator for HeuristicEvaluator {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn evaluate(
        &self,
        transcript: &[TranscriptMessage],
        context: &EvaluationContext,
    ) -> Result<Evaluation> {
        let turns = TurnCounts::of(transcript);
        let balance = turns.balance();

        let mut score = turns.total() as f64 * POINTS_PER_TURN + balance * BALANCE_BONUS;
        if context.call_successful == CallOutcome::Failure {
            score -= FAILURE_PENALTY;
        }
        let score = score.clamp(0.0, 100.0).round();

        let outcome_factor = match context.call_successful {
            CallOutcome::Success => 1.0,
            CallOutcome::Unknown => 0.5,
            CallOutcome::Failure => 0.0,
        };

        let agent_performance = AgentPerformance {
            responsiveness: rating(turns.agent as f64 / turns.user.max(1) as f64 * 5.0),
            accuracy: rating(7.0 + balance * 3.0),
            helpfulness: rating(6.0 + outcome_factor * 4.0),
        };

        let mut strengths = Vec::new();
        let mut improvements = Vec::new();

        if turns.agent >= turns.user && turns.user > 0 {
            strengths.push("Agent responded to all user queries".to_string());
        } else {
            improvements.push("Some user turns went unanswered".to_string());
        }
        if balance >= 0.5 {
            strengths.push("Conversation flow was natural".to_string());
        } else {
            improvements.push("Exchange was one-sided".to_string());
        }
        if context.call_successful == CallOutcome::Failure {
            improvements.push("Call did not reach its goal".to_string());
        }

        Ok(Evaluation {
            score,
            summary: format!(
                "Conversation with {} messages. {} from user, {} from agent.",
                turns.total(),
                turns.user,
                turns.agent
            ),
            strengths,
            improvements,
            sentiment: Sentiment::from_score(score),
            key_topics: key_topics(transcript),
            agent_performance,
        })
    }
}
