//! Conversation evaluators
//!
//! An [`Evaluator`] scores a finished conversation's transcript and returns
//! a structured [`Evaluation`]. Two implementations ship:
//! - [`HeuristicEvaluator`]: deterministic, offline, derived from transcript shape
//! - [`LlmEvaluator`]: asks Claude for a JSON evaluation
//!
//! The evaluation driver only talks to the trait; which implementation runs
//! is decided once at startup by [`build_evaluator`].

pub mod heuristic;
pub mod llm;

pub use heuristic::HeuristicEvaluator;
pub use llm::LlmEvaluator;

use crate::config::{EvaluatorConfig, EvaluatorKind};
use crate::error::{ConvaiError, Result};
use crate::types::{AgentPerformance, Evaluation, EvaluationContext, TranscriptMessage};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Highest value of any agent performance dimension
pub const MAX_PERFORMANCE_RATING: u8 = AgentPerformance::MAX_RATING;

/// Scores a transcript
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn evaluate(
        &self,
        transcript: &[TranscriptMessage],
        context: &EvaluationContext,
    ) -> Result<Evaluation>;
}

/// Reject evaluations that must not be persisted
pub fn validate_evaluation(evaluation: &Evaluation) -> Result<()> {
    if !evaluation.score.is_finite() || !(0.0..=100.0).contains(&evaluation.score) {
        return Err(ConvaiError::Evaluation(format!(
            "Score out of range: {}",
            evaluation.score
        )));
    }

    let perf = &evaluation.agent_performance;
    for (dimension, value) in [
        ("responsiveness", perf.responsiveness),
        ("accuracy", perf.accuracy),
        ("helpfulness", perf.helpfulness),
    ] {
        if value > MAX_PERFORMANCE_RATING {
            return Err(ConvaiError::Evaluation(format!(
                "Agent {} rating out of range: {}",
                dimension, value
            )));
        }
    }

    Ok(())
}

/// Instantiate the configured evaluator
pub fn build_evaluator(config: &EvaluatorConfig) -> Result<Arc<dyn Evaluator>> {
    let evaluator: Arc<dyn Evaluator> = match config.kind {
        EvaluatorKind::Heuristic => Arc::new(HeuristicEvaluator::new()),
        EvaluatorKind::Llm => Arc::new(LlmEvaluator::new(config.llm.clone())?),
    };

    info!("Using {} evaluator", evaluator.name());
    Ok(evaluator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use crate::types::{AgentPerformance, Sentiment};

    fn evaluation(score: f64, responsiveness: u8) -> Evaluation {
        Evaluation {
            score,
            summary: "ok".to_string(),
            strengths: vec![],
            improvements: vec![],
            sentiment: Sentiment::Neutral,
            key_topics: vec![],
            agent_performance: AgentPerformance {
                responsiveness,
                accuracy: 5,
                helpfulness: 5,
            },
        }
    }

    #[test]
    fn test_validate_score_bounds() {
        assert!(validate_evaluation(&evaluation(0.0, 5)).is_ok());
        assert!(validate_evaluation(&evaluation(100.0, 5)).is_ok());
        assert!(validate_evaluation(&evaluation(100.5, 5)).is_err());
        assert!(validate_evaluation(&evaluation(-1.0, 5)).is_err());
        assert!(validate_evaluation(&evaluation(f64::NAN, 5)).is_err());
        assert!(validate_evaluation(&evaluation(50.0, 11)).is_err());
    }

    #[test]
    fn test_build_evaluator_selects_kind() {
        let heuristic = build_evaluator(&EvaluatorConfig::default()).unwrap();
        assert_eq!(heuristic.name(), "heuristic");

        let llm = build_evaluator(&EvaluatorConfig {
            kind: EvaluatorKind::Llm,
            llm: LlmConfig {
                api_key: "sk-test".to_string(),
                ..LlmConfig::default()
            },
        })
        .unwrap();
        assert_eq!(llm.name(), "llm");

        let missing_key = build_evaluator(&EvaluatorConfig {
            kind: EvaluatorKind::Llm,
            llm: LlmConfig {
                api_key: String::new(),
                ..LlmConfig::default()
            },
        });
        assert!(missing_key.is_err());
    }
}
