//! Evaluation driver
//!
//! Scores done, transcribed, not-yet-evaluated conversations oldest first.
//! A failing conversation is retried with exponential backoff and
//! quarantined after `max_attempts` failures; a success clears its record.

use super::retry_delay;
use crate::clock::Clock;
use crate::config::EvaluationConfig;
use crate::error::{ConvaiError, Result};
use crate::evaluator::{validate_evaluation, Evaluator};
use crate::scheduler::{JobReport, PeriodicJob};
use crate::storage::EvaluationStore;
use crate::types::{
    ConversationRecord, Evaluation, EvaluationAttempt, EvaluationContext, NewEvaluation,
    TranscriptMessage,
};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Outcome of one evaluation cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationReport {
    /// Eligible conversations selected for this cycle
    pub candidates: usize,
    pub evaluated: usize,
    pub failed: usize,
    /// Failures that pushed a conversation into quarantine
    pub quarantined: usize,
    /// Candidates no longer eligible when their turn came
    pub skipped: usize,
}

/// Scores eligible conversations and appends evaluation rows
pub struct EvaluationDriver {
    store: Arc<dyn EvaluationStore>,
    evaluator: Arc<dyn Evaluator>,
    clock: Arc<dyn Clock>,
    config: EvaluationConfig,
}

impl EvaluationDriver {
    pub fn new(
        store: Arc<dyn EvaluationStore>,
        evaluator: Arc<dyn Evaluator>,
        clock: Arc<dyn Clock>,
        config: EvaluationConfig,
    ) -> Self {
        Self {
            store,
            evaluator,
            clock,
            config,
        }
    }

    /// Run one full evaluation cycle
    pub async fn run_cycle(&self) -> Result<EvaluationReport> {
        let candidates = self
            .store
            .eligible_for_evaluation(self.clock.now_unix(), self.config.batch_size)
            .await?;

        let mut report = EvaluationReport {
            candidates: candidates.len(),
            ..EvaluationReport::default()
        };

        if candidates.is_empty() {
            debug!("[evaluator] Nothing to evaluate");
            return Ok(report);
        }
        info!("[evaluator] Found {} unevaluated conversations", candidates.len());

        for record in &candidates {
            self.process(record, &mut report).await?;
        }

        info!(
            "[evaluator] Cycle done: {} evaluated, {} failed, {} quarantined, {} skipped",
            report.evaluated, report.failed, report.quarantined, report.skipped
        );
        Ok(report)
    }

    async fn process(&self, record: &ConversationRecord, report: &mut EvaluationReport) -> Result<()> {
        let id = record.conversation_id.as_str();

        // Another cycle may have evaluated it since the candidate list was built
        if !self.store.is_eligible(id, self.clock.now_unix()).await? {
            debug!("[evaluator] {} no longer eligible", id);
            report.skipped += 1;
            return Ok(());
        }

        let transcript = match record.transcript.as_deref() {
            Some(transcript) if record.is_evaluable() => transcript,
            _ => {
                report.skipped += 1;
                return Ok(());
            }
        };

        debug!("[evaluator] Evaluating conversation {}...", id);
        match self.evaluate(transcript, record).await {
            Ok(evaluation) => {
                let score = evaluation.score;
                self.store
                    .insert_evaluation(&NewEvaluation {
                        conversation_id: id.to_string(),
                        evaluation,
                        created_at: self.clock.now_unix(),
                    })
                    .await?;
                self.store.clear_attempt(id).await?;
                report.evaluated += 1;
                info!("[evaluator] Evaluated {} with score {}", id, score);
            }
            Err(e) => {
                let previous = self.store.get_attempt(id).await?;
                let attempt = self.next_attempt(previous.as_ref(), id, &e);
                self.store.record_attempt(&attempt).await?;
                report.failed += 1;

                if attempt.quarantined {
                    report.quarantined += 1;
                    warn!(
                        "[evaluator] Quarantined {} after {} failed attempts: {}",
                        id, attempt.attempts, e
                    );
                } else {
                    warn!(
                        "[evaluator] Failed to evaluate {} (attempt {}, retry at {}): {}",
                        id, attempt.attempts, attempt.next_attempt_at, e
                    );
                }
            }
        }

        Ok(())
    }

    /// Call the evaluator under the configured timeout and validate its output
    async fn evaluate(
        &self,
        transcript: &[TranscriptMessage],
        record: &ConversationRecord,
    ) -> Result<Evaluation> {
        let context = EvaluationContext::from(record);
        let limit = self.config.evaluator_timeout;

        let evaluation = timeout(limit, self.evaluator.evaluate(transcript, &context))
            .await
            .map_err(|_| {
                ConvaiError::Evaluation(format!(
                    "{} evaluator timed out after {:?}",
                    self.evaluator.name(),
                    limit
                ))
            })??;

        validate_evaluation(&evaluation)?;
        Ok(evaluation)
    }

    /// Failure bookkeeping after one more failed attempt
    fn next_attempt(
        &self,
        previous: Option<&EvaluationAttempt>,
        conversation_id: &str,
        error: &ConvaiError,
    ) -> EvaluationAttempt {
        let now = self.clock.now_unix();
        let attempts = previous.map(|a| a.attempts).unwrap_or(0).saturating_add(1);
        let delay = retry_delay(
            self.config.retry_backoff,
            self.config.max_retry_backoff,
            attempts,
        );

        EvaluationAttempt {
            conversation_id: conversation_id.to_string(),
            attempts,
            last_error: error.to_string(),
            last_attempt_at: now,
            next_attempt_at: now.saturating_add(delay.as_secs() as i64),
            quarantined: self.config.max_attempts > 0 && attempts >= self.config.max_attempts,
        }
    }
}

impl From<&EvaluationReport> for JobReport {
    fn from(report: &EvaluationReport) -> Self {
        JobReport {
            items_processed: report.candidates,
            changes_made: report.evaluated,
            errors: report.failed,
            duration: Duration::default(),
        }
    }
}

#[async_trait]
impl PeriodicJob for EvaluationDriver {
    fn name(&self) -> &str {
        "evaluator"
    }

    async fn run_once(&self) -> Result<JobReport> {
        let started = Instant::now();
        let report = self.run_cycle().await?;
        Ok(JobReport {
            duration: started.elapsed(),
            ..JobReport::from(&report)
        })
    }
}
