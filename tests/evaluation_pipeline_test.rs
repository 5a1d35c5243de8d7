//! Evaluation driver: eligibility, retry backoff and quarantine

mod common;

use common::{create_test_store, meta, test_clock, transcript, ScriptedEvaluator, Step, T0};
use convai_evaluator::config::EvaluationConfig;
use convai_evaluator::storage::{ConversationStore, EvaluationStore, QueryStore};
use convai_evaluator::types::{ConversationRecord, ConversationStatus};
use convai_evaluator::{EvaluationDriver, LibsqlStore, ManualClock};
use std::sync::Arc;
use std::time::Duration;

fn config() -> EvaluationConfig {
    EvaluationConfig {
        max_attempts: 3,
        retry_backoff: Duration::from_secs(60),
        max_retry_backoff: Duration::from_secs(3600),
        evaluator_timeout: Duration::from_secs(5),
        ..EvaluationConfig::default()
    }
}

async fn seed(store: &LibsqlStore, id: &str, status: ConversationStatus, start: i64, turns: Option<usize>) {
    let mut record = ConversationRecord::from_metadata(&meta(id, status, start), None, T0);
    record.transcript = turns.map(transcript);
    store.upsert_conversation(&record).await.unwrap();
}

fn driver(
    store: &Arc<LibsqlStore>,
    evaluator: &Arc<ScriptedEvaluator>,
    clock: &Arc<ManualClock>,
    config: EvaluationConfig,
) -> EvaluationDriver {
    EvaluationDriver::new(store.clone(), evaluator.clone(), clock.clone(), config)
}

#[tokio::test]
async fn test_only_done_transcribed_conversations_are_evaluated() {
    let (store, _dir) = create_test_store().await;
    let clock = test_clock();
    let evaluator = Arc::new(ScriptedEvaluator::new(vec![]));

    seed(&store, "ready", ConversationStatus::Done, T0 + 10, Some(4)).await;
    seed(&store, "no_transcript", ConversationStatus::Done, T0 + 20, None).await;
    seed(&store, "still_live", ConversationStatus::InProgress, T0 + 30, None).await;
    seed(&store, "failed_call", ConversationStatus::Failed, T0 + 40, Some(2)).await;

    let report = driver(&store, &evaluator, &clock, config())
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(report.candidates, 1);
    assert_eq!(report.evaluated, 1);
    assert_eq!(evaluator.calls(), 1);

    let latest = store.latest_evaluation("ready").await.unwrap().unwrap();
    assert_eq!(latest.score, 80.0);
    assert_eq!(latest.created_at, T0);
    assert_eq!(latest.payload["score"], 80.0);

    for id in ["no_transcript", "still_live", "failed_call"] {
        assert!(store.latest_evaluation(id).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_candidates_are_processed_oldest_first_in_batches() {
    let (store, _dir) = create_test_store().await;
    let clock = test_clock();
    let evaluator = Arc::new(ScriptedEvaluator::new(vec![]));

    seed(&store, "newest", ConversationStatus::Done, T0 + 300, Some(4)).await;
    seed(&store, "oldest", ConversationStatus::Done, T0 + 100, Some(4)).await;
    seed(&store, "middle", ConversationStatus::Done, T0 + 200, Some(4)).await;

    let batch = EvaluationConfig {
        batch_size: 2,
        ..config()
    };
    let evaluation = driver(&store, &evaluator, &clock, batch);

    let first = evaluation.run_cycle().await.unwrap();
    assert_eq!(first.evaluated, 2);
    assert!(store.latest_evaluation("oldest").await.unwrap().is_some());
    assert!(store.latest_evaluation("middle").await.unwrap().is_some());
    assert!(store.latest_evaluation("newest").await.unwrap().is_none());

    let second = evaluation.run_cycle().await.unwrap();
    assert_eq!(second.evaluated, 1);
    assert_eq!(store.stats().await.unwrap().evaluated_count, 3);
}

#[tokio::test]
async fn test_failure_backs_off_then_succeeds_and_clears_state() {
    let (store, _dir) = create_test_store().await;
    let clock = test_clock();
    let evaluator = Arc::new(ScriptedEvaluator::new(vec![Step::Fail, Step::Fail]));
    seed(&store, "flaky", ConversationStatus::Done, T0 + 10, Some(4)).await;

    let evaluation = driver(&store, &evaluator, &clock, config());

    let first = evaluation.run_cycle().await.unwrap();
    assert_eq!(first.failed, 1);
    let attempt = store.get_attempt("flaky").await.unwrap().unwrap();
    assert_eq!(attempt.attempts, 1);
    assert_eq!(attempt.next_attempt_at, T0 + 60);
    assert!(!attempt.quarantined);
    assert!(attempt.last_error.contains("model unavailable"));

    // Still inside the backoff window
    clock.advance(59);
    let waiting = evaluation.run_cycle().await.unwrap();
    assert_eq!(waiting.candidates, 0);
    assert_eq!(evaluator.calls(), 1);

    clock.advance(1);
    let second = evaluation.run_cycle().await.unwrap();
    assert_eq!(second.failed, 1);
    let attempt = store.get_attempt("flaky").await.unwrap().unwrap();
    assert_eq!(attempt.attempts, 2);
    assert_eq!(attempt.next_attempt_at, T0 + 60 + 120);

    clock.advance(120);
    let third = evaluation.run_cycle().await.unwrap();
    assert_eq!(third.evaluated, 1);
    assert!(store.get_attempt("flaky").await.unwrap().is_none());
    assert_eq!(store.evaluation_history("flaky").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_repeated_failures_quarantine() {
    let (store, _dir) = create_test_store().await;
    let clock = test_clock();
    let evaluator = Arc::new(ScriptedEvaluator::new(vec![Step::Fail; 10]));
    seed(&store, "broken", ConversationStatus::Done, T0 + 10, Some(4)).await;
    seed(&store, "also_broken", ConversationStatus::Done, T0 + 20, Some(4)).await;

    let evaluation = driver(&store, &evaluator, &clock, config());

    let mut quarantined = 0;
    for _ in 0..3 {
        let report = evaluation.run_cycle().await.unwrap();
        quarantined += report.quarantined;
        clock.advance(10_000);
    }

    assert_eq!(quarantined, 2);
    let parked = store.quarantined_conversations().await.unwrap();
    assert_eq!(parked.len(), 2);
    assert!(parked.iter().all(|a| a.attempts == 3 && a.quarantined));

    // Quarantined conversations are never picked again
    let calls = evaluator.calls();
    clock.advance(1_000_000);
    let report = evaluation.run_cycle().await.unwrap();
    assert_eq!(report.candidates, 0);
    assert_eq!(evaluator.calls(), calls);
    assert!(!store.is_eligible("broken", T0 + 2_000_000).await.unwrap());
}

#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let (store, _dir) = create_test_store().await;
    let clock = test_clock();
    let evaluator = Arc::new(ScriptedEvaluator::new(vec![Step::Hang]));
    seed(&store, "slow", ConversationStatus::Done, T0 + 10, Some(4)).await;

    let short = EvaluationConfig {
        evaluator_timeout: Duration::from_millis(50),
        ..config()
    };
    let report = driver(&store, &evaluator, &clock, short)
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(report.failed, 1);
    assert!(store.latest_evaluation("slow").await.unwrap().is_none());
    let attempt = store.get_attempt("slow").await.unwrap().unwrap();
    assert!(attempt.last_error.contains("timed out"));
}

#[tokio::test]
async fn test_out_of_range_score_is_not_persisted() {
    let (store, _dir) = create_test_store().await;
    let clock = test_clock();
    let evaluator = Arc::new(ScriptedEvaluator::new(vec![Step::Score(150.0), Step::Score(72.5)]));
    seed(&store, "conv_a", ConversationStatus::Done, T0 + 10, Some(4)).await;

    let evaluation = driver(&store, &evaluator, &clock, config());

    let first = evaluation.run_cycle().await.unwrap();
    assert_eq!(first.failed, 1);
    assert!(store.latest_evaluation("conv_a").await.unwrap().is_none());

    clock.advance(60);
    let second = evaluation.run_cycle().await.unwrap();
    assert_eq!(second.evaluated, 1);
    let latest = store.latest_evaluation("conv_a").await.unwrap().unwrap();
    assert_eq!(latest.score, 72.5);
}

#[tokio::test]
async fn test_zero_max_attempts_never_quarantines() {
    let (store, _dir) = create_test_store().await;
    let clock = test_clock();
    let evaluator = Arc::new(ScriptedEvaluator::new(vec![Step::Fail; 6]));
    seed(&store, "stubborn", ConversationStatus::Done, T0 + 10, Some(4)).await;

    let unbounded = EvaluationConfig {
        max_attempts: 0,
        ..config()
    };
    let evaluation = driver(&store, &evaluator, &clock, unbounded);

    for _ in 0..6 {
        evaluation.run_cycle().await.unwrap();
        clock.advance(10_000);
    }

    let attempt = store.get_attempt("stubborn").await.unwrap().unwrap();
    assert_eq!(attempt.attempts, 6);
    assert!(!attempt.quarantined);
    assert!(store.quarantined_conversations().await.unwrap().is_empty());
}
