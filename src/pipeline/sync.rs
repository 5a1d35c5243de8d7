//! Sync driver
//!
//! One cycle:
//! 1. read the watermark and fetch everything that started after it
//! 2. merge each entry into the store (see [`plan_merge`])
//! 3. optionally backfill transcripts of done conversations that lack one
//! 4. advance the watermark
//!
//! A list failure or a storage failure aborts the cycle before step 4, so
//! the watermark only moves after a cycle that fully persisted its batch.
//!
//! A failed transcript fetch (including a detail reply with no transcript
//! lines) is recorded per conversation. The backfill waits out an
//! exponential backoff before asking again and gives up after
//! `transcript_max_attempts` failures, so rows the provider can no longer
//! serve do not crowd out newer ones.

use super::retry_delay;
use crate::clock::Clock;
use crate::config::{SyncConfig, WatermarkPolicy};
use crate::error::{ConvaiError, Result};
use crate::remote::RemoteSource;
use crate::scheduler::{JobReport, PeriodicJob};
use crate::storage::{plan_merge, ConversationStore, MergePlan};
use crate::types::{
    ConversationDetails, ConversationMetadata, ConversationRecord, TranscriptFetchAttempt,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one sync cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Entries returned by the remote source
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Unchanged done conversations still stored without a transcript
    pub awaiting_transcript: usize,
    pub transcripts_fetched: usize,
    pub transcript_failures: usize,
    pub backfilled: usize,
    pub backfill_failures: usize,
    /// Conversations whose transcript fetch was given up on this cycle
    pub transcripts_abandoned: usize,
    /// Watermark after the cycle
    pub watermark: Option<i64>,
}

/// Pulls conversations from the remote source into the store
pub struct SyncDriver {
    remote: Arc<dyn RemoteSource>,
    store: Arc<dyn ConversationStore>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl SyncDriver {
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        store: Arc<dyn ConversationStore>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        if let WatermarkPolicy::MaxObserved { overlap_secs } = config.watermark {
            info!(
                "[sync] Watermark follows max observed start time (overlap {}s)",
                overlap_secs
            );
        }

        Self {
            remote,
            store,
            clock,
            config,
        }
    }

    /// Run one full sync cycle
    pub async fn run_cycle(&self) -> Result<SyncReport> {
        let cycle_time = self.clock.now_unix();
        let previous = self.store.watermark().await?;

        match previous {
            Some(ts) => info!("[sync] Fetching conversations started after {}", ts),
            None => info!("[sync] Fetching all conversations (first sync)"),
        }

        let fetched = self.remote.fetch_since(previous).await?;

        let mut report = SyncReport {
            fetched: fetched.len(),
            ..SyncReport::default()
        };
        let mut attempted = HashSet::new();

        for metadata in &fetched {
            self.merge(metadata, cycle_time, &mut attempted, &mut report)
                .await?;
        }

        if self.config.backfill_missing_transcripts {
            self.backfill(&attempted, cycle_time, &mut report).await?;
        }

        report.watermark = match self.next_watermark(&fetched) {
            Some(target) => Some(self.store.advance_watermark(target).await?),
            None => previous,
        };

        info!(
            "[sync] Processed {} conversations: {} new, {} updated, {} unchanged, {} transcripts ({} failed), {} backfilled",
            report.fetched,
            report.inserted,
            report.updated,
            report.unchanged,
            report.transcripts_fetched,
            report.transcript_failures,
            report.backfilled
        );
        if report.awaiting_transcript > 0 || report.transcripts_abandoned > 0 {
            info!(
                "[sync] {} listed conversations still lack a transcript, {} abandoned this cycle",
                report.awaiting_transcript, report.transcripts_abandoned
            );
        }

        Ok(report)
    }

    async fn merge(
        &self,
        metadata: &ConversationMetadata,
        cycle_time: i64,
        attempted: &mut HashSet<String>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let id = metadata.conversation_id.as_str();
        let existing = self.store.get_conversation(id).await?;
        let plan = plan_merge(existing.as_ref(), metadata);

        if let MergePlan::Unchanged { missing_transcript } = plan {
            report.unchanged += 1;
            if missing_transcript {
                report.awaiting_transcript += 1;
            }
            return Ok(());
        }

        let mut failure = None;
        let details = if plan.fetch_transcript() {
            attempted.insert(id.to_string());
            match self.fetch_transcript(id).await {
                Ok(details) => {
                    report.transcripts_fetched += 1;
                    Some(details)
                }
                Err(e) => {
                    warn!("[sync] Could not fetch transcript for {}: {}", id, e);
                    report.transcript_failures += 1;
                    failure = Some(e);
                    None
                }
            }
        } else {
            None
        };

        let record = ConversationRecord::from_metadata(metadata, details.as_ref(), cycle_time);
        self.store.upsert_conversation(&record).await?;

        // Bookkeeping references the row, so it is written after the upsert
        if let Some(e) = failure {
            self.record_fetch_failure(id, &e, cycle_time, report).await?;
        }

        match plan {
            MergePlan::Insert { .. } => {
                report.inserted += 1;
                debug!("[sync] New conversation {} ({})", id, metadata.status);
            }
            _ => {
                report.updated += 1;
                debug!(
                    "[sync] Conversation {} moved {} → {}",
                    id,
                    existing.map(|r| r.status.to_string()).unwrap_or_default(),
                    metadata.status
                );
            }
        }

        Ok(())
    }

    /// Retry transcripts for done conversations stored without one
    async fn backfill(
        &self,
        attempted: &HashSet<String>,
        cycle_time: i64,
        report: &mut SyncReport,
    ) -> Result<()> {
        let limit = self.config.backfill_batch;
        if limit == 0 {
            return Ok(());
        }

        let candidates = self
            .store
            .conversations_missing_transcript(cycle_time, limit + attempted.len())
            .await?;

        for record in candidates
            .into_iter()
            .filter(|r| !attempted.contains(&r.conversation_id))
            .take(limit)
        {
            let id = record.conversation_id.as_str();
            match self.fetch_transcript(id).await {
                Ok(details) => {
                    let attached = self
                        .store
                        .attach_transcript(
                            id,
                            &details.transcript,
                            Some(details.metadata.call_duration_secs),
                            cycle_time,
                        )
                        .await?;
                    if attached {
                        report.backfilled += 1;
                        debug!("[sync] Backfilled transcript for {}", id);
                    }
                }
                Err(e) => {
                    warn!("[sync] Transcript backfill failed for {}: {}", id, e);
                    report.backfill_failures += 1;
                    self.record_fetch_failure(id, &e, cycle_time, report).await?;
                }
            }
        }

        Ok(())
    }

    /// Fetch details, treating a reply without transcript lines as a failure
    async fn fetch_transcript(&self, conversation_id: &str) -> Result<ConversationDetails> {
        let details = self.remote.fetch_details(conversation_id).await?;
        if details.transcript.is_empty() {
            return Err(ConvaiError::MalformedPayload(format!(
                "Details for {} carry no transcript",
                conversation_id
            )));
        }
        Ok(details)
    }

    async fn record_fetch_failure(
        &self,
        conversation_id: &str,
        error: &ConvaiError,
        now: i64,
        report: &mut SyncReport,
    ) -> Result<()> {
        let previous = self.store.get_transcript_fetch(conversation_id).await?;
        let attempts = previous.map(|a| a.attempts).unwrap_or(0).saturating_add(1);
        let delay = retry_delay(
            self.config.transcript_retry_backoff,
            self.config.transcript_max_retry_backoff,
            attempts,
        );
        let max = self.config.transcript_max_attempts;

        let attempt = TranscriptFetchAttempt {
            conversation_id: conversation_id.to_string(),
            attempts,
            last_error: error.to_string(),
            last_attempt_at: now,
            next_fetch_at: now.saturating_add(delay.as_secs() as i64),
            abandoned: max > 0 && attempts >= max,
        };
        self.store.record_transcript_fetch(&attempt).await?;

        if attempt.abandoned {
            report.transcripts_abandoned += 1;
            warn!(
                "[sync] Giving up on transcript for {} after {} failed fetches: {}",
                conversation_id, attempts, error
            );
        }
        Ok(())
    }

    fn next_watermark(&self, fetched: &[ConversationMetadata]) -> Option<i64> {
        match self.config.watermark {
            WatermarkPolicy::WallClock => Some(self.clock.now_unix()),
            WatermarkPolicy::MaxObserved { overlap_secs } => fetched
                .iter()
                .map(|c| c.start_time_unix_secs)
                .max()
                .map(|latest| latest - overlap_secs),
        }
    }
}

impl From<&SyncReport> for JobReport {
    fn from(report: &SyncReport) -> Self {
        JobReport {
            items_processed: report.fetched,
            changes_made: report.inserted + report.updated + report.backfilled,
            errors: report.transcript_failures + report.backfill_failures,
            duration: Default::default(),
        }
    }
}

#[async_trait]
impl PeriodicJob for SyncDriver {
    fn name(&self) -> &str {
        "sync"
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
