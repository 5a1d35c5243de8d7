//! Common test utilities and helpers
#![allow(dead_code)]

use async_trait::async_trait;
use convai_evaluator::error::{ConvaiError, Result};
use convai_evaluator::remote::{ConversationPage, ListQuery, RemoteSource};
use convai_evaluator::types::{
    AgentPerformance, CallOutcome, ConversationDetails, ConversationMetadata, ConversationStatus,
    DetailsMetadata, Evaluation, EvaluationContext, Sentiment, SpeakerRole, TranscriptMessage,
};
use convai_evaluator::{Evaluator, LibsqlStore, ManualClock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Clock reading every test starts from
pub const T0: i64 = 1_700_000_000;

/// Create a file-backed store in a fresh temp dir
///
/// Keep the TempDir alive for as long as the store is used.
pub async fn create_test_store() -> (Arc<LibsqlStore>, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("conversations.db");
    let store = LibsqlStore::open(path.to_str().expect("utf-8 temp path"))
        .await
        .expect("Failed to create test store");
    (Arc::new(store), dir)
}

pub fn test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(T0))
}

/// List entry as the provider would return it
pub fn meta(id: &str, status: ConversationStatus, start: i64) -> ConversationMetadata {
    ConversationMetadata {
        conversation_id: id.to_string(),
        agent_id: "agent_support".to_string(),
        agent_name: "Support Bot".to_string(),
        start_time_unix_secs: start,
        call_duration_secs: 0,
        message_count: 0,
        status,
        call_successful: CallOutcome::Unknown,
        direction: None,
        transcript_summary: None,
        call_summary_title: None,
    }
}

/// Alternating agent/user transcript with `turns` lines
pub fn transcript(turns: usize) -> Vec<TranscriptMessage> {
    (0..turns)
        .map(|i| TranscriptMessage {
            role: if i % 2 == 0 {
                SpeakerRole::Agent
            } else {
                SpeakerRole::User
            },
            time_in_call_secs: (i * 5) as f64,
            message: if i % 2 == 0 {
                format!("How can I help with your booking? ({})", i)
            } else {
                format!("I need to change my booking date ({})", i)
            },
        })
        .collect()
}

/// Detail payload matching `meta`, with its own authoritative duration
pub fn details_for(meta: &ConversationMetadata, turns: usize, duration: i64) -> ConversationDetails {
    ConversationDetails {
        conversation_id: meta.conversation_id.clone(),
        agent_id: meta.agent_id.clone(),
        status: meta.status,
        transcript: transcript(turns),
        metadata: DetailsMetadata {
            start_time_unix_secs: meta.start_time_unix_secs,
            call_duration_secs: duration,
        },
        user_id: None,
        analysis: None,
    }
}

/// In-process provider with scripted failures
///
/// Honors `call_start_after_unix` strictly (start > after) and pages by
/// `page_size` using the item offset as cursor.
pub struct FakeRemote {
    conversations: Mutex<Vec<ConversationMetadata>>,
    details: Mutex<HashMap<String, ConversationDetails>>,
    detail_failures: Mutex<HashMap<String, usize>>,
    list_failures: AtomicUsize,
    page_size: u32,
    pub list_queries: Mutex<Vec<(Option<String>, ListQuery)>>,
    pub detail_requests: Mutex<Vec<String>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::with_page_size(100)
    }

    pub fn with_page_size(page_size: u32) -> Self {
        Self {
            conversations: Mutex::new(Vec::new()),
            details: Mutex::new(HashMap::new()),
            detail_failures: Mutex::new(HashMap::new()),
            list_failures: AtomicUsize::new(0),
            page_size,
            list_queries: Mutex::new(Vec::new()),
            detail_requests: Mutex::new(Vec::new()),
        }
    }

    /// Add or replace a list entry
    pub fn put(&self, meta: ConversationMetadata) {
        let mut conversations = self.conversations.lock().unwrap();
        match conversations
            .iter_mut()
            .find(|c| c.conversation_id == meta.conversation_id)
        {
            Some(existing) => *existing = meta,
            None => conversations.push(meta),
        }
    }

    pub fn put_details(&self, details: ConversationDetails) {
        self.details
            .lock()
            .unwrap()
            .insert(details.conversation_id.clone(), details);
    }

    /// Make the next `times` detail fetches of `id` fail
    pub fn fail_details(&self, id: &str, times: usize) {
        self.detail_failures
            .lock()
            .unwrap()
            .insert(id.to_string(), times);
    }

    /// Make the next `times` list calls fail
    pub fn fail_lists(&self, times: usize) {
        self.list_failures.store(times, Ordering::SeqCst);
    }

    pub fn detail_request_count(&self, id: &str) -> usize {
        self.detail_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.as_str() == id)
            .count()
    }

    pub fn list_call_count(&self) -> usize {
        self.list_queries.lock().unwrap().len()
    }

    pub fn last_list_query(&self) -> Option<ListQuery> {
        self.list_queries
            .lock()
            .unwrap()
            .last()
            .map(|(_, q)| q.clone())
    }
}

#[async_trait]
impl RemoteSource for FakeRemote {
    async fn list_page(&self, query: &ListQuery, cursor: Option<&str>) -> Result<ConversationPage> {
        self.list_queries
            .lock()
            .unwrap()
            .push((cursor.map(str::to_string), query.clone()));

        if self
            .list_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ConvaiError::Network("connection refused".to_string()));
        }

        let matching: Vec<_> = self
            .conversations
            .lock()
            .unwrap()
            .iter()
            .filter(|c| {
                query
                    .call_start_after_unix
                    .map_or(true, |after| c.start_time_unix_secs > after)
            })
            .cloned()
            .collect();

        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let end = (offset + query.page_size as usize).min(matching.len());
        let has_more = end < matching.len();

        Ok(ConversationPage {
            conversations: matching[offset.min(end)..end].to_vec(),
            has_more,
            next_cursor: has_more.then(|| end.to_string()),
            rejected: 0,
        })
    }

    async fn fetch_details(&self, conversation_id: &str) -> Result<ConversationDetails> {
        self.detail_requests
            .lock()
            .unwrap()
            .push(conversation_id.to_string());

        if let Some(remaining) = self.detail_failures.lock().unwrap().get_mut(conversation_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ConvaiError::RemoteApi {
                    status: 503,
                    message: "upstream unavailable".to_string(),
                });
            }
        }

        self.details
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| ConvaiError::ConversationNotFound(conversation_id.to_string()))
    }

    fn base_query(&self) -> ListQuery {
        ListQuery {
            page_size: self.page_size,
            ..ListQuery::default()
        }
    }
}

/// What a [`ScriptedEvaluator`] does on one call
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Fail,
    Score(f64),
    /// Never returns within any sane timeout
    Hang,
}

/// Evaluator that plays back a script, then scores 80 forever
pub struct ScriptedEvaluator {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
}

impl ScriptedEvaluator {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn evaluation_with_score(score: f64) -> Evaluation {
    Evaluation {
        score,
        summary: "Agent resolved the booking change".to_string(),
        strengths: vec!["Clear answers".to_string()],
        improvements: vec![],
        sentiment: Sentiment::from_score(score),
        key_topics: vec!["booking".to_string()],
        agent_performance: AgentPerformance {
            responsiveness: 8,
            accuracy: 7,
            helpfulness: 8,
        },
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn evaluate(
        &self,
        _transcript: &[TranscriptMessage],
        _context: &EvaluationContext,
    ) -> Result<Evaluation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();

        match step.unwrap_or(Step::Score(80.0)) {
            Step::Fail => Err(ConvaiError::Evaluation("model unavailable".to_string())),
            Step::Score(score) => Ok(evaluation_with_score(score)),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(evaluation_with_score(50.0))
            }
        }
    }
}
