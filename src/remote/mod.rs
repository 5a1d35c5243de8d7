//! Remote conversation source
//!
//! [`RemoteSource`] abstracts the provider's list and detail endpoints. The
//! only primitive a backend must implement for listing is [`RemoteSource::list_page`];
//! [`RemoteSource::fetch_since`] builds cursor pagination on top of it so
//! every backend (and every test fake) pages the same way.
//!
//! The source is stateless with respect to the store and never retries:
//! transport and decode errors propagate to the caller unchanged.

pub mod elevenlabs;

pub use elevenlabs::ElevenLabsClient;

use crate::error::{ConvaiError, Result};
use crate::types::{CallOutcome, ConversationDetails, ConversationMetadata};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

/// Default number of items requested per list page
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Filters accepted by the provider's list endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub agent_id: Option<String>,
    pub call_successful: Option<CallOutcome>,
    pub call_start_after_unix: Option<i64>,
    pub call_start_before_unix: Option<i64>,
    pub user_id: Option<String>,
    pub page_size: u32,
    /// Ask the provider to include transcript summaries in list entries
    pub include_summary: bool,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            agent_id: None,
            call_successful: None,
            call_start_after_unix: None,
            call_start_before_unix: None,
            user_id: None,
            page_size: DEFAULT_PAGE_SIZE,
            include_summary: true,
        }
    }
}

impl ListQuery {
    /// Query-string pairs for one page request
    pub fn to_query_pairs(&self, cursor: Option<&str>) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("page_size", self.page_size.to_string())];

        if self.include_summary {
            pairs.push(("summary_mode", "include".to_string()));
        }
        if let Some(cursor) = cursor {
            pairs.push(("cursor", cursor.to_string()));
        }
        if let Some(agent_id) = &self.agent_id {
            pairs.push(("agent_id", agent_id.clone()));
        }
        if let Some(outcome) = self.call_successful {
            pairs.push(("call_successful", outcome.as_str().to_string()));
        }
        if let Some(after) = self.call_start_after_unix {
            pairs.push(("call_start_after_unix", after.to_string()));
        }
        if let Some(before) = self.call_start_before_unix {
            pairs.push(("call_start_before_unix", before.to_string()));
        }
        if let Some(user_id) = &self.user_id {
            pairs.push(("user_id", user_id.clone()));
        }

        pairs
    }
}

/// One decoded page of the list endpoint
#[derive(Debug, Clone, Default)]
pub struct ConversationPage {
    pub conversations: Vec<ConversationMetadata>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
    /// Items dropped because they did not decode
    pub rejected: usize,
}

#[derive(Debug, Deserialize)]
struct RawPage {
    conversations: Vec<serde_json::Value>,
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// Decode a list response, isolating malformed entries
///
/// The page envelope must decode; individual conversations that do not are
/// logged and dropped so one bad record cannot sink the whole batch.
pub fn decode_page(body: serde_json::Value) -> Result<ConversationPage> {
    let raw: RawPage = serde_json::from_value(body)
        .map_err(|e| ConvaiError::MalformedPayload(format!("Invalid conversation page: {}", e)))?;

    let mut page = ConversationPage {
        conversations: Vec::with_capacity(raw.conversations.len()),
        has_more: raw.has_more,
        next_cursor: raw.next_cursor,
        rejected: 0,
    };

    for item in raw.conversations {
        let id = item
            .get("conversation_id")
            .and_then(|v| v.as_str())
            .unwrap_or("<unknown>")
            .to_string();

        match serde_json::from_value::<ConversationMetadata>(item) {
            Ok(meta) => page.conversations.push(meta),
            Err(e) => {
                warn!("[remote] Skipping malformed conversation {}: {}", id, e);
                page.rejected += 1;
            }
        }
    }

    Ok(page)
}

/// Paginated client over the provider's list and detail endpoints
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetch a single page of the list endpoint
    async fn list_page(&self, query: &ListQuery, cursor: Option<&str>) -> Result<ConversationPage>;

    /// Fetch the full conversation including transcript and authoritative duration
    async fn fetch_details(&self, conversation_id: &str) -> Result<ConversationDetails>;

    /// Filters applied to every incremental fetch
    fn base_query(&self) -> ListQuery {
        ListQuery::default()
    }

    /// Fetch every conversation that started after `watermark`
    ///
    /// Follows `next_cursor` until the provider reports no more pages and
    /// returns the accumulated result.
    async fn fetch_since(&self, watermark: Option<i64>) -> Result<Vec<ConversationMetadata>> {
        let mut query = self.base_query();
        query.call_start_after_unix = watermark;
        fetch_all_pages(self, &query).await
    }
}

/// Drain every page for `query`
pub async fn fetch_all_pages<S>(source: &S, query: &ListQuery) -> Result<Vec<ConversationMetadata>>
where
    S: RemoteSource + ?Sized,
{
    let mut conversations = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0usize;
    let mut rejected = 0usize;

    loop {
        let page = source.list_page(query, cursor.as_deref()).await?;
        pages += 1;
        rejected += page.rejected;
        conversations.extend(page.conversations);

        if !page.has_more {
            break;
        }

        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => {
                warn!(
                    "[remote] Provider reported more pages without a cursor after page {}, stopping",
                    pages
                );
                break;
            }
        }
    }

    debug!(
        "[remote] Fetched {} conversations over {} page(s), {} rejected",
        conversations.len(),
        pages,
        rejected
    );

    Ok(conversations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConversationStatus;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn meta(id: &str) -> ConversationMetadata {
        ConversationMetadata {
            conversation_id: id.to_string(),
            agent_id: "agent_1".to_string(),
            agent_name: "Support".to_string(),
            start_time_unix_secs: 1_700_000_000,
            call_duration_secs: 30,
            message_count: 4,
            status: ConversationStatus::Done,
            call_successful: CallOutcome::Success,
            direction: None,
            transcript_summary: None,
            call_summary_title: None,
        }
    }

    /// Serves scripted pages and records the cursor and query of each call
    struct ScriptedPages {
        pages: Mutex<Vec<Result<ConversationPage>>>,
        seen: Mutex<Vec<(Option<String>, ListQuery)>>,
    }

    impl ScriptedPages {
        fn new(pages: Vec<Result<ConversationPage>>) -> Self {
            Self {
                pages: Mutex::new(pages.into_iter().rev().collect()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteSource for ScriptedPages {
        async fn list_page(&self, query: &ListQuery, cursor: Option<&str>) -> Result<ConversationPage> {
            self.seen
                .lock()
                .unwrap()
                .push((cursor.map(str::to_string), query.clone()));
            self.pages
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ConvaiError::Other("no more scripted pages".into())))
        }

        async fn fetch_details(&self, conversation_id: &str) -> Result<ConversationDetails> {
            Err(ConvaiError::ConversationNotFound(conversation_id.to_string()))
        }
    }

    fn page(range: std::ops::Range<usize>, has_more: bool, cursor: Option<&str>) -> ConversationPage {
        ConversationPage {
            conversations: range.map(|i| meta(&format!("conv_{:03}", i))).collect(),
            has_more,
            next_cursor: cursor.map(str::to_string),
            rejected: 0,
        }
    }

    #[tokio::test]
    async fn test_two_pages_aggregate_without_gaps_or_duplicates() {
        let source = ScriptedPages::new(vec![
            Ok(page(0..100, true, Some("c1"))),
            Ok(page(100..140, false, None)),
        ]);

        let all = source.fetch_since(Some(1_699_999_000)).await.unwrap();
        assert_eq!(all.len(), 140);

        let ids: HashSet<_> = all.iter().map(|c| c.conversation_id.as_str()).collect();
        assert_eq!(ids.len(), 140);
        for i in 0..140 {
            assert!(ids.contains(format!("conv_{:03}", i).as_str()));
        }

        let seen = source.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, None);
        assert_eq!(seen[1].0.as_deref(), Some("c1"));
        assert!(seen
            .iter()
            .all(|(_, q)| q.call_start_after_unix == Some(1_699_999_000)));
    }

    #[tokio::test]
    async fn test_first_sync_has_no_lower_bound() {
        let source = ScriptedPages::new(vec![Ok(page(0..3, false, None))]);
        let all = source.fetch_since(None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(source.seen.lock().unwrap()[0].1.call_start_after_unix, None);
    }

    #[tokio::test]
    async fn test_page_error_propagates() {
        let source = ScriptedPages::new(vec![
            Ok(page(0..100, true, Some("c1"))),
            Err(ConvaiError::Network("connection reset".into())),
        ]);

        let err = source.fetch_since(None).await.unwrap_err();
        assert!(matches!(err, ConvaiError::Network(_)));
    }

    #[tokio::test]
    async fn test_missing_cursor_stops_pagination() {
        let source = ScriptedPages::new(vec![Ok(page(0..10, true, None))]);
        let all = source.fetch_since(None).await.unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(source.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_decode_page_isolates_bad_items() {
        let body = serde_json::json!({
            "conversations": [
                serde_json::to_value(meta("good_1")).unwrap(),
                {"conversation_id": "bad_1", "status": "exploded"},
                serde_json::to_value(meta("good_2")).unwrap()
            ],
            "has_more": true,
            "next_cursor": "c9"
        });

        let page = decode_page(body).unwrap();
        assert_eq!(page.conversations.len(), 2);
        assert_eq!(page.rejected, 1);
        assert!(page.has_more);
        assert_eq!(page.next_cursor.as_deref(), Some("c9"));
    }

    #[test]
    fn test_decode_page_rejects_bad_envelope() {
        let err = decode_page(serde_json::json!({"items": []})).unwrap_err();
        assert!(matches!(err, ConvaiError::MalformedPayload(_)));
    }

    #[test]
    fn test_query_pairs() {
        let query = ListQuery {
            agent_id: Some("agent_7".into()),
            call_successful: Some(CallOutcome::Failure),
            call_start_after_unix: Some(10),
            call_start_before_unix: Some(20),
            user_id: Some("user_3".into()),
            page_size: 50,
            include_summary: true,
        };

        let pairs = query.to_query_pairs(Some("abc"));
        let get = |k: &str| pairs.iter().find(|(key, _)| *key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("page_size"), Some("50"));
        assert_eq!(get("summary_mode"), Some("include"));
        assert_eq!(get("cursor"), Some("abc"));
        assert_eq!(get("agent_id"), Some("agent_7"));
        assert_eq!(get("call_successful"), Some("failure"));
        assert_eq!(get("call_start_after_unix"), Some("10"));
        assert_eq!(get("call_start_before_unix"), Some("20"));
        assert_eq!(get("user_id"), Some("user_3"));

        let bare = ListQuery::default().to_query_pairs(None);
        assert!(bare.iter().all(|(k, _)| *k != "cursor" && *k != "call_start_after_unix"));
    }
}
