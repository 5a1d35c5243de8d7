//! ElevenLabs Conversational AI client
//!
//! Thin reqwest wrapper over `GET /convai/conversations` and
//! `GET /convai/conversations/{id}`. Every request carries an explicit
//! timeout; retries are left to the next scheduled sync cycle.

use super::{decode_page, ConversationPage, ListQuery, RemoteSource};
use crate::config::RemoteConfig;
use crate::error::{ConvaiError, Result};
use crate::types::ConversationDetails;
use async_trait::async_trait;
use reqwest::{Client, Response};
use tracing::debug;

/// Header carrying the provider API key
const API_KEY_HEADER: &str = "xi-api-key";

/// Max characters of an error body kept in error messages
const ERROR_BODY_LIMIT: usize = 300;

/// ElevenLabs conversation API client
pub struct ElevenLabsClient {
    client: Client,
    api_key: String,
    base_url: String,
    defaults: ListQuery,
}

impl ElevenLabsClient {
    /// Create a client from the remote section of the service config
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(ConvaiError::Validation(
                "Provider API key cannot be empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConvaiError::Network(e.to_string()))?;

        let defaults = ListQuery {
            agent_id: config.agent_id.clone(),
            call_successful: config.call_successful,
            user_id: config.user_id.clone(),
            page_size: config.page_size,
            ..ListQuery::default()
        };

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            defaults,
        })
    }

    fn conversations_url(&self) -> String {
        format!("{}/convai/conversations", self.base_url)
    }

    /// Turn a non-success response into a `RemoteApi` error
    async fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message: String = body.chars().take(ERROR_BODY_LIMIT).collect();
        Err(ConvaiError::RemoteApi {
            status: status.as_u16(),
            message: if message.is_empty() {
                status.to_string()
            } else {
                message
            },
        })
    }
}

#[async_trait]
impl RemoteSource for ElevenLabsClient {
    async fn list_page(&self, query: &ListQuery, cursor: Option<&str>) -> Result<ConversationPage> {
        debug!(
            "[remote] Listing conversations (cursor: {:?}, after: {:?})",
            cursor, query.call_start_after_unix
        );

        let response = self
            .client
            .get(self.conversations_url())
            .header(API_KEY_HEADER, &self.api_key)
            .query(&query.to_query_pairs(cursor))
            .send()
            .await
            .map_err(|e| ConvaiError::Network(e.to_string()))?;

        let body: serde_json::Value = Self::check_status(response).await?.json().await?;
        decode_page(body)
    }

    async fn fetch_details(&self, conversation_id: &str) -> Result<ConversationDetails> {
        debug!("[remote] Fetching details for {}", conversation_id);

        let response = self
            .client
            .get(format!("{}/{}", self.conversations_url(), conversation_id))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| ConvaiError::Network(e.to_string()))?;

        let details: ConversationDetails = Self::check_status(response).await?.json().await?;
        Ok(details)
    }

    fn base_query(&self) -> ListQuery {
        self.defaults.clone()
    }
}
