//! HTTP API server

use super::views::{ConversationDetailView, ConversationListView, ConversationSummaryView, StatsView};
use crate::error::{ConvaiError, Result};
use crate::storage::QueryStore;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info};

/// Conversations returned when no limit is given
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Upper bound on `?limit=`
pub const MAX_LIST_LIMIT: usize = 1000;

/// API server state
#[derive(Clone)]
struct AppState {
    store: Arc<dyn QueryStore>,
}

/// Errors surfaced to HTTP clients
#[derive(Debug)]
enum ApiError {
    NotFound,
    /// Internal failure; only `context` reaches the client
    Internal {
        context: &'static str,
        source: ConvaiError,
    },
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Conversation not found".to_string()),
            ApiError::Internal { context, source } => {
                error!("[api] {}: {}", context, source);
                (StatusCode::INTERNAL_SERVER_ERROR, context.to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

fn internal(context: &'static str) -> impl FnOnce(ConvaiError) -> ApiError {
    move |source| ApiError::Internal { context, source }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<String>,
}

impl ListParams {
    /// Unparsable or zero limits fall back to the default
    fn limit(&self) -> usize {
        self.limit
            .as_deref()
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|limit| *limit > 0)
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .min(MAX_LIST_LIMIT)
    }
}

/// Build the API router over a read-only store
pub fn build_router(store: Arc<dyn QueryStore>) -> Router {
    Router::new()
        .route("/api/conversations", get(list_conversations_handler))
        .route("/api/conversations/:id", get(conversation_handler))
        .route("/api/stats", get(stats_handler))
        // Health check
        .route("/health", get(health_handler))
        .with_state(AppState { store })
        // Middleware
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// Serve the API until `shutdown` is cancelled
pub async fn serve(
    addr: SocketAddr,
    store: Arc<dyn QueryStore>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("[api] Server running on http://{}", listener.local_addr()?);

    axum::serve(listener, build_router(store))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("[api] Server stopped");
    Ok(())
}

async fn list_conversations_handler(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> std::result::Result<Json<ConversationListView>, ApiError> {
    let limit = params.limit();
    debug!("[api] Listing {} conversations", limit);

    let conversations = state
        .store
        .list_conversations(limit)
        .await
        .map_err(internal("Failed to fetch conversations"))?;

    Ok(Json(ConversationListView {
        conversations: conversations
            .into_iter()
            .map(ConversationSummaryView::from)
            .collect(),
    }))
}

async fn conversation_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<ConversationDetailView>, ApiError> {
    state
        .store
        .conversation_with_evaluation(&id)
        .await
        .map_err(internal("Failed to fetch conversation"))?
        .map(|item| Json(ConversationDetailView::from(item)))
        .ok_or(ApiError::NotFound)
}

async fn stats_handler(
    State(state): State<AppState>,
) -> std::result::Result<Json<StatsView>, ApiError> {
    let stats = state
        .store
        .stats()
        .await
        .map_err(internal("Failed to fetch statistics"))?;
    Ok(Json(StatsView::from(stats)))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
