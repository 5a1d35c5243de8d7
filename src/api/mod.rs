//! Read-only HTTP API
//!
//! Provides:
//! - `GET /api/conversations?limit=N`: newest conversations with their current evaluation
//! - `GET /api/conversations/{id}`: one conversation with transcript
//! - `GET /api/stats`: aggregate counters
//! - `GET /health`
//!
//! Responses are camelCase JSON projections of the store; nothing here writes.

pub mod server;
pub mod views;

pub use server::{build_router, serve, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT};
pub use views::{ConversationDetailView, ConversationListView, ConversationSummaryView, StatsView};
