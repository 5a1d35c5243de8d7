//! Conversational-AI call evaluator
//!
//! Mirrors call transcripts from a conversational-AI provider into a local
//! store and scores each finished conversation asynchronously:
//! - **Sync**: incremental, watermark-driven fetch of new and changed conversations
//! - **Evaluation**: scores done, transcribed conversations with retry and quarantine
//! - **API**: read-only JSON views over conversations, evaluations and stats
//!
//! # Architecture
//!
//! - **Types**: Provider payloads and persisted records
//! - **Remote**: Paginated provider client ([`RemoteSource`])
//! - **Storage**: libSQL-backed store ([`LibsqlStore`])
//! - **Evaluator**: Pluggable scoring ([`Evaluator`])
//! - **Pipeline**: The sync and evaluation drivers
//! - **Scheduler**: Self-rescheduling polling loops
//!
//! # Example
//!
//! ```ignore
//! use convai_evaluator::{
//!     build_evaluator, ElevenLabsClient, EvaluationDriver, LibsqlStore, ServiceConfig,
//!     SyncDriver, SystemClock,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServiceConfig::load(None)?;
//!     let store = Arc::new(LibsqlStore::open(&config.database.path).await?);
//!     let remote = Arc::new(ElevenLabsClient::new(&config.remote)?);
//!     let clock = Arc::new(SystemClock);
//!
//!     let sync = SyncDriver::new(remote, store.clone(), clock.clone(), config.sync.clone());
//!     println!("{:?}", sync.run_cycle().await?);
//!
//!     let evaluator = build_evaluator(&config.evaluator)?;
//!     let evaluation = EvaluationDriver::new(store, evaluator, clock, config.evaluation.clone());
//!     println!("{:?}", evaluation.run_cycle().await?);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod pipeline;
pub mod remote;
pub mod scheduler;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ServiceConfig, WatermarkPolicy};
pub use error::{ConvaiError, Result};
pub use evaluator::{build_evaluator, Evaluator, HeuristicEvaluator, LlmEvaluator};
pub use pipeline::{EvaluationDriver, EvaluationReport, SyncDriver, SyncReport};
pub use remote::{ElevenLabsClient, ListQuery, RemoteSource};
pub use scheduler::{JobReport, PeriodicJob, PollingLoop};
pub use storage::{ConversationStore, EvaluationStore, LibsqlStore, QueryStore};
pub use types::{
    CallOutcome, ConversationDetails, ConversationMetadata, ConversationRecord, ConversationStats,
    ConversationStatus, Evaluation, EvaluationResult, TranscriptMessage,
};
