//! Service configuration
//!
//! Configuration is layered with the `config` crate:
//! 1. Built-in defaults
//! 2. Optional TOML file (`convai-evaluator.toml` or `--config <path>`)
//! 3. Environment variables prefixed `CONVAI__` (e.g. `CONVAI__SYNC__INTERVAL=60`)
//!
//! API keys additionally fall back to the well-known `ELEVENLABS_API_KEY`
//! and `ANTHROPIC_API_KEY` variables.

use crate::error::{ConvaiError, Result};
use crate::types::CallOutcome;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Config file looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_NAME: &str = "convai-evaluator";

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "CONVAI";

/// Largest page the provider's list endpoint accepts
pub const MAX_PAGE_SIZE: u32 = 100;

// Custom serde module for Duration (serialize/deserialize as seconds)
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub database: DatabaseConfig,
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    pub evaluation: EvaluationConfig,
    pub evaluator: EvaluatorConfig,
    pub api: ApiConfig,
}

/// Local store location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./conversations.db".to_string(),
        }
    }
}

/// Conversational-AI provider connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Provider API key (falls back to ELEVENLABS_API_KEY)
    pub api_key: String,

    pub base_url: String,

    /// Items per list page (1-100)
    pub page_size: u32,

    /// Per-request timeout
    #[serde(with = "serde_duration")]
    pub request_timeout: Duration,

    /// Only sync conversations of this agent
    pub agent_id: Option<String>,

    /// Only sync conversations with this outcome
    pub call_successful: Option<CallOutcome>,

    /// Only sync conversations of this end user
    pub user_id: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.elevenlabs.io/v1".to_string(),
            page_size: MAX_PAGE_SIZE,
            request_timeout: Duration::from_secs(30),
            agent_id: None,
            call_successful: None,
            user_id: None,
        }
    }
}

/// How the sync watermark advances after a successful cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
#[derive(Default)]
pub enum WatermarkPolicy {
    /// Local wall-clock time at cycle completion
    #[default]
    WallClock,

    /// Latest observed `start_time` minus an overlap margin
    MaxObserved { overlap_secs: i64 },
}

/// Sync loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Delay between the end of one cycle and the start of the next
    #[serde(with = "serde_duration")]
    pub interval: Duration,

    pub watermark: WatermarkPolicy,

    /// Re-fetch transcripts for done conversations stored without one
    pub backfill_missing_transcripts: bool,

    /// Max backfill fetches per cycle
    pub backfill_batch: usize,

    /// Failed transcript fetches before a conversation is abandoned (0 = never)
    pub transcript_max_attempts: u32,

    /// Base delay after the first failed fetch, doubled per further failure
    #[serde(with = "serde_duration")]
    pub transcript_retry_backoff: Duration,

    #[serde(with = "serde_duration")]
    pub transcript_max_retry_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            watermark: WatermarkPolicy::WallClock,
            backfill_missing_transcripts: true,
            backfill_batch: 50,
            transcript_max_attempts: 8,
            transcript_retry_backoff: Duration::from_secs(30),
            transcript_max_retry_backoff: Duration::from_secs(6 * 3600),
        }
    }
}

/// Evaluation loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    #[serde(with = "serde_duration")]
    pub interval: Duration,

    /// Max conversations evaluated per cycle
    pub batch_size: usize,

    /// Failures before a conversation is quarantined (0 = never)
    pub max_attempts: u32,

    /// Base delay after the first failure, doubled per further failure
    #[serde(with = "serde_duration")]
    pub retry_backoff: Duration,

    #[serde(with = "serde_duration")]
    pub max_retry_backoff: Duration,

    /// Upper bound on a single evaluator call
    #[serde(with = "serde_duration")]
    pub evaluator_timeout: Duration,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            batch_size: 100,
            max_attempts: 5,
            retry_backoff: Duration::from_secs(60),
            max_retry_backoff: Duration::from_secs(3600),
            evaluator_timeout: Duration::from_secs(120),
        }
    }
}

/// Which evaluator implementation to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum EvaluatorKind {
    /// Transcript statistics only (fast, free, deterministic)
    #[default]
    Heuristic,

    /// Claude via the Anthropic Messages API
    Llm,
}

/// Evaluator selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub kind: EvaluatorKind,
    pub llm: LlmConfig,
}

/// Configuration for the LLM evaluator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Anthropic API key (falls back to ANTHROPIC_API_KEY)
    pub api_key: String,

    /// Model to use (default: claude-3-5-haiku-20241022)
    pub model: String,

    /// Max tokens for responses
    pub max_tokens: usize,

    /// Temperature for sampling
    pub temperature: f32,

    pub base_url: String,

    #[serde(with = "serde_duration")]
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "claude-3-5-haiku-20241022".to_string(),
            max_tokens: 1024,
            temperature: 0.3,
            base_url: "https://api.anthropic.com/v1".to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Read API server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: ([127, 0, 0, 1], 3000).into(),
        }
    }
}

impl ServiceConfig {
    /// Load layered configuration
    ///
    /// An explicit `path` must exist; otherwise `convai-evaluator.toml` in the
    /// working directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                builder.add_source(config::File::from(path).required(true))
            }
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_NAME).required(false)),
        };

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ServiceConfig = settings.try_deserialize()?;
        Ok(config.with_env_secrets())
    }

    /// Render the effective configuration as TOML with API keys masked
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        for key in [&mut shown.remote.api_key, &mut shown.evaluator.llm.api_key] {
            if !key.is_empty() {
                *key = "***".to_string();
            }
        }

        toml::to_string_pretty(&shown).map_err(|e| {
            ConvaiError::Config(config::ConfigError::Message(format!(
                "Cannot render configuration: {}",
                e
            )))
        })
    }

    /// Fill empty API keys from the conventional environment variables
    pub fn with_env_secrets(mut self) -> Self {
        if self.remote.api_key.is_empty() {
            if let Ok(key) = env::var("ELEVENLABS_API_KEY") {
                debug!("Using provider API key from ELEVENLABS_API_KEY");
                self.remote.api_key = key;
            }
        }
        if self.evaluator.llm.api_key.is_empty() {
            if let Ok(key) = env::var("ANTHROPIC_API_KEY") {
                debug!("Using LLM API key from ANTHROPIC_API_KEY");
                self.evaluator.llm.api_key = key;
            }
        }
        self
    }

    /// Reject unusable settings
    ///
    /// `require_remote` is false for commands that only read the store.
    pub fn validate(&self, require_remote: bool) -> Result<()> {
        if require_remote && self.remote.api_key.trim().is_empty() {
            return Err(ConvaiError::Validation(
                "Provider API key not set. Set ELEVENLABS_API_KEY or remote.api_key".to_string(),
            ));
        }
        if self.remote.page_size == 0 || self.remote.page_size > MAX_PAGE_SIZE {
            return Err(ConvaiError::Validation(format!(
                "remote.page_size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, self.remote.page_size
            )));
        }
        if self.sync.interval.is_zero() || self.evaluation.interval.is_zero() {
            return Err(ConvaiError::Validation(
                "Loop intervals must be greater than zero".to_string(),
            ));
        }
        if self.evaluation.batch_size == 0 {
            return Err(ConvaiError::Validation(
                "evaluation.batch_size must be greater than zero".to_string(),
            ));
        }
        if let WatermarkPolicy::MaxObserved { overlap_secs } = self.sync.watermark {
            if overlap_secs < 0 {
                return Err(ConvaiError::Validation(
                    "sync.watermark.overlap_secs cannot be negative".to_string(),
                ));
            }
        }
        if self.evaluator.kind == EvaluatorKind::Llm && self.evaluator.llm.api_key.trim().is_empty()
        {
            return Err(ConvaiError::Validation(
                "LLM evaluator selected but ANTHROPIC_API_KEY / evaluator.llm.api_key is not set"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
