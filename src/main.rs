//! convai-evaluator - conversation sync and evaluation service
//!
//! Runs the sync and evaluation loops plus the read API, or a single cycle
//! of either for cron-style use.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use convai_evaluator::{
    api::{self, ConversationDetailView, StatsView},
    build_evaluator,
    types::{EvaluationAttempt, TranscriptFetchAttempt},
    Clock, ConversationStore, ElevenLabsClient, EvaluationDriver, EvaluationStore, LibsqlStore,
    PollingLoop, QueryStore, ServiceConfig, SyncDriver, SystemClock,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "convai-evaluator")]
#[command(about = "Sync conversational-AI calls and score their transcripts", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./convai-evaluator.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides database.path)
    #[arg(long, global = true, env = "CONVAI_DB_PATH")]
    db: Option<String>,

    /// Set log level
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync loop, the evaluation loop and the read API until Ctrl-C
    Serve {
        /// Do not start the HTTP API
        #[arg(long)]
        no_api: bool,
    },

    /// Run a single sync cycle and print its report
    Sync,

    /// Run a single evaluation cycle and print its report
    Evaluate,

    /// Print aggregate statistics
    Stats,

    /// Print one conversation with its evaluation history
    Show {
        /// Provider conversation id
        id: String,
    },

    /// List conversations whose evaluation or transcript fetch was given up on
    Quarantined,

    /// Print the effective configuration with API keys masked
    Config,
}

impl Commands {
    /// Commands that talk to the provider need its API key
    fn needs_remote(&self) -> bool {
        matches!(self, Commands::Serve { .. } | Commands::Sync)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // RUST_LOG wins; otherwise our level for the service, WARN for HTTP plumbing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "convai_evaluator={},tower_http=warn,hyper=warn,libsql=warn",
            level.as_str().to_lowercase()
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Write logs to stderr, not stdout
        .init();

    debug!("convai-evaluator v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut config =
        ServiceConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(db) = cli.db {
        config.database.path = db;
    }
    config.validate(cli.command.needs_remote())?;

    if let Commands::Config = cli.command {
        print!("{}", config.to_redacted_toml()?);
        return Ok(());
    }

    let store = Arc::new(
        LibsqlStore::open(&config.database.path)
            .await
            .with_context(|| format!("Failed to open database {}", config.database.path))?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Commands::Serve { no_api } => serve(config, store, clock, !no_api).await,
        Commands::Sync => {
            let driver = sync_driver(&config, store, clock)?;
            print_json(&driver.run_cycle().await?)
        }
        Commands::Evaluate => {
            let driver = evaluation_driver(&config, store, clock)?;
            print_json(&driver.run_cycle().await?)
        }
        Commands::Stats => print_json(&StatsView::from(store.stats().await?)),
        Commands::Show { id } => {
            let Some(item) = store.conversation_with_evaluation(&id).await? else {
                bail!("Conversation not found: {}", id);
            };
            let history = store.evaluation_history(&id).await?;
            print_json(&ShowOutput {
                conversation: ConversationDetailView::from(item),
                evaluation_history: history.into_iter().map(|e| e.payload).collect(),
            })
        }
        Commands::Quarantined => print_json(&QuarantinedOutput {
            evaluations: store.quarantined_conversations().await?,
            transcripts: store.abandoned_transcripts().await?,
        }),
        Commands::Config => Ok(()),
    }
}

#[derive(Serialize)]
struct QuarantinedOutput {
    evaluations: Vec<EvaluationAttempt>,
    transcripts: Vec<TranscriptFetchAttempt>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ShowOutput {
    conversation: ConversationDetailView,
    evaluation_history: Vec<serde_json::Value>,
}

fn sync_driver(
    config: &ServiceConfig,
    store: Arc<LibsqlStore>,
    clock: Arc<dyn Clock>,
) -> Result<SyncDriver> {
    let remote = ElevenLabsClient::new(&config.remote).context("Failed to build provider client")?;
    Ok(SyncDriver::new(
        Arc::new(remote),
        store,
        clock,
        config.sync.clone(),
    ))
}

fn evaluation_driver(
    config: &ServiceConfig,
    store: Arc<LibsqlStore>,
    clock: Arc<dyn Clock>,
) -> Result<EvaluationDriver> {
    let evaluator = build_evaluator(&config.evaluator)?;
    Ok(EvaluationDriver::new(
        store,
        evaluator,
        clock,
        config.evaluation.clone(),
    ))
}

/// Run both loops and the API until Ctrl-C, then stop them in order
async fn serve(
    config: ServiceConfig,
    store: Arc<LibsqlStore>,
    clock: Arc<dyn Clock>,
    with_api: bool,
) -> Result<()> {
    let sync = PollingLoop::new(
        Arc::new(sync_driver(&config, store.clone(), clock.clone())?),
        config.sync.interval,
    );
    let evaluation = PollingLoop::new(
        Arc::new(evaluation_driver(&config, store.clone(), clock)?),
        config.evaluation.interval,
    );

    sync.start();
    evaluation.start();

    let shutdown = CancellationToken::new();
    let api_task = (with_api && config.api.enabled).then(|| {
        let store: Arc<dyn QueryStore> = store.clone();
        let token = shutdown.clone();
        let addr = config.api.addr;
        tokio::spawn(async move { api::serve(addr, store, token).await })
    });

    info!(
        "Service running (sync every {:?}, evaluation every {:?}). Press Ctrl-C to stop",
        config.sync.interval, config.evaluation.interval
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal, stopping gracefully...");

    // Loops finish their in-flight cycle before returning
    sync.shutdown().await;
    evaluation.shutdown().await;
    shutdown.cancel();

    if let Some(task) = api_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("API server exited with error: {}", e),
            Err(e) => warn!("API server task panicked: {}", e),
        }
    }

    info!("Shut down complete");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
