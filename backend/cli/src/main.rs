mod api;
mod auth;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chatdigest_core::{
    ChannelInfo, ChatPlatformReader, LlmProvider, MessageStore, RawMessage, ReaderError,
    SystemClock,
};
use chatdigest_logging::init_logger;
use chatdigest_pipeline::{Collaborators, SyncOrchestrator};
use chatdigest_providers::{
    DiscordConfig, DiscordReader, LlmSummarizer, MockProvider, OllamaProvider, OpenAiProvider,
};
use chatdigest_store::SqliteStore;

use api::AppState;
use config::Config;

#[derive(Parser)]
#[command(name = "chatdigest")]
#[command(about = "Per-channel activity digests for chat servers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Port to bind the HTTP server to
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the cached digest of a server
    Summaries { server_id: String },
    /// Pull new messages for a server, then print its digest
    Sync { server_id: String },
    /// Drop every cached summary of a server
    ClearCache { server_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();
    init_logger(config.log_dir.as_deref(), &config.log_level);

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            let config = Config {
                port: port.unwrap_or(config.port),
                ..config
            };
            run_server(config).await?;
        }
        Commands::Summaries { server_id } => {
            let orchestrator = build_orchestrator(&config)?;
            print_json(&orchestrator.get_summaries(&server_id).await?)?;
        }
        Commands::Sync { server_id } => {
            let orchestrator = build_orchestrator(&config)?;
            print_json(&orchestrator.force_sync(&server_id).await?)?;
        }
        Commands::ClearCache { server_id } => {
            let orchestrator = build_orchestrator(&config)?;
            print_json(&orchestrator.clear_cache(&server_id).await?)?;
        }
    }

    Ok(())
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    info!(
        port = config.port,
        bind = %config.bind_address,
        db = %config.db_path,
        "Starting chat digest service"
    );

    let orchestrator = build_orchestrator(&config)?;
    let app_state = Arc::new(AppState {
        orchestrator,
        admin_token: config.admin_token.clone(),
    });
    if app_state.admin_token.is_none() {
        warn!("CHATDIGEST_ADMIN_TOKEN not set, sync and clear-cache are open to any caller");
    }

    let app = api::build_router(app_state).layer(api::cors_layer(&config.allowed_origins));
    let addr = format!("{}:{}", config.bind_address, config.port);

    info!(addr = %addr, "HTTP API listening");

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_orchestrator(config: &Config) -> Result<SyncOrchestrator> {
    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("Failed to open database {}", config.db_path))?,
    );
    let messages: Arc<dyn MessageStore> = store.clone();

    let reader: Arc<dyn ChatPlatformReader> = match &config.discord_token {
        Some(token) => Arc::new(DiscordReader::new(
            DiscordConfig::new(token.as_str()).with_api_base(config.discord_api_base.as_str()),
        )),
        None => {
            warn!("DISCORD_TOKEN not set, force-sync cannot reach Discord");
            Arc::new(MissingCredentials)
        }
    };

    let provider: Arc<dyn LlmProvider> = if let Some(key) = &config.openai_api_key {
        info!(model = %config.model, "Using OpenAI provider");
        Arc::new(OpenAiProvider::new(key.as_str()).with_base_url(config.openai_api_base.as_str()))
    } else if let Some(url) = &config.ollama_url {
        info!(url = %url, model = %config.model, "Using Ollama provider");
        Arc::new(OllamaProvider::new().with_base_url(url.as_str()))
    } else {
        warn!("No summarization provider configured, summaries will fail");
        Arc::new(MockProvider::new("unconfigured").failing(
            "no summarization provider configured: set OPENAI_API_KEY or OLLAMA_URL",
        ))
    };

    let orchestrator = SyncOrchestrator::new(
        Collaborators {
            messages,
            summaries: store,
            reader,
            summarizer: Arc::new(LlmSummarizer::new(provider, config.model.as_str())),
            clock: Arc::new(SystemClock),
        },
        config.pipeline(),
    )?;
    Ok(orchestrator)
}

/// Stand-in reader when no Discord token is configured.
struct MissingCredentials;

#[async_trait]
impl ChatPlatformReader for MissingCredentials {
    async fn list_channels(&self, _server_id: &str) -> Result<Vec<ChannelInfo>, ReaderError> {
        Err(ReaderError::Transport(anyhow::anyhow!("DISCORD_TOKEN is not set")))
    }

    async fn fetch_new_messages(
        &self,
        _channel_id: &str,
        _since: DateTime<Utc>,
    ) -> Result<Vec<RawMessage>, ReaderError> {
        Err(ReaderError::Transport(anyhow::anyhow!("DISCORD_TOKEN is not set")))
    }
}
