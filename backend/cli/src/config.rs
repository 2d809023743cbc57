use std::path::PathBuf;
use std::time::Duration;

use chatdigest_pipeline::PipelineConfig;

const DEFAULT_ORIGINS: &str = "http://localhost:5173,http://localhost:3000,http://localhost";

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server bind address
    pub bind_address: String,
    /// HTTP server port
    pub port: u16,
    /// SQLite database path
    pub db_path: String,
    /// Directory for rolling NDJSON logs
    pub log_dir: Option<PathBuf>,
    /// Log level
    pub log_level: String,

    // Pipeline
    pub window_days: u64,
    pub generation_timeout_secs: u64,
    pub sync_concurrency: usize,

    // HTTP
    pub admin_token: Option<String>,
    pub allowed_origins: Vec<String>,

    // Discord
    pub discord_token: Option<String>,
    pub discord_api_base: String,

    // Summarization
    pub openai_api_key: Option<String>,
    pub openai_api_base: String,
    pub model: String,
    pub ollama_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset and
    /// unparseable numbers fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parsed = |key: &str| var(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            bind_address: var("CHATDIGEST_BIND").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: var("CHATDIGEST_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
            db_path: var("CHATDIGEST_DB").unwrap_or_else(|| "chatdigest.db".to_string()),
            log_dir: var("CHATDIGEST_LOG_DIR").map(PathBuf::from),
            log_level: var("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            window_days: parsed("CHATDIGEST_WINDOW_DAYS")
                .filter(|d| *d > 0)
                .unwrap_or(7),
            generation_timeout_secs: parsed("CHATDIGEST_GENERATION_TIMEOUT_SECS")
                .filter(|s| *s > 0)
                .unwrap_or(120),
            sync_concurrency: parsed("CHATDIGEST_SYNC_CONCURRENCY")
                .filter(|n| *n > 0)
                .map(|n| n as usize)
                .unwrap_or(5),
            admin_token: var("CHATDIGEST_ADMIN_TOKEN"),
            allowed_origins: var("ALLOWED_ORIGINS")
                .unwrap_or_else(|| DEFAULT_ORIGINS.to_string())
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            discord_token: var("DISCORD_TOKEN"),
            discord_api_base: var("DISCORD_API_BASE")
                .unwrap_or_else(|| chatdigest_providers::discord::DEFAULT_API_BASE.to_string()),
            openai_api_key: var("OPENAI_API_KEY"),
            openai_api_base: var("OPENAI_API_BASE")
                .unwrap_or_else(|| chatdigest_providers::llm::openai::DEFAULT_API_BASE.to_string()),
            model: var("CHATDIGEST_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
            ollama_url: var("OLLAMA_URL"),
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            window: Duration::from_secs(self.window_days * 24 * 3600),
            generation_timeout: Duration::from_secs(self.generation_timeout_secs),
            sync_concurrency: self.sync_concurrency,
        }
    }
}
