use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ReaderError;
use crate::message::{AppendOutcome, ChannelInfo, Message, RawMessage};
use crate::summary::CacheEntry;

/// Durable, append-only record of chat messages per channel.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Register (or rename) a channel under its server.
    async fn upsert_channel(&self, channel: &ChannelInfo) -> Result<()>;

    /// All channels known for a server, ordered by name.
    async fn list_channels(&self, server_id: &str) -> Result<Vec<ChannelInfo>>;

    /// Insert messages by identity. Already-stored messages are a no-op and
    /// malformed ones are rejected individually; the rest of the batch commits.
    async fn append(&self, channel_id: &str, messages: Vec<RawMessage>) -> Result<AppendOutcome>;

    /// Messages with `since <= timestamp <= until`, oldest first.
    async fn query(
        &self,
        channel_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Message>>;

    /// Timestamp of the newest stored message in the channel.
    async fn latest_timestamp(&self, channel_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Record that the channel was synchronised at `at`.
    async fn record_sync(&self, channel_id: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Durable storage for generated summaries.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    async fn load_summary(&self, channel_id: &str) -> Result<Option<CacheEntry>>;

    /// Replace the channel's stored summary.
    async fn save_summary(&self, entry: &CacheEntry) -> Result<()>;

    /// Delete every stored summary for the server's channels; returns the count.
    async fn clear_summaries(&self, server_id: &str) -> Result<usize>;
}

/// Read side of the chat platform.
#[async_trait]
pub trait ChatPlatformReader: Send + Sync {
    /// Text channels of a server.
    async fn list_channels(&self, server_id: &str) -> Result<Vec<ChannelInfo>, ReaderError>;

    /// Messages posted at or after `since`, oldest first. Pagination is the
    /// reader's concern.
    async fn fetch_new_messages(
        &self,
        channel_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawMessage>, ReaderError>;
}

/// Produces summary text from a channel's message window.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, channel_name: &str, messages: &[Message]) -> Result<String>;
}

/// Trait for LLM providers backing the summarizer.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g., "openai", "ollama").
    fn name(&self) -> &str;

    /// Send a completion request and return the response text.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;
}

/// Request to an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Response from an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub provider: String,
    pub model: String,
    pub tokens_used: u64,
    pub latency_ms: u64,
}
