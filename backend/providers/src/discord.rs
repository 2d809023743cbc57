/// Discord reader for the digest pipeline.
///
/// Uses the Discord REST API (v10), read-only:
///  - `GET /guilds/{guild_id}/channels` for channel discovery
///  - `GET /channels/{channel_id}/messages?limit=100&after={snowflake}` for
///    incremental history, paging forward by the newest id seen
///
/// Required env vars:
///   DISCORD_TOKEN     bot token, sent as `Bot <token>` unless it already
///                     carries a scheme
///   DISCORD_API_BASE  defaults to https://discord.com/api/v10
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use chatdigest_core::{ChannelInfo, ChatPlatformReader, RawMessage, ReaderError};

use crate::retry::RateLimitPolicy;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Milliseconds between the Unix epoch and the Discord epoch (2015-01-01).
pub const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;

const PAGE_LIMIT: usize = 100;
const MAX_PAGES: usize = 50;

/// Text (0) and announcement (5) channels carry readable message history.
const READABLE_CHANNEL_TYPES: [i64; 2] = [0, 5];

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DiscordConfig {
    pub token: String,
    pub api_base: String,
}

impl DiscordConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    fn authorization(&self) -> String {
        if self.token.trim().contains(' ') {
            self.token.trim().to_string()
        } else {
            format!("Bot {}", self.token.trim())
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types (minimal subset)
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug)]
struct GuildChannel {
    id: Option<String>,
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<i64>,
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

pub struct DiscordReader {
    config: DiscordConfig,
    http_client: Client,
    rate_limit: RateLimitPolicy,
}

impl DiscordReader {
    pub fn new(config: DiscordConfig) -> Self {
        Self {
            config,
            http_client: Client::new(),
            rate_limit: RateLimitPolicy::default(),
        }
    }

    pub fn with_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = policy;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    /// GET with rate-limit backoff. 403 and other non-2xx are not retried.
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ReaderError> {
        let mut retries = 0;
        loop {
            let response = self
                .http_client
                .get(url)
                .header(AUTHORIZATION, self.config.authorization())
                .query(query)
                .send()
                .await
                .context("Discord HTTP request failed")?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = retry_after(response.headers());
                retries += 1;
                let Some(wait) = self.rate_limit.wait_before(retries, retry_after) else {
                    return Err(ReaderError::RateLimited { retry_after });
                };
                warn!(
                    url = %url,
                    retry = retries,
                    wait_ms = wait.as_millis() as u64,
                    "Rate limited by Discord, backing off"
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            if status == StatusCode::FORBIDDEN {
                let body = response.text().await.unwrap_or_default();
                return Err(ReaderError::PermissionDenied(format!("{url}: {body}")));
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ReaderError::Http {
                    status: status.as_u16(),
                    body,
                });
            }

            let parsed = response
                .json::<T>()
                .await
                .context("Failed to parse Discord response")?;
            return Ok(parsed);
        }
    }
}

#[async_trait]
impl ChatPlatformReader for DiscordReader {
    async fn list_channels(&self, server_id: &str) -> Result<Vec<ChannelInfo>, ReaderError> {
        let url = self.url(&format!("guilds/{server_id}/channels"));
        let listed: Vec<GuildChannel> = self.get_json(&url, &[]).await?;
        let channels = readable_channels(server_id, listed);
        debug!(server_id = %server_id, channels = channels.len(), "Discovered Discord channels");
        Ok(channels)
    }

    async fn fetch_new_messages(
        &self,
        channel_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawMessage>, ReaderError> {
        let url = self.url(&format!("channels/{channel_id}/messages"));
        let mut after = snowflake_at(since);
        let mut collected: Vec<RawMessage> = Vec::new();

        for page in 1..=MAX_PAGES {
            let batch: Vec<RawMessage> = self
                .get_json(
                    &url,
                    &[("limit", PAGE_LIMIT.to_string()), ("after", after.to_string())],
                )
                .await?;
            let count = batch.len();
            let newest = batch.iter().filter_map(snowflake_of).max();
            collected.extend(batch);

            if count < PAGE_LIMIT {
                break;
            }
            match newest {
                Some(id) if id > after => after = id,
                _ => break,
            }
            if page == MAX_PAGES {
                warn!(channel_id = %channel_id, pages = MAX_PAGES, "Page cap reached, remaining history deferred");
            }
        }

        collected.sort_by_key(|m| snowflake_of(m).unwrap_or(0));
        debug!(channel_id = %channel_id, fetched = collected.len(), "Fetched Discord messages");
        Ok(collected)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Lowest snowflake whose embedded timestamp is `at`.
pub fn snowflake_at(at: DateTime<Utc>) -> u64 {
    let since_epoch = (at.timestamp_millis() - DISCORD_EPOCH_MS).max(0) as u64;
    since_epoch << 22
}

fn snowflake_of(message: &RawMessage) -> Option<u64> {
    message.id.as_deref()?.parse().ok()
}

fn readable_channels(server_id: &str, listed: Vec<GuildChannel>) -> Vec<ChannelInfo> {
    listed
        .into_iter()
        .filter(|c| c.kind.is_some_and(|k| READABLE_CHANNEL_TYPES.contains(&k)))
        .filter_map(|c| {
            let channel_id = c.id.filter(|id| !id.is_empty())?;
            let name = c.name.filter(|n| !n.is_empty())?;
            Some(ChannelInfo {
                channel_id,
                server_id: server_id.to_string(),
                name,
            })
        })
        .collect()
}

/// `Retry-After` in (possibly fractional) seconds.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}
