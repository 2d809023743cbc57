use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// Opaque digest identifying the exact set of messages in a channel's window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A generated summary and the window it was generated from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub channel_id: String,
    pub server_id: String,
    pub fingerprint: Fingerprint,
    pub summary: String,
    pub generated_at: DateTime<Utc>,
    pub message_count: usize,
    pub total_participants: usize,
    pub last_active: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Lifecycle of a channel's current cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Ready,
}

/// Whether a served summary was reused or freshly computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Hit,
    Miss,
    /// Generation failed for this channel; see `ChannelDigest::error`
    Error,
}

/// One channel's entry in a [`ServerSummaryResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDigest {
    pub channel_id: String,
    /// Used as the map key when serialized
    #[serde(skip_serializing)]
    pub channel_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message_count: usize,
    pub total_participants: usize,
    pub last_active: DateTime<Utc>,
    pub cache_status: CacheStatus,
    pub generated_at: Option<DateTime<Utc>>,
}

/// Hit/miss accounting for one response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: usize,
    pub misses: usize,
    pub failures: usize,
    pub hit_ratio: f64,
}

impl CacheMetrics {
    pub fn from_digests(digests: &[ChannelDigest]) -> Self {
        let mut metrics = Self::default();
        for digest in digests {
            match digest.cache_status {
                CacheStatus::Hit => metrics.hits += 1,
                CacheStatus::Miss => metrics.misses += 1,
                CacheStatus::Error => metrics.failures += 1,
            }
        }
        let served = metrics.hits + metrics.misses;
        if served > 0 {
            metrics.hit_ratio = metrics.hits as f64 / served as f64;
        }
        metrics
    }
}

/// Outcome of the ingestion phase of a force-sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub synced_channels: usize,
    pub failed_channels: usize,
    pub total_channels: usize,
    pub messages_ingested: usize,
    pub rejected_messages: usize,
    pub errors: Vec<String>,
}

/// Per-request digest of a server's active channels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerSummaryResponse {
    pub server_id: String,
    pub timestamp: DateTime<Utc>,
    /// Ordered by `last_active` descending
    #[serde(serialize_with = "serialize_channels")]
    pub channels: Vec<ChannelDigest>,
    pub total_channels_analyzed: usize,
    pub active_channels: usize,
    pub cache_metrics: CacheMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncReport>,
}

impl ServerSummaryResponse {
    pub fn channel(&self, name: &str) -> Option<&ChannelDigest> {
        self.channels.iter().find(|c| c.channel_name == name)
    }
}

/// Emit `channels` as a JSON object keyed by channel name, keeping order.
///
/// A name already used as a key gets the channel id appended, then a
/// counter, until the key is unique among everything emitted so far.
fn serialize_channels<S>(channels: &[ChannelDigest], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut seen: HashSet<String> = HashSet::new();
    serializer.collect_map(channels.iter().map(|c| {
        let mut key = c.channel_name.clone();
        if seen.contains(&key) {
            key = format!("{} ({})", c.channel_name, c.channel_id);
        }
        let mut n = 2;
        while seen.contains(&key) {
            key = format!("{} ({}) #{n}", c.channel_name, c.channel_id);
            n += 1;
        }
        seen.insert(key.clone());
        (key, c)
    }))
}

/// Acknowledgement for a cache clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearAck {
    pub server_id: String,
    pub status: String,
    pub message: String,
    pub cleared: usize,
}
