use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::warn;

use chatdigest_core::{
    AppendOutcome, CacheEntry, ChannelInfo, Message, MessageStore, RawMessage, SummaryStore,
};

#[derive(Default)]
struct State {
    channels: HashMap<String, ChannelInfo>,
    /// channel_id -> message_id -> message
    messages: HashMap<String, HashMap<String, Message>>,
    synced: HashMap<String, DateTime<Utc>>,
    summaries: HashMap<String, CacheEntry>,
}

/// Non-durable store for tests and dry runs.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// When the channel was last synchronised, if ever.
    pub async fn last_synced(&self, channel_id: &str) -> Option<DateTime<Utc>> {
        self.state.read().await.synced.get(channel_id).copied()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn upsert_channel(&self, channel: &ChannelInfo) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .channels
            .insert(channel.channel_id.clone(), channel.clone());
        Ok(())
    }

    async fn list_channels(&self, server_id: &str) -> Result<Vec<ChannelInfo>> {
        let state = self.state.read().await;
        let mut channels: Vec<_> = state
            .channels
            .values()
            .filter(|c| c.server_id == server_id)
            .cloned()
            .collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(channels)
    }

    async fn append(&self, channel_id: &str, messages: Vec<RawMessage>) -> Result<AppendOutcome> {
        let mut outcome = AppendOutcome::default();
        let mut state = self.state.write().await;
        let stored = state.messages.entry(channel_id.to_string()).or_default();

        for raw in messages {
            match raw.into_message(channel_id) {
                Ok(msg) => {
                    if stored.contains_key(&msg.message_id) {
                        outcome.duplicates += 1;
                    } else {
                        stored.insert(msg.message_id.clone(), msg);
                        outcome.inserted += 1;
                    }
                }
                Err(e) => {
                    warn!(channel_id = %channel_id, error = %e, "Rejected malformed message");
                    outcome.rejected += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn query(
        &self,
        channel_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let state = self.state.read().await;
        let mut window: Vec<Message> = state
            .messages
            .get(channel_id)
            .map(|stored| {
                stored
                    .values()
                    .filter(|m| m.timestamp >= since && m.timestamp <= until)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        window.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        Ok(window)
    }

    async fn latest_timestamp(&self, channel_id: &str) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .get(channel_id)
            .and_then(|stored| stored.values().map(|m| m.timestamp).max()))
    }

    async fn record_sync(&self, channel_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.state
            .write()
            .await
            .synced
            .insert(channel_id.to_string(), at);
        Ok(())
    }
}

#[async_trait]
impl SummaryStore for InMemoryStore {
    async fn load_summary(&self, channel_id: &str) -> Result<Option<CacheEntry>> {
        Ok(self.state.read().await.summaries.get(channel_id).cloned())
    }

    async fn save_summary(&self, entry: &CacheEntry) -> Result<()> {
        self.state
            .write()
            .await
            .summaries
            .insert(entry.channel_id.clone(), entry.clone());
        Ok(())
    }

    async fn clear_summaries(&self, server_id: &str) -> Result<usize> {
        let mut state = self.state.write().await;
        let State {
            channels,
            summaries,
            ..
        } = &mut *state;
        let before = summaries.len();
        summaries.retain(|channel_id, entry| {
            let owned_by_server = entry.server_id == server_id
                || channels
                    .get(channel_id)
                    .is_some_and(|c| c.server_id == server_id);
            !owned_by_server
        });
        Ok(before - summaries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatdigest_core::Fingerprint;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn raw(id: &str, at: DateTime<Utc>) -> RawMessage {
        RawMessage::from(Message {
            channel_id: "c1".into(),
            message_id: id.into(),
            author_id: "u".into(),
            author_name: "u".into(),
            timestamp: at,
            text: "hi".into(),
        })
    }

    #[tokio::test]
    async fn repeated_append_yields_same_contents() {
        let store = InMemoryStore::new();
        let batch = vec![raw("a", t0()), raw("b", t0()), raw("a", t0())];
        let first = store.append("c1", batch.clone()).await.unwrap();
        assert_eq!((first.inserted, first.duplicates), (2, 1));

        let snapshot = store
            .query("c1", t0() - Duration::days(1), t0())
            .await
            .unwrap();
        store.append("c1", batch).await.unwrap();
        let again = store
            .query("c1", t0() - Duration::days(1), t0())
            .await
            .unwrap();
        assert_eq!(snapshot, again);
    }

    #[tokio::test]
    async fn clear_removes_only_server_entries() {
        let store = InMemoryStore::new();
        store
            .upsert_channel(&ChannelInfo {
                channel_id: "c1".into(),
                server_id: "s1".into(),
                name: "general".into(),
            })
            .await
            .unwrap();
        for (channel, server) in [("c1", "s1"), ("c2", "s2")] {
            store
                .save_summary(&CacheEntry {
                    channel_id: channel.into(),
                    server_id: server.into(),
                    fingerprint: Fingerprint::new("fp"),
                    summary: "s".into(),
                    generated_at: t0(),
                    message_count: 1,
                    total_participants: 1,
                    last_active: t0(),
                    window_start: t0(),
                    window_end: t0(),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.clear_summaries("s1").await.unwrap(), 1);
        assert!(store.load_summary("c2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn records_sync_time() {
        let store = InMemoryStore::new();
        assert!(store.last_synced("c1").await.is_none());
        store.record_sync("c1", t0()).await.unwrap();
        assert_eq!(store.last_synced("c1").await, Some(t0()));
    }
}
