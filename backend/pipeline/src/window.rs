//! Per-channel activity windows derived from the message store.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use chatdigest_core::{Message, MessageStore};

/// Messages of one channel inside `[as_of - window, as_of]`, plus stats.
#[derive(Debug, Clone, Serialize)]
pub struct ActivitySnapshot {
    pub channel_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub message_count: usize,
    /// Newest message timestamp; `None` for an empty window
    pub last_active: Option<DateTime<Utc>>,
    pub total_participants: usize,
    #[serde(skip)]
    pub messages: Vec<Message>,
}

impl ActivitySnapshot {
    pub fn is_empty(&self) -> bool {
        self.message_count == 0
    }

    pub fn message_ids(&self) -> impl Iterator<Item = &str> {
        self.messages.iter().map(|m| m.message_id.as_str())
    }
}

/// Read-only view over the store that computes activity snapshots.
#[derive(Clone)]
pub struct ActivityIndex {
    store: Arc<dyn MessageStore>,
    window: chrono::Duration,
}

impl ActivityIndex {
    pub fn new(store: Arc<dyn MessageStore>, window: std::time::Duration) -> Result<Self> {
        let window = chrono::Duration::from_std(window).context("Activity window out of range")?;
        Ok(Self { store, window })
    }

    /// Snapshot of `channel_id` as of `as_of`. No side effects.
    pub async fn snapshot(&self, channel_id: &str, as_of: DateTime<Utc>) -> Result<ActivitySnapshot> {
        let window_start = as_of - self.window;
        let messages = self
            .store
            .query(channel_id, window_start, as_of)
            .await
            .with_context(|| format!("Failed to query window for channel {channel_id}"))?;

        let last_active = messages.iter().map(|m| m.timestamp).max();
        let total_participants = messages
            .iter()
            .map(|m| m.author_id.as_str())
            .collect::<HashSet<_>>()
            .len();

        Ok(ActivitySnapshot {
            channel_id: channel_id.to_string(),
            window_start,
            window_end: as_of,
            message_count: messages.len(),
            last_active,
            total_participants,
            messages,
        })
    }
}
