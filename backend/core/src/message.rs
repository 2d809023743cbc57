use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DigestError;

/// A stored chat message. Immutable once written; identified by
/// `(channel_id, message_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub channel_id: String,
    pub message_id: String,
    pub author_id: String,
    /// Display name used when building prompts
    pub author_name: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// Wire-level message as returned by the chat platform.
///
/// Every field is optional so a single bad record can be rejected without
/// failing the page it arrived in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: Option<String>,
    pub author: Option<RawAuthor>,
    pub content: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawAuthor {
    pub id: Option<String>,
    pub username: Option<String>,
}

impl RawMessage {
    /// Validate and convert into a stored [`Message`] for `channel_id`.
    ///
    /// A missing/blank id or a missing/unparseable timestamp is rejected.
    pub fn into_message(self, channel_id: &str) -> Result<Message, DigestError> {
        let message_id = match self.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                return Err(DigestError::MalformedMessage(format!(
                    "message in channel {channel_id} has no id"
                )))
            }
        };

        let raw_ts = self.timestamp.ok_or_else(|| {
            DigestError::MalformedMessage(format!("message {message_id} has no timestamp"))
        })?;
        let timestamp = DateTime::parse_from_rfc3339(&raw_ts)
            .map_err(|e| {
                DigestError::MalformedMessage(format!(
                    "message {message_id} has invalid timestamp {raw_ts:?}: {e}"
                ))
            })?
            .with_timezone(&Utc);

        let author = self.author.unwrap_or_default();
        let author_id = author.id.unwrap_or_else(|| "unknown".to_string());
        let author_name = author.username.unwrap_or_else(|| author_id.clone());

        Ok(Message {
            channel_id: channel_id.to_string(),
            message_id,
            author_id,
            author_name,
            timestamp,
            text: self.content.unwrap_or_default(),
        })
    }
}

impl From<Message> for RawMessage {
    fn from(msg: Message) -> Self {
        Self {
            id: Some(msg.message_id),
            author: Some(RawAuthor {
                id: Some(msg.author_id),
                username: Some(msg.author_name),
            }),
            content: Some(msg.text),
            timestamp: Some(msg.timestamp.to_rfc3339()),
        }
    }
}

/// A channel known to belong to a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_id: String,
    pub server_id: String,
    pub name: String,
}

/// Per-batch breakdown returned by `MessageStore::append`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendOutcome {
    /// Messages newly written
    pub inserted: usize,
    /// Messages already present (no-op)
    pub duplicates: usize,
    /// Malformed messages dropped from the batch
    pub rejected: usize,
}
