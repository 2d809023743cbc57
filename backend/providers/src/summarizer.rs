//! LLM-backed channel summarizer.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use chatdigest_core::{LlmProvider, LlmRequest, Message, Summarizer};

const SYSTEM_PROMPT: &str =
    "You summarize chat channel activity for a community dashboard. Be concise and factual.";

/// Transcript characters sent to the model.
pub const MAX_TRANSCRIPT_CHARS: usize = 3000;

pub struct LlmSummarizer {
    provider: Arc<dyn LlmProvider>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl LlmSummarizer {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            max_tokens: 800,
            temperature: 0.3,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// `author: text` lines, oldest first, cut to [`MAX_TRANSCRIPT_CHARS`].
pub fn transcript(messages: &[Message]) -> String {
    let full = messages
        .iter()
        .map(|m| format!("{}: {}", m.author_name, m.text))
        .collect::<Vec<_>>()
        .join("\n");
    match full.char_indices().nth(MAX_TRANSCRIPT_CHARS) {
        Some((cut, _)) => full[..cut].to_string(),
        None => full,
    }
}

pub fn build_prompt(channel_name: &str, messages: &[Message]) -> String {
    format!(
        "Analyze the following messages from channel '{channel_name}' and provide a concise \
         summary of the key recent discussions. Focus on:\n\n\
         1. Main conversation topics and themes\n\
         2. Important questions or issues raised\n\
         3. Any significant announcements or decisions\n\
         4. Notable community interactions or discussions\n\n\
         Channel: #{channel_name}\n\
         Messages:\n{}",
        transcript(messages)
    )
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, channel_name: &str, messages: &[Message]) -> Result<String> {
        if messages.is_empty() {
            anyhow::bail!("no messages to summarize for #{channel_name}");
        }

        let request = LlmRequest {
            model: self.model.clone(),
            system_prompt: SYSTEM_PROMPT.to_string(),
            user_prompt: build_prompt(channel_name, messages),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .provider
            .complete(&request)
            .await
            .with_context(|| format!("{} completion failed", self.provider.name()))?;

        let summary = response.content.trim();
        if summary.is_empty() {
            anyhow::bail!("{} returned an empty completion", response.provider);
        }

        info!(
            channel = %channel_name,
            provider = %response.provider,
            model = %response.model,
            tokens = response.tokens_used,
            latency_ms = response.latency_ms,
            "Channel summarized"
        );
        Ok(summary.to_string())
    }
}
