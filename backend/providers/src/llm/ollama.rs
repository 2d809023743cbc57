//! Ollama `/api/chat` client, used when no OpenAI key is configured.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use chatdigest_core::{LlmProvider, LlmRequest, LlmResponse};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

pub struct OllamaProvider {
    client: Client,
    base_url: String,
}

impl OllamaProvider {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_OLLAMA_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// `OLLAMA_URL` may be the server root or the chat endpoint itself.
    fn chat_endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/api/chat") {
            base.to_string()
        } else {
            format!("{base}/api/chat")
        }
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<Turn<'a>>,
    stream: bool,
    options: SamplingOptions,
}

#[derive(Serialize)]
struct Turn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct SamplingOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    message: Option<ReplyMessage>,
    eval_count: Option<u64>,
    prompt_eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: String,
}

/// Models are configured as e.g. `openai/gpt-4o`; Ollama wants the bare tag.
fn local_model_name(model: &str) -> &str {
    model.rsplit('/').next().unwrap_or(model)
}

/// Non-streaming chat body for the summarizer's request.
fn chat_body(request: &LlmRequest) -> ChatBody<'_> {
    let mut messages = Vec::with_capacity(2);
    if !request.system_prompt.is_empty() {
        messages.push(Turn {
            role: "system",
            content: &request.system_prompt,
        });
    }
    messages.push(Turn {
        role: "user",
        content: &request.user_prompt,
    });
    ChatBody {
        model: local_model_name(&request.model),
        messages,
        stream: false,
        options: SamplingOptions {
            temperature: request.temperature,
            num_predict: request.max_tokens,
        },
    }
}

/// A reply without message text is a malformed completion.
fn into_llm_response(reply: ChatReply, model: &str, latency: Duration) -> Result<LlmResponse> {
    let content = reply
        .message
        .map(|m| m.content)
        .filter(|c| !c.trim().is_empty())
        .with_context(|| format!("Ollama reply for {model} had no message content"))?;

    Ok(LlmResponse {
        content,
        provider: "ollama".to_string(),
        model: model.to_string(),
        tokens_used: reply.eval_count.unwrap_or(0) + reply.prompt_eval_count.unwrap_or(0),
        latency_ms: latency.as_millis() as u64,
    })
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let started = Instant::now();
        let body = chat_body(request);
        debug!(model = %body.model, endpoint = %self.chat_endpoint(), "Requesting Ollama summary");

        let response = self
            .client
            .post(self.chat_endpoint())
            .json(&body)
            .send()
            .await
            .context("Ollama HTTP request failed")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned {status}: {detail}");
        }

        let reply: ChatReply = response
            .json()
            .await
            .context("Failed to parse Ollama reply")?;
        into_llm_response(reply, body.model, started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chatdigest_core::{Message, Summarizer};
    use chrono::{TimeZone, Utc};

    use crate::llm::MockProvider;
    use crate::summarizer::LlmSummarizer;

    /// The request the summarizer actually hands its provider.
    async fn summarizer_request() -> LlmRequest {
        let recorder = Arc::new(MockProvider::new("recorder").with_response("ok"));
        LlmSummarizer::new(recorder.clone(), "openai/llama3")
            .summarize(
                "general",
                &[Message {
                    channel_id: "c1".into(),
                    message_id: "1".into(),
                    author_id: "u1".into(),
                    author_name: "alice".into(),
                    timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
                    text: "release on friday".into(),
                }],
            )
            .await
            .unwrap();
        recorder.last_request().unwrap()
    }

    #[tokio::test]
    async fn summarizer_request_maps_to_chat_body() {
        let request = summarizer_request().await;
        let body = serde_json::to_value(chat_body(&request)).unwrap();

        assert_eq!(body["model"], "llama3");
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["num_predict"], 800);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        let prompt = body["messages"][1]["content"].as_str().unwrap();
        assert!(prompt.contains("Channel: #general"));
        assert!(prompt.ends_with("alice: release on friday"));
    }

    #[test]
    fn blank_system_prompt_is_omitted() {
        let request = LlmRequest {
            model: "llama3".into(),
            system_prompt: String::new(),
            user_prompt: "hi".into(),
            max_tokens: 10,
            temperature: 0.0,
        };
        assert_eq!(chat_body(&request).messages.len(), 1);
    }

    #[test]
    fn reply_without_content_is_an_error() {
        let missing: ChatReply = serde_json::from_value(serde_json::json!({"done": true})).unwrap();
        assert!(into_llm_response(missing, "llama3", Duration::ZERO).is_err());

        let blank: ChatReply = serde_json::from_value(serde_json::json!({
            "message": {"role": "assistant", "content": "  "}
        }))
        .unwrap();
        let err = into_llm_response(blank, "llama3", Duration::ZERO).unwrap_err();
        assert!(err.to_string().contains("no message content"));
    }

    #[test]
    fn reply_tokens_are_summed() {
        let reply: ChatReply = serde_json::from_value(serde_json::json!({
            "message": {"role": "assistant", "content": "Release planning."},
            "eval_count": 12,
            "prompt_eval_count": 30
        }))
        .unwrap();
        let response = into_llm_response(reply, "llama3", Duration::from_millis(5)).unwrap();
        assert_eq!(response.content, "Release planning.");
        assert_eq!(response.tokens_used, 42);
        assert_eq!(response.latency_ms, 5);
    }

    #[test]
    fn endpoint_accepts_root_or_chat_path() {
        assert_eq!(OllamaProvider::new().chat_endpoint(), "http://localhost:11434/api/chat");
        let full = OllamaProvider::new().with_base_url("http://gpu-box:11434/api/chat/");
        assert_eq!(full.chat_endpoint(), "http://gpu-box:11434/api/chat");
        assert_eq!(local_model_name("openai/gpt-4o"), "gpt-4o");
    }
}
