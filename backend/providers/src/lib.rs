//! Collaborators for the digest pipeline: the Discord reader and the
//! LLM-backed summarizer.

pub mod discord;
pub mod llm;
pub mod retry;
pub mod summarizer;

pub use discord::{DiscordConfig, DiscordReader};
pub use llm::{MockProvider, OllamaProvider, OpenAiProvider};
pub use retry::RateLimitPolicy;
pub use summarizer::LlmSummarizer;
