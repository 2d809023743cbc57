use std::time::Duration;

use thiserror::Error;

/// Top-level error type for the digest pipeline.
#[derive(Debug, Error)]
pub enum DigestError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures surfaced by a chat platform reader.
///
/// None of these abort a sync; the affected channel is skipped for the cycle.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("access denied: {0}")]
    PermissionDenied(String),

    #[error("rate limited by chat platform (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("chat platform returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// A failed summary generation attempt.
///
/// `Clone` because one attempt's outcome is delivered to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generation failed: timeout after {0:?}")]
    Timeout(Duration),

    #[error("summarization provider error: {0}")]
    Provider(String),

    #[error("generation aborted: {0}")]
    Aborted(String),
}
