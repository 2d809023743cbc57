use std::time::Duration;

/// Process-wide pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Trailing activity window (default 7 days)
    pub window: Duration,
    /// Upper bound on a single summary generation
    pub generation_timeout: Duration,
    /// Channels fetched or summarised in parallel per request
    pub sync_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(7 * 24 * 3600),
            generation_timeout: Duration::from_secs(120),
            sync_concurrency: 5,
        }
    }
}
