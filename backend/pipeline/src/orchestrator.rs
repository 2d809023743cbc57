//! Sync Orchestrator: ingestion, per-channel digests, cache control.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use chatdigest_core::{
    AppendOutcome, CacheMetrics, CacheStatus, ChannelDigest, ChannelInfo, ChatPlatformReader,
    ClearAck, Clock, DigestError, MessageStore, ReaderError, ServerSummaryResponse, Summarizer,
    SummaryStore, SyncReport,
};
use chatdigest_logging::redact_sensitive_data;

use crate::config::PipelineConfig;
use crate::fingerprint::fingerprint;
use crate::summary_cache::{GenerationTarget, SummaryCache};
use crate::sync_state::{SyncState, SyncStateTracker};
use crate::window::ActivityIndex;

/// External capabilities the orchestrator is built from.
pub struct Collaborators {
    pub messages: Arc<dyn MessageStore>,
    pub summaries: Arc<dyn SummaryStore>,
    pub reader: Arc<dyn ChatPlatformReader>,
    pub summarizer: Arc<dyn Summarizer>,
    pub clock: Arc<dyn Clock>,
}

/// Entry point for `get_summaries`, `force_sync` and `clear_cache`.
///
/// Cheap to clone; clones share the cache and sync state.
#[derive(Clone)]
pub struct SyncOrchestrator {
    messages: Arc<dyn MessageStore>,
    reader: Arc<dyn ChatPlatformReader>,
    summarizer: Arc<dyn Summarizer>,
    clock: Arc<dyn Clock>,
    index: ActivityIndex,
    cache: SummaryCache,
    syncs: Arc<SyncStateTracker>,
    window: chrono::Duration,
    concurrency: usize,
}

impl SyncOrchestrator {
    pub fn new(collaborators: Collaborators, config: PipelineConfig) -> Result<Self, DigestError> {
        let Collaborators {
            messages,
            summaries,
            reader,
            summarizer,
            clock,
        } = collaborators;

        let window = chrono::Duration::from_std(config.window).context("Activity window out of range")?;
        let index = ActivityIndex::new(Arc::clone(&messages), config.window)?;
        let cache = SummaryCache::new(summaries, Arc::clone(&clock), config.generation_timeout);
        let syncs = Arc::new(SyncStateTracker::new(Arc::clone(&clock)));

        Ok(Self {
            messages,
            reader,
            summarizer,
            clock,
            index,
            cache,
            syncs,
            window,
            concurrency: config.sync_concurrency.max(1),
        })
    }

    pub fn cache(&self) -> &SummaryCache {
        &self.cache
    }

    /// Digest of the server's active channels from already-ingested messages.
    pub async fn get_summaries(&self, server_id: &str) -> Result<ServerSummaryResponse, DigestError> {
        self.summarize_server(server_id, None).await
    }

    /// Pull new messages for every channel of the server, then digest.
    pub async fn force_sync(&self, server_id: &str) -> Result<ServerSummaryResponse, DigestError> {
        let this = self.clone();
        let owner = server_id.to_string();
        let (outcome, started) = self
            .syncs
            .join_or_start(server_id, move || async move { this.ingest(&owner).await });
        if !started {
            debug!(server_id = %server_id, "Waiting on running sync");
        }
        let report = outcome.await;
        self.summarize_server(server_id, Some(report)).await
    }

    /// Invalidate every cached summary of the server. Messages are untouched.
    pub async fn clear_cache(&self, server_id: &str) -> Result<ClearAck, DigestError> {
        let cleared = self
            .cache
            .clear(server_id)
            .await
            .with_context(|| format!("Failed to clear summaries for server {server_id}"))?;
        Ok(ClearAck {
            server_id: server_id.to_string(),
            status: "success".to_string(),
            message: "Cache cleared successfully".to_string(),
            cleared,
        })
    }

    pub fn sync_state(&self, server_id: &str) -> Option<SyncState> {
        self.syncs.get(server_id)
    }

    async fn summarize_server(
        &self,
        server_id: &str,
        sync: Option<SyncReport>,
    ) -> Result<ServerSummaryResponse, DigestError> {
        let now = self.clock.now();
        let channels = self
            .messages
            .list_channels(server_id)
            .await
            .with_context(|| format!("Failed to list channels for server {server_id}"))?;
        let total_channels_analyzed = channels.len();

        let limit = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set = JoinSet::new();
        for channel in channels {
            let this = self.clone();
            let server = server_id.to_string();
            let limit = Arc::clone(&limit);
            join_set.spawn(async move {
                let _permit = limit.acquire_owned().await;
                this.digest_channel(&server, channel, now).await
            });
        }

        let mut channels: Vec<ChannelDigest> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(digest)) => channels.push(digest),
                Ok(None) => {}
                Err(e) => error!(server_id = %server_id, error = %e, "Channel digest task panicked"),
            }
        }
        channels.sort_by(|a, b| {
            b.last_active
                .cmp(&a.last_active)
                .then_with(|| a.channel_name.cmp(&b.channel_name))
                .then_with(|| a.channel_id.cmp(&b.channel_id))
        });

        let cache_metrics = CacheMetrics::from_digests(&channels);
        info!(
            server_id = %server_id,
            active = channels.len(),
            hits = cache_metrics.hits,
            misses = cache_metrics.misses,
            failures = cache_metrics.failures,
            "Server digest built"
        );

        Ok(ServerSummaryResponse {
            server_id: server_id.to_string(),
            timestamp: now,
            active_channels: channels.len(),
            channels,
            total_channels_analyzed,
            cache_metrics,
            sync,
        })
    }

    /// `None` for an empty window or a channel whose window could not be read.
    async fn digest_channel(
        &self,
        server_id: &str,
        channel: ChannelInfo,
        now: DateTime<Utc>,
    ) -> Option<ChannelDigest> {
        let snapshot = match self.index.snapshot(&channel.channel_id, now).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(channel_id = %channel.channel_id, error = %format!("{e:#}"), "Skipping channel");
                return None;
            }
        };
        let last_active = snapshot.last_active?;

        let target = GenerationTarget {
            server_id: server_id.to_string(),
            channel_id: channel.channel_id.clone(),
            fingerprint: fingerprint(snapshot.message_ids()),
            message_count: snapshot.message_count,
            total_participants: snapshot.total_participants,
            last_active,
            window_start: snapshot.window_start,
            window_end: snapshot.window_end,
        };

        let summarizer = Arc::clone(&self.summarizer);
        let name = channel.name.clone();
        let messages = snapshot.messages;
        let outcome = self
            .cache
            .get_or_generate(&target, move || async move {
                summarizer.summarize(&name, &messages).await
            })
            .await;

        let (summary, error, cache_status, generated_at) = match outcome {
            Ok(cached) => (
                Some(cached.entry.summary),
                None,
                cached.status,
                Some(cached.entry.generated_at),
            ),
            Err(e) => (None, Some(e.to_string()), CacheStatus::Error, None),
        };

        Some(ChannelDigest {
            channel_id: channel.channel_id,
            channel_name: channel.name,
            summary,
            error,
            message_count: target.message_count,
            total_participants: target.total_participants,
            last_active,
            cache_status,
            generated_at,
        })
    }

    async fn ingest(&self, server_id: &str) -> SyncReport {
        let mut report = SyncReport::default();

        let channels = match self.reader.list_channels(server_id).await {
            Ok(listed) => {
                for channel in &listed {
                    if let Err(e) = self.messages.upsert_channel(channel).await {
                        warn!(channel_id = %channel.channel_id, error = %e, "Failed to register channel");
                        report.errors.push(format!("channel {}: {e}", channel.channel_id));
                    }
                }
                listed
            }
            Err(e) => {
                let cause = redact_sensitive_data(&e.to_string());
                warn!(server_id = %server_id, error = %cause, "Channel listing failed, using known channels");
                report.errors.push(format!("channel listing failed: {cause}"));
                match self.messages.list_channels(server_id).await {
                    Ok(known) => known,
                    Err(e) => {
                        report.errors.push(format!("known channels unavailable: {e}"));
                        Vec::new()
                    }
                }
            }
        };

        report.total_channels = channels.len();
        self.syncs.set_total(server_id, channels.len());

        let limit = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set = JoinSet::new();
        for channel in channels {
            let this = self.clone();
            let server = server_id.to_string();
            let limit = Arc::clone(&limit);
            join_set.spawn(async move {
                let _permit = limit.acquire_owned().await;
                let result = this.sync_channel(&channel.channel_id).await;
                this.syncs
                    .channel_finished(&server, result.as_ref().err().cloned());
                (channel.channel_id, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => {
                    report.synced_channels += 1;
                    report.messages_ingested += outcome.inserted;
                    report.rejected_messages += outcome.rejected;
                }
                Ok((channel_id, Err(cause))) => {
                    report.failed_channels += 1;
                    report.errors.push(format!("channel {channel_id}: {cause}"));
                }
                Err(e) => {
                    error!(server_id = %server_id, error = %e, "Channel sync task panicked");
                    report.failed_channels += 1;
                    report.errors.push(format!("channel sync task aborted: {e}"));
                }
            }
        }
        report
    }

    /// Incremental fetch for one channel. Errors come back redacted.
    async fn sync_channel(&self, channel_id: &str) -> Result<AppendOutcome, String> {
        let now = self.clock.now();
        let since = match self.messages.latest_timestamp(channel_id).await {
            Ok(Some(latest)) => latest,
            Ok(None) => now - self.window,
            Err(e) => return Err(format!("{e:#}")),
        };

        let fetched = match self.reader.fetch_new_messages(channel_id, since).await {
            Ok(fetched) => fetched,
            Err(e) => {
                let cause = redact_sensitive_data(&e.to_string());
                match e {
                    ReaderError::PermissionDenied(_) => {
                        warn!(channel_id = %channel_id, "No read access, skipping channel")
                    }
                    _ => warn!(channel_id = %channel_id, error = %cause, "Fetch failed, skipping channel"),
                }
                return Err(cause);
            }
        };

        let outcome = self
            .messages
            .append(channel_id, fetched)
            .await
            .map_err(|e| format!("{e:#}"))?;
        if let Err(e) = self.messages.record_sync(channel_id, now).await {
            warn!(channel_id = %channel_id, error = %e, "Failed to record sync time");
        }
        info!(
            channel_id = %channel_id,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            rejected = outcome.rejected,
            "Channel synced"
        );
        Ok(outcome)
    }
}
