//! Fingerprint-keyed summary cache with single-flight generation.
//!
//! At most one generation runs per channel at a time. Concurrent requests
//! for the same fingerprint share that generation's outcome, success or
//! failure. Generations run on their own task, so a caller that goes away
//! does not cancel work other callers are waiting on.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use chatdigest_core::{
    CacheEntry, CacheStatus, Clock, EntryStatus, Fingerprint, GenerationError, SummaryStore,
};
use chatdigest_logging::redact_sensitive_data;

type Outcome = Shared<BoxFuture<'static, Result<CacheEntry, GenerationError>>>;

/// Everything needed to build a [`CacheEntry`] once generation succeeds.
#[derive(Debug, Clone)]
pub struct GenerationTarget {
    pub server_id: String,
    pub channel_id: String,
    pub fingerprint: Fingerprint,
    pub message_count: usize,
    pub total_participants: usize,
    pub last_active: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// A served summary and whether it was reused.
#[derive(Debug, Clone)]
pub struct CachedSummary {
    pub entry: CacheEntry,
    pub status: CacheStatus,
}

struct PendingGeneration {
    attempt: u64,
    fingerprint: Fingerprint,
    outcome: Outcome,
}

struct Slot {
    server_id: String,
    current: Option<CacheEntry>,
    /// Whether the durable entry has been read into `current`
    loaded: bool,
    /// Bumped on clear; stale loads compare against it
    epoch: u64,
    pending: Option<PendingGeneration>,
}

impl Slot {
    fn new(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            current: None,
            loaded: false,
            epoch: 0,
            pending: None,
        }
    }
}

struct CacheInner {
    slots: Mutex<HashMap<String, Slot>>,
    store: Arc<dyn SummaryStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    next_attempt: AtomicU64,
}

impl CacheInner {
    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a finished attempt and hand its result to every waiter.
    async fn finish(
        &self,
        target: &GenerationTarget,
        attempt: u64,
        result: Result<String, GenerationError>,
    ) -> Result<CacheEntry, GenerationError> {
        let summary = match result {
            Ok(summary) => summary,
            Err(e) => {
                warn!(
                    channel_id = %target.channel_id,
                    fingerprint = %target.fingerprint,
                    error = %e,
                    "Summary generation failed"
                );
                let mut slots = self.lock_slots();
                if let Some(slot) = slots.get_mut(&target.channel_id) {
                    if slot.pending.as_ref().is_some_and(|p| p.attempt == attempt) {
                        slot.pending = None;
                    }
                }
                return Err(e);
            }
        };

        let entry = CacheEntry {
            channel_id: target.channel_id.clone(),
            server_id: target.server_id.clone(),
            fingerprint: target.fingerprint.clone(),
            summary,
            generated_at: self.clock.now(),
            message_count: target.message_count,
            total_participants: target.total_participants,
            last_active: target.last_active,
            window_start: target.window_start,
            window_end: target.window_end,
        };

        if let Err(e) = self.store.save_summary(&entry).await {
            warn!(channel_id = %entry.channel_id, error = %e, "Failed to persist summary");
        }

        let mut slots = self.lock_slots();
        let slot = slots
            .entry(target.channel_id.clone())
            .or_insert_with(|| Slot::new(&target.server_id));
        if slot.pending.as_ref().is_some_and(|p| p.attempt == attempt) {
            slot.pending = None;
        }
        slot.current = Some(entry.clone());
        slot.loaded = true;
        Ok(entry)
    }
}

enum Next {
    Join(Outcome),
    /// A generation for an older fingerprint is still running
    Wait(Outcome),
}

/// Per-channel summary cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SummaryCache {
    inner: Arc<CacheInner>,
}

impl SummaryCache {
    pub fn new(store: Arc<dyn SummaryStore>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                slots: Mutex::new(HashMap::new()),
                store,
                clock,
                timeout,
                next_attempt: AtomicU64::new(1),
            }),
        }
    }

    /// Return the cached summary for `target.fingerprint`, generating it with
    /// `generate` if needed.
    ///
    /// `generate` is invoked at most once, and only when no entry or running
    /// generation already matches the fingerprint.
    pub async fn get_or_generate<F, Fut>(
        &self,
        target: &GenerationTarget,
        generate: F,
    ) -> Result<CachedSummary, GenerationError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        self.ensure_loaded(target).await;

        let mut generate = Some(generate);
        loop {
            let next = {
                let mut slots = self.inner.lock_slots();
                let slot = slots
                    .entry(target.channel_id.clone())
                    .or_insert_with(|| Slot::new(&target.server_id));
                slot.server_id.clone_from(&target.server_id);

                if let Some(entry) = slot
                    .current
                    .as_ref()
                    .filter(|e| e.fingerprint == target.fingerprint)
                {
                    debug!(channel_id = %target.channel_id, "Summary cache hit");
                    return Ok(CachedSummary {
                        entry: entry.clone(),
                        status: CacheStatus::Hit,
                    });
                }

                match &slot.pending {
                    Some(p) if p.fingerprint == target.fingerprint => Next::Join(p.outcome.clone()),
                    Some(p) => Next::Wait(p.outcome.clone()),
                    None => {
                        let Some(generate) = generate.take() else {
                            return Err(GenerationError::Aborted(
                                "generator already consumed".to_string(),
                            ));
                        };
                        let attempt = self.inner.next_attempt.fetch_add(1, Ordering::Relaxed);
                        let outcome = self.spawn_generation(target.clone(), attempt, generate);
                        slot.pending = Some(PendingGeneration {
                            attempt,
                            fingerprint: target.fingerprint.clone(),
                            outcome: outcome.clone(),
                        });
                        Next::Join(outcome)
                    }
                }
            };

            match next {
                Next::Join(outcome) => {
                    let entry = outcome.await?;
                    return Ok(CachedSummary {
                        entry,
                        status: CacheStatus::Miss,
                    });
                }
                Next::Wait(outcome) => {
                    // Outcome belongs to another fingerprint; only its completion matters
                    let _ = outcome.await;
                }
            }
        }
    }

    fn spawn_generation<F, Fut>(&self, target: GenerationTarget, attempt: u64, generate: F) -> Outcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let timeout = inner.timeout;
        info!(
            channel_id = %target.channel_id,
            fingerprint = %target.fingerprint,
            messages = target.message_count,
            "Generating summary"
        );

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let run = AssertUnwindSafe(async move { generate().await }).catch_unwind();
            let result = match tokio::time::timeout(timeout, run).await {
                Err(_) => Err(GenerationError::Timeout(timeout)),
                Ok(Err(_)) => Err(GenerationError::Aborted("summarizer panicked".to_string())),
                Ok(Ok(Err(e))) => Err(GenerationError::Provider(redact_sensitive_data(&format!(
                    "{e:#}"
                )))),
                Ok(Ok(Ok(text))) if text.trim().is_empty() => {
                    Err(GenerationError::Provider("empty summary".to_string()))
                }
                Ok(Ok(Ok(text))) => Ok(text),
            };
            debug!(
                channel_id = %target.channel_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "Generation attempt finished"
            );
            inner.finish(&target, attempt, result).await
        });

        handle
            .map(|joined| {
                joined.unwrap_or_else(|e| Err(GenerationError::Aborted(e.to_string())))
            })
            .boxed()
            .shared()
    }

    /// Read the durable entry into memory the first time a channel is seen.
    async fn ensure_loaded(&self, target: &GenerationTarget) {
        let epoch = {
            let mut slots = self.inner.lock_slots();
            let slot = slots
                .entry(target.channel_id.clone())
                .or_insert_with(|| Slot::new(&target.server_id));
            if slot.loaded {
                return;
            }
            slot.epoch
        };

        let stored = match self.inner.store.load_summary(&target.channel_id).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(channel_id = %target.channel_id, error = %e, "Failed to load stored summary");
                return;
            }
        };

        let mut slots = self.inner.lock_slots();
        if let Some(slot) = slots.get_mut(&target.channel_id) {
            if !slot.loaded && slot.epoch == epoch {
                if slot.current.is_none() {
                    slot.current = stored;
                }
                slot.loaded = true;
            }
        }
    }

    /// State of the channel's slot, if it has one.
    pub fn status(&self, channel_id: &str) -> Option<EntryStatus> {
        let slots = self.inner.lock_slots();
        let slot = slots.get(channel_id)?;
        if slot.pending.is_some() {
            Some(EntryStatus::Pending)
        } else if slot.current.is_some() {
            Some(EntryStatus::Ready)
        } else {
            None
        }
    }

    /// Drop every cached summary for the server, in memory and on disk.
    ///
    /// Running generations are left alone; whichever finishes first after
    /// the clear becomes the channel's entry.
    ///
    /// The durable rows go first. A lazy load that read a row before the
    /// delete started on an epoch this bumps, so it cannot install the
    /// cleared entry.
    pub async fn clear(&self, server_id: &str) -> anyhow::Result<usize> {
        let persisted = self.inner.store.clear_summaries(server_id).await?;
        let in_memory = {
            let mut slots = self.inner.lock_slots();
            let mut cleared = 0;
            for slot in slots.values_mut().filter(|s| s.server_id == server_id) {
                if slot.current.take().is_some() {
                    cleared += 1;
                }
                slot.loaded = true;
                slot.epoch += 1;
            }
            cleared
        };
        info!(server_id = %server_id, in_memory, persisted, "Summary cache cleared");
        Ok(in_memory.max(persisted))
    }
}
