//! Per-server record of the latest force-sync.
//!
//! A sync requested while another is running for the same server joins the
//! running one instead of starting a second ingestion pass.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tracing::{info, warn};

use chatdigest_core::{Clock, SyncReport};

pub type SyncOutcome = Shared<BoxFuture<'static, SyncReport>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncState {
    pub server_id: String,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub channels_total: usize,
    pub channels_completed: usize,
    pub channels_failed: usize,
    pub errors: Vec<String>,
}

struct Tracked {
    state: SyncState,
    running: Option<SyncOutcome>,
}

pub struct SyncStateTracker {
    servers: Mutex<HashMap<String, Tracked>>,
    clock: Arc<dyn Clock>,
}

impl SyncStateTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Tracked>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the server's running sync, or spawn `run` as a new one.
    ///
    /// Returns the shared outcome and whether this call started it.
    pub fn join_or_start<F, Fut>(self: &Arc<Self>, server_id: &str, run: F) -> (SyncOutcome, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncReport> + Send + 'static,
    {
        let mut servers = self.lock();
        if let Some(running) = servers.get(server_id).and_then(|t| t.running.clone()) {
            info!(server_id = %server_id, "Joining in-progress sync");
            return (running, false);
        }

        let tracker = Arc::clone(self);
        let owner = server_id.to_string();
        let work = run();
        let handle = tokio::spawn(async move {
            let report = work.await;
            tracker.finish(&owner, &report);
            report
        });
        let outcome = handle
            .map(|joined| {
                joined.unwrap_or_else(|e| SyncReport {
                    errors: vec![format!("sync task aborted: {e}")],
                    ..SyncReport::default()
                })
            })
            .boxed()
            .shared();

        servers.insert(
            server_id.to_string(),
            Tracked {
                state: SyncState {
                    server_id: server_id.to_string(),
                    status: SyncStatus::InProgress,
                    started_at: self.clock.now(),
                    finished_at: None,
                    channels_total: 0,
                    channels_completed: 0,
                    channels_failed: 0,
                    errors: Vec::new(),
                },
                running: Some(outcome.clone()),
            },
        );
        (outcome, true)
    }

    /// Record how many channels the running sync will visit.
    pub fn set_total(&self, server_id: &str, total: usize) {
        if let Some(t) = self.lock().get_mut(server_id) {
            t.state.channels_total = total;
        }
    }

    pub fn channel_finished(&self, server_id: &str, error: Option<String>) {
        if let Some(t) = self.lock().get_mut(server_id) {
            match error {
                None => t.state.channels_completed += 1,
                Some(e) => {
                    t.state.channels_failed += 1;
                    t.state.errors.push(e);
                }
            }
        }
    }

    fn finish(&self, server_id: &str, report: &SyncReport) {
        let failed = (report.total_channels == 0 && !report.errors.is_empty())
            || (report.total_channels > 0 && report.failed_channels == report.total_channels);
        let now = self.clock.now();

        let mut servers = self.lock();
        let Some(t) = servers.get_mut(server_id) else {
            return;
        };
        t.running = None;
        t.state.status = if failed {
            SyncStatus::Failed
        } else {
            SyncStatus::Completed
        };
        t.state.finished_at = Some(now);
        t.state.channels_total = report.total_channels;
        t.state.channels_completed = report.synced_channels;
        t.state.channels_failed = report.failed_channels;
        t.state.errors.clone_from(&report.errors);

        if failed {
            warn!(server_id = %server_id, errors = report.errors.len(), "Sync failed");
        } else {
            info!(
                server_id = %server_id,
                synced = report.synced_channels,
                failed = report.failed_channels,
                ingested = report.messages_ingested,
                "Sync completed"
            );
        }
    }

    pub fn get(&self, server_id: &str) -> Option<SyncState> {
        self.lock().get(server_id).map(|t| t.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatdigest_core::FixedClock;
    use chrono::TimeZone;
    use std::time::Duration;

    fn tracker() -> Arc<SyncStateTracker> {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        Arc::new(SyncStateTracker::new(Arc::new(FixedClock::new(t0))))
    }

    fn report(total: usize, failed: usize) -> SyncReport {
        SyncReport {
            synced_channels: total - failed,
            failed_channels: failed,
            total_channels: total,
            errors: (0..failed).map(|i| format!("channel {i} failed")).collect(),
            ..SyncReport::default()
        }
    }

    #[tokio::test]
    async fn second_request_joins_running_sync() {
        let tracker = tracker();
        let (first, started) = tracker.join_or_start("s1", || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            report(2, 0)
        });
        assert!(started);
        assert_eq!(tracker.get("s1").unwrap().status, SyncStatus::InProgress);

        let (second, started_again) = tracker.join_or_start("s1", || async { report(9, 9) });
        assert!(!started_again);

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a, b);
        let state = tracker.get("s1").unwrap();
        assert_eq!(state.status, SyncStatus::Completed);
        assert_eq!(state.channels_completed, 2);
        assert!(state.finished_at.is_some());
    }

    #[tokio::test]
    async fn all_channels_failing_marks_failed() {
        let tracker = tracker();
        let (outcome, _) = tracker.join_or_start("s1", || async { report(2, 2) });
        outcome.await;
        let state = tracker.get("s1").unwrap();
        assert_eq!(state.status, SyncStatus::Failed);
        assert_eq!(state.errors.len(), 2);
    }

    #[tokio::test]
    async fn progress_is_visible_while_running() {
        let tracker = tracker();
        let inner = Arc::clone(&tracker);
        let (outcome, _) = tracker.join_or_start("s1", move || async move {
            inner.set_total("s1", 2);
            inner.channel_finished("s1", None);
            inner.channel_finished("s1", Some("denied".into()));
            let state = inner.get("s1").unwrap();
            assert_eq!(
                (state.channels_total, state.channels_completed, state.channels_failed),
                (2, 1, 1)
            );
            report(2, 1)
        });
        outcome.await;

        let state = tracker.get("s1").unwrap();
        assert_eq!(state.status, SyncStatus::Completed);
        assert!(tracker.get("s2").is_none());

        let (_, restarted) = tracker.join_or_start("s1", || async { report(1, 0) });
        assert!(restarted);
    }
}
