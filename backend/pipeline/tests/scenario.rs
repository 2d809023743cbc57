use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use chatdigest_core::{
    CacheStatus, ChannelInfo, ChatPlatformReader, FixedClock, Message, MessageStore, RawMessage,
    ReaderError, Summarizer, SummaryStore,
};
use chatdigest_pipeline::{Collaborators, PipelineConfig, SyncOrchestrator, SyncStatus};
use chatdigest_store::{InMemoryStore, SqliteStore};

const SERVER: &str = "s1";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn hours(h: i64) -> chrono::Duration {
    chrono::Duration::hours(h)
}

fn channel(id: &str, name: &str) -> ChannelInfo {
    ChannelInfo {
        channel_id: id.into(),
        server_id: SERVER.into(),
        name: name.into(),
    }
}

fn raw(channel_id: &str, id: &str, author: &str, at: DateTime<Utc>) -> RawMessage {
    RawMessage::from(Message {
        channel_id: channel_id.into(),
        message_id: id.into(),
        author_id: author.into(),
        author_name: author.into(),
        timestamp: at,
        text: format!("message {id}"),
    })
}

/// Chat reader driven by the test.
#[derive(Default)]
struct ScriptedReader {
    channels: Mutex<Vec<ChannelInfo>>,
    messages: Mutex<HashMap<String, Vec<RawMessage>>>,
    denied: Mutex<HashSet<String>>,
    fail_listing: Mutex<bool>,
    fetches: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl ScriptedReader {
    fn add_channel(&self, info: ChannelInfo) {
        self.channels.lock().unwrap().push(info);
    }

    fn post(&self, message: RawMessage, channel_id: &str) {
        self.messages
            .lock()
            .unwrap()
            .entry(channel_id.to_string())
            .or_default()
            .push(message);
    }

    fn deny(&self, channel_id: &str) {
        self.denied.lock().unwrap().insert(channel_id.to_string());
    }

    fn since_for(&self, channel_id: &str) -> Vec<DateTime<Utc>> {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel_id)
            .map(|(_, since)| *since)
            .collect()
    }
}

#[async_trait]
impl ChatPlatformReader for ScriptedReader {
    async fn list_channels(&self, server_id: &str) -> Result<Vec<ChannelInfo>, ReaderError> {
        if *self.fail_listing.lock().unwrap() {
            return Err(ReaderError::Http {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        Ok(self
            .channels
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.server_id == server_id)
            .cloned()
            .collect())
    }

    async fn fetch_new_messages(
        &self,
        channel_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawMessage>, ReaderError> {
        self.fetches
            .lock()
            .unwrap()
            .push((channel_id.to_string(), since));
        if self.denied.lock().unwrap().contains(channel_id) {
            return Err(ReaderError::PermissionDenied(format!(
                "missing access to channel {channel_id}"
            )));
        }
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(channel_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Summarizer that counts calls and can be told to fail per channel.
#[derive(Default)]
struct CountingSummarizer {
    calls: AtomicUsize,
    delay: Duration,
    broken: Mutex<HashSet<String>>,
}

impl CountingSummarizer {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for CountingSummarizer {
    async fn summarize(&self, channel_name: &str, messages: &[Message]) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.broken.lock().unwrap().contains(channel_name) {
            anyhow::bail!("provider unavailable (key sk-live0123456789abcdefgh)");
        }
        Ok(format!(
            "{channel_name}: {} messages (call {call})",
            messages.len()
        ))
    }
}

struct Harness {
    orchestrator: SyncOrchestrator,
    clock: Arc<FixedClock>,
    reader: Arc<ScriptedReader>,
    summarizer: Arc<CountingSummarizer>,
    messages: Arc<dyn MessageStore>,
}

fn harness_with<S>(store: Arc<S>, summarizer: CountingSummarizer, now: DateTime<Utc>) -> Harness
where
    S: MessageStore + SummaryStore + 'static,
{
    let clock = Arc::new(FixedClock::new(now));
    let reader = Arc::new(ScriptedReader::default());
    let summarizer = Arc::new(summarizer);
    let messages: Arc<dyn MessageStore> = store.clone();
    let orchestrator = SyncOrchestrator::new(
        Collaborators {
            messages: Arc::clone(&messages),
            summaries: store,
            reader: reader.clone(),
            summarizer: summarizer.clone(),
            clock: clock.clone(),
        },
        PipelineConfig::default(),
    )
    .unwrap();
    Harness {
        orchestrator,
        clock,
        reader,
        summarizer,
        messages,
    }
}

fn harness(now: DateTime<Utc>) -> Harness {
    harness_with(
        Arc::new(InMemoryStore::new()),
        CountingSummarizer::default(),
        now,
    )
}

async fn seed_general(h: &Harness) {
    h.messages
        .upsert_channel(&channel("c1", "general"))
        .await
        .unwrap();
    h.messages
        .append(
            "c1",
            vec![
                raw("c1", "1", "alice", t0()),
                raw("c1", "2", "bob", t0() + hours(1)),
                raw("c1", "3", "alice", t0() + hours(2)),
            ],
        )
        .await
        .unwrap();
}

async fn run_lifecycle(h: Harness) {
    seed_general(&h).await;
    h.reader.add_channel(channel("c1", "general"));

    let first = h.orchestrator.get_summaries(SERVER).await.unwrap();
    assert_eq!(first.channels.len(), 1);
    let general = first.channel("general").unwrap();
    assert_eq!(general.message_count, 3);
    assert_eq!(general.total_participants, 2);
    assert_eq!(general.last_active, t0() + hours(2));
    assert_eq!(general.cache_status, CacheStatus::Miss);
    assert_eq!(general.summary.as_deref(), Some("general: 3 messages (call 1)"));

    h.clock.advance(chrono::Duration::minutes(1));
    let second = h.orchestrator.get_summaries(SERVER).await.unwrap();
    let cached = second.channel("general").unwrap();
    assert_eq!(cached.cache_status, CacheStatus::Hit);
    assert_eq!(cached.summary, general.summary);
    assert_eq!(cached.generated_at, general.generated_at);

    h.clock.set(t0() + hours(3));
    h.reader.post(raw("c1", "4", "carol", t0() + hours(3)), "c1");
    let synced = h.orchestrator.force_sync(SERVER).await.unwrap();
    let refreshed = synced.channel("general").unwrap();
    assert_eq!(refreshed.cache_status, CacheStatus::Miss);
    assert_eq!(refreshed.message_count, 4);
    assert_eq!(refreshed.summary.as_deref(), Some("general: 4 messages (call 2)"));
    assert_ne!(refreshed.generated_at, general.generated_at);
    let report = synced.sync.as_ref().unwrap();
    assert_eq!(
        (report.synced_channels, report.failed_channels, report.messages_ingested),
        (1, 0, 1)
    );

    let stable = h.orchestrator.get_summaries(SERVER).await.unwrap();
    assert_eq!(stable.channel("general").unwrap().cache_status, CacheStatus::Hit);

    let ack = h.orchestrator.clear_cache(SERVER).await.unwrap();
    assert_eq!(ack.status, "success");
    assert_eq!(ack.cleared, 1);

    h.clock.advance(chrono::Duration::minutes(1));
    let after_clear = h.orchestrator.get_summaries(SERVER).await.unwrap();
    let regenerated = after_clear.channel("general").unwrap();
    assert_eq!(regenerated.cache_status, CacheStatus::Miss);
    assert_eq!(regenerated.message_count, 4);
    assert_ne!(regenerated.generated_at, refreshed.generated_at);
    assert_eq!(h.summarizer.calls(), 3);
}

#[tokio::test]
async fn lifecycle_with_memory_store() {
    run_lifecycle(harness(t0() + hours(2))).await;
}

#[tokio::test]
async fn lifecycle_with_sqlite_store() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    run_lifecycle(harness_with(store, CountingSummarizer::default(), t0() + hours(2))).await;
}

#[tokio::test]
async fn channels_without_recent_messages_are_excluded() {
    let h = harness(t0());
    for info in [channel("c1", "general"), channel("c2", "archive"), channel("c3", "empty")] {
        h.messages.upsert_channel(&info).await.unwrap();
    }
    h.messages
        .append("c1", vec![raw("c1", "1", "a", t0() - hours(1))])
        .await
        .unwrap();
    h.messages
        .append("c2", vec![raw("c2", "1", "a", t0() - chrono::Duration::days(8))])
        .await
        .unwrap();

    let response = h.orchestrator.get_summaries(SERVER).await.unwrap();
    assert_eq!(response.total_channels_analyzed, 3);
    assert_eq!(response.active_channels, 1);
    assert!(response.channel("archive").is_none());
    assert!(response.channel("empty").is_none());
    assert_eq!(h.summarizer.calls(), 1);
}

#[tokio::test]
async fn channels_are_ordered_by_recent_activity() {
    let h = harness(t0());
    for (id, name, offset) in [("c1", "alpha", 5), ("c2", "beta", 1), ("c3", "gamma", 3)] {
        h.messages.upsert_channel(&channel(id, name)).await.unwrap();
        h.messages
            .append(id, vec![raw(id, "1", "a", t0() - hours(offset))])
            .await
            .unwrap();
    }

    let response = h.orchestrator.get_summaries(SERVER).await.unwrap();
    let names: Vec<&str> = response
        .channels
        .iter()
        .map(|c| c.channel_name.as_str())
        .collect();
    assert_eq!(names, vec!["beta", "gamma", "alpha"]);

    let json = serde_json::to_value(&response).unwrap();
    let keys: Vec<&String> = json["channels"].as_object().unwrap().keys().collect();
    assert_eq!(keys.len(), 3);
    assert_eq!(json["channels"]["beta"]["cache_status"], "miss");
    assert_eq!(json["cache_metrics"]["misses"], 3);
}

#[tokio::test]
async fn denied_channel_does_not_block_others() {
    let h = harness(t0());
    h.reader.add_channel(channel("c1", "general"));
    h.reader.add_channel(channel("c2", "secret"));
    h.reader.post(raw("c1", "1", "a", t0() - hours(1)), "c1");
    h.reader.post(raw("c2", "1", "a", t0() - hours(1)), "c2");
    h.reader.deny("c2");

    let response = h.orchestrator.force_sync(SERVER).await.unwrap();
    let report = response.sync.as_ref().unwrap();
    assert_eq!(report.total_channels, 2);
    assert_eq!(report.synced_channels, 1);
    assert_eq!(report.failed_channels, 1);
    assert!(report.errors.iter().any(|e| e.contains("c2")));
    assert!(response.channel("general").is_some());
    assert!(response.channel("secret").is_none());

    let state = h.orchestrator.sync_state(SERVER).unwrap();
    assert_eq!(state.status, SyncStatus::Completed);
    assert_eq!((state.channels_completed, state.channels_failed), (1, 1));
}

#[tokio::test]
async fn listing_failure_falls_back_to_known_channels() {
    let h = harness(t0());
    seed_general(&h).await;
    h.clock.set(t0() + hours(4));
    h.reader.post(raw("c1", "9", "dave", t0() + hours(4)), "c1");
    *h.reader.fail_listing.lock().unwrap() = true;

    let response = h.orchestrator.force_sync(SERVER).await.unwrap();
    let report = response.sync.as_ref().unwrap();
    assert_eq!(report.synced_channels, 1);
    assert_eq!(report.messages_ingested, 1);
    assert!(report.errors[0].starts_with("channel listing failed"));
    assert_eq!(response.channel("general").unwrap().message_count, 4);
}

#[tokio::test]
async fn fetch_resumes_from_latest_known_message() {
    let h = harness(t0() + hours(2));
    seed_general(&h).await;
    h.reader.add_channel(channel("c1", "general"));
    h.reader.add_channel(channel("c2", "fresh"));

    h.orchestrator.force_sync(SERVER).await.unwrap();
    assert_eq!(h.reader.since_for("c1"), vec![t0() + hours(2)]);
    assert_eq!(
        h.reader.since_for("c2"),
        vec![t0() + hours(2) - chrono::Duration::days(7)]
    );
}

#[tokio::test]
async fn generation_failure_is_isolated_to_its_channel() {
    let h = harness(t0());
    for (id, name) in [("c1", "general"), ("c2", "broken")] {
        h.messages.upsert_channel(&channel(id, name)).await.unwrap();
        h.messages
            .append(id, vec![raw(id, "1", "a", t0() - hours(1))])
            .await
            .unwrap();
    }
    h.summarizer.broken.lock().unwrap().insert("broken".into());

    let response = h.orchestrator.get_summaries(SERVER).await.unwrap();
    let broken = response.channel("broken").unwrap();
    assert_eq!(broken.cache_status, CacheStatus::Error);
    assert!(broken.summary.is_none());
    let error = broken.error.as_deref().unwrap();
    assert!(error.contains("provider unavailable"));
    assert!(!error.contains("sk-live0123456789"));
    assert_eq!(response.channel("general").unwrap().cache_status, CacheStatus::Miss);
    assert_eq!(response.cache_metrics.failures, 1);

    h.summarizer.broken.lock().unwrap().clear();
    let healed = h.orchestrator.get_summaries(SERVER).await.unwrap();
    assert_eq!(healed.channel("broken").unwrap().cache_status, CacheStatus::Miss);
    assert_eq!(healed.channel("general").unwrap().cache_status, CacheStatus::Hit);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_summarize_each_channel_once() {
    let h = harness_with(
        Arc::new(InMemoryStore::new()),
        CountingSummarizer::with_delay(Duration::from_millis(100)),
        t0(),
    );
    for (id, name) in [("c1", "general"), ("c2", "random")] {
        h.messages.upsert_channel(&channel(id, name)).await.unwrap();
        h.messages
            .append(id, vec![raw(id, "1", "a", t0() - hours(1))])
            .await
            .unwrap();
    }

    let requests = (0..8).map(|_| {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.get_summaries(SERVER).await })
    });
    let responses = futures::future::join_all(requests).await;

    assert_eq!(h.summarizer.calls(), 2);
    let summaries: HashSet<String> = responses
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .flat_map(|r| r.channels.into_iter().filter_map(|c| c.summary))
        .collect();
    assert_eq!(summaries.len(), 2);
}

#[tokio::test]
async fn clear_only_touches_the_named_server() {
    let h = harness(t0());
    let other = ChannelInfo {
        channel_id: "x1".into(),
        server_id: "s2".into(),
        name: "elsewhere".into(),
    };
    seed_general(&h).await;
    h.messages.upsert_channel(&other).await.unwrap();
    h.messages
        .append("x1", vec![raw("x1", "1", "a", t0() - hours(1))])
        .await
        .unwrap();
    h.clock.set(t0() + hours(2));

    h.orchestrator.get_summaries(SERVER).await.unwrap();
    h.orchestrator.get_summaries("s2").await.unwrap();
    h.orchestrator.clear_cache(SERVER).await.unwrap();

    let other_server = h.orchestrator.get_summaries("s2").await.unwrap();
    assert_eq!(
        other_server.channel("elsewhere").unwrap().cache_status,
        CacheStatus::Hit
    );
    let stored = h
        .messages
        .query("c1", t0() - hours(1), t0() + hours(3))
        .await
        .unwrap();
    assert_eq!(stored.len(), 3);
}
