#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kasane::config::RetryPolicy;
use kasane::mem_store::MemoryStore;
use kasane::progress::{ShardAction, Subscription};
use kasane::storage::DaemonStorage;
use kasane::{BoxError, DaemonSettings, ProjectionDaemon, Sequence, ShardState, ShardStateTracker, DEFAULT_TENANT};

pub mod fixtures;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn settings() -> DaemonSettings {
    DaemonSettings::builder()
        .batch_size(2)
        .maximum_hopper_size(10)
        .high_water_polling_interval(Duration::from_millis(20))
        .graceful_stop_timeout(Duration::from_secs(1))
        .retry(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        })
        .build()
        .expect("test settings are valid")
}

pub fn daemon(store: &MemoryStore) -> ProjectionDaemon {
    init_tracing();
    ProjectionDaemon::new(DaemonStorage::from_store(store.clone()), settings()).expect("daemon settings are valid")
}

pub fn read_document<T: serde::de::DeserializeOwned>(store: &MemoryStore, doc_type: &str, id: &str) -> Option<T> {
    store
        .document(doc_type, DEFAULT_TENANT, id)
        .filter(|doc| !doc.deleted)
        .map(|doc| serde_json::from_slice(&doc.payload).expect("stored payload is valid json"))
}

/// Polls `check` until it holds or `TIMEOUT` elapses.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Collects every progress update published for `shard` while the subscription lives.
pub fn record_progress(tracker: &ShardStateTracker, shard: &'static str) -> (Subscription, Arc<Mutex<Vec<Sequence>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscription = tracker.subscribe(move |state: &ShardState| -> Result<(), BoxError> {
        if state.shard == shard && state.action == ShardAction::Updated {
            sink.lock().unwrap().push(state.sequence);
        }
        Ok(())
    });
    (subscription, seen)
}
