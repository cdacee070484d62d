//! Broadcast hub for shard state transitions, with waits on top.

use crate::dispatch::BoxError;
use crate::event::Sequence;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Pseudo shard name under which the high-water mark is published.
pub const HIGH_WATER_MARK: &str = "HighWaterMark";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardAction {
    Updated,
    Started,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardState {
    pub shard: String,
    pub sequence: Sequence,
    pub action: ShardAction,
    /// Rendered failure that paused or stopped the shard.
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ShardState {
    pub fn new(shard: impl Into<String>, sequence: Sequence) -> Self {
        Self {
            shard: shard.into(),
            sequence,
            action: ShardAction::Updated,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_action(mut self, action: ShardAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn high_water(sequence: Sequence) -> Self {
        Self::new(HIGH_WATER_MARK, sequence)
    }
}

pub trait ShardObserver: Send + Sync {
    fn on_state(&self, state: &ShardState) -> Result<(), BoxError>;
}

impl<F> ShardObserver for F
where
    F: Fn(&ShardState) -> Result<(), BoxError> + Send + Sync,
{
    fn on_state(&self, state: &ShardState) -> Result<(), BoxError> {
        self(state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFailure {
    pub shard: String,
    pub error: String,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("timed out after {timeout:?} waiting for {waiting_for}{}", render_failures(.failures))]
pub struct ProgressTimeout {
    pub waiting_for: String,
    pub timeout: Duration,
    /// Failures captured from shards while waiting.
    pub failures: Vec<ShardFailure>,
}

fn render_failures(failures: &[ShardFailure]) -> String {
    if failures.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = failures.iter().map(|f| format!("{}: {}", f.shard, f.error)).collect();
    format!(" ({})", rendered.join("; "))
}

#[derive(Default)]
struct TrackerInner {
    observers: Mutex<Vec<(u64, Arc<dyn ShardObserver>)>>,
    next_id: AtomicU64,
    states: Mutex<HashMap<String, ShardState>>,
    failures: Mutex<HashMap<String, String>>,
    high_water_mark: AtomicU64,
}

/// Publishes every shard state change to its observers and remembers the last state per shard.
#[derive(Clone, Default)]
pub struct ShardStateTracker {
    inner: Arc<TrackerInner>,
}

impl ShardStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `observer` until the returned subscription is dropped.
    #[must_use = "dropping the subscription unsubscribes the observer"]
    pub fn subscribe(&self, observer: impl ShardObserver + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.lock().push((id, Arc::new(observer)));
        Subscription {
            id,
            tracker: Arc::downgrade(&self.inner),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().len()
    }

    /// Records `state` and delivers it to every observer in turn.
    ///
    /// An observer that fails or panics is logged and skipped; the others still see the state.
    pub fn publish(&self, state: ShardState) {
        if state.shard == HIGH_WATER_MARK {
            self.inner.high_water_mark.fetch_max(state.sequence, Ordering::AcqRel);
        }
        match (&state.action, &state.error) {
            (ShardAction::Paused | ShardAction::Stopped, Some(error)) => {
                self.inner.failures.lock().insert(state.shard.clone(), error.clone());
            }
            (ShardAction::Started, _) => {
                self.inner.failures.lock().remove(&state.shard);
            }
            _ => {}
        }
        self.inner.states.lock().insert(state.shard.clone(), state.clone());

        let observers: Vec<Arc<dyn ShardObserver>> =
            self.inner.observers.lock().iter().map(|(_, o)| o.clone()).collect();
        for observer in observers {
            match catch_unwind(AssertUnwindSafe(|| observer.on_state(&state))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(shard = %state.shard, error = %err, "shard observer failed"),
                Err(_) => warn!(shard = %state.shard, "shard observer panicked"),
            }
        }
    }

    pub fn mark_high_water(&self, sequence: Sequence) {
        self.publish(ShardState::high_water(sequence));
    }

    pub fn high_water_mark(&self) -> Sequence {
        self.inner.high_water_mark.load(Ordering::Acquire)
    }

    pub fn last_state(&self, shard: &str) -> Option<ShardState> {
        self.inner.states.lock().get(shard).cloned()
    }

    pub fn failures(&self) -> Vec<ShardFailure> {
        let mut failures: Vec<ShardFailure> = self
            .inner
            .failures
            .lock()
            .iter()
            .map(|(shard, error)| ShardFailure {
                shard: shard.clone(),
                error: error.clone(),
            })
            .collect();
        failures.sort_by(|a, b| a.shard.cmp(&b.shard));
        failures
    }

    /// Waits until `shard` has reached at least `sequence`.
    pub async fn wait_for_shard_state(
        &self,
        shard: &str,
        sequence: Sequence,
        timeout: Duration,
    ) -> Result<ShardState, ProgressTimeout> {
        let target = shard.to_string();
        let waiter = self.waiter(move |state| state.shard == target && state.sequence >= sequence);
        if let Some(state) = self.last_state(shard).filter(|state| state.sequence >= sequence) {
            return Ok(state);
        }
        self.await_waiter(waiter, format!("{shard} to reach {sequence}"), timeout).await
    }

    /// Waits for the next published state matching `predicate`.
    pub async fn wait_for<F>(&self, predicate: F, timeout: Duration) -> Result<ShardState, ProgressTimeout>
    where
        F: Fn(&ShardState) -> bool + Send + Sync + 'static,
    {
        let waiter = self.waiter(predicate);
        self.await_waiter(waiter, "a matching shard state".to_string(), timeout).await
    }

    fn waiter<F>(&self, predicate: F) -> (Subscription, oneshot::Receiver<ShardState>)
    where
        F: Fn(&ShardState) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let subscription = self.subscribe(move |state: &ShardState| -> Result<(), BoxError> {
            if predicate(state) {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(state.clone());
                }
            }
            Ok(())
        });
        (subscription, rx)
    }

    async fn await_waiter(
        &self,
        (subscription, rx): (Subscription, oneshot::Receiver<ShardState>),
        waiting_for: String,
        timeout: Duration,
    ) -> Result<ShardState, ProgressTimeout> {
        let outcome = tokio::time::timeout(timeout, rx).await;
        drop(subscription);
        match outcome {
            Ok(Ok(state)) => Ok(state),
            _ => {
                debug!(%waiting_for, ?timeout, "progress wait timed out");
                Err(ProgressTimeout {
                    waiting_for,
                    timeout,
                    failures: self.failures(),
                })
            }
        }
    }
}

impl fmt::Debug for ShardStateTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardStateTracker")
            .field("observers", &self.observer_count())
            .field("high_water_mark", &self.high_water_mark())
            .finish()
    }
}

/// Unsubscribes its observer when dropped.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    tracker: Weak<TrackerInner>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.tracker.upgrade() {
            inner.observers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<ShardState>>>, impl ShardObserver) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer = move |state: &ShardState| -> Result<(), BoxError> {
            sink.lock().push(state.clone());
            Ok(())
        };
        (seen, observer)
    }

    #[test]
    fn test_publish_reaches_every_observer_and_records_state() {
        let tracker = ShardStateTracker::new();
        let (first, a) = recorder();
        let (second, b) = recorder();
        let _a = tracker.subscribe(a);
        let _b = tracker.subscribe(b);

        tracker.publish(ShardState::new("Trips:All", 7));

        assert_eq!(first.lock().len(), 1);
        assert_eq!(second.lock().len(), 1);
        assert_eq!(tracker.last_state("Trips:All").map(|s| s.sequence), Some(7));
    }

    #[test]
    fn test_failing_and_panicking_observers_do_not_stop_the_broadcast() {
        let tracker = ShardStateTracker::new();
        let _failing = tracker.subscribe(|_: &ShardState| -> Result<(), BoxError> { Err("nope".into()) });
        let _panicking = tracker.subscribe(|_: &ShardState| -> Result<(), BoxError> { panic!("observer blew up") });
        let (seen, observer) = recorder();
        let _ok = tracker.subscribe(observer);

        tracker.publish(ShardState::new("Trips:All", 1));

        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_dropping_the_subscription_unsubscribes() {
        let tracker = ShardStateTracker::new();
        let (seen, observer) = recorder();
        let subscription = tracker.subscribe(observer);
        assert_eq!(tracker.observer_count(), 1);

        drop(subscription);
        tracker.publish(ShardState::new("Trips:All", 1));

        assert_eq!(tracker.observer_count(), 0);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_high_water_mark_only_moves_forward() {
        let tracker = ShardStateTracker::new();
        tracker.mark_high_water(10);
        tracker.mark_high_water(4);
        assert_eq!(tracker.high_water_mark(), 10);
    }

    #[tokio::test]
    async fn test_wait_for_shard_state_returns_immediately_when_already_there() {
        let tracker = ShardStateTracker::new();
        tracker.publish(ShardState::new("Trips:All", 12));

        let state = tracker
            .wait_for_shard_state("Trips:All", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(state.sequence, 12);
    }

    #[tokio::test]
    async fn test_wait_for_shard_state_wakes_on_publish() {
        let tracker = ShardStateTracker::new();
        let publisher = tracker.clone();
        tokio::spawn(async move {
            for sequence in [3, 6, 9] {
                tokio::time::sleep(Duration::from_millis(5)).await;
                publisher.publish(ShardState::new("Trips:All", sequence));
            }
        });

        let state = tracker
            .wait_for_shard_state("Trips:All", 5, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(state.sequence >= 5);
        assert_eq!(tracker.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_reports_captured_failures() {
        let tracker = ShardStateTracker::new();
        tracker.publish(
            ShardState::new("Trips:All", 4)
                .with_action(ShardAction::Paused)
                .with_error("disk full"),
        );

        let err = tracker
            .wait_for_shard_state("Trips:All", 5, Duration::from_millis(20))
            .await
            .unwrap_err();

        assert_eq!(
            err.failures,
            vec![ShardFailure {
                shard: "Trips:All".to_string(),
                error: "disk full".to_string()
            }]
        );
        assert!(err.to_string().contains("Trips:All: disk full"));
    }

    #[tokio::test]
    async fn test_wait_for_predicate() {
        let tracker = ShardStateTracker::new();
        let publisher = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            publisher.publish(ShardState::new("Trips:All", 1).with_action(ShardAction::Stopped));
        });

        let state = tracker
            .wait_for(|s| s.action == ShardAction::Stopped, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(state.shard, "Trips:All");
    }
}
