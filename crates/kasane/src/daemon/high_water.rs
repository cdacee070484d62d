use crate::cancel::CancelToken;
use crate::event::Sequence;
use crate::progress::ShardStateTracker;
use crate::storage::HighWaterDetector;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Polls the log's high-water mark and publishes every advance through the tracker.
pub struct HighWaterAgent {
    cancel: CancelToken,
    task: JoinHandle<()>,
}

impl HighWaterAgent {
    pub fn start(detector: Arc<dyn HighWaterDetector>, tracker: ShardStateTracker, interval: Duration) -> Self {
        let cancel = CancelToken::new();
        let task = tokio::spawn(poll(detector, tracker, interval, cancel.clone()));
        Self { cancel, task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

impl std::fmt::Debug for HighWaterAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HighWaterAgent")
            .field("running", &self.is_running())
            .finish()
    }
}

async fn poll(detector: Arc<dyn HighWaterDetector>, tracker: ShardStateTracker, interval: Duration, cancel: CancelToken) {
    let mut last: Sequence = tracker.high_water_mark();
    loop {
        match detector.detect().await {
            Ok(stats) if stats.high_water_mark > last => {
                debug!(
                    high_water_mark = stats.high_water_mark,
                    highest_sequence = stats.highest_sequence,
                    "high water mark advanced"
                );
                last = stats.high_water_mark;
                tracker.mark_high_water(last);
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "high water detection failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
