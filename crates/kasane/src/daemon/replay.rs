use crate::aggregation::ExecutionMode;
use crate::cancel::CancelToken;
use crate::daemon::error::{DaemonError, Result};
use crate::daemon::shard::ShardName;
use crate::dispatch::ApplyContext;
use crate::event::{Sequence, DEFAULT_TENANT};
use crate::projection::Projection;
use crate::storage::DaemonStorage;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Replays a shard from zero up to `high_water` outside the page-by-page pipeline.
///
/// Must leave the shard's progress at `high_water` when it returns `Ok`.
#[async_trait]
pub trait ReplayExecutor: Send + Sync + 'static {
    async fn replay(
        &self,
        projection: Arc<dyn Projection>,
        shard: &ShardName,
        storage: &DaemonStorage,
        high_water: Sequence,
        cancel: &CancelToken,
    ) -> Result<()>;
}

/// Replays in large pages, one batch per page, without the hopper or stage hand-offs.
#[derive(Debug, Clone, Copy)]
pub struct BulkReplayExecutor {
    page_size: Sequence,
}

impl BulkReplayExecutor {
    pub fn new(page_size: Sequence) -> Self {
        Self {
            page_size: page_size.max(1),
        }
    }
}

impl Default for BulkReplayExecutor {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl ReplayExecutor for BulkReplayExecutor {
    async fn replay(
        &self,
        projection: Arc<dyn Projection>,
        shard: &ShardName,
        storage: &DaemonStorage,
        high_water: Sequence,
        cancel: &CancelToken,
    ) -> Result<()> {
        info!(%shard, high_water, page_size = self.page_size, "bulk replay started");
        let filter = projection.event_filter();
        let ctx = ApplyContext::new(DEFAULT_TENANT, storage.documents.clone(), cancel.clone());
        let mut floor = 0;
        while floor < high_water {
            if cancel.is_cancelled() {
                return Err(DaemonError::Cancelled(format!("replay of {shard}")));
            }
            let ceiling = (floor + self.page_size).min(high_water);
            let events = storage.events.load_events(&filter, floor, ceiling).await?;
            let sliced = projection.clone().slice(events, storage.documents.clone()).await?;
            let mut batch = storage.batches.start_batch().await?;
            let stats = sliced.apply(batch.as_mut(), &ctx, ExecutionMode::Rebuild).await?;
            batch.mark_progress(shard.identity(), floor, ceiling);
            batch.execute().await?;
            debug!(%shard, floor, ceiling, slices = stats.slices, "replayed page");
            floor = ceiling;
        }
        info!(%shard, high_water, "bulk replay finished");
        Ok(())
    }
}
