use crate::aggregation::{ExecutionMode, Result};
use crate::cancel::CancelToken;
use crate::dispatch::{ApplyContext, InvalidProjection};
use crate::event::{Event, DEFAULT_TENANT};
use crate::projection::{ApplyStats, Projection, ProjectionLifecycle};
use crate::storage::{DocumentLoader, ProjectionBatch};
use std::sync::Arc;
use tracing::debug;

/// Projections applied in the same write as the events they read.
#[derive(Default)]
pub struct InlineProjections {
    projections: Vec<Arc<dyn Projection>>,
}

impl InlineProjections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, projection: impl Projection) -> std::result::Result<&mut Self, InvalidProjection> {
        projection.assert_validity()?;
        if projection.lifecycle() != ProjectionLifecycle::Inline {
            debug!(projection = %projection.name(), lifecycle = ?projection.lifecycle(), "applying projection inline");
        }
        self.projections.push(Arc::new(projection));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.projections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projections.is_empty()
    }

    /// Folds `events` through every projection, queueing the writes in `batch`.
    pub async fn apply(
        &self,
        events: &[Event],
        batch: &mut dyn ProjectionBatch,
        session: Arc<dyn DocumentLoader>,
    ) -> Result<ApplyStats> {
        let ctx = ApplyContext::new(DEFAULT_TENANT, session.clone(), CancelToken::new());
        let mut total = ApplyStats::default();
        for projection in &self.projections {
            let filter = projection.event_filter();
            let relevant: Vec<Event> = events.iter().filter(|e| filter.matches(e)).cloned().collect();
            if relevant.is_empty() {
                continue;
            }
            let sliced = projection.clone().slice(relevant, session.clone()).await?;
            let stats = sliced.apply(batch, &ctx, ExecutionMode::Continuous).await?;
            debug!(projection = %projection.name(), slices = stats.slices, "applied inline projection");
            total.slices += stats.slices;
            total.operations += stats.operations;
            total.side_effects += stats.side_effects;
        }
        Ok(total)
    }
}

impl std::fmt::Debug for InlineProjections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.projections.iter().map(|p| p.name()).collect();
        f.debug_struct("InlineProjections").field("projections", &names).finish()
    }
}
