use crate::aggregation::{ExecutionMode, Result};
use crate::daemon::{ReplayExecutor, ShardName};
use crate::dispatch::{ApplyContext, InvalidProjection};
use crate::event::Event;
use crate::storage::{DocumentLoader, EventFilter, ProjectionBatch};
use async_trait::async_trait;
use std::sync::Arc;

/// When a projection is applied relative to the events it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProjectionLifecycle {
    /// In the same transaction as the append.
    Inline,
    /// In the background by the projection daemon.
    #[default]
    Async,
    /// Only on demand, never stored.
    Live,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub slices: usize,
    pub operations: usize,
    pub side_effects: usize,
}

/// A range of events already sliced by one projection, ready to be folded.
#[async_trait]
pub trait SlicedRange: Send {
    fn slice_count(&self) -> usize;

    /// Folds every slice and queues the resulting writes in `batch`.
    async fn apply(
        self: Box<Self>,
        batch: &mut dyn ProjectionBatch,
        ctx: &ApplyContext,
        mode: ExecutionMode,
    ) -> Result<ApplyStats>;
}

/// What the daemon and the inline path need from a projection, whatever it folds into.
#[async_trait]
pub trait Projection: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn version(&self) -> u32 {
        1
    }

    fn lifecycle(&self) -> ProjectionLifecycle {
        ProjectionLifecycle::Async
    }

    /// Document type the projection writes; torn down on rebuild.
    fn doc_type(&self) -> &str;

    fn event_filter(&self) -> EventFilter;

    fn shards(&self) -> Vec<ShardName> {
        vec![ShardName::all(self.name(), self.version())]
    }

    fn assert_validity(&self) -> std::result::Result<(), InvalidProjection>;

    /// Optimised executor for rebuilds from sequence zero.
    fn replay_executor(&self) -> Option<Arc<dyn ReplayExecutor>> {
        None
    }

    async fn slice(self: Arc<Self>, events: Vec<Event>, session: Arc<dyn DocumentLoader>) -> Result<Box<dyn SlicedRange>>;
}
