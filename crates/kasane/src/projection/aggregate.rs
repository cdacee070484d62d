use crate::aggregation::{
    forward_side_effects, AggregationRunner, ExecutionMode, Result, SnapshotAction, VersionSource,
};
use crate::daemon::ReplayExecutor;
use crate::dispatch::{AggregateDispatcher, ApplyContext, InvalidProjection};
use crate::event::{Archived, Event, EventType, Version};
use crate::projection::adapter::{ApplyStats, Projection, ProjectionLifecycle, SlicedRange};
use crate::serde::Serde;
use crate::slicing::{EventSlicer, Identity, MultiStreamSlicer, SingleStreamSlicer, SliceGroup};
use crate::storage::{DocumentKey, DocumentLoader, DocumentOperation, EventFilter, ProjectionBatch, StoredDocument};
use async_trait::async_trait;
use chrono::Utc;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A projection that folds events into one document of type `A` per identity `I`.
pub struct AggregateProjection<A, I: Identity> {
    name: String,
    version: u32,
    lifecycle: ProjectionLifecycle,
    doc_type: String,
    soft_deletes: bool,
    include_archived: bool,
    runner: AggregationRunner<A, I>,
    slicer: Arc<dyn EventSlicer<A, I>>,
    codec: Arc<dyn Serde<A>>,
    replay: Option<Arc<dyn ReplayExecutor>>,
}

impl<A, I> AggregateProjection<A, I>
where
    A: Send + Sync + 'static,
    I: Identity,
{
    pub fn new(
        dispatcher: AggregateDispatcher<A>,
        codec: impl Serde<A> + 'static,
        slicer: impl EventSlicer<A, I> + 'static,
    ) -> Self {
        Self {
            name: dispatcher.projection_name().to_string(),
            version: 1,
            lifecycle: ProjectionLifecycle::default(),
            doc_type: dispatcher.aggregate_name().to_string(),
            soft_deletes: false,
            include_archived: false,
            runner: AggregationRunner::new(Arc::new(dispatcher)),
            slicer: Arc::new(slicer),
            codec: Arc::new(codec),
            replay: None,
        }
    }

    /// One document per stream, versioned by stream version.
    pub fn single_stream(dispatcher: AggregateDispatcher<A>, codec: impl Serde<A> + 'static) -> Self {
        Self::new(dispatcher, codec, SingleStreamSlicer::new())
    }

    /// Documents built from many streams, versioned by global sequence.
    pub fn multi_stream(
        dispatcher: AggregateDispatcher<A>,
        codec: impl Serde<A> + 'static,
        slicer: MultiStreamSlicer<A, I>,
    ) -> Self {
        let mut projection = Self::new(dispatcher, codec, slicer);
        projection.runner.version_source(VersionSource::Sequence);
        projection
    }

    pub fn set_version(&mut self, version: u32) -> &mut Self {
        self.version = version.max(1);
        self
    }

    pub fn set_lifecycle(&mut self, lifecycle: ProjectionLifecycle) -> &mut Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn set_doc_type(&mut self, doc_type: impl Into<String>) -> &mut Self {
        self.doc_type = doc_type.into();
        self
    }

    /// Deletes mark documents as deleted instead of removing them.
    pub fn soft_deletes(&mut self, soft: bool) -> &mut Self {
        self.soft_deletes = soft;
        self
    }

    pub fn include_archived(&mut self, include: bool) -> &mut Self {
        self.include_archived = include;
        self
    }

    pub fn replay_with(&mut self, executor: impl ReplayExecutor + 'static) -> &mut Self {
        self.replay = Some(Arc::new(executor));
        self
    }

    pub fn runner(&self) -> &AggregationRunner<A, I> {
        &self.runner
    }

    pub fn runner_mut(&mut self) -> &mut AggregationRunner<A, I> {
        &mut self.runner
    }

    /// Builds the current state of `id` from `events` without touching storage.
    pub async fn aggregate(&self, id: &I, events: &[Event], ctx: &ApplyContext) -> Result<Option<A>> {
        self.runner.fold_events(id, None, events, ctx).await
    }

    fn key(&self, tenant_id: &str, id: &I) -> DocumentKey {
        DocumentKey {
            doc_type: self.doc_type.clone(),
            tenant_id: tenant_id.to_string(),
            id: id.document_id(),
        }
    }

    async fn load_snapshots(&self, group: &mut SliceGroup<A, I>, session: &dyn DocumentLoader) -> Result<()> {
        let ids: Vec<String> = group.ids().map(Identity::document_id).collect();
        if ids.is_empty() {
            return Ok(());
        }
        let mut documents: HashMap<String, StoredDocument> = session
            .load_documents(&self.doc_type, group.tenant_id(), &ids)
            .await?
            .into_iter()
            .map(|document| (document.id.clone(), document))
            .collect();
        for slice in group.slices_mut() {
            if let Some(document) = documents.remove(&slice.id().document_id()) {
                slice.snapshot = Some(self.codec.deserialize(&document.payload)?);
                slice.snapshot_deleted = document.deleted;
            }
        }
        Ok(())
    }

    fn operations(&self, key: DocumentKey, action: SnapshotAction<A>, version: Version) -> Result<Vec<DocumentOperation>> {
        let upsert = |snapshot: &A, key: DocumentKey| -> Result<DocumentOperation> {
            Ok(DocumentOperation::Upsert(StoredDocument {
                doc_type: key.doc_type,
                tenant_id: key.tenant_id,
                id: key.id,
                payload: self.codec.serialize(snapshot)?,
                version,
                deleted: false,
                last_modified: Utc::now(),
            }))
        };
        let operations = match action {
            SnapshotAction::Nothing => Vec::new(),
            SnapshotAction::Store(snapshot) | SnapshotAction::UnDeleteAndStore(snapshot) => vec![upsert(&snapshot, key)?],
            SnapshotAction::Delete if self.soft_deletes => vec![DocumentOperation::SoftDelete(key)],
            SnapshotAction::Delete | SnapshotAction::HardDelete => vec![DocumentOperation::Remove(key)],
            SnapshotAction::StoreThenSoftDelete(snapshot) => {
                vec![upsert(&snapshot, key.clone())?, DocumentOperation::SoftDelete(key)]
            }
        };
        Ok(operations)
    }
}

#[async_trait]
impl<A, I> Projection for AggregateProjection<A, I>
where
    A: Send + Sync + 'static,
    I: Identity,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn lifecycle(&self) -> ProjectionLifecycle {
        self.lifecycle
    }

    fn doc_type(&self) -> &str {
        &self.doc_type
    }

    fn event_filter(&self) -> EventFilter {
        let handled = self.runner.dispatcher().handled_event_types();
        let filter = match (handled, self.slicer.event_types()) {
            (Some(handled), Some(sliced)) => EventFilter::of_types(
                handled
                    .iter()
                    .map(EventType::id)
                    .chain(sliced)
                    .chain(self.runner.marker_types())
                    .chain([TypeId::of::<Archived>()]),
            ),
            _ => EventFilter::all(),
        };
        filter.include_archived(self.include_archived)
    }

    fn assert_validity(&self) -> std::result::Result<(), InvalidProjection> {
        self.runner.dispatcher().assert_validity()
    }

    fn replay_executor(&self) -> Option<Arc<dyn ReplayExecutor>> {
        self.replay.clone()
    }

    async fn slice(self: Arc<Self>, events: Vec<Event>, session: Arc<dyn DocumentLoader>) -> Result<Box<dyn SlicedRange>> {
        let groups = self.slicer.slice(events, session).await?;
        Ok(Box::new(AggregateRange {
            projection: self,
            groups,
        }))
    }
}

impl<A, I: Identity> std::fmt::Debug for AggregateProjection<A, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateProjection")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("lifecycle", &self.lifecycle)
            .field("doc_type", &self.doc_type)
            .finish_non_exhaustive()
    }
}

struct AggregateRange<A, I: Identity> {
    projection: Arc<AggregateProjection<A, I>>,
    groups: Vec<SliceGroup<A, I>>,
}

#[async_trait]
impl<A, I> SlicedRange for AggregateRange<A, I>
where
    A: Send + Sync + 'static,
    I: Identity,
{
    fn slice_count(&self) -> usize {
        self.groups.iter().map(SliceGroup::len).sum()
    }

    async fn apply(
        self: Box<Self>,
        batch: &mut dyn ProjectionBatch,
        ctx: &ApplyContext,
        mode: ExecutionMode,
    ) -> Result<ApplyStats> {
        let AggregateRange { projection, groups } = *self;
        let runner = &projection.runner;
        let mut stats = ApplyStats::default();
        for mut group in groups {
            projection.load_snapshots(&mut group, ctx.session.as_ref()).await?;
            for slice in group.slices_mut() {
                runner.apply_slice(slice, ctx, mode).await?;
                stats.side_effects += forward_side_effects(slice, batch);
                let version = slice
                    .last_applied()
                    .or_else(|| slice.last_event())
                    .map_or(0, |event| runner.version_of(event));
                let key = projection.key(slice.tenant_id(), slice.id());
                for operation in projection.operations(key, SnapshotAction::take_from(slice), version)? {
                    batch.queue(operation);
                    stats.operations += 1;
                }
                stats.slices += 1;
            }
        }
        debug!(
            projection = %projection.name,
            slices = stats.slices,
            operations = stats.operations,
            "applied sliced range"
        );
        Ok(stats)
    }
}
