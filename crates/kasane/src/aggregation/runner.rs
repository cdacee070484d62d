use crate::aggregation::action::ActionType;
use crate::aggregation::error::{AggregationError, ProjectionErrors, Result};
use crate::aggregation::side_effects::SideEffects;
use crate::dispatch::{AggregateDispatcher, ApplyContext};
use crate::event::{Archived, Event, EventData, Version, DEFAULT_TENANT};
use crate::slicing::{EventSlice, Identity};
use std::any::TypeId;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// How a shard is running, which decides whether side effects fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// Tailing the live log.
    Continuous,
    /// Replaying from zero after the previous output was torn down.
    Rebuild,
    /// Replaying up to a known high-water mark, then stopping.
    CatchUp,
}

impl ExecutionMode {
    pub fn side_effects_enabled(&self) -> bool {
        matches!(self, Self::Continuous)
    }
}

/// Which number is stamped into a snapshot's version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionSource {
    /// The stream version of the last applied event. Right for one aggregate per stream.
    #[default]
    StreamVersion,
    /// The global sequence of the last applied event, for aggregates built from many streams.
    Sequence,
}

type IdentitySetter<A, I> = Arc<dyn Fn(&mut A, &I) + Send + Sync>;
type VersionSetter<A> = Arc<dyn Fn(&mut A, Version) + Send + Sync>;

/// Folds slices through an [`AggregateDispatcher`] into snapshot actions.
pub struct AggregationRunner<A, I> {
    dispatcher: Arc<AggregateDispatcher<A>>,
    errors: ProjectionErrors,
    identity: Option<IdentitySetter<A, I>>,
    version: Option<VersionSetter<A>>,
    version_source: VersionSource,
    delete_types: HashSet<TypeId>,
    hard_delete_types: HashSet<TypeId>,
    undelete_types: HashSet<TypeId>,
    soft_delete_after_store_types: HashSet<TypeId>,
    side_effects: Option<Arc<dyn SideEffects<A, I>>>,
}

impl<A, I> AggregationRunner<A, I>
where
    A: Send + Sync + 'static,
    I: Identity,
{
    pub fn new(dispatcher: Arc<AggregateDispatcher<A>>) -> Self {
        Self {
            dispatcher,
            errors: ProjectionErrors::new(),
            identity: None,
            version: None,
            version_source: VersionSource::default(),
            delete_types: HashSet::new(),
            hard_delete_types: HashSet::new(),
            undelete_types: HashSet::new(),
            soft_delete_after_store_types: HashSet::new(),
            side_effects: None,
        }
    }

    pub fn dispatcher(&self) -> &Arc<AggregateDispatcher<A>> {
        &self.dispatcher
    }

    pub fn errors_mut(&mut self) -> &mut ProjectionErrors {
        &mut self.errors
    }

    /// Writes the slice identity into every folded snapshot.
    pub fn identity_setter<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut A, &I) + Send + Sync + 'static,
    {
        self.identity = Some(Arc::new(f));
        self
    }

    pub fn version_setter<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut A, Version) + Send + Sync + 'static,
    {
        self.version = Some(Arc::new(f));
        self
    }

    pub fn version_source(&mut self, source: VersionSource) -> &mut Self {
        self.version_source = source;
        self
    }

    /// A slice containing a `T` is deleted without folding.
    pub fn delete_on<T: EventData>(&mut self) -> &mut Self {
        self.delete_types.insert(TypeId::of::<T>());
        self
    }

    pub fn hard_delete_on<T: EventData>(&mut self) -> &mut Self {
        self.hard_delete_types.insert(TypeId::of::<T>());
        self
    }

    /// A `T` restores a soft-deleted snapshot.
    pub fn undelete_on<T: EventData>(&mut self) -> &mut Self {
        self.undelete_types.insert(TypeId::of::<T>());
        self
    }

    /// A `T` stores the folded snapshot and then soft-deletes it.
    pub fn store_then_soft_delete_on<T: EventData>(&mut self) -> &mut Self {
        self.soft_delete_after_store_types.insert(TypeId::of::<T>());
        self
    }

    pub fn side_effects(&mut self, side_effects: impl SideEffects<A, I> + 'static) -> &mut Self {
        self.side_effects = Some(Arc::new(side_effects));
        self
    }

    /// Event types that short-circuit or mark a slice, on top of the dispatcher's handlers.
    pub fn marker_types(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.delete_types
            .iter()
            .chain(&self.hard_delete_types)
            .chain(&self.undelete_types)
            .chain(&self.soft_delete_after_store_types)
            .copied()
    }

    fn contains_any(slice: &EventSlice<A, I>, types: &HashSet<TypeId>) -> bool {
        !types.is_empty() && slice.events().iter().any(|e| types.contains(&e.event_type().id()))
    }

    fn short_circuit(&self, slice: &EventSlice<A, I>) -> Option<ActionType> {
        if Self::contains_any(slice, &self.hard_delete_types) {
            Some(ActionType::HardDelete)
        } else if Self::contains_any(slice, &self.delete_types) {
            Some(ActionType::Delete)
        } else {
            None
        }
    }

    /// Folds the events of `slice` into `slice.snapshot` and records the outcome on the slice.
    pub async fn apply_slice(
        &self,
        slice: &mut EventSlice<A, I>,
        ctx: &ApplyContext,
        mode: ExecutionMode,
    ) -> Result<ActionType> {
        let ctx = ctx.for_tenant(slice.tenant_id());
        if slice.snapshot_deleted && !Self::contains_any(slice, &self.undelete_types) {
            slice.snapshot = None;
        }
        let existed = slice.snapshot.is_some();

        if let Some(action) = self.short_circuit(slice) {
            trace!(id = %slice.id(), ?action, "slice short-circuited by a delete event");
            slice.snapshot = None;
            slice.set_last_applied(None);
            slice.set_action(action);
            return Ok(action);
        }

        let mut snapshot = slice.snapshot.take();
        let mut last_applied: Option<Event> = None;
        for event in slice.events() {
            if event.is::<Archived>() {
                debug!(id = %slice.id(), sequence = event.sequence(), "stream archived, folding stopped");
                break;
            }
            let ty = event.event_type();
            let folded = match snapshot {
                None if !self.dispatcher.handles(ty) || self.dispatcher.only_deletes(ty) => None,
                None => Some(self.dispatcher.create(event, &ctx).await.map(Some)),
                Some(current) => Some(self.dispatcher.apply(current, event, &ctx).await),
            };
            snapshot = match folded {
                None => None,
                Some(Ok(next)) => {
                    last_applied = Some(event.clone());
                    next
                }
                Some(Err(err)) => {
                    return Err(self.errors.classify(err, event, self.dispatcher.aggregate_name(), slice.id().document_id()));
                }
            };
        }

        if let Some(snapshot) = snapshot.as_mut() {
            self.stamp(snapshot, slice.id(), last_applied.as_ref());
        }

        let action = match (existed, snapshot.is_some()) {
            (_, true) if slice.snapshot_deleted && Self::contains_any(slice, &self.undelete_types) => {
                ActionType::UnDeleteAndStore
            }
            (_, true) if Self::contains_any(slice, &self.soft_delete_after_store_types) => {
                ActionType::StoreThenSoftDelete
            }
            (_, true) => ActionType::Store,
            (true, false) => ActionType::Delete,
            (false, false) => ActionType::Nothing,
        };
        slice.snapshot = snapshot;
        slice.set_last_applied(last_applied);
        slice.set_action(action);

        if mode.side_effects_enabled() {
            if let Some(side_effects) = &self.side_effects {
                side_effects
                    .raise(slice, &ctx)
                    .await
                    .map_err(AggregationError::SideEffects)?;
            }
        }
        Ok(action)
    }

    fn stamp(&self, snapshot: &mut A, id: &I, last: Option<&Event>) {
        if let Some(set_identity) = &self.identity {
            set_identity(snapshot, id);
        }
        if let (Some(set_version), Some(last)) = (&self.version, last) {
            set_version(snapshot, self.version_of(last));
        }
    }

    /// The version a snapshot whose last applied event is `event` carries.
    pub fn version_of(&self, event: &Event) -> Version {
        match self.version_source {
            VersionSource::StreamVersion => event.version(),
            VersionSource::Sequence => event.sequence(),
        }
    }

    /// Folds `events` on demand, without storage or side effects.
    pub async fn fold_events(&self, id: &I, snapshot: Option<A>, events: &[Event], ctx: &ApplyContext) -> Result<Option<A>> {
        let tenant = events.first().map_or(DEFAULT_TENANT, Event::tenant_id);
        let mut slice = EventSlice::new(id.clone(), tenant).with_events(events.iter().cloned());
        slice.normalize();
        slice.snapshot = snapshot;
        self.apply_slice(&mut slice, ctx, ExecutionMode::CatchUp).await?;
        Ok(slice.snapshot)
    }
}

impl<A, I> std::fmt::Debug for AggregationRunner<A, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationRunner")
            .field("dispatcher", &self.dispatcher)
            .field("version_source", &self.version_source)
            .field("side_effects", &self.side_effects.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EventCatalog;
    use crate::dispatch::BoxError;
    use crate::message::{Envelope, Message};
    use crate::stream::{StreamAction, StreamIdentity};

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Trip {
        id: String,
        miles: u32,
        version: Version,
        ended: bool,
    }

    #[derive(Debug)]
    struct TripStarted;

    #[derive(Debug)]
    struct Travelled(u32);

    #[derive(Debug)]
    struct TripEnded;

    #[derive(Debug)]
    struct TripAbandoned;

    #[derive(Debug)]
    struct TripPurged;

    #[derive(Debug)]
    struct TripRestored;

    #[derive(Debug)]
    struct Breakdown;

    #[derive(Debug)]
    struct Unrelated;

    #[derive(Debug)]
    struct TripFinished {
        trip: String,
    }

    impl Message for TripFinished {
        fn name(&self) -> &'static str {
            "TripFinished"
        }
    }

    fn runner() -> AggregationRunner<Trip, String> {
        let mut dispatcher = AggregateDispatcher::<Trip>::new("Trips", Arc::new(EventCatalog::new()));
        dispatcher
            .aggregate_methods()
            .create(|_: &TripStarted| Trip::default())
            .apply(|trip: &mut Trip, e: &Travelled| trip.miles += e.0)
            .apply(|trip: &mut Trip, _: &TripRestored| trip.ended = false)
            .try_apply(|_: Trip, _: &Breakdown| -> std::result::Result<Option<Trip>, BoxError> {
                Err("engine failure".into())
            })
            .should_delete(|_: &Trip, _: &TripEnded| true);

        let mut runner = AggregationRunner::new(Arc::new(dispatcher));
        runner
            .identity_setter(|trip: &mut Trip, id: &String| trip.id = id.clone())
            .version_setter(|trip: &mut Trip, version| trip.version = version)
            .delete_on::<TripAbandoned>()
            .hard_delete_on::<TripPurged>()
            .undelete_on::<TripRestored>();
        runner
    }

    fn event<T: EventData>(data: T, version: Version) -> Event {
        Event::builder(data)
            .stream_key("trip-1")
            .version(version)
            .sequence(100 + version)
            .build()
    }

    fn slice(events: Vec<Event>) -> EventSlice<Trip, String> {
        EventSlice::new("trip-1".to_string(), DEFAULT_TENANT).with_events(events)
    }

    #[tokio::test]
    async fn test_new_snapshot_is_stored_with_identity_and_version() {
        let runner = runner();
        let mut slice = slice(vec![event(TripStarted, 1), event(Travelled(5), 2), event(Travelled(7), 3)]);

        let action = runner
            .apply_slice(&mut slice, &ApplyContext::detached(), ExecutionMode::Continuous)
            .await
            .unwrap();

        assert_eq!(action, ActionType::Store);
        assert_eq!(
            slice.snapshot,
            Some(Trip {
                id: "trip-1".to_string(),
                miles: 12,
                version: 3,
                ended: false
            })
        );
    }

    #[tokio::test]
    async fn test_sequence_version_source() {
        let mut runner = runner();
        runner.version_source(VersionSource::Sequence);
        let mut slice = slice(vec![event(TripStarted, 1), event(Travelled(5), 2)]);

        runner
            .apply_slice(&mut slice, &ApplyContext::detached(), ExecutionMode::Rebuild)
            .await
            .unwrap();

        assert_eq!(slice.snapshot.map(|t| t.version), Some(102));
    }

    #[tokio::test]
    async fn test_should_delete_turns_into_delete() {
        let runner = runner();
        let mut slice = slice(vec![event(Travelled(1), 4), event(TripEnded, 5)]);
        slice.snapshot = Some(Trip::default());

        let action = runner
            .apply_slice(&mut slice, &ApplyContext::detached(), ExecutionMode::Continuous)
            .await
            .unwrap();

        assert_eq!(action, ActionType::Delete);
        assert!(slice.snapshot.is_none());
    }

    #[tokio::test]
    async fn test_nothing_when_no_snapshot_appears() {
        let runner = runner();
        let mut slice = slice(vec![event(Unrelated, 1), event(TripEnded, 2)]);

        let action = runner
            .apply_slice(&mut slice, &ApplyContext::detached(), ExecutionMode::Continuous)
            .await
            .unwrap();

        assert_eq!(action, ActionType::Nothing);
    }

    #[tokio::test]
    async fn test_delete_types_short_circuit_without_folding() {
        let runner = runner();
        let mut slice = slice(vec![event(Breakdown, 1), event(TripAbandoned, 2)]);
        slice.snapshot = Some(Trip::default());
        let action = runner
            .apply_slice(&mut slice, &ApplyContext::detached(), ExecutionMode::Continuous)
            .await
            .unwrap();
        assert_eq!(action, ActionType::Delete);

        let mut slice = self::slice(vec![event(TripStarted, 1), event(TripPurged, 2)]);
        let action = runner
            .apply_slice(&mut slice, &ApplyContext::detached(), ExecutionMode::Continuous)
            .await
            .unwrap();
        assert_eq!(action, ActionType::HardDelete);
    }

    #[tokio::test]
    async fn test_archive_marker_stops_folding() {
        let runner = runner();
        let mut slice = slice(vec![
            event(TripStarted, 1),
            event(Travelled(3), 2),
            event(Archived::new("closed"), 3),
            event(Travelled(50), 4),
        ]);

        runner
            .apply_slice(&mut slice, &ApplyContext::detached(), ExecutionMode::Continuous)
            .await
            .unwrap();

        assert_eq!(slice.last_applied().map(Event::version), Some(2));
        let trip = slice.snapshot.unwrap();
        assert_eq!(trip.miles, 3);
        assert_eq!(trip.version, 2);
    }

    #[tokio::test]
    async fn test_undelete_restores_a_soft_deleted_snapshot() {
        let runner = runner();
        let mut slice = slice(vec![event(TripRestored, 9)]);
        slice.snapshot = Some(Trip {
            ended: true,
            ..Trip::default()
        });
        slice.snapshot_deleted = true;

        let action = runner
            .apply_slice(&mut slice, &ApplyContext::detached(), ExecutionMode::Continuous)
            .await
            .unwrap();

        assert_eq!(action, ActionType::UnDeleteAndStore);
        assert!(!slice.snapshot.unwrap().ended);
    }

    #[tokio::test]
    async fn test_soft_deleted_snapshot_is_ignored_without_an_undelete() {
        let runner = runner();
        let mut slice = slice(vec![event(Unrelated, 9)]);
        slice.snapshot = Some(Trip {
            miles: 100,
            ..Trip::default()
        });
        slice.snapshot_deleted = true;

        let action = runner
            .apply_slice(&mut slice, &ApplyContext::detached(), ExecutionMode::Continuous)
            .await
            .unwrap();

        assert_eq!(action, ActionType::Nothing);
        assert!(slice.snapshot.is_none());
    }

    #[tokio::test]
    async fn test_store_then_soft_delete() {
        let mut runner = runner();
        runner.store_then_soft_delete_on::<Travelled>();
        let mut slice = slice(vec![event(TripStarted, 1), event(Travelled(2), 2)]);

        let action = runner
            .apply_slice(&mut slice, &ApplyContext::detached(), ExecutionMode::Continuous)
            .await
            .unwrap();
        assert_eq!(action, ActionType::StoreThenSoftDelete);
        assert_eq!(slice.snapshot.map(|t| t.miles), Some(2));
    }

    #[tokio::test]
    async fn test_permanent_failure_names_the_event() {
        let runner = runner();
        let mut slice = slice(vec![event(TripStarted, 1), event(Breakdown, 2)]);

        let err = runner
            .apply_slice(&mut slice, &ApplyContext::detached(), ExecutionMode::Continuous)
            .await
            .unwrap_err();

        assert!(!err.is_transient());
        assert_eq!(err.failed_event().map(Event::version), Some(2));
    }

    #[tokio::test]
    async fn test_transient_failures_are_not_dead_lettered() {
        let mut runner = runner();
        runner.errors_mut().transient_when(|err| err.to_string() == "engine failure");
        let mut slice = slice(vec![event(TripStarted, 1), event(Breakdown, 2)]);

        let err = runner
            .apply_slice(&mut slice, &ApplyContext::detached(), ExecutionMode::Continuous)
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert!(err.failed_event().is_none());
    }

    fn announce(slice: &mut EventSlice<Trip, String>) -> std::result::Result<(), BoxError> {
        if slice.snapshot.as_ref().is_some_and(|t| t.miles > 10) {
            let trip = slice.id().clone();
            slice.publish_message(Envelope::from(TripFinished { trip }).boxed());
            slice.append_events(StreamAction::append(StreamIdentity::Key("odometer".to_string())).with(Travelled(0)));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_side_effects_only_run_in_continuous_mode() {
        let mut runner = runner();
        runner.side_effects(announce);
        let events = vec![event(TripStarted, 1), event(Travelled(11), 2)];

        let mut continuous = slice(events.clone());
        runner
            .apply_slice(&mut continuous, &ApplyContext::detached(), ExecutionMode::Continuous)
            .await
            .unwrap();
        assert_eq!(continuous.messages().len(), 1);
        assert_eq!(continuous.raised_events().len(), 1);

        let mut rebuild = slice(events);
        runner
            .apply_slice(&mut rebuild, &ApplyContext::detached(), ExecutionMode::Rebuild)
            .await
            .unwrap();
        assert!(rebuild.messages().is_empty());
        assert!(rebuild.raised_events().is_empty());
    }

    #[tokio::test]
    async fn test_folding_one_at_a_time_matches_folding_at_once() {
        let runner = runner();
        let events: Vec<Event> = std::iter::once(event(TripStarted, 1))
            .chain((2..=6).map(|v| event(Travelled(v as u32), v)))
            .collect();
        let ctx = ApplyContext::detached();
        let id = "trip-1".to_string();

        let at_once = runner.fold_events(&id, None, &events, &ctx).await.unwrap();

        let mut one_by_one = None;
        for event in &events {
            one_by_one = runner
                .fold_events(&id, one_by_one, std::slice::from_ref(event), &ctx)
                .await
                .unwrap();
        }

        assert_eq!(at_once, one_by_one);
        assert_eq!(at_once.map(|t| t.miles), Some(20));
    }
}
