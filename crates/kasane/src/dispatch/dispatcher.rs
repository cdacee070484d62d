use crate::cache::SharedMap;
use crate::catalog::EventCatalog;
use crate::dispatch::descriptor::{MethodDescriptor, MethodKind, MethodSource, MethodStyle, Parameter};
use crate::dispatch::error::{BoxError, DispatchError, InvalidProjection, Result};
use crate::dispatch::handler::{
    Applier, ApplyContext, Creator, Deleter, HandlerFuture, HandlerResult, MethodBody,
};
use crate::event::{Event, EventData, EventType};
use futures::future::{self, TryFutureExt};
use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

struct Slot<A> {
    descriptor: MethodDescriptor,
    body: MethodBody<A>,
}

/// Resolves, caches and invokes the create/apply/delete handlers of one aggregate type.
///
/// Handlers are registered up front. Resolution happens lazily per concrete event type and
/// is cached, including negative results, so steady-state dispatch is a map lookup.
pub struct AggregateDispatcher<A> {
    aggregate: &'static str,
    projection: String,
    catalog: Arc<EventCatalog>,
    slots: Vec<Slot<A>>,
    default_ctor: Option<Arc<dyn Fn() -> A + Send + Sync>>,
    lambda_creators: HashMap<TypeId, (EventType, Creator<A>)>,
    lambda_appliers: HashMap<TypeId, (EventType, Applier<A>)>,
    lambda_deleters: HashMap<TypeId, (EventType, Deleter<A>)>,
    has_views: bool,
    creators: SharedMap<TypeId, Option<Creator<A>>>,
    appliers: SharedMap<TypeId, Option<Applier<A>>>,
    deleters: SharedMap<TypeId, Option<Deleter<A>>>,
}

fn mismatch<T: ?Sized + 'static>(event: &Event) -> BoxError {
    Box::new(DispatchError::PayloadMismatch {
        expected: EventType::of::<T>().short_name(),
        actual: event.event_type(),
    })
}

fn read<'e, T: EventData>(catalog: &EventCatalog, event: &'e Event) -> HandlerResult<&'e T> {
    catalog.resolve::<T>(event).ok_or_else(|| mismatch::<T>(event))
}

fn read_view<'e, S: ?Sized + 'static>(catalog: &EventCatalog, event: &'e Event) -> HandlerResult<&'e S> {
    catalog.view::<S>(event).ok_or_else(|| mismatch::<S>(event))
}

fn sync_creator<A, F>(f: F) -> Creator<A>
where
    A: Send + 'static,
    F: Fn(&Event) -> HandlerResult<A> + Send + Sync + 'static,
{
    Arc::new(move |event: Event, _ctx: ApplyContext| -> HandlerFuture<A> { Box::pin(future::ready(f(&event))) })
}

fn sync_applier<A, F>(f: F) -> Applier<A>
where
    A: Send + 'static,
    F: Fn(A, &Event) -> HandlerResult<Option<A>> + Send + Sync + 'static,
{
    Arc::new(
        move |snapshot: A, event: Event, _ctx: ApplyContext| -> HandlerFuture<Option<A>> {
            Box::pin(future::ready(f(snapshot, &event)))
        },
    )
}

fn typed_creator<A, T, F>(catalog: Arc<EventCatalog>, f: F) -> Creator<A>
where
    A: Send + 'static,
    T: EventData,
    F: Fn(&T) -> A + Send + Sync + 'static,
{
    sync_creator(move |event| read::<T>(&catalog, event).map(&f))
}

fn typed_applier<A, T, F>(catalog: Arc<EventCatalog>, f: F) -> Applier<A>
where
    A: Send + 'static,
    T: EventData,
    F: Fn(&mut A, &T) + Send + Sync + 'static,
{
    sync_applier(move |mut snapshot, event| {
        let data = read::<T>(&catalog, event)?;
        f(&mut snapshot, data);
        Ok(Some(snapshot))
    })
}

fn typed_deleter<A, T, F>(catalog: Arc<EventCatalog>, f: F) -> Deleter<A>
where
    A: 'static,
    T: EventData,
    F: Fn(&A, &T) -> bool + Send + Sync + 'static,
{
    Arc::new(move |snapshot: &A, event: &Event| -> HandlerResult<bool> {
        read::<T>(&catalog, event).map(|data| f(snapshot, data))
    })
}

impl<A> AggregateDispatcher<A>
where
    A: Send + Sync + 'static,
{
    pub fn new(projection: impl Into<String>, catalog: Arc<EventCatalog>) -> Self {
        Self {
            aggregate: EventType::of::<A>().short_name(),
            projection: projection.into(),
            catalog,
            slots: Vec::new(),
            default_ctor: None,
            lambda_creators: HashMap::new(),
            lambda_appliers: HashMap::new(),
            lambda_deleters: HashMap::new(),
            has_views: false,
            creators: SharedMap::new(),
            appliers: SharedMap::new(),
            deleters: SharedMap::new(),
        }
    }

    pub fn aggregate_name(&self) -> &'static str {
        self.aggregate
    }

    pub fn projection_name(&self) -> &str {
        &self.projection
    }

    pub fn catalog(&self) -> &Arc<EventCatalog> {
        &self.catalog
    }

    /// Registration of handlers declared on the aggregate.
    pub fn aggregate_methods(&mut self) -> MethodSet<'_, A> {
        MethodSet {
            dispatcher: self,
            source: MethodSource::Aggregate,
        }
    }

    /// Registration of handlers declared on the projection.
    pub fn projection_methods(&mut self) -> MethodSet<'_, A> {
        MethodSet {
            dispatcher: self,
            source: MethodSource::Projection,
        }
    }

    /// Starts the aggregate from a `T`, tried before any other way of creating it.
    pub fn constructor<T, F>(&mut self, f: F) -> &mut Self
    where
        T: EventData,
        F: Fn(&T) -> A + Send + Sync + 'static,
    {
        self.catalog.register::<T>();
        let descriptor = MethodDescriptor::new(
            MethodKind::Create,
            MethodStyle::Constructor,
            MethodSource::Aggregate,
            EventType::of::<T>(),
        )
        .param(Parameter::EventData);
        let body = MethodBody::Create(typed_creator(self.catalog.clone(), f));
        self.register_method(descriptor, body)
    }

    /// Used to start the aggregate from events that only have an apply handler.
    pub fn default_constructor<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        self.default_ctor = Some(Arc::new(f));
        self.reset_caches();
        self
    }

    /// Registers a handler described by `descriptor`, e.g. one emitted by a code generator.
    pub fn register_method(&mut self, descriptor: MethodDescriptor, body: MethodBody<A>) -> &mut Self {
        debug!(
            projection = %self.projection,
            method = %descriptor,
            "registered projection method"
        );
        self.slots.push(Slot { descriptor, body });
        self.reset_caches();
        self
    }

    /// Creates the aggregate from `T` ahead of every registered method.
    pub fn create_event<T, F>(&mut self, f: F) -> &mut Self
    where
        T: EventData,
        F: Fn(&T) -> A + Send + Sync + 'static,
    {
        let ty = self.catalog.register::<T>();
        let creator = typed_creator(self.catalog.clone(), f);
        self.lambda_creators.insert(ty.id(), (ty, creator.clone()));
        self.creators.insert(ty.id(), Some(creator));
        self
    }

    /// Applies `T` ahead of every registered method.
    pub fn project_event<T, F>(&mut self, f: F) -> &mut Self
    where
        T: EventData,
        F: Fn(&mut A, &T) + Send + Sync + 'static,
    {
        let ty = self.catalog.register::<T>();
        let applier = typed_applier(self.catalog.clone(), f);
        self.lambda_appliers.insert(ty.id(), (ty, applier.clone()));
        self.appliers.insert(ty.id(), Some(applier));
        self
    }

    /// Deletes the snapshot when `f` returns true for a `T`, ahead of every registered method.
    pub fn delete_when<T, F>(&mut self, f: F) -> &mut Self
    where
        T: EventData,
        F: Fn(&A, &T) -> bool + Send + Sync + 'static,
    {
        let ty = self.catalog.register::<T>();
        let deleter = typed_deleter(self.catalog.clone(), f);
        self.lambda_deleters.insert(ty.id(), (ty, deleter.clone()));
        self.deleters.insert(ty.id(), Some(deleter));
        self
    }

    fn reset_caches(&mut self) {
        self.creators = SharedMap::new();
        self.appliers = SharedMap::new();
        self.deleters = SharedMap::new();
        for (id, (_, creator)) in &self.lambda_creators {
            self.creators.insert(*id, Some(creator.clone()));
        }
        for (id, (_, applier)) in &self.lambda_appliers {
            self.appliers.insert(*id, Some(applier.clone()));
        }
        for (id, (_, deleter)) in &self.lambda_deleters {
            self.deleters.insert(*id, Some(deleter.clone()));
        }
    }

    fn slots_for(&self, kind: MethodKind, id: TypeId) -> Vec<&Slot<A>> {
        let mut slots: Vec<_> = self
            .slots
            .iter()
            .filter(|slot| slot.descriptor.kind == kind && slot.descriptor.event_type.id() == id)
            .collect();
        slots.sort_by_key(|slot| {
            (
                slot.descriptor.style != MethodStyle::Constructor,
                slot.descriptor.source,
                slot.descriptor.style,
            )
        });
        slots
    }

    fn direct_applier(&self, id: TypeId) -> Option<Applier<A>> {
        if let Some((_, applier)) = self.lambda_appliers.get(&id) {
            return Some(applier.clone());
        }
        self.slots_for(MethodKind::Apply, id)
            .into_iter()
            .find_map(|slot| match &slot.body {
                MethodBody::Apply(applier) => Some(applier.clone()),
                _ => None,
            })
    }

    fn direct_deleter(&self, id: TypeId) -> Option<Deleter<A>> {
        if let Some((_, deleter)) = self.lambda_deleters.get(&id) {
            return Some(deleter.clone());
        }
        self.slots_for(MethodKind::ShouldDelete, id)
            .into_iter()
            .find_map(|slot| match &slot.body {
                MethodBody::ShouldDelete(deleter) => Some(deleter.clone()),
                _ => None,
            })
    }

    fn direct_creator(&self, id: TypeId) -> Option<Creator<A>> {
        if let Some((_, creator)) = self.lambda_creators.get(&id) {
            return Some(creator.clone());
        }
        let declared = self
            .slots_for(MethodKind::Create, id)
            .into_iter()
            .find_map(|slot| match &slot.body {
                MethodBody::Create(creator) => Some(creator.clone()),
                _ => None,
            });
        if declared.is_some() {
            return declared;
        }
        let make = self.default_ctor.clone()?;
        let applier = self.direct_applier(id)?;
        let aggregate = self.aggregate;
        Some(Arc::new(move |event: Event, ctx: ApplyContext| -> HandlerFuture<A> {
            let applied = applier(make(), event, ctx);
            Box::pin(async move {
                applied
                    .await?
                    .ok_or_else(|| BoxError::from(format!("applying the first event deleted the new {aggregate}")))
            })
        }))
    }

    /// Looks `id` up in `cache`, resolving it directly or through its first declared
    /// ancestor with a handler, and remembers the answer.
    fn resolve<H: Clone>(
        &self,
        cache: &SharedMap<TypeId, Option<H>>,
        ty: EventType,
        direct: impl Fn(TypeId) -> Option<H>,
    ) -> Option<H> {
        if let Some(cached) = cache.get(&ty.id()) {
            return cached;
        }
        let resolved = direct(ty.id()).or_else(|| {
            self.catalog.ancestors_of(ty.id()).iter().find_map(|ancestor| {
                let found = cache.get(&ancestor.id()).flatten().or_else(|| direct(ancestor.id()));
                if found.is_some() {
                    debug!(
                        projection = %self.projection,
                        event_type = %ty,
                        ancestor = %ancestor,
                        "resolved handler through ancestor"
                    );
                }
                found
            })
        });
        cache.get_or_insert_with(ty.id(), || resolved)
    }

    fn resolve_creator(&self, ty: EventType) -> Option<Creator<A>> {
        self.resolve(&self.creators, ty, |id| self.direct_creator(id))
    }

    fn resolve_applier(&self, ty: EventType) -> Option<Applier<A>> {
        self.resolve(&self.appliers, ty, |id| self.direct_applier(id))
    }

    fn resolve_deleter(&self, ty: EventType) -> Option<Deleter<A>> {
        self.resolve(&self.deleters, ty, |id| self.direct_deleter(id))
    }

    pub fn can_create(&self, ty: EventType) -> bool {
        self.resolve_creator(ty).is_some()
    }

    /// True when any handler, direct or inherited, exists for `ty`.
    pub fn handles(&self, ty: EventType) -> bool {
        self.resolve_creator(ty).is_some() || self.resolve_applier(ty).is_some() || self.resolve_deleter(ty).is_some()
    }

    /// True when `ty` can only delete a snapshot, never start or change one.
    pub fn only_deletes(&self, ty: EventType) -> bool {
        self.resolve_deleter(ty).is_some() && self.resolve_creator(ty).is_none() && self.resolve_applier(ty).is_none()
    }

    fn wrap(ty: EventType, source: BoxError) -> DispatchError {
        match source.downcast::<DispatchError>() {
            Ok(own) => *own,
            Err(source) => DispatchError::Handler { event_type: ty, source },
        }
    }

    pub async fn create(&self, event: &Event, ctx: &ApplyContext) -> Result<A> {
        let ty = event.event_type();
        let creator = self.resolve_creator(ty).ok_or_else(|| DispatchError::CannotStart {
            aggregate: self.aggregate,
            projection: self.projection.clone(),
            event_type: ty,
        })?;
        creator(event.clone(), ctx.clone())
            .await
            .map_err(|source| Self::wrap(ty, source))
    }

    /// Folds `event` into `snapshot`. `None` means the snapshot is deleted.
    ///
    /// Event types without any handler leave the snapshot untouched.
    pub async fn apply(&self, snapshot: A, event: &Event, ctx: &ApplyContext) -> Result<Option<A>> {
        let ty = event.event_type();
        if let Some(deleter) = self.resolve_deleter(ty) {
            if deleter(&snapshot, event).map_err(|source| Self::wrap(ty, source))? {
                return Ok(None);
            }
        }
        match self.resolve_applier(ty) {
            Some(applier) => applier(snapshot, event.clone(), ctx.clone())
                .await
                .map_err(|source| Self::wrap(ty, source)),
            None => Ok(Some(snapshot)),
        }
    }

    /// Event types with a handler registered directly, or `None` when handlers are
    /// registered against views and every event type must be offered.
    pub fn handled_event_types(&self) -> Option<Vec<EventType>> {
        if self.has_views {
            return None;
        }
        let mut types: Vec<EventType> = self
            .slots
            .iter()
            .map(|slot| slot.descriptor.event_type)
            .chain(self.lambda_creators.values().map(|(ty, _)| *ty))
            .chain(self.lambda_appliers.values().map(|(ty, _)| *ty))
            .chain(self.lambda_deleters.values().map(|(ty, _)| *ty))
            .collect();
        for known in self.catalog.known_types() {
            let inherits = self
                .catalog
                .ancestors_of(known.id())
                .iter()
                .any(|ancestor| types.contains(ancestor));
            if inherits {
                types.push(known);
            }
        }
        types.sort_by_key(|ty| ty.name());
        types.dedup();
        Some(types)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.slots.iter().map(|slot| &slot.descriptor)
    }

    /// Checks the registered handlers and reports every problem at once.
    pub fn assert_validity(&self) -> std::result::Result<(), InvalidProjection> {
        let mut messages = Vec::new();
        let lambdas = self.lambda_creators.len() + self.lambda_appliers.len() + self.lambda_deleters.len();
        if self.slots.is_empty() && lambdas == 0 {
            messages.push(format!(
                "no create, apply or should_delete handlers are registered for {}",
                self.aggregate
            ));
        }
        for slot in &self.slots {
            messages.extend(slot.descriptor.problems());
        }

        let mut seen: Vec<(&MethodDescriptor, usize)> = Vec::new();
        for slot in &self.slots {
            let d = &slot.descriptor;
            match seen.iter_mut().find(|(other, _)| {
                other.kind == d.kind && other.style == d.style && other.source == d.source && other.event_type == d.event_type
            }) {
                Some((_, count)) => *count += 1,
                None => seen.push((d, 1)),
            }
        }
        for (d, count) in seen.into_iter().filter(|(_, count)| *count > 1) {
            messages.push(format!(
                "{count} {:?} {:?} handlers on {:?} for {} are ambiguous",
                d.style, d.kind, d.source, d.event_type
            ));
        }

        if messages.is_empty() {
            Ok(())
        } else {
            Err(InvalidProjection {
                projection: self.projection.clone(),
                messages,
            })
        }
    }
}

impl<A> std::fmt::Debug for AggregateDispatcher<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateDispatcher")
            .field("aggregate", &self.aggregate)
            .field("projection", &self.projection)
            .field("methods", &self.slots.len())
            .finish()
    }
}

/// Typed registration of handlers declared on one [`MethodSource`].
pub struct MethodSet<'d, A> {
    dispatcher: &'d mut AggregateDispatcher<A>,
    source: MethodSource,
}

impl<'d, A> MethodSet<'d, A>
where
    A: Send + Sync + 'static,
{
    fn style(&self, kind: MethodKind) -> MethodStyle {
        match (self.source, kind) {
            (MethodSource::Aggregate, MethodKind::Create) => MethodStyle::Static,
            _ => MethodStyle::Instance,
        }
    }

    fn descriptor(&self, kind: MethodKind, event_type: EventType, params: &[Parameter]) -> MethodDescriptor {
        MethodDescriptor::new(kind, self.style(kind), self.source, event_type).params(params.iter().cloned())
    }

    fn push(self, descriptor: MethodDescriptor, body: MethodBody<A>) -> Self {
        self.dispatcher.register_method(descriptor, body);
        self
    }

    fn catalog(&self) -> Arc<EventCatalog> {
        self.dispatcher.catalog.clone()
    }

    pub fn create<T, F>(self, f: F) -> Self
    where
        T: EventData,
        F: Fn(&T) -> A + Send + Sync + 'static,
    {
        let ty = self.dispatcher.catalog.register::<T>();
        let descriptor = self.descriptor(MethodKind::Create, ty, &[Parameter::EventData]);
        let body = MethodBody::Create(typed_creator(self.catalog(), f));
        self.push(descriptor, body)
    }

    /// Creates from the payload and its envelope.
    pub fn create_from_event<T, F>(self, f: F) -> Self
    where
        T: EventData,
        F: Fn(&T, &Event) -> A + Send + Sync + 'static,
    {
        let ty = self.dispatcher.catalog.register::<T>();
        let descriptor = self.descriptor(MethodKind::Create, ty, &[Parameter::EventData, Parameter::WrappedEvent]);
        let catalog = self.catalog();
        let body = MethodBody::Create(sync_creator(move |event| {
            read::<T>(&catalog, event).map(|data| f(data, event))
        }));
        self.push(descriptor, body)
    }

    /// Creates through a handler that may load other documents or wait.
    pub fn create_async<T, E, F, Fut>(self, f: F) -> Self
    where
        T: EventData,
        E: Into<BoxError> + 'static,
        F: Fn(Arc<T>, Event, ApplyContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<A, E>> + Send + 'static,
    {
        let ty = self.dispatcher.catalog.register::<T>();
        let descriptor = self.descriptor(
            MethodKind::Create,
            ty,
            &[Parameter::EventData, Parameter::WrappedEvent, Parameter::Session, Parameter::Cancellation],
        );
        let body = MethodBody::Create(Arc::new(move |event: Event, ctx: ApplyContext| -> HandlerFuture<A> {
            match event.data_arc::<T>() {
                Some(data) => Box::pin(f(data, event, ctx).map_err(Into::<BoxError>::into)),
                None => Box::pin(future::ready(Err(mismatch::<T>(&event)))),
            }
        }));
        self.push(descriptor, body)
    }

    /// Creates from any event declared in the catalog as viewable as an `S`.
    pub fn create_as<S, F>(self, f: F) -> Self
    where
        S: ?Sized + 'static,
        F: Fn(&S) -> A + Send + Sync + 'static,
    {
        let descriptor = self.descriptor(MethodKind::Create, EventType::of::<S>(), &[Parameter::EventData]);
        let catalog = self.catalog();
        let body = MethodBody::Create(sync_creator(move |event| read_view::<S>(&catalog, event).map(&f)));
        self.dispatcher.has_views = true;
        self.push(descriptor, body)
    }

    pub fn apply<T, F>(self, f: F) -> Self
    where
        T: EventData,
        F: Fn(&mut A, &T) + Send + Sync + 'static,
    {
        let ty = self.dispatcher.catalog.register::<T>();
        let descriptor = self.descriptor(MethodKind::Apply, ty, &[Parameter::Aggregate, Parameter::EventData]);
        let body = MethodBody::Apply(typed_applier(self.catalog(), f));
        self.push(descriptor, body)
    }

    /// Applies with access to the event envelope, e.g. for timestamps or headers.
    pub fn apply_event<T, F>(self, f: F) -> Self
    where
        T: EventData,
        F: Fn(&mut A, &T, &Event) + Send + Sync + 'static,
    {
        let ty = self.dispatcher.catalog.register::<T>();
        let descriptor = self.descriptor(
            MethodKind::Apply,
            ty,
            &[Parameter::Aggregate, Parameter::EventData, Parameter::WrappedEvent],
        );
        let catalog = self.catalog();
        let body = MethodBody::Apply(sync_applier(move |mut snapshot, event| {
            let data = read::<T>(&catalog, event)?;
            f(&mut snapshot, data, event);
            Ok(Some(snapshot))
        }));
        self.push(descriptor, body)
    }

    /// Applies with a handler that can fail or replace the snapshot. Returning `None` deletes it.
    pub fn try_apply<T, E, F>(self, f: F) -> Self
    where
        T: EventData,
        E: Into<BoxError> + 'static,
        F: Fn(A, &T) -> std::result::Result<Option<A>, E> + Send + Sync + 'static,
    {
        let ty = self.dispatcher.catalog.register::<T>();
        let descriptor = self.descriptor(MethodKind::Apply, ty, &[Parameter::Aggregate, Parameter::EventData]);
        let catalog = self.catalog();
        let body = MethodBody::Apply(sync_applier(move |snapshot, event| {
            let data = read::<T>(&catalog, event)?;
            f(snapshot, data).map_err(Into::into)
        }));
        self.push(descriptor, body)
    }

    pub fn apply_async<T, E, F, Fut>(self, f: F) -> Self
    where
        T: EventData,
        E: Into<BoxError> + 'static,
        F: Fn(A, Arc<T>, ApplyContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<A>, E>> + Send + 'static,
    {
        let ty = self.dispatcher.catalog.register::<T>();
        let descriptor = self.descriptor(
            MethodKind::Apply,
            ty,
            &[Parameter::Aggregate, Parameter::EventData, Parameter::Session, Parameter::Cancellation],
        );
        let body = MethodBody::Apply(Arc::new(
            move |snapshot: A, event: Event, ctx: ApplyContext| -> HandlerFuture<Option<A>> {
                match event.data_arc::<T>() {
                    Some(data) => Box::pin(f(snapshot, data, ctx).map_err(Into::<BoxError>::into)),
                    None => Box::pin(future::ready(Err(mismatch::<T>(&event)))),
                }
            },
        ));
        self.push(descriptor, body)
    }

    /// Applies every event declared in the catalog as viewable as an `S`.
    pub fn apply_as<S, F>(self, f: F) -> Self
    where
        S: ?Sized + 'static,
        F: Fn(&mut A, &S) + Send + Sync + 'static,
    {
        let descriptor = self.descriptor(
            MethodKind::Apply,
            EventType::of::<S>(),
            &[Parameter::Aggregate, Parameter::EventData],
        );
        let catalog = self.catalog();
        let body = MethodBody::Apply(sync_applier(move |mut snapshot, event| {
            let data = read_view::<S>(&catalog, event)?;
            f(&mut snapshot, data);
            Ok(Some(snapshot))
        }));
        self.dispatcher.has_views = true;
        self.push(descriptor, body)
    }

    pub fn should_delete<T, F>(self, f: F) -> Self
    where
        T: EventData,
        F: Fn(&A, &T) -> bool + Send + Sync + 'static,
    {
        let ty = self.dispatcher.catalog.register::<T>();
        let descriptor = self.descriptor(
            MethodKind::ShouldDelete,
            ty,
            &[Parameter::Aggregate, Parameter::EventData],
        );
        let body = MethodBody::ShouldDelete(typed_deleter(self.catalog(), f));
        self.push(descriptor, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Letters {
        a: u32,
        b: u32,
        c: u32,
    }

    #[derive(Debug)]
    struct StartLetters(u32, u32);

    #[derive(Debug)]
    struct AEvent;

    #[derive(Debug)]
    struct BEvent;

    #[derive(Debug)]
    struct CEvent;

    #[derive(Debug)]
    struct FullStop(bool);

    #[derive(Debug)]
    struct Unknown;

    trait Tally: std::fmt::Debug {
        fn amount(&self) -> u32;
    }

    #[derive(Debug)]
    struct Bonus(u32);

    impl Tally for Bonus {
        fn amount(&self) -> u32 {
            self.0
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("letter overflow")]
    struct Overflow;

    fn dispatcher() -> AggregateDispatcher<Letters> {
        let mut d = AggregateDispatcher::new("Letters", Arc::new(EventCatalog::new()));
        d.constructor(|e: &StartLetters| Letters {
            a: e.0,
            b: e.1,
            c: 0,
        })
        .default_constructor(Letters::default);
        d.aggregate_methods()
            .apply(|s: &mut Letters, _: &AEvent| s.a += 1)
            .apply(|s: &mut Letters, _: &BEvent| s.b += 1)
            .should_delete(|_: &Letters, e: &FullStop| e.0);
        d
    }

    fn event<T: EventData>(data: T) -> Event {
        Event::builder(data).sequence(1).version(1).build()
    }

    #[tokio::test]
    async fn test_constructor_starts_the_aggregate() {
        let d = dispatcher();
        let created = assert_ok!(d.create(&event(StartLetters(2, 3)), &ApplyContext::detached()).await);
        assert_eq!(created, Letters { a: 2, b: 3, c: 0 });
    }

    #[tokio::test]
    async fn test_default_constructor_then_apply() {
        let d = dispatcher();
        let created = assert_ok!(d.create(&event(AEvent), &ApplyContext::detached()).await);
        assert_eq!(created, Letters { a: 1, b: 0, c: 0 });
    }

    #[tokio::test]
    async fn test_cannot_start_without_a_handler() {
        let mut d = AggregateDispatcher::<Letters>::new("Letters", Arc::new(EventCatalog::new()));
        d.aggregate_methods().apply(|s: &mut Letters, _: &AEvent| s.a += 1);

        let err = assert_err!(d.create(&event(AEvent), &ApplyContext::detached()).await);
        match err {
            DispatchError::CannotStart {
                aggregate,
                projection,
                event_type,
            } => {
                assert_eq!(aggregate, "Letters");
                assert_eq!(projection, "Letters");
                assert_eq!(event_type, EventType::of::<AEvent>());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_should_delete_false_keeps_the_snapshot_then_true_deletes_it() {
        let d = dispatcher();
        let ctx = ApplyContext::detached();
        let snapshot = Letters { a: 4, b: 4, c: 4 };

        let kept = assert_ok!(d.apply(snapshot.clone(), &event(FullStop(false)), &ctx).await);
        assert_eq!(kept, Some(snapshot.clone()));

        let deleted = assert_ok!(d.apply(snapshot, &event(FullStop(true)), &ctx).await);
        assert_eq!(deleted, None);
    }

    #[tokio::test]
    async fn test_unknown_events_leave_the_snapshot_alone() {
        let d = dispatcher();
        let snapshot = Letters { a: 1, b: 2, c: 3 };
        let applied = assert_ok!(d.apply(snapshot.clone(), &event(Unknown), &ApplyContext::detached()).await);
        assert_eq!(applied, Some(snapshot));
        assert!(!d.handles(EventType::of::<Unknown>()));
    }

    #[tokio::test]
    async fn test_lambdas_win_over_registered_methods() {
        let mut d = dispatcher();
        d.project_event(|s: &mut Letters, _: &AEvent| s.a += 10);

        let applied = assert_ok!(d.apply(Letters::default(), &event(AEvent), &ApplyContext::detached()).await);
        assert_eq!(applied.map(|s| s.a), Some(10));
    }

    #[tokio::test]
    async fn test_lambdas_survive_later_registrations() {
        let mut d = dispatcher();
        d.create_event(|_: &CEvent| Letters { a: 0, b: 0, c: 9 });
        d.aggregate_methods().apply(|s: &mut Letters, _: &CEvent| s.c += 1);

        let created = assert_ok!(d.create(&event(CEvent), &ApplyContext::detached()).await);
        assert_eq!(created.c, 9);
    }

    #[tokio::test]
    async fn test_resolution_through_an_interface_is_cached() {
        let catalog = Arc::new(EventCatalog::new());
        catalog.declare::<Bonus, dyn Tally>(|e| e);

        let calls = Arc::new(AtomicUsize::new(0));
        let mut d = AggregateDispatcher::<Letters>::new("Letters", catalog);
        let counter = calls.clone();
        d.aggregate_methods().apply_as::<dyn Tally, _>(move |s, t| {
            counter.fetch_add(1, Ordering::SeqCst);
            s.c += t.amount();
        });

        let ctx = ApplyContext::detached();
        let once = assert_ok!(d.apply(Letters::default(), &event(Bonus(5)), &ctx).await);
        let twice = assert_ok!(d.apply(once.unwrap_or_default(), &event(Bonus(2)), &ctx).await);

        assert_eq!(twice.map(|s| s.c), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(d.appliers.contains_key(&TypeId::of::<Bonus>()));
        assert_eq!(d.handled_event_types(), None);
    }

    #[tokio::test]
    async fn test_try_apply_errors_are_wrapped_with_the_event_type() {
        let mut d = dispatcher();
        d.aggregate_methods()
            .try_apply(|_: Letters, _: &CEvent| Err::<Option<Letters>, _>(Overflow));

        let err = assert_err!(d.apply(Letters::default(), &event(CEvent), &ApplyContext::detached()).await);
        assert!(matches!(err, DispatchError::Handler { event_type, .. } if event_type == EventType::of::<CEvent>()));
        assert_eq!(err.handler_error().map(ToString::to_string), Some("letter overflow".to_string()));
    }

    #[tokio::test]
    async fn test_async_handlers_receive_the_context() {
        let mut d = AggregateDispatcher::<Letters>::new("Letters", Arc::new(EventCatalog::new()));
        d.projection_methods()
            .create_async(|data: Arc<StartLetters>, _event: Event, ctx: ApplyContext| async move {
                let c = if ctx.cancel.is_cancelled() { 1 } else { 0 };
                Ok::<_, Overflow>(Letters {
                    a: data.0,
                    b: data.1,
                    c,
                })
            })
            .apply_async(|mut s: Letters, _: Arc<BEvent>, _ctx: ApplyContext| async move {
                s.b *= 2;
                Ok::<_, Overflow>(Some(s))
            });

        let ctx = ApplyContext::detached();
        let created = assert_ok!(d.create(&event(StartLetters(1, 3)), &ctx).await);
        let applied = assert_ok!(d.apply(created, &event(BEvent), &ctx).await);
        assert_eq!(applied, Some(Letters { a: 1, b: 6, c: 0 }));
    }

    #[test]
    fn test_handled_event_types_lists_direct_handlers() {
        let d = dispatcher();
        let types = d.handled_event_types().unwrap_or_default();
        assert_eq!(types.len(), 4);
        assert!(types.contains(&EventType::of::<StartLetters>()));
        assert!(types.contains(&EventType::of::<FullStop>()));
    }

    #[test]
    fn test_validity_requires_handlers() {
        let d = AggregateDispatcher::<Letters>::new("Empty", Arc::new(EventCatalog::new()));
        let err = assert_err!(d.assert_validity());
        assert_eq!(err.projection, "Empty");
        assert_eq!(err.messages.len(), 1);
    }

    #[test]
    fn test_validity_collects_every_problem() {
        let mut d = dispatcher();
        let ty = EventType::of::<CEvent>();
        let noop = || MethodBody::<Letters>::should_delete(|_, _| Ok(false));
        d.register_method(
            MethodDescriptor::new(MethodKind::ShouldDelete, MethodStyle::Instance, MethodSource::Projection, ty)
                .params([Parameter::Aggregate, Parameter::unsupported("clock", "Clock")]),
            noop(),
        );
        d.aggregate_methods()
            .apply(|s: &mut Letters, _: &BEvent| s.b += 2);

        let err = assert_err!(d.assert_validity());
        assert_eq!(err.messages.len(), 3);
        assert!(err.messages[0].contains("`clock` of type `Clock`"));
        assert!(err.messages[1].ends_with("no event parameter"));
        assert!(err.messages[2].contains("ambiguous"));
    }

    #[test]
    fn test_valid_dispatcher_passes() {
        assert_ok!(dispatcher().assert_validity());
    }
}
