//! Registry of event types and the supertype/interface views they can be read through.
//!
//! Rust has no runtime subtyping, so "event `C` is also an `S`" is declared once with a
//! cast function. Handlers registered against `S` then receive every `C` through that cast.

use crate::cache::SharedMap;
use crate::event::{Event, EventData, EventType};
use std::any::{Any, TypeId};
use std::sync::Arc;

type ViewFn<S> = Box<dyn for<'a> Fn(&'a (dyn Any + 'static)) -> Option<&'a S> + Send + Sync>;

fn view_fn<S, F>(f: F) -> F
where
    S: ?Sized,
    F: for<'a> Fn(&'a (dyn Any + 'static)) -> Option<&'a S>,
{
    f
}

#[derive(Default)]
pub struct EventCatalog {
    known: SharedMap<TypeId, EventType>,
    ancestors: SharedMap<TypeId, Arc<Vec<EventType>>>,
    views: SharedMap<(TypeId, TypeId), Arc<dyn Any + Send + Sync>>,
}

impl EventCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: EventData>(&self) -> EventType {
        let event_type = EventType::of::<T>();
        self.known.get_or_insert_with(event_type.id(), || event_type)
    }

    /// Declares that every `C` can be read as an `S`.
    ///
    /// `S` may be a trait object (`dyn Trait`) or a concrete "base" payload embedded in `C`.
    /// Ancestors are kept in declaration order; that order decides which handler wins when
    /// several ancestors of one event type have handlers.
    pub fn declare<C, S>(&self, cast: fn(&C) -> &S) -> &Self
    where
        C: EventData,
        S: ?Sized + 'static,
    {
        let concrete = self.register::<C>();
        let ancestor = EventType::of::<S>();
        let view: ViewFn<S> = Box::new(view_fn(move |any: &(dyn Any + 'static)| {
            any.downcast_ref::<C>().map(cast)
        }));
        self.views
            .insert((concrete.id(), ancestor.id()), Arc::new(view) as Arc<dyn Any + Send + Sync>);

        let mut list = self
            .ancestors
            .get(&concrete.id())
            .map(|list| list.as_ref().clone())
            .unwrap_or_default();
        if !list.contains(&ancestor) {
            list.push(ancestor);
        }
        self.ancestors.insert(concrete.id(), Arc::new(list));
        self
    }

    pub fn ancestors_of(&self, event_type: TypeId) -> Arc<Vec<EventType>> {
        self.ancestors.get(&event_type).unwrap_or_default()
    }

    pub fn is_declared<C: EventData, S: ?Sized + 'static>(&self) -> bool {
        self.views.contains_key(&(TypeId::of::<C>(), TypeId::of::<S>()))
    }

    /// Reads the payload of `event` as an `S` through a declared view.
    pub fn view<'e, S: ?Sized + 'static>(&self, event: &'e Event) -> Option<&'e S> {
        let erased = self.views.get(&(event.event_type().id(), TypeId::of::<S>()))?;
        let view = erased.downcast_ref::<ViewFn<S>>()?;
        view(event.data_any())
    }

    /// The payload itself when it is a `T`, otherwise a declared view of it as `T`.
    pub fn resolve<'e, T: EventData>(&self, event: &'e Event) -> Option<&'e T> {
        event.data::<T>().or_else(|| self.view::<T>(event))
    }

    pub fn known_types(&self) -> Vec<EventType> {
        self.known.values()
    }

    pub fn find_by_name(&self, name: &str) -> Option<EventType> {
        self.known
            .values()
            .into_iter()
            .find(|ty| ty.name() == name || ty.short_name() == name)
    }
}

impl std::fmt::Debug for EventCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCatalog")
            .field("known", &self.known.len())
            .field("views", &self.views.len())
            .finish()
    }
}
