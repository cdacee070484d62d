use crate::event::Event;
use crate::slicing::error::Result;
use crate::slicing::group::{SliceGroup, TenantGroups};
use crate::slicing::identity::Identity;
use crate::storage::DocumentLoader;
use async_trait::async_trait;
use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

/// Splits a batch of events into tenant groups of per-identity slices.
#[async_trait]
pub trait EventSlicer<A, I: Identity>: Send + Sync {
    async fn slice(&self, events: Vec<Event>, session: Arc<dyn DocumentLoader>) -> Result<Vec<SliceGroup<A, I>>>;

    /// Event types the slicer needs on top of the ones the projection handles,
    /// or `None` when it cannot tell and every event must be offered.
    fn event_types(&self) -> Option<Vec<TypeId>> {
        Some(Vec::new())
    }
}

/// One slice per stream per tenant; the identity is the stream's own id or key.
pub struct SingleStreamSlicer<A, I> {
    _marker: PhantomData<fn() -> (A, I)>,
}

impl<A, I: Identity> SingleStreamSlicer<A, I> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }

    pub fn group(&self, events: Vec<Event>) -> Vec<SliceGroup<A, I>> {
        let mut groups = TenantGroups::default();
        for event in events {
            match I::from_stream(&event) {
                Some(id) => groups.group_mut(event.tenant_id()).add_event(&id, event),
                None => warn!(
                    sequence = event.sequence(),
                    event_type = %event.event_type(),
                    "event has no stream identity of the projected type, skipping"
                ),
            }
        }
        let mut groups = groups.into_groups();
        for group in &mut groups {
            group.normalize();
        }
        groups
    }
}

impl<A, I: Identity> Default for SingleStreamSlicer<A, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, I> std::fmt::Debug for SingleStreamSlicer<A, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SingleStreamSlicer")
    }
}

#[async_trait]
impl<A, I> EventSlicer<A, I> for SingleStreamSlicer<A, I>
where
    A: Send + 'static,
    I: Identity,
{
    async fn slice(&self, events: Vec<Event>, _session: Arc<dyn DocumentLoader>) -> Result<Vec<SliceGroup<A, I>>> {
        Ok(self.group(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NoDocuments;
    use ulid::Ulid;

    #[derive(Debug)]
    struct Scanned;

    fn scanned(stream: Ulid, tenant: &str, sequence: u64) -> Event {
        Event::builder(Scanned)
            .stream_id(stream)
            .tenant(tenant)
            .sequence(sequence)
            .build()
    }

    #[tokio::test]
    async fn test_one_slice_per_stream_and_tenant() {
        let (a, b) = (Ulid::new(), Ulid::new());
        let events = vec![
            scanned(a, "blue", 1),
            scanned(b, "blue", 2),
            scanned(a, "red", 3),
            scanned(a, "blue", 4),
        ];

        let slicer = SingleStreamSlicer::<(), Ulid>::new();
        let groups = slicer.slice(events, Arc::new(NoDocuments)).await.unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].tenant_id(), "blue");
        assert_eq!(groups[0].len(), 2);
        let blue_a: Vec<_> = groups[0].get(&a).unwrap().events().iter().map(Event::sequence).collect();
        assert_eq!(blue_a, vec![1, 4]);
        assert_eq!(groups[1].get(&a).unwrap().tenant_id(), "red");
    }

    #[test]
    fn test_every_event_lands_in_exactly_one_slice() {
        let streams: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
        let events: Vec<Event> = (1..=30)
            .map(|seq| scanned(streams[(seq % 3) as usize], if seq % 2 == 0 { "blue" } else { "red" }, seq))
            .collect();

        let groups = SingleStreamSlicer::<(), Ulid>::new().group(events);

        let mut seen: Vec<u64> = groups
            .iter()
            .flat_map(|g| g.slices().iter())
            .flat_map(|s| s.events().iter().map(Event::sequence))
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (1..=30).collect::<Vec<_>>());
    }

    #[test]
    fn test_events_without_a_matching_identity_are_skipped() {
        let events = vec![Event::builder(Scanned).stream_key("k").sequence(1).build()];
        let groups = SingleStreamSlicer::<(), Ulid>::new().group(events);
        assert!(groups.is_empty());
    }
}
