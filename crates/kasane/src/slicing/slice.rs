use crate::aggregation::ActionType;
use crate::event::{self, Event, Sequence};
use crate::message::OutgoingMessage;
use crate::stream::StreamAction;
use std::collections::HashSet;

/// The ordered events of one (tenant, identity) pair and the working snapshot they fold into.
#[derive(Debug)]
pub struct EventSlice<A, I> {
    id: I,
    tenant_id: String,
    events: Vec<Event>,
    seen: HashSet<usize>,
    /// Snapshot loaded from storage before folding, replaced by the fold result.
    pub snapshot: Option<A>,
    /// Whether the stored snapshot was soft-deleted when it was loaded.
    pub snapshot_deleted: bool,
    raised: Vec<StreamAction>,
    messages: Vec<OutgoingMessage>,
    action: Option<ActionType>,
    last_applied: Option<Event>,
}

impl<A, I> EventSlice<A, I> {
    pub fn new(id: I, tenant_id: impl Into<String>) -> Self {
        Self {
            id,
            tenant_id: tenant_id.into(),
            events: Vec::new(),
            seen: HashSet::new(),
            snapshot: None,
            snapshot_deleted: false,
            raised: Vec::new(),
            messages: Vec::new(),
            action: None,
            last_applied: None,
        }
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = Event>) -> Self {
        self.add_events(events);
        self
    }

    pub fn id(&self) -> &I {
        &self.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn add_event(&mut self, event: Event) {
        if self.seen.insert(event.identity_key()) {
            self.events.push(event);
        }
    }

    pub fn add_events(&mut self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.add_event(event);
        }
    }

    pub fn contains(&self, event: &Event) -> bool {
        self.seen.contains(&event.identity_key())
    }

    pub(crate) fn replace_events(&mut self, events: Vec<Event>) {
        self.events = events;
        self.normalize();
        self.reindex();
    }

    fn reindex(&mut self) {
        self.seen = self.events.iter().map(Event::identity_key).collect();
    }

    /// De-duplicates the events and re-sorts them by sequence.
    pub fn normalize(&mut self) {
        event::normalize(&mut self.events);
    }

    /// Drops every event with `sequence`, returning how many were removed.
    pub fn remove_sequence(&mut self, sequence: Sequence) -> usize {
        let before = self.events.len();
        self.events.retain(|e| e.sequence() != sequence);
        let removed = before - self.events.len();
        if removed > 0 {
            self.reindex();
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last_event(&self) -> Option<&Event> {
        self.events.last()
    }

    /// Queues events to append to the log once the slice's batch commits.
    pub fn append_events(&mut self, action: StreamAction) {
        self.raised.push(action);
    }

    pub fn publish_message(&mut self, message: OutgoingMessage) {
        self.messages.push(message);
    }

    pub fn raised_events(&self) -> &[StreamAction] {
        &self.raised
    }

    pub fn messages(&self) -> &[OutgoingMessage] {
        &self.messages
    }

    pub fn drain_raised(&mut self) -> Vec<StreamAction> {
        std::mem::take(&mut self.raised)
    }

    pub fn drain_messages(&mut self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut self.messages)
    }

    pub fn action(&self) -> Option<ActionType> {
        self.action
    }

    pub(crate) fn set_action(&mut self, action: ActionType) {
        self.action = Some(action);
    }

    /// The last event the fold actually applied, which may precede [`EventSlice::last_event`]
    /// when folding stopped early.
    pub fn last_applied(&self) -> Option<&Event> {
        self.last_applied.as_ref()
    }

    pub(crate) fn set_last_applied(&mut self, event: Option<Event>) {
        self.last_applied = event;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::stream::StreamIdentity;

    #[derive(Debug)]
    struct Moved(u32);

    #[derive(Debug)]
    struct Alert;

    impl Message for Alert {
        fn name(&self) -> &'static str {
            "alert"
        }
    }

    fn moved(sequence: Sequence) -> Event {
        Event::builder(Moved(sequence as u32)).sequence(sequence).build()
    }

    #[test]
    fn test_add_event_ignores_the_same_event_twice() {
        let e = moved(1);
        let mut slice = EventSlice::<(), String>::new("a".to_string(), "*DEFAULT*");
        slice.add_event(e.clone());
        slice.add_event(e);
        assert_eq!(slice.events().len(), 1);
    }

    #[test]
    fn test_removed_events_can_be_added_again() {
        let e = moved(2);
        let mut slice = EventSlice::<(), String>::new("a".to_string(), "*DEFAULT*").with_events([moved(1), e.clone()]);
        assert!(slice.contains(&e));

        slice.remove_sequence(2);
        assert!(!slice.contains(&e));
        slice.add_event(e.clone());
        assert_eq!(slice.events().len(), 2);
    }

    #[test]
    fn test_thousands_of_events_deduplicate_by_identity() {
        let events: Vec<Event> = (1..=10_000).rev().map(moved).collect();
        let mut slice = EventSlice::<(), String>::new("a".to_string(), "*DEFAULT*").with_events(events.iter().cloned());
        slice.add_events(events.iter().step_by(3).cloned());
        slice.replace_events(events.iter().chain(events.iter()).cloned().collect());

        assert_eq!(slice.events().len(), 10_000);
        assert_eq!(slice.events().first().map(Event::sequence), Some(1));
        assert!(events.iter().all(|e| slice.contains(e)));
    }

    #[test]
    fn test_normalize_sorts_by_sequence() {
        let mut slice = EventSlice::<(), String>::new("a".to_string(), "*DEFAULT*").with_events([moved(3), moved(1), moved(2)]);
        slice.normalize();
        let order: Vec<_> = slice.events().iter().map(Event::sequence).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_remove_sequence() {
        let mut slice = EventSlice::<(), String>::new("a".to_string(), "blue").with_events([moved(1), moved(2)]);
        assert_eq!(slice.remove_sequence(2), 1);
        assert_eq!(slice.remove_sequence(7), 0);
        assert_eq!(slice.events().len(), 1);
        assert_eq!(slice.tenant_id(), "blue");
    }

    #[test]
    fn test_side_effects_are_drained_once() {
        let mut slice = EventSlice::<(), String>::new("a".to_string(), "*DEFAULT*");
        slice.append_events(StreamAction::append(StreamIdentity::Key("other".to_string())).with(Moved(1)));
        slice.publish_message(crate::message::Envelope::from(Alert).boxed());

        assert_eq!(slice.drain_raised().len(), 1);
        assert_eq!(slice.drain_messages().len(), 1);
        assert!(slice.drain_raised().is_empty());
        assert!(slice.messages().is_empty());
    }
}
