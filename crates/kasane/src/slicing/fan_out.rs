use crate::event::{Event, EventData, EventType};
use std::sync::Arc;

/// When a fan-out rule runs relative to identity grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanOutMode {
    /// Children are grouped by their own identity rules.
    #[default]
    BeforeGrouping,
    /// Children stay in the slice of their parent.
    AfterGrouping,
}

type Expand = Arc<dyn Fn(&Event) -> Vec<Event> + Send + Sync>;

/// Expands events of one type into synthetic child events.
#[derive(Clone)]
pub struct FanOutRule {
    mode: FanOutMode,
    source: EventType,
    expand: Expand,
}

impl FanOutRule {
    pub fn new<T, C, F>(mode: FanOutMode, f: F) -> Self
    where
        T: EventData,
        C: EventData,
        F: Fn(&T) -> Vec<C> + Send + Sync + 'static,
    {
        let expand = move |event: &Event| -> Vec<Event> {
            match event.data::<T>() {
                Some(data) => f(data).into_iter().map(|child| event.with_data(child)).collect(),
                None => Vec::new(),
            }
        };
        Self {
            mode,
            source: EventType::of::<T>(),
            expand: Arc::new(expand),
        }
    }

    pub fn mode(&self) -> FanOutMode {
        self.mode
    }

    pub fn source(&self) -> EventType {
        self.source
    }

    /// Returns `events` sorted by sequence with the children of each matching parent
    /// placed directly after it. Children share the parent's sequence.
    pub fn apply(&self, mut events: Vec<Event>) -> Vec<Event> {
        events.sort_by_key(Event::sequence);
        let mut expanded = Vec::with_capacity(events.len());
        for event in events {
            let children = if event.event_type() == self.source {
                (self.expand)(&event)
            } else {
                Vec::new()
            };
            expanded.push(event);
            expanded.extend(children);
        }
        expanded
    }
}

impl std::fmt::Debug for FanOutRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutRule")
            .field("mode", &self.mode)
            .field("source", &self.source)
            .finish()
    }
}

/// Runs every rule with `mode`, in registration order.
pub fn fan_out(rules: &[FanOutRule], mode: FanOutMode, events: Vec<Event>) -> Vec<Event> {
    rules
        .iter()
        .filter(|rule| rule.mode == mode)
        .fold(events, |events, rule| rule.apply(events))
}
