use crate::daemon::shard::ShardName;
use crate::event::{Event, Sequence};
use crate::projection::SlicedRange;
use crate::storage::DeadLetterEvent;
use std::fmt;

/// One page of events moving through a shard's pipeline: `floor < sequence <= ceiling`.
pub struct EventRange {
    pub shard: ShardName,
    pub floor: Sequence,
    pub ceiling: Sequence,
    pub events: Vec<Event>,
    pub(crate) sliced: Option<Box<dyn SlicedRange>>,
    /// Events already skipped; written with whichever build attempt commits.
    pub dead_letters: Vec<DeadLetterEvent>,
}

impl EventRange {
    pub fn new(shard: ShardName, floor: Sequence, ceiling: Sequence, events: Vec<Event>) -> Self {
        Self {
            shard,
            floor,
            ceiling,
            events,
            sliced: None,
            dead_letters: Vec::new(),
        }
    }

    pub fn is_sliced(&self) -> bool {
        self.sliced.is_some()
    }

    /// Drops every event at `sequence` and records it as a dead letter.
    /// Any slicing done so far is discarded.
    pub fn skip_event(&mut self, event: &Event, error: impl ToString) -> usize {
        let sequence = event.sequence();
        let before = self.events.len();
        self.events.retain(|e| e.sequence() != sequence);
        self.sliced = None;
        self.dead_letters.push(DeadLetterEvent::new(
            self.shard.projection(),
            self.shard.identity(),
            event,
            error,
        ));
        before - self.events.len()
    }
}

impl fmt::Debug for EventRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRange")
            .field("shard", &self.shard.identity())
            .field("floor", &self.floor)
            .field("ceiling", &self.ceiling)
            .field("events", &self.events.len())
            .field("sliced", &self.is_sliced())
            .field("dead_letters", &self.dead_letters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Pinged;

    #[test]
    fn test_skip_event_removes_the_sequence_and_records_one_dead_letter() {
        let events: Vec<Event> = (1..=3).map(|s| Event::builder(Pinged).sequence(s).build()).collect();
        let bad = events[1].clone();
        let mut range = EventRange::new(ShardName::all("Pings", 1), 0, 3, events);

        assert_eq!(range.skip_event(&bad, "boom"), 1);

        assert_eq!(range.events.iter().map(Event::sequence).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(range.dead_letters.len(), 1);
        assert_eq!(range.dead_letters[0].event_sequence, 2);
        assert_eq!(range.dead_letters[0].shard, "Pings:All");
    }
}
