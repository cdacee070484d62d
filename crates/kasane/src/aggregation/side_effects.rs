use crate::dispatch::{ApplyContext, BoxError};
use crate::slicing::EventSlice;
use crate::storage::ProjectionBatch;
use async_trait::async_trait;
use tracing::debug;

/// Hook run after a slice is folded, in continuous mode only.
///
/// Implementations read `slice.snapshot` and queue follow-up work with
/// [`EventSlice::append_events`] or [`EventSlice::publish_message`].
#[async_trait]
pub trait SideEffects<A, I>: Send + Sync {
    async fn raise(&self, slice: &mut EventSlice<A, I>, ctx: &ApplyContext) -> Result<(), BoxError>;
}

#[async_trait]
impl<A, I, F> SideEffects<A, I> for F
where
    A: Send + 'static,
    I: Send + 'static,
    F: Fn(&mut EventSlice<A, I>) -> Result<(), BoxError> + Send + Sync,
{
    async fn raise(&self, slice: &mut EventSlice<A, I>, _ctx: &ApplyContext) -> Result<(), BoxError> {
        self(slice)
    }
}

/// Moves everything a slice raised into `batch`. Returns how many items were forwarded.
pub fn forward_side_effects<A, I>(slice: &mut EventSlice<A, I>, batch: &mut dyn ProjectionBatch) -> usize {
    let raised = slice.drain_raised();
    let messages = slice.drain_messages();
    let forwarded = raised.len() + messages.len();
    for action in raised {
        batch.append_events(action);
    }
    for message in messages {
        batch.publish(message);
    }
    if forwarded > 0 {
        debug!(forwarded, "forwarded side effects to batch");
    }
    forwarded
}
