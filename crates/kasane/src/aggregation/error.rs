use crate::dispatch::{BoxError, DispatchError};
use crate::event::{Event, EventType, Sequence};
use crate::persist::PersistenceError;
use crate::serde::SerdeError;
use crate::slicing::SlicingError;
use std::error::Error as StdError;
use std::sync::Arc;

/// A permanent failure to apply one event, kept with the event so it can be dead-lettered.
#[derive(Debug, thiserror::Error)]
#[error("failed to apply {} at sequence {} to {aggregate} {id}: {source}", .event.event_type(), .event.sequence())]
pub struct ApplyEventError {
    pub event: Event,
    pub aggregate: &'static str,
    pub id: String,
    #[source]
    pub source: DispatchError,
}

#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    /// Worth retrying as is; nothing is dead-lettered.
    #[error("transient failure applying {event_type} at sequence {sequence}: {source}")]
    Transient {
        event_type: EventType,
        sequence: Sequence,
        #[source]
        source: DispatchError,
    },
    #[error(transparent)]
    ApplyEvent(#[from] ApplyEventError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("side effects failed: {0}")]
    SideEffects(BoxError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerdeError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Slicing(#[from] SlicingError),
}

impl AggregationError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::Persistence(err) => matches!(err, PersistenceError::ConnectionError(_)),
            Self::Slicing(SlicingError::Enrichment(err)) => matches!(err, PersistenceError::ConnectionError(_)),
            _ => false,
        }
    }

    /// The event to dead-letter, when this is a permanent failure of one event.
    pub fn failed_event(&self) -> Option<&Event> {
        match self {
            Self::ApplyEvent(err) => Some(&err.event),
            _ => None,
        }
    }

    pub fn is_out_of_order(&self) -> bool {
        matches!(self, Self::Persistence(err) if err.is_out_of_order())
    }
}

pub type Result<T> = std::result::Result<T, AggregationError>;

type Predicate = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

/// Decides which handler errors are transient. Everything else is permanent.
#[derive(Clone, Default)]
pub struct ProjectionErrors {
    transient: Vec<Predicate>,
}

impl ProjectionErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treats any error of type `E` anywhere in a handler's error chain as transient.
    pub fn transient<E: StdError + 'static>(&mut self) -> &mut Self {
        self.transient.push(Arc::new(|err: &(dyn StdError + 'static)| err.is::<E>()));
        self
    }

    pub fn transient_when<F>(&mut self, predicate: F) -> &mut Self
    where
        F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        self.transient.push(Arc::new(predicate));
        self
    }

    pub fn is_transient(&self, err: &DispatchError) -> bool {
        let Some(handler) = err.handler_error() else {
            return false;
        };
        let handler: &(dyn StdError + 'static) = handler;
        let mut current = Some(handler);
        while let Some(err) = current {
            if self.transient.iter().any(|p| p(err)) {
                return true;
            }
            current = err.source();
        }
        false
    }

    pub(crate) fn classify(&self, err: DispatchError, event: &Event, aggregate: &'static str, id: String) -> AggregationError {
        if self.is_transient(&err) {
            AggregationError::Transient {
                event_type: event.event_type(),
                sequence: event.sequence(),
                source: err,
            }
        } else {
            AggregationError::ApplyEvent(ApplyEventError {
                event: event.clone(),
                aggregate,
                id,
                source: err,
            })
        }
    }
}

impl std::fmt::Debug for ProjectionErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionErrors")
            .field("transient", &self.transient.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Charged;

    #[derive(Debug, thiserror::Error)]
    #[error("gateway timed out")]
    struct GatewayTimeout;

    #[derive(Debug, thiserror::Error)]
    #[error("charge failed")]
    struct ChargeFailed(#[source] GatewayTimeout);

    fn handler_error(source: BoxError) -> DispatchError {
        DispatchError::Handler {
            event_type: EventType::of::<Charged>(),
            source,
        }
    }

    #[test]
    fn test_registered_types_are_transient_anywhere_in_the_chain() {
        let mut errors = ProjectionErrors::new();
        errors.transient::<GatewayTimeout>();

        assert!(errors.is_transient(&handler_error(Box::new(GatewayTimeout))));
        assert!(errors.is_transient(&handler_error(Box::new(ChargeFailed(GatewayTimeout)))));
        assert!(!errors.is_transient(&handler_error("bad amount".into())));
    }

    #[test]
    fn test_classify_wraps_permanent_errors_with_the_event() {
        let errors = ProjectionErrors::new();
        let event = Event::builder(Charged).sequence(12).build();

        let err = errors.classify(handler_error("bad amount".into()), &event, "Invoice", "inv-1".to_string());
        assert!(!err.is_transient());
        assert_eq!(err.failed_event().map(Event::sequence), Some(12));
        assert_eq!(
            err.to_string(),
            "failed to apply Charged at sequence 12 to Invoice inv-1: handler for Charged failed: bad amount"
        );
    }

    #[test]
    fn test_classify_transient() {
        let mut errors = ProjectionErrors::new();
        errors.transient_when(|err| err.to_string().contains("timed out"));
        let event = Event::builder(Charged).sequence(3).build();

        let err = errors.classify(handler_error(Box::new(GatewayTimeout)), &event, "Invoice", "inv-1".to_string());
        assert!(err.is_transient());
        assert!(err.failed_event().is_none());
    }

    #[test]
    fn test_cannot_start_is_never_transient() {
        let mut errors = ProjectionErrors::new();
        errors.transient_when(|_| true);
        let err = DispatchError::CannotStart {
            aggregate: "Invoice",
            projection: "Invoices".to_string(),
            event_type: EventType::of::<Charged>(),
        };
        assert!(!errors.is_transient(&err));
    }
}
