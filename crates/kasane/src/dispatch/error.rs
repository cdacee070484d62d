use crate::event::EventType;
use std::fmt;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("cannot start aggregate {aggregate} from event {event_type} in projection {projection}")]
    CannotStart {
        aggregate: &'static str,
        projection: String,
        event_type: EventType,
    },
    #[error("handler for {expected} received a {actual} payload")]
    PayloadMismatch { expected: &'static str, actual: EventType },
    #[error("handler for {event_type} failed: {source}")]
    Handler {
        event_type: EventType,
        #[source]
        source: BoxError,
    },
}

impl DispatchError {
    /// The error raised by user code, if this wraps one.
    pub fn handler_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Handler { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Every reason a projection definition cannot be used, collected in one error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidProjection {
    pub projection: String,
    pub messages: Vec<String>,
}

impl fmt::Display for InvalidProjection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projection {} is invalid:", self.projection)?;
        for message in &self.messages {
            write!(f, "\n  - {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for InvalidProjection {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Started;

    #[test]
    fn test_invalid_projection_lists_every_message() {
        let err = InvalidProjection {
            projection: "Trips".to_string(),
            messages: vec!["first".to_string(), "second".to_string()],
        };
        assert_eq!(err.to_string(), "projection Trips is invalid:\n  - first\n  - second");
    }

    #[test]
    fn test_handler_error_is_exposed() {
        let err = DispatchError::Handler {
            event_type: EventType::of::<Started>(),
            source: "bad data".into(),
        };
        assert_eq!(err.handler_error().map(ToString::to_string), Some("bad data".to_string()));
        assert_eq!(err.to_string(), "handler for Started failed: bad data");
    }
}
