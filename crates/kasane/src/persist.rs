use crate::{event::Sequence, serde};

/// Errors raised by the storage collaborator behind the projection core.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Another writer moved the progress of this shard; blind retry would corrupt state.
    #[error("progress for {shard} is out of order: expected {expected}, found {actual:?}")]
    ProgressOutOfOrder {
        shard: String,
        expected: Sequence,
        actual: Option<Sequence>,
    },
    #[error("optimistic concurrency conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    ConnectionError(Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("{0}")]
    SerializationError(Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("{0}")]
    UnknownError(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl PersistenceError {
    pub fn is_out_of_order(&self) -> bool {
        matches!(self, Self::ProgressOutOfOrder { .. })
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        match err.classify() {
            serde_json::error::Category::Data | serde_json::error::Category::Syntax => {
                Self::SerializationError(Box::new(err))
            }
            serde_json::error::Category::Io | serde_json::error::Category::Eof => Self::UnknownError(Box::new(err)),
        }
    }
}

impl From<serde::SerdeError> for PersistenceError {
    fn from(err: serde::SerdeError) -> Self {
        match err {
            serde::SerdeError::ConversionError(msg) => Self::SerializationError(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                msg,
            ))),
            serde::SerdeError::JsonError(err) => Self::from(err),
            serde::SerdeError::ProtobufDeserializationError(err) => Self::SerializationError(Box::new(err)),
        }
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_syntax_errors_are_serialization_errors() {
        let err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err: PersistenceError = err.into();
        assert!(matches!(err, PersistenceError::SerializationError(_)));
    }

    #[test]
    fn test_json_eof_is_unknown() {
        let err = serde_json::from_str::<serde_json::Value>("").unwrap_err();
        let err: PersistenceError = err.into();
        assert!(matches!(err, PersistenceError::UnknownError(_)));
    }

    #[test]
    fn test_conversion_errors_keep_their_message() {
        let err: PersistenceError = serde::SerdeError::ConversionError("bad enum tag".to_string()).into();
        assert_eq!(err.to_string(), "bad enum tag");
    }

    #[test]
    fn test_out_of_order_is_detected() {
        let err = PersistenceError::ProgressOutOfOrder {
            shard: "Trips:All".to_string(),
            expected: 10,
            actual: Some(20),
        };
        assert!(err.is_out_of_order());
        assert_eq!(
            err.to_string(),
            "progress for Trips:All is out of order: expected 10, found Some(20)"
        );
    }
}
