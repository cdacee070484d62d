use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// An outbound message raised by a projection while it processes a slice.
pub trait Message: fmt::Debug + Send + Sync + 'static {
    fn name(&self) -> &'static str;
}

impl Message for Box<dyn Message> {
    fn name(&self) -> &'static str {
        self.as_ref().name()
    }
}

pub type Metadata = HashMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T>
where
    T: Message,
{
    pub message: T,
    pub metadata: Metadata,
}

/// Type-erased envelope forwarded to the storage batch after a slice is processed.
pub type OutgoingMessage = Envelope<Box<dyn Message>>;

impl<T> Envelope<T>
where
    T: Message,
{
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn set_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn boxed(self) -> OutgoingMessage {
        Envelope {
            message: Box::new(self.message),
            metadata: self.metadata,
        }
    }
}

impl<T> From<T> for Envelope<T>
where
    T: Message,
{
    fn from(message: T) -> Self {
        Envelope {
            message,
            metadata: Metadata::default(),
        }
    }
}

impl<T> PartialEq for Envelope<T>
where
    T: Message + PartialEq,
{
    fn eq(&self, other: &Envelope<T>) -> bool {
        self.message == other.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Notification(pub(crate) &'static str);

    impl Message for Notification {
        fn name(&self) -> &'static str {
            "notification"
        }
    }

    #[test]
    fn test_metadata_does_not_affect_equality() {
        let message = Envelope::from(Notification("trip ended"));

        let tagged = message
            .clone()
            .with_metadata("tenant", "blue")
            .with_metadata("attempt", 1.to_string());

        assert_eq!(message, tagged);
        assert_eq!(tagged.metadata.len(), 2);
    }

    #[test]
    fn test_boxing_keeps_name_and_metadata() {
        let boxed = Envelope::from(Notification("trip ended"))
            .with_metadata("tenant", "blue")
            .boxed();

        assert_eq!(boxed.message.name(), "notification");
        assert_eq!(boxed.metadata.get("tenant").map(String::as_str), Some("blue"));
    }
}
