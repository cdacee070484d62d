use crate::event::Event;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use ulid::Ulid;

/// Key of an aggregate document.
pub trait Identity: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static {
    /// Identity of the stream `event` belongs to, if this identity type can express it.
    fn from_stream(event: &Event) -> Option<Self>;

    /// Identity derived from a tenant id. Only identity types that can hold a tenant id
    /// support rolling aggregates up by tenant.
    fn from_tenant(_tenant_id: &str) -> Option<Self> {
        None
    }

    fn supports_tenant_roll_up() -> bool {
        Self::from_tenant("").is_some()
    }

    fn document_id(&self) -> String {
        self.to_string()
    }
}

impl Identity for Ulid {
    fn from_stream(event: &Event) -> Option<Self> {
        event.stream_id()
    }
}

impl Identity for String {
    fn from_stream(event: &Event) -> Option<Self> {
        event.stream_key().map(str::to_string)
    }

    fn from_tenant(tenant_id: &str) -> Option<Self> {
        Some(tenant_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Ping;

    #[test]
    fn test_ulid_identity_reads_the_stream_id() {
        let id = Ulid::new();
        let event = Event::builder(Ping).stream_id(id).build();
        assert_eq!(Ulid::from_stream(&event), Some(id));
        assert!(!Ulid::supports_tenant_roll_up());
    }

    #[test]
    fn test_string_identity_reads_the_stream_key() {
        let event = Event::builder(Ping).stream_key("cart-9").build();
        assert_eq!(String::from_stream(&event), Some("cart-9".to_string()));
        assert_eq!(String::from_tenant("blue"), Some("blue".to_string()));
        assert!(String::supports_tenant_roll_up());
    }

    #[test]
    fn test_missing_stream_identity() {
        let event = Event::builder(Ping).stream_key("cart-9").build();
        assert_eq!(Ulid::from_stream(&event), None);
    }
}
