//! The immutable event envelope read from the log.

use chrono::{DateTime, Utc};
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use ulid::Ulid;

/// Position of an event in the global log. Strictly increasing across the whole log.
pub type Sequence = u64;
/// Position of an event within its stream, starting at 1.
pub type Version = u64;
pub type Headers = HashMap<String, String>;

pub const DEFAULT_TENANT: &str = "*DEFAULT*";

/// Payload carried by an [`Event`]. Implemented for every thread-safe `'static` type.
pub trait EventData: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> EventData for T
where
    T: Any + fmt::Debug + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Runtime identity of an event payload type, or of an interface view over payloads.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventType {
    id: TypeId,
    name: &'static str,
}

impl EventType {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name without its module path, e.g. `TripStarted`.
    pub fn short_name(&self) -> &'static str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        match base.rfind("::") {
            Some(idx) => &self.name[idx + 2..],
            None => self.name,
        }
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Marker appended to a stream when it is archived. Folding stops at this event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archived {
    pub reason: String,
}

impl Archived {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

struct Recorded {
    id: Ulid,
    version: Version,
    sequence: Sequence,
    stream_id: Option<Ulid>,
    stream_key: Option<String>,
    tenant_id: String,
    timestamp: DateTime<Utc>,
    event_type: EventType,
    data: Arc<dyn EventData>,
    headers: Headers,
    causation_id: Option<String>,
    correlation_id: Option<String>,
    is_archived: bool,
}

/// An event as stored in the log.
///
/// Cloning is cheap and yields the same event; [`Event::same`] compares identity,
/// which is what slices de-duplicate on.
#[derive(Clone)]
pub struct Event {
    inner: Arc<Recorded>,
}

impl Event {
    pub fn builder<T: EventData>(data: T) -> EventBuilder {
        EventBuilder::new(EventType::of::<T>(), Arc::new(data))
    }

    pub fn id(&self) -> Ulid {
        self.inner.id
    }

    pub fn version(&self) -> Version {
        self.inner.version
    }

    pub fn sequence(&self) -> Sequence {
        self.inner.sequence
    }

    pub fn stream_id(&self) -> Option<Ulid> {
        self.inner.stream_id
    }

    pub fn stream_key(&self) -> Option<&str> {
        self.inner.stream_key.as_deref()
    }

    pub fn tenant_id(&self) -> &str {
        &self.inner.tenant_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.inner.timestamp
    }

    pub fn event_type(&self) -> EventType {
        self.inner.event_type
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.inner.causation_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.inner.correlation_id.as_deref()
    }

    pub fn is_archived(&self) -> bool {
        self.inner.is_archived
    }

    pub fn is<T: EventData>(&self) -> bool {
        self.inner.event_type.id() == TypeId::of::<T>()
    }

    /// The payload, if it is a `T`.
    pub fn data<T: EventData>(&self) -> Option<&T> {
        self.data_any().downcast_ref::<T>()
    }

    /// Shared ownership of the payload, for handlers that outlive the borrow of the event.
    pub fn data_arc<T: EventData>(&self) -> Option<Arc<T>> {
        self.inner.data.clone().into_any_arc().downcast::<T>().ok()
    }

    pub fn data_any(&self) -> &dyn Any {
        (*self.inner.data).as_any()
    }

    pub fn raw_data(&self) -> Arc<dyn EventData> {
        self.inner.data.clone()
    }

    /// A new event carrying `data` and every piece of this event's metadata.
    pub fn with_data<T: EventData>(&self, data: T) -> Event {
        self.with_raw_data(EventType::of::<T>(), Arc::new(data))
    }

    pub(crate) fn with_raw_data(&self, event_type: EventType, data: Arc<dyn EventData>) -> Event {
        let source = &self.inner;
        Event {
            inner: Arc::new(Recorded {
                id: source.id,
                version: source.version,
                sequence: source.sequence,
                stream_id: source.stream_id,
                stream_key: source.stream_key.clone(),
                tenant_id: source.tenant_id.clone(),
                timestamp: source.timestamp,
                event_type,
                data,
                headers: source.headers.clone(),
                causation_id: source.causation_id.clone(),
                correlation_id: source.correlation_id.clone(),
                is_archived: source.is_archived,
            }),
        }
    }

    pub fn same(a: &Event, b: &Event) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Equal for two handles exactly when [`Event::same`] holds.
    pub(crate) fn identity_key(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("sequence", &self.inner.sequence)
            .field("version", &self.inner.version)
            .field("type", &self.inner.event_type)
            .field("tenant", &self.inner.tenant_id)
            .field("stream_id", &self.inner.stream_id)
            .field("stream_key", &self.inner.stream_key)
            .field("data", &self.inner.data)
            .finish()
    }
}

pub struct EventBuilder {
    event_type: EventType,
    data: Arc<dyn EventData>,
    id: Option<Ulid>,
    version: Version,
    sequence: Sequence,
    stream_id: Option<Ulid>,
    stream_key: Option<String>,
    tenant_id: String,
    timestamp: Option<DateTime<Utc>>,
    headers: Headers,
    causation_id: Option<String>,
    correlation_id: Option<String>,
    is_archived: bool,
}

impl EventBuilder {
    pub(crate) fn new(event_type: EventType, data: Arc<dyn EventData>) -> Self {
        Self {
            event_type,
            data,
            id: None,
            version: 0,
            sequence: 0,
            stream_id: None,
            stream_key: None,
            tenant_id: DEFAULT_TENANT.to_string(),
            timestamp: None,
            headers: Headers::new(),
            causation_id: None,
            correlation_id: None,
            is_archived: false,
        }
    }

    pub fn id(mut self, id: Ulid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn stream_id(mut self, stream_id: Ulid) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    pub fn stream_key(mut self, stream_key: impl Into<String>) -> Self {
        self.stream_key = Some(stream_key.into());
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn archived(mut self, is_archived: bool) -> Self {
        self.is_archived = is_archived;
        self
    }

    pub fn build(self) -> Event {
        Event {
            inner: Arc::new(Recorded {
                id: self.id.unwrap_or_else(Ulid::new),
                version: self.version,
                sequence: self.sequence,
                stream_id: self.stream_id,
                stream_key: self.stream_key,
                tenant_id: self.tenant_id,
                timestamp: self.timestamp.unwrap_or_else(Utc::now),
                event_type: self.event_type,
                data: self.data,
                headers: self.headers,
                causation_id: self.causation_id,
                correlation_id: self.correlation_id,
                is_archived: self.is_archived,
            }),
        }
    }
}

/// Sorts events by ascending sequence (stable) and drops repeated references to the same event.
pub fn normalize(events: &mut Vec<Event>) {
    let mut seen = HashSet::with_capacity(events.len());
    events.retain(|event| seen.insert(event.identity_key()));
    events.sort_by_key(Event::sequence);
}
