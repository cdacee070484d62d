//! Write-side unit: the events appended to one stream in one transaction.

use crate::event::{Event, EventBuilder, EventData, EventType, Headers, Sequence, Version, DEFAULT_TENANT};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamActionType {
    /// The stream must not exist yet.
    Start,
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamIdentity {
    Id(Ulid),
    Key(String),
}

impl fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Key(key) => f.write_str(key),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream {0} already exists")]
    AlreadyExists(StreamIdentity),
    #[error("unexpected version for stream {stream}: expected {expected}, actual {actual}")]
    UnexpectedVersion {
        stream: StreamIdentity,
        expected: Version,
        actual: Version,
    },
    #[error("no events to append to stream {0}")]
    Empty(StreamIdentity),
}

#[derive(Debug, Clone)]
struct PendingEvent {
    id: Ulid,
    event_type: EventType,
    data: Arc<dyn EventData>,
    headers: Headers,
}

/// A batch of events to append to a single stream.
#[derive(Debug, Clone)]
pub struct StreamAction {
    stream: StreamIdentity,
    tenant_id: String,
    action_type: StreamActionType,
    expected_version: Option<Version>,
    causation_id: Option<String>,
    correlation_id: Option<String>,
    events: Vec<PendingEvent>,
}

impl StreamAction {
    pub fn start(stream: StreamIdentity) -> Self {
        Self::new(stream, StreamActionType::Start)
    }

    pub fn append(stream: StreamIdentity) -> Self {
        Self::new(stream, StreamActionType::Append)
    }

    fn new(stream: StreamIdentity, action_type: StreamActionType) -> Self {
        Self {
            stream,
            tenant_id: DEFAULT_TENANT.to_string(),
            action_type,
            expected_version: None,
            causation_id: None,
            correlation_id: None,
            events: Vec::new(),
        }
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    /// Version the stream must be at before these events are appended.
    pub fn expect_version(mut self, version: Version) -> Self {
        self.expected_version = Some(version);
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

    pub fn with<T: EventData>(self, data: T) -> Self {
        self.with_headers(data, Headers::new())
    }

    pub fn with_headers<T: EventData>(mut self, data: T, headers: Headers) -> Self {
        self.events.push(PendingEvent {
            id: Ulid::new(),
            event_type: EventType::of::<T>(),
            data: Arc::new(data),
            headers,
        });
        self
    }

    pub fn stream(&self) -> &StreamIdentity {
        &self.stream
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn action_type(&self) -> StreamActionType {
        self.action_type
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Checks the action against the stream's current version (`None` when the stream does not exist).
    pub fn validate(&self, current: Option<Version>) -> Result<(), StreamError> {
        if self.events.is_empty() {
            return Err(StreamError::Empty(self.stream.clone()));
        }
        match (self.action_type, current) {
            (StreamActionType::Start, Some(_)) => Err(StreamError::AlreadyExists(self.stream.clone())),
            (StreamActionType::Start, None) => Ok(()),
            (StreamActionType::Append, current) => match self.expected_version {
                Some(expected) if expected != current.unwrap_or(0) => Err(StreamError::UnexpectedVersion {
                    stream: self.stream.clone(),
                    expected,
                    actual: current.unwrap_or(0),
                }),
                _ => Ok(()),
            },
        }
    }

    /// Validates and stamps every pending event with its stream version and global sequence.
    ///
    /// `next_sequence` is the first free global sequence and is advanced past the new events.
    pub fn into_events(
        self,
        current: Option<Version>,
        next_sequence: &mut Sequence,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<Event>, StreamError> {
        self.validate(current)?;
        let mut version = current.unwrap_or(0);
        let mut events = Vec::with_capacity(self.events.len());
        for pending in self.events {
            version += 1;
            let mut builder = EventBuilder::new(pending.event_type, pending.data)
                .id(pending.id)
                .version(version)
                .sequence(*next_sequence)
                .tenant(self.tenant_id.clone())
                .timestamp(timestamp)
                .headers(pending.headers);
            builder = match &self.stream {
                StreamIdentity::Id(id) => builder.stream_id(*id),
                StreamIdentity::Key(key) => builder.stream_key(key.clone()),
            };
            if let Some(causation_id) = &self.causation_id {
                builder = builder.causation_id(causation_id.clone());
            }
            if let Some(correlation_id) = &self.correlation_id {
                builder = builder.correlation_id(correlation_id.clone());
            }
            *next_sequence += 1;
            events.push(builder.build());
        }
        Ok(events)
    }
}
