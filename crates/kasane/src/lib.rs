//! Kasane folds an append-only event log into materialized aggregate views.
//!
//! Events are grouped into slices per document, folded through an [`AggregationRunner`]
//! and written as document operations, either in the same write as the events
//! ([`InlineProjections`]) or behind the log by the [`ProjectionDaemon`].

pub mod aggregation;
pub mod cache;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod event;
pub mod inline;
pub mod mem_store;
pub mod message;
pub mod persist;
pub mod progress;
pub mod projection;
pub mod serde;
pub mod slicing;
pub mod storage;
pub mod stream;

pub use aggregation::{ActionType, AggregationError, AggregationRunner, ExecutionMode, SnapshotAction, VersionSource};
pub use cancel::CancelToken;
pub use catalog::EventCatalog;
pub use config::{ConfigError, DaemonSettings, SliceBehavior};
pub use daemon::{DaemonError, ProjectionDaemon, ShardName};
pub use dispatch::{AggregateDispatcher, ApplyContext, BoxError};
pub use event::{Event, EventData, EventType, Sequence, Version, DEFAULT_TENANT};
pub use inline::InlineProjections;
pub use mem_store::MemoryStore;
pub use persist::PersistenceError;
pub use progress::{ShardState, ShardStateTracker};
pub use projection::{AggregateProjection, Projection, ProjectionLifecycle};
pub use slicing::{EventSlice, EventSlicer, Identity};
pub use storage::{DaemonStorage, EventFilter};
pub use stream::StreamAction;
