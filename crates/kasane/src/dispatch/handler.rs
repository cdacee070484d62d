use crate::cancel::CancelToken;
use crate::dispatch::error::BoxError;
use crate::event::{Event, DEFAULT_TENANT};
use crate::storage::{DocumentLoader, NoDocuments};
use futures::future::BoxFuture;
use std::sync::Arc;

/// What a handler can reach besides the event and snapshot.
#[derive(Clone)]
pub struct ApplyContext {
    pub tenant_id: String,
    pub session: Arc<dyn DocumentLoader>,
    pub cancel: CancelToken,
}

impl ApplyContext {
    pub fn new(tenant_id: impl Into<String>, session: Arc<dyn DocumentLoader>, cancel: CancelToken) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            session,
            cancel,
        }
    }

    /// A context with no storage behind it, for live aggregation and tests.
    pub fn detached() -> Self {
        Self::new(DEFAULT_TENANT, Arc::new(NoDocuments), CancelToken::new())
    }

    pub fn for_tenant(&self, tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            session: self.session.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl std::fmt::Debug for ApplyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyContext")
            .field("tenant_id", &self.tenant_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

pub type HandlerResult<T> = std::result::Result<T, BoxError>;
pub type HandlerFuture<T> = BoxFuture<'static, HandlerResult<T>>;

/// Builds a new snapshot from the first event of a slice.
pub type Creator<A> = Arc<dyn Fn(Event, ApplyContext) -> HandlerFuture<A> + Send + Sync>;
/// Folds one event into a snapshot. `None` deletes the snapshot.
pub type Applier<A> = Arc<dyn Fn(A, Event, ApplyContext) -> HandlerFuture<Option<A>> + Send + Sync>;
pub type Deleter<A> = Arc<dyn Fn(&A, &Event) -> HandlerResult<bool> + Send + Sync>;

/// A type-erased handler body, paired with a descriptor when registered.
pub enum MethodBody<A> {
    Create(Creator<A>),
    Apply(Applier<A>),
    ShouldDelete(Deleter<A>),
}

impl<A> Clone for MethodBody<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Create(f) => Self::Create(f.clone()),
            Self::Apply(f) => Self::Apply(f.clone()),
            Self::ShouldDelete(f) => Self::ShouldDelete(f.clone()),
        }
    }
}

impl<A: Send + 'static> MethodBody<A> {
    pub fn create<F, Fut>(f: F) -> Self
    where
        F: Fn(Event, ApplyContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult<A>> + Send + 'static,
    {
        Self::Create(Arc::new(move |event: Event, ctx: ApplyContext| -> HandlerFuture<A> {
            Box::pin(f(event, ctx))
        }))
    }

    pub fn apply<F, Fut>(f: F) -> Self
    where
        F: Fn(A, Event, ApplyContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult<Option<A>>> + Send + 'static,
    {
        Self::Apply(Arc::new(
            move |snapshot: A, event: Event, ctx: ApplyContext| -> HandlerFuture<Option<A>> {
                Box::pin(f(snapshot, event, ctx))
            },
        ))
    }

    pub fn should_delete<F>(f: F) -> Self
    where
        F: Fn(&A, &Event) -> HandlerResult<bool> + Send + Sync + 'static,
    {
        Self::ShouldDelete(Arc::new(f))
    }
}
