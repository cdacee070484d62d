use crate::dispatch::BoxError;
use crate::persist::PersistenceError;
use crate::serde::SerdeError;

#[derive(Debug, thiserror::Error)]
pub enum SlicingError {
    #[error("failed to load documents for enrichment: {0}")]
    Enrichment(#[from] PersistenceError),
    #[error("failed to decode enrichment document {doc_type}/{id}: {source}")]
    Decode {
        doc_type: String,
        id: String,
        #[source]
        source: SerdeError,
    },
    #[error("custom grouper failed: {0}")]
    Grouper(BoxError),
    #[error("{identity} cannot be derived from a tenant id; roll-up by tenant needs a string identity")]
    TenantRollUp { identity: &'static str },
}

pub type Result<T> = std::result::Result<T, SlicingError>;
