//! Cross-document enrichment of slices with one bulk lookup per group.

use crate::event::{Event, EventData};
use crate::serde::Deserializer;
use crate::slicing::error::{Result, SlicingError};
use crate::slicing::group::SliceGroup;
use crate::slicing::identity::Identity;
use crate::storage::DocumentLoader;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Synthetic event placed right after an event whose foreign key resolved to a stored document.
#[derive(Debug)]
pub struct References<D> {
    pub id: String,
    pub entity: Arc<D>,
}

/// Documents found by one enrichment lookup.
pub trait EnrichmentCache<D>: Send + Sync {
    fn find(&self, id: &str) -> Option<Arc<D>>;
}

#[derive(Debug)]
pub struct HashCache<D> {
    entries: HashMap<String, Arc<D>>,
}

impl<D> HashCache<D> {
    pub fn new(entries: HashMap<String, Arc<D>>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<D: Send + Sync> EnrichmentCache<D> for HashCache<D> {
    fn find(&self, id: &str) -> Option<Arc<D>> {
        self.entries.get(id).cloned()
    }
}

/// Stands in when a lookup found nothing, so no slice ever looks anything up again.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

impl<D> EnrichmentCache<D> for NullCache {
    fn find(&self, _id: &str) -> Option<Arc<D>> {
        None
    }
}

#[async_trait]
pub trait Enricher<A, I: Identity>: Send + Sync {
    async fn enrich(&self, group: &mut SliceGroup<A, I>, session: &dyn DocumentLoader) -> Result<()>;
}

type KeySelector<T> = Arc<dyn Fn(&T) -> Option<String> + Send + Sync>;

/// Enriches events of type `T` with the `D` document their key points at.
pub struct EnrichWith<T, D> {
    doc_type: String,
    key: KeySelector<T>,
    codec: Arc<dyn Deserializer<D>>,
}

impl<T, D> EnrichWith<T, D>
where
    T: EventData,
    D: fmt::Debug + Send + Sync + 'static,
{
    pub fn new<F>(doc_type: impl Into<String>, key: F, codec: impl Deserializer<D> + 'static) -> Self
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            doc_type: doc_type.into(),
            key: Arc::new(key),
            codec: Arc::new(codec),
        }
    }

    fn distinct_keys<A, I: Identity>(&self, group: &SliceGroup<A, I>) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for event in group.slices().iter().flat_map(|slice| slice.events()) {
            if let Some(key) = event.data::<T>().and_then(|data| (self.key)(data)) {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    async fn lookup(&self, tenant_id: &str, keys: &[String], session: &dyn DocumentLoader) -> Result<Box<dyn EnrichmentCache<D>>> {
        let documents = session.load_documents(&self.doc_type, tenant_id, keys).await?;
        let mut entries = HashMap::new();
        for document in documents.into_iter().filter(|d| !d.deleted) {
            let entity = self.codec.deserialize(&document.payload).map_err(|source| SlicingError::Decode {
                doc_type: document.doc_type.clone(),
                id: document.id.clone(),
                source,
            })?;
            entries.insert(document.id, Arc::new(entity));
        }
        if entries.is_empty() {
            Ok(Box::new(NullCache))
        } else {
            Ok(Box::new(HashCache::new(entries)))
        }
    }

    fn splice(&self, events: &[Event], cache: &dyn EnrichmentCache<D>) -> Vec<Event> {
        let mut enriched = Vec::with_capacity(events.len());
        for event in events {
            enriched.push(event.clone());
            let key = event.data::<T>().and_then(|data| (self.key)(data));
            if let Some((id, entity)) = key.and_then(|id| cache.find(&id).map(|entity| (id, entity))) {
                enriched.push(event.with_data(References { id, entity }));
            }
        }
        enriched
    }
}

#[async_trait]
impl<A, I, T, D> Enricher<A, I> for EnrichWith<T, D>
where
    A: Send + 'static,
    I: Identity,
    T: EventData,
    D: fmt::Debug + Send + Sync + 'static,
{
    async fn enrich(&self, group: &mut SliceGroup<A, I>, session: &dyn DocumentLoader) -> Result<()> {
        let keys = self.distinct_keys(group);
        if keys.is_empty() {
            return Ok(());
        }
        let cache = self.lookup(group.tenant_id(), &keys, session).await?;
        debug!(
            doc_type = %self.doc_type,
            tenant = %group.tenant_id(),
            keys = keys.len(),
            "enriched slice group"
        );
        for slice in group.slices_mut() {
            let enriched = self.splice(slice.events(), cache.as_ref());
            slice.replace_events(enriched);
        }
        Ok(())
    }
}
