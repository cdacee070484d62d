use crate::catalog::EventCatalog;
use crate::dispatch::BoxError;
use crate::event::{self, Event, EventData, DEFAULT_TENANT};
use crate::slicing::enrichment::{EnrichWith, Enricher};
use crate::slicing::error::{Result, SlicingError};
use crate::slicing::fan_out::{fan_out, FanOutMode, FanOutRule};
use crate::slicing::group::{SliceGroup, TenantGroups};
use crate::slicing::identity::Identity;
use crate::slicing::single_stream::EventSlicer;
use crate::serde::Deserializer;
use crate::storage::DocumentLoader;
use async_trait::async_trait;
use std::any::TypeId;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// How events of different tenants are grouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TenancyGrouping {
    /// One group per tenant; aggregates never mix tenants.
    #[default]
    PerTenant,
    /// One group for all tenants; handlers deal with tenancy themselves.
    AcrossTenants,
    /// The tenant id is the aggregate identity.
    RollUpByTenant,
}

/// Identity assignments made by a [`CustomGrouper`].
#[derive(Debug)]
pub struct EventGrouping<I> {
    assignments: Vec<(I, Event)>,
}

impl<I> Default for EventGrouping<I> {
    fn default() -> Self {
        Self {
            assignments: Vec::new(),
        }
    }
}

impl<I: Identity> EventGrouping<I> {
    pub fn add_event(&mut self, id: I, event: &Event) {
        self.assignments.push((id, event.clone()));
    }

    pub fn add_events<'e>(&mut self, id: I, events: impl IntoIterator<Item = &'e Event>) {
        for event in events {
            self.add_event(id.clone(), event);
        }
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// Free-form grouping logic, e.g. one that looks identities up in other documents.
#[async_trait]
pub trait CustomGrouper<I: Identity>: Send + Sync {
    async fn group(
        &self,
        session: &dyn DocumentLoader,
        events: &[Event],
        grouping: &mut EventGrouping<I>,
    ) -> std::result::Result<(), BoxError>;
}

type IdentityRule<I> = Arc<dyn Fn(&EventCatalog, &Event) -> Vec<I> + Send + Sync>;

/// Groups events from many streams into aggregates by identities read from the events.
pub struct MultiStreamSlicer<A, I: Identity> {
    catalog: Arc<EventCatalog>,
    rules: Vec<IdentityRule<I>>,
    groupers: Vec<Arc<dyn CustomGrouper<I>>>,
    fan_outs: Vec<FanOutRule>,
    enrichers: Vec<Arc<dyn Enricher<A, I>>>,
    tenancy: TenancyGrouping,
    source_types: Option<Vec<TypeId>>,
    _marker: PhantomData<fn() -> A>,
}

impl<A, I> MultiStreamSlicer<A, I>
where
    A: Send + 'static,
    I: Identity,
{
    pub fn new(catalog: Arc<EventCatalog>) -> Self {
        Self {
            catalog,
            rules: Vec::new(),
            groupers: Vec::new(),
            fan_outs: Vec::new(),
            enrichers: Vec::new(),
            tenancy: TenancyGrouping::default(),
            source_types: Some(Vec::new()),
            _marker: PhantomData,
        }
    }

    /// Assigns every `T` (or event viewable as `T`) to the aggregate `f` names.
    pub fn identity<T, F>(&mut self, f: F) -> &mut Self
    where
        T: EventData,
        F: Fn(&T) -> I + Send + Sync + 'static,
    {
        self.source::<T>();
        self.rules.push(Arc::new(move |catalog: &EventCatalog, event: &Event| -> Vec<I> {
            catalog.resolve::<T>(event).map(|data| vec![f(data)]).unwrap_or_default()
        }));
        self
    }

    /// Assigns every `T` to each aggregate `f` names.
    pub fn identities<T, F>(&mut self, f: F) -> &mut Self
    where
        T: EventData,
        F: Fn(&T) -> Vec<I> + Send + Sync + 'static,
    {
        self.source::<T>();
        self.rules.push(Arc::new(move |catalog: &EventCatalog, event: &Event| -> Vec<I> {
            catalog.resolve::<T>(event).map(&f).unwrap_or_default()
        }));
        self
    }

    /// Assigns every event declared as viewable as an `S`.
    pub fn identity_as<S, F>(&mut self, f: F) -> &mut Self
    where
        S: ?Sized + 'static,
        F: Fn(&S) -> I + Send + Sync + 'static,
    {
        self.source_types = None;
        self.rules.push(Arc::new(move |catalog: &EventCatalog, event: &Event| -> Vec<I> {
            catalog.view::<S>(event).map(|data| vec![f(data)]).unwrap_or_default()
        }));
        self
    }

    /// Custom groupers see every event, so the shard filter is lifted.
    pub fn custom_grouper(&mut self, grouper: impl CustomGrouper<I> + 'static) -> &mut Self {
        self.source_types = None;
        self.groupers.push(Arc::new(grouper));
        self
    }

    pub fn fan_out<T, C, F>(&mut self, mode: FanOutMode, f: F) -> &mut Self
    where
        T: EventData,
        C: EventData,
        F: Fn(&T) -> Vec<C> + Send + Sync + 'static,
    {
        self.source::<T>();
        self.catalog.register::<C>();
        self.fan_outs.push(FanOutRule::new(mode, f));
        self
    }

    pub fn enrich(&mut self, enricher: impl Enricher<A, I> + 'static) -> &mut Self {
        self.enrichers.push(Arc::new(enricher));
        self
    }

    /// Adds a `References<D>` event after every `T` whose key names a stored `D`.
    pub fn enrich_with<T, D, F>(
        &mut self,
        doc_type: impl Into<String>,
        key: F,
        codec: impl Deserializer<D> + 'static,
    ) -> &mut Self
    where
        T: EventData,
        D: fmt::Debug + Send + Sync + 'static,
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        self.enrich(EnrichWith::<T, D>::new(doc_type, key, codec))
    }

    fn source<T: EventData>(&mut self) {
        let ty = self.catalog.register::<T>();
        if let Some(types) = self.source_types.as_mut() {
            types.push(ty.id());
        }
    }

    pub fn tenancy(&mut self, tenancy: TenancyGrouping) -> Result<&mut Self> {
        if tenancy == TenancyGrouping::RollUpByTenant && !I::supports_tenant_roll_up() {
            return Err(SlicingError::TenantRollUp {
                identity: std::any::type_name::<I>(),
            });
        }
        self.tenancy = tenancy;
        Ok(self)
    }

    pub fn tenancy_grouping(&self) -> TenancyGrouping {
        self.tenancy
    }

    async fn assign(
        &self,
        group: &mut SliceGroup<A, I>,
        events: &[Event],
        session: &dyn DocumentLoader,
    ) -> Result<()> {
        for event in events {
            for rule in &self.rules {
                for id in rule(&self.catalog, event) {
                    group.add_event(&id, event.clone());
                }
            }
        }
        for grouper in &self.groupers {
            let mut grouping = EventGrouping::default();
            grouper
                .group(session, events, &mut grouping)
                .await
                .map_err(SlicingError::Grouper)?;
            for (id, event) in grouping.assignments {
                group.add_event(&id, event);
            }
        }
        Ok(())
    }

    fn split_by_tenant(events: Vec<Event>) -> Vec<(String, Vec<Event>)> {
        let mut tenants: Vec<(String, Vec<Event>)> = Vec::new();
        for event in events {
            match tenants.iter_mut().find(|(tenant, _)| tenant == event.tenant_id()) {
                Some((_, bucket)) => bucket.push(event),
                None => tenants.push((event.tenant_id().to_string(), vec![event])),
            }
        }
        tenants
    }
}

#[async_trait]
impl<A, I> EventSlicer<A, I> for MultiStreamSlicer<A, I>
where
    A: Send + 'static,
    I: Identity,
{
    async fn slice(&self, mut events: Vec<Event>, session: Arc<dyn DocumentLoader>) -> Result<Vec<SliceGroup<A, I>>> {
        event::normalize(&mut events);
        let events = fan_out(&self.fan_outs, FanOutMode::BeforeGrouping, events);

        let mut groups = match self.tenancy {
            TenancyGrouping::RollUpByTenant => {
                let mut groups = TenantGroups::default();
                let group = groups.group_mut(DEFAULT_TENANT);
                for event in events {
                    if let Some(id) = I::from_tenant(event.tenant_id()) {
                        group.add_event(&id, event);
                    }
                }
                groups.into_groups()
            }
            TenancyGrouping::AcrossTenants => {
                let mut group = SliceGroup::new(DEFAULT_TENANT);
                self.assign(&mut group, &events, session.as_ref()).await?;
                vec![group]
            }
            TenancyGrouping::PerTenant => {
                let mut groups = Vec::new();
                for (tenant, events) in Self::split_by_tenant(events) {
                    let mut group = SliceGroup::new(tenant);
                    self.assign(&mut group, &events, session.as_ref()).await?;
                    groups.push(group);
                }
                groups
            }
        };

        let after_grouping = self.fan_outs.iter().any(|rule| rule.mode() == FanOutMode::AfterGrouping);
        for group in &mut groups {
            if after_grouping {
                for slice in group.slices_mut() {
                    let expanded = fan_out(&self.fan_outs, FanOutMode::AfterGrouping, slice.events().to_vec());
                    slice.replace_events(expanded);
                }
            }
            for enricher in &self.enrichers {
                enricher.enrich(group, session.as_ref()).await?;
            }
            group.normalize();
        }
        groups.retain(|group| !group.is_empty());
        Ok(groups)
    }

    fn event_types(&self) -> Option<Vec<TypeId>> {
        let mut types = self.source_types.clone()?;
        for known in self.catalog.known_types() {
            let inherits = self
                .catalog
                .ancestors_of(known.id())
                .iter()
                .any(|ancestor| types.contains(&ancestor.id()));
            if inherits {
                types.push(known.id());
            }
        }
        Some(types)
    }
}

impl<A, I: Identity> fmt::Debug for MultiStreamSlicer<A, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiStreamSlicer")
            .field("rules", &self.rules.len())
            .field("groupers", &self.groupers.len())
            .field("fan_outs", &self.fan_outs)
            .field("enrichers", &self.enrichers.len())
            .field("tenancy", &self.tenancy)
            .finish()
    }
}
