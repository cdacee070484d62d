use crate::event::{Event, Sequence};
use crate::slicing::identity::Identity;
use crate::slicing::slice::EventSlice;
use std::collections::HashMap;

/// Slices of one tenant, keyed by identity, in order of first appearance.
#[derive(Debug)]
pub struct SliceGroup<A, I: Identity> {
    tenant_id: String,
    slices: Vec<EventSlice<A, I>>,
    index: HashMap<I, usize>,
}

impl<A, I: Identity> SliceGroup<A, I> {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            slices: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn slice_mut(&mut self, id: &I) -> &mut EventSlice<A, I> {
        let position = match self.index.get(id) {
            Some(position) => *position,
            None => {
                self.slices.push(EventSlice::new(id.clone(), self.tenant_id.clone()));
                self.index.insert(id.clone(), self.slices.len() - 1);
                self.slices.len() - 1
            }
        };
        &mut self.slices[position]
    }

    pub fn add_event(&mut self, id: &I, event: Event) {
        self.slice_mut(id).add_event(event);
    }

    pub fn add_events(&mut self, id: &I, events: impl IntoIterator<Item = Event>) {
        self.slice_mut(id).add_events(events);
    }

    pub fn get(&self, id: &I) -> Option<&EventSlice<A, I>> {
        self.index.get(id).map(|position| &self.slices[*position])
    }

    pub fn slices(&self) -> &[EventSlice<A, I>] {
        &self.slices
    }

    pub fn slices_mut(&mut self) -> &mut [EventSlice<A, I>] {
        &mut self.slices
    }

    pub fn into_slices(self) -> Vec<EventSlice<A, I>> {
        self.slices
    }

    pub fn ids(&self) -> impl Iterator<Item = &I> {
        self.slices.iter().map(EventSlice::id)
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn normalize(&mut self) {
        for slice in &mut self.slices {
            slice.normalize();
        }
    }

    /// Removes `sequence` from every slice and drops slices left empty.
    pub fn remove_sequence(&mut self, sequence: Sequence) -> usize {
        let removed = self.slices.iter_mut().map(|slice| slice.remove_sequence(sequence)).sum();
        if removed > 0 {
            self.slices.retain(|slice| !slice.is_empty());
            self.index = self
                .slices
                .iter()
                .enumerate()
                .map(|(position, slice)| (slice.id().clone(), position))
                .collect();
        }
        removed
    }
}

/// Groups keyed by tenant, in order of first appearance.
#[derive(Debug)]
pub struct TenantGroups<A, I: Identity> {
    groups: Vec<SliceGroup<A, I>>,
}

impl<A, I: Identity> Default for TenantGroups<A, I> {
    fn default() -> Self {
        Self { groups: Vec::new() }
    }
}

impl<A, I: Identity> TenantGroups<A, I> {
    pub fn group_mut(&mut self, tenant_id: &str) -> &mut SliceGroup<A, I> {
        let position = match self.groups.iter().position(|g| g.tenant_id() == tenant_id) {
            Some(position) => position,
            None => {
                self.groups.push(SliceGroup::new(tenant_id));
                self.groups.len() - 1
            }
        };
        &mut self.groups[position]
    }

    pub fn into_groups(self) -> Vec<SliceGroup<A, I>> {
        self.groups
    }
}
