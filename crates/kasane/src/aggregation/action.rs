use crate::slicing::EventSlice;

/// The outcome of folding one slice, without the snapshot it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    Nothing,
    Store,
    /// Delete the stored snapshot, softly if the projection soft-deletes.
    Delete,
    HardDelete,
    /// Store the snapshot and clear its soft-deleted mark.
    UnDeleteAndStore,
    /// Store the final snapshot, then soft-delete it.
    StoreThenSoftDelete,
}

impl ActionType {
    pub fn stores(&self) -> bool {
        matches!(self, Self::Store | Self::UnDeleteAndStore | Self::StoreThenSoftDelete)
    }
}

/// Exactly one per slice per range.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotAction<A> {
    Nothing,
    Store(A),
    Delete,
    HardDelete,
    UnDeleteAndStore(A),
    StoreThenSoftDelete(A),
}

impl<A> SnapshotAction<A> {
    /// Moves the outcome recorded on `slice` out of it, together with its snapshot.
    ///
    /// A storing outcome whose snapshot is missing degrades to `Nothing`.
    pub fn take_from<I>(slice: &mut EventSlice<A, I>) -> Self {
        let action = slice.action().unwrap_or(ActionType::Nothing);
        match action {
            ActionType::Nothing => Self::Nothing,
            ActionType::Delete => Self::Delete,
            ActionType::HardDelete => Self::HardDelete,
            ActionType::Store => slice.snapshot.take().map_or(Self::Nothing, Self::Store),
            ActionType::UnDeleteAndStore => slice.snapshot.take().map_or(Self::Nothing, Self::UnDeleteAndStore),
            ActionType::StoreThenSoftDelete => slice
                .snapshot
                .take()
                .map_or(Self::Nothing, Self::StoreThenSoftDelete),
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            Self::Nothing => ActionType::Nothing,
            Self::Store(_) => ActionType::Store,
            Self::Delete => ActionType::Delete,
            Self::HardDelete => ActionType::HardDelete,
            Self::UnDeleteAndStore(_) => ActionType::UnDeleteAndStore,
            Self::StoreThenSoftDelete(_) => ActionType::StoreThenSoftDelete,
        }
    }

    pub fn snapshot(&self) -> Option<&A> {
        match self {
            Self::Store(a) | Self::UnDeleteAndStore(a) | Self::StoreThenSoftDelete(a) => Some(a),
            _ => None,
        }
    }

    pub fn into_snapshot(self) -> Option<A> {
        match self {
            Self::Store(a) | Self::UnDeleteAndStore(a) | Self::StoreThenSoftDelete(a) => Some(a),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_from_moves_the_snapshot_out() {
        let mut slice = EventSlice::<u32, String>::new("a".to_string(), "*DEFAULT*");
        slice.snapshot = Some(7);
        slice.set_action(ActionType::StoreThenSoftDelete);

        let action = SnapshotAction::take_from(&mut slice);
        assert_eq!(action, SnapshotAction::StoreThenSoftDelete(7));
        assert_eq!(action.action_type(), ActionType::StoreThenSoftDelete);
        assert!(slice.snapshot.is_none());
    }

    #[test]
    fn test_unfolded_slice_does_nothing() {
        let mut slice = EventSlice::<u32, String>::new("a".to_string(), "*DEFAULT*");
        slice.snapshot = Some(7);
        assert_eq!(SnapshotAction::take_from(&mut slice), SnapshotAction::Nothing);
        assert_eq!(slice.snapshot, Some(7));
    }

    #[test]
    fn test_store_without_snapshot_degrades_to_nothing() {
        let mut slice = EventSlice::<u32, String>::new("a".to_string(), "*DEFAULT*");
        slice.set_action(ActionType::Store);
        assert_eq!(SnapshotAction::take_from(&mut slice), SnapshotAction::Nothing);
    }

    #[test]
    fn test_only_storing_actions_carry_a_snapshot() {
        assert_eq!(SnapshotAction::Store(1).into_snapshot(), Some(1));
        assert_eq!(SnapshotAction::<u32>::Delete.snapshot(), None);
        assert!(ActionType::UnDeleteAndStore.stores());
        assert!(!ActionType::HardDelete.stores());
    }
}
