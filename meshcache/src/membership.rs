use std::collections::HashMap;

use crate::NodeId;

/// The membership registry: an ordered, indexed collection of peer handles
/// keyed by peer identity.
///
/// Every entry keeps a stable positional index from admission until removal;
/// freed slots may later be handed to *other* peers, but never back to the
/// removed instance. The registry itself never holds two entries with the
/// same identity - admission goes through
/// [`contains`](Registry::contains) under the same lock.
pub(crate) struct Registry<T> {
    slots: Vec<Option<(NodeId, T)>>,
    index: HashMap<NodeId, usize>,
    free: Vec<usize>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
            free: Vec::new(),
        }
    }
}

impl<T: Clone> Registry<T> {
    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Admits a peer, returning its assigned positional index.
    ///
    /// The caller must have checked [`contains`](Registry::contains) under
    /// the same lock guard.
    pub(crate) fn insert(&mut self, id: NodeId, value: T) -> usize {
        debug_assert!(
            !self.index.contains_key(&id),
            "registry must never hold two entries for one identity",
        );

        let slot = self.free.pop().unwrap_or_else(|| {
            self.slots.push(None);
            self.slots.len() - 1
        });

        self.index.insert(id.clone(), slot);
        self.slots[slot] = Some((id, value));
        slot
    }

    /// Removes the entry at the given index, returning the identity that
    /// occupied it.
    pub(crate) fn remove(&mut self, slot: usize) -> Option<NodeId> {
        let (id, _) = self.slots.get_mut(slot)?.take()?;
        self.index.remove(&id);
        self.free.push(slot);
        Some(id)
    }

    /// A snapshot of all registered peer handles in positional order.
    pub(crate) fn values(&self) -> Vec<T> {
        self.slots
            .iter()
            .flatten()
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub(crate) fn entries(&self) -> Vec<(NodeId, T)> {
        self.slots.iter().flatten().cloned().collect()
    }

    pub(crate) fn ids(&self) -> Vec<NodeId> {
        self.slots.iter().flatten().map(|(id, _)| id.clone()).collect()
    }
}
