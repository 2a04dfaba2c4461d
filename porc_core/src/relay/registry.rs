/*! Id-keyed table of live sessions.

Ids are handed out from a wrapping counter that starts at 1. A value still
held by a live entry is skipped, so an id is never assigned to two live
entries at once.
*/

use std::collections::BTreeMap;
use std::num::NonZeroU32;

/// Mapping from session id to session.
#[derive(Debug)]
pub struct Registry<I, T> {
    entries: BTreeMap<I, T>,
    next_id: u32,
}

impl<I, T> Default for Registry<I, T> {
    fn default() -> Self {
        Registry {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl<I: Copy + Ord + From<NonZeroU32>, T> Registry<I, T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Registry::default()
    }

    fn next_free_id(&mut self) -> I {
        loop {
            let candidate = NonZeroU32::new(self.next_id).map(I::from);
            self.next_id = self.next_id.wrapping_add(1);
            match candidate {
                Some(id) if !self.entries.contains_key(&id) => return id,
                _ => continue,
            }
        }
    }

    /// Insert a session under a fresh id and return the id.
    pub fn insert(&mut self, entry: T) -> I {
        let id = self.next_free_id();
        self.entries.insert(id, entry);
        id
    }

    /// Get the session by its id.
    pub fn get(&self, id: I) -> Option<&T> {
        self.entries.get(&id)
    }

    /// Get mutable access to the session by its id.
    pub fn get_mut(&mut self, id: I) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    /// Remove the session. `None` means there was no such session.
    pub fn remove(&mut self, id: I) -> Option<T> {
        self.entries.remove(&id)
    }

    /// Check if the id belongs to a live session.
    pub fn contains(&self, id: I) -> bool {
        self.entries.contains_key(&id)
    }

    /// Iterate over live sessions ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = (I, &T)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    /// Ids of live sessions.
    pub fn ids(&self) -> Vec<I> {
        self.entries.keys().copied().collect()
    }

    /// Remove all sessions.
    pub fn clear(&mut self) {
        self.entries.clear()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no live sessions.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
