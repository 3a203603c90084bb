//! Recycle bin of free data file slots

use super::descriptor::{DescriptorArena, DescriptorId, RecycleKey};
use std::collections::BTreeSet;

/// Free slots ordered by length ascending, then position descending
///
/// A ceiling search on this order finds the smallest slot that can hold a
/// payload. Adjacent free slots are never merged.
#[derive(Debug, Default)]
pub struct RecycleBin {
    free_slots: BTreeSet<RecycleKey>,
}

impl RecycleBin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a free slot; the descriptor must already live in the arena
    pub fn insert(&mut self, arena: &DescriptorArena, id: DescriptorId) -> bool {
        match arena.get(id) {
            Some(slot) => self.free_slots.insert(RecycleKey::new(id, slot)),
            None => false,
        }
    }

    /// Take the smallest slot whose length is at least `length`
    pub fn take_ceiling(&mut self, length: u32) -> Option<DescriptorId> {
        let key = *self
            .free_slots
            .range(RecycleKey::ceiling_probe(length)..)
            .next()?;
        self.free_slots.remove(&key);
        Some(key.id)
    }

    /// Empty the bin, releasing every slot from the arena
    pub fn clear(&mut self, arena: &mut DescriptorArena) {
        for key in std::mem::take(&mut self.free_slots) {
            arena.release(key.id);
        }
    }

    /// Ids currently in the bin
    pub fn ids(&self) -> impl Iterator<Item = DescriptorId> + '_ {
        self.free_slots.iter().map(|k| k.id)
    }

    pub fn len(&self) -> usize {
        self.free_slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free_slots.is_empty()
    }
}
