//! Slot descriptors for the indexed disk cache
//!
//! A descriptor locates one length-prefixed record in the data file.
//! Descriptors are owned by a [`DescriptorArena`] and referenced everywhere
//! else (key index, recycle bin, defragmentation snapshots) by [`DescriptorId`],
//! so a move or an in-place reuse is seen by every holder.

use super::record_file::HEADER_SIZE_BYTES;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;
use std::fmt;

/// Location of a stored record in the data file
///
/// `length` is the payload length and excludes the 4-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotDescriptor {
    /// Offset of the record header
    pub position: u64,
    /// Payload length in bytes
    pub length: u32,
}

impl SlotDescriptor {
    /// Create a new descriptor
    pub fn new(position: u64, length: u32) -> Self {
        Self { position, length }
    }

    /// Bytes occupied on disk, header included
    pub fn record_size(&self) -> u64 {
        HEADER_SIZE_BYTES + self.length as u64
    }

    /// First offset past the end of this record, `None` if it lies beyond `u64::MAX`
    ///
    /// Positions loaded from a key file are untrusted, so anything checking
    /// them against a file length goes through here.
    pub fn checked_end(&self) -> Option<u64> {
        self.position.checked_add(self.record_size())
    }

    /// First offset past the end of this record, saturating at `u64::MAX`
    pub fn end(&self) -> u64 {
        self.checked_end().unwrap_or(u64::MAX)
    }

    /// Whether the byte ranges of two records intersect
    pub fn overlaps(&self, other: &SlotDescriptor) -> bool {
        self.position < other.end() && other.position < self.end()
    }

    /// Recycle bin order: length ascending, then position descending
    pub fn recycle_cmp(&self, other: &SlotDescriptor) -> Ordering {
        self.length
            .cmp(&other.length)
            .then_with(|| other.position.cmp(&self.position))
    }

    /// Defragmentation order: position ascending
    pub fn position_cmp(&self, other: &SlotDescriptor) -> Ordering {
        self.position.cmp(&other.position)
    }
}

impl fmt::Display for SlotDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot(pos={}, len={})", self.position, self.length)
    }
}

/// Stable handle to a descriptor stored in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DescriptorId(u64);

impl DescriptorId {
    /// Smallest possible id, used as a lower bound in range searches
    pub const MIN: DescriptorId = DescriptorId(0);
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ordering key used by the recycle bin
///
/// Sorting by `(length, Reverse(position), id)` gives length ascending,
/// position descending. The id only breaks ties between equal descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecycleKey {
    pub length: u32,
    pub position: Reverse<u64>,
    pub id: DescriptorId,
}

impl RecycleKey {
    pub fn new(id: DescriptorId, slot: &SlotDescriptor) -> Self {
        Self {
            length: slot.length,
            position: Reverse(slot.position),
            id,
        }
    }

    /// Lower bound for the smallest slot able to hold `length` bytes
    pub fn ceiling_probe(length: u32) -> Self {
        Self {
            length,
            position: Reverse(u64::MAX),
            id: DescriptorId::MIN,
        }
    }
}

/// Owner of every descriptor of a region
#[derive(Debug, Default)]
pub struct DescriptorArena {
    slots: HashMap<DescriptorId, SlotDescriptor>,
    next_id: u64,
}

impl DescriptorArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a descriptor and hand out its id
    ///
    /// Ids are never reused, even across [`DescriptorArena::clear`], so a stale
    /// id held by a compaction snapshot can never alias a newer descriptor.
    pub fn insert(&mut self, slot: SlotDescriptor) -> DescriptorId {
        let id = DescriptorId(self.next_id);
        self.next_id += 1;
        self.slots.insert(id, slot);
        id
    }

    pub fn get(&self, id: DescriptorId) -> Option<&SlotDescriptor> {
        self.slots.get(&id)
    }

    pub fn get_mut(&mut self, id: DescriptorId) -> Option<&mut SlotDescriptor> {
        self.slots.get_mut(&id)
    }

    /// Drop a descriptor for good
    pub fn release(&mut self, id: DescriptorId) -> Option<SlotDescriptor> {
        self.slots.remove(&id)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Check a position-sorted list of descriptors for overlapping ranges
///
/// Returns the first descriptor that starts before its predecessor ends.
pub fn find_overlap(sorted: &[SlotDescriptor]) -> Option<SlotDescriptor> {
    let mut expected_next = 0u64;
    for slot in sorted {
        if expected_next > slot.position {
            return Some(*slot);
        }
        expected_next = slot.end();
    }
    None
}
