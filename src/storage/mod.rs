//! Storage layer
//!
//! # Architecture
//!
//! Storage is organised as independent cache regions:
//!
//! ```text
//! DiskCacheRegistry (region name → IndexedDiskCache)
//!   └─→ IndexedDiskCache (key → value, serialized)
//!        └─→ Records in <region>.data, index in <region>.key
//! ```
//!
//! ## Disk Cache
//!
//! The `disk` module provides the region implementation:
//! - Record file access (length-prefixed records, relocation, truncation)
//! - Key index with optional LRU bound by entry count or kilobytes
//! - Recycle bin for freed slots
//! - Background compaction and shutdown handling

pub mod disk;

pub use disk::{
    DiskCacheRegistry, DiskCacheStats, DiskKey, ElementSerializer, IndexedDiskCache,
    RegionStatus, RemovalKey, SlotDescriptor,
};
