//! Indexed Disk Cache
//!
//! A disk-resident key/value cache region. Values live in a data file of
//! length-prefixed records; an in-memory index maps keys to record
//! positions, and a key file persists that index across restarts.
//!
//! # Architecture
//!
//! ```text
//! IndexedDiskCache<K, V>           serialize / deserialize values
//!   └─→ Region<K>                  RwLock<RegionState>
//!        ├─→ KeyIndex              key → DescriptorId (LRU by count or KB)
//!        ├─→ DescriptorArena       DescriptorId → (position, length)
//!        ├─→ RecycleBin            free slots, best fit by length
//!        ├─→ Optimizer             Idle | Compacting | Disposing
//!        ├─→ <name>.data           [u32 len][payload] [u32 len][payload] ...
//!        └─→ <name>.key            one record: the whole index as JSON
//! ```
//!
//! Freed slots are reused by later puts of equal or smaller size. Holes
//! that are never reused are closed by compaction, which runs in the
//! background after a configurable number of removals and once more on
//! shutdown.

pub mod cache;
pub mod descriptor;
pub mod key;
pub mod key_index;
mod optimizer;
pub mod record_file;
pub mod recycle;
mod region;
pub mod registry;
pub mod serializer;
pub mod stats;

pub use cache::IndexedDiskCache;
pub use descriptor::{DescriptorId, SlotDescriptor};
pub use key::{CacheKey, DiskKey, GroupAttrName, GroupId, RemovalKey};
pub use key_index::{IndexLimit, KeyIndex};
pub use record_file::{RecordFile, HEADER_SIZE_BYTES};
pub use region::RegionStatus;
pub use registry::DiskCacheRegistry;
pub use serializer::{CompressingSerializer, ElementSerializer, JsonSerializer};
pub use stats::DiskCacheStats;
