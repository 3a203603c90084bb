//! Region state and byte-level operations
//!
//! A [`Region`] owns the data file, the key file and every in-memory
//! structure describing them. All structural state lives in one
//! [`RegionState`] behind a single reader/writer lock:
//!
//! ```text
//! RwLock<RegionState>
//!   ├─→ files      data file + key file
//!   ├─→ arena      DescriptorId → SlotDescriptor
//!   ├─→ index      key → DescriptorId (LRU promotion behind its own mutex)
//!   ├─→ recycle    free DescriptorIds, smallest fit first
//!   ├─→ queued     ids written while a compaction runs
//!   └─→ optimizer  Idle | Compacting | Disposing
//! ```
//!
//! Readers take the read lock; anything that changes a descriptor, the
//! index or the bin takes the write lock.

use super::descriptor::{find_overlap, DescriptorArena, DescriptorId, SlotDescriptor};
use super::key::{DiskKey, RemovalKey};
use super::key_index::{IndexLimit, KeyIndex};
use super::optimizer::OptimizerState;
use super::record_file::RecordFile;
use super::recycle::RecycleBin;
use super::stats::DiskCacheStats;
use crate::config::IndexedDiskCacheConfig;
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Above this many descriptors, position sorts run on the rayon pool
const PARALLEL_SORT_THRESHOLD: usize = 100;

/// Lifecycle of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionStatus {
    Initializing,
    Alive,
    Disposing,
    Closed,
}

/// The two files backing a region
pub(crate) struct RegionFiles {
    pub data: RecordFile,
    pub keys: RecordFile,
}

impl RegionFiles {
    fn open(config: &IndexedDiskCacheConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.disk_path).map_err(|e| {
            Error::Storage(format!(
                "Failed to create cache directory {}: {}",
                config.disk_path.display(),
                e
            ))
        })?;
        Ok(Self {
            data: RecordFile::open(config.data_file_path())?,
            keys: RecordFile::open(config.key_file_path())?,
        })
    }

    pub fn close(self) -> Result<()> {
        let data = self.data.close();
        let keys = self.keys.close();
        data.and(keys)
    }
}

/// Everything guarded by the region lock
pub(crate) struct RegionState<K: DiskKey> {
    pub status: RegionStatus,
    pub files: Option<RegionFiles>,
    pub arena: DescriptorArena,
    pub index: Mutex<KeyIndex<K>>,
    pub recycle: RecycleBin,
    /// Feed and consult the recycle bin; off while compacting
    pub do_recycle: bool,
    /// Record new allocations in `queued_puts`; on while compacting
    pub queue_input: bool,
    pub queued_puts: Vec<DescriptorId>,
    pub optimizer: OptimizerState,
    /// Bumped by every reset so a running compaction can tell its snapshot is stale
    pub generation: u64,
    pub remove_count: u32,
    pub times_optimized: u32,
    pub recycle_count: u64,
    pub startup_size: usize,
    pub bytes_free: u64,
}

impl<K: DiskKey> RegionState<K> {
    fn new(limit: IndexLimit) -> Self {
        Self {
            status: RegionStatus::Initializing,
            files: None,
            arena: DescriptorArena::new(),
            index: Mutex::new(KeyIndex::new(limit)),
            recycle: RecycleBin::new(),
            do_recycle: true,
            queue_input: false,
            queued_puts: Vec::new(),
            optimizer: OptimizerState::Idle,
            generation: 0,
            remove_count: 0,
            times_optimized: 0,
            recycle_count: 0,
            startup_size: 0,
            bytes_free: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status == RegionStatus::Alive
    }

    pub fn files(&self) -> Result<&RegionFiles> {
        self.files
            .as_ref()
            .ok_or_else(|| Error::NotAlive("region files are closed".to_string()))
    }

    fn ensure_alive(&self, name: &str) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(Error::NotAlive(format!("region {} is {:?}", name, self.status)))
        }
    }

    /// Live descriptors with their ids, sorted by position
    pub fn position_sorted(&self) -> Vec<(DescriptorId, SlotDescriptor)> {
        let ids = self.index.lock().ids();
        let mut entries: Vec<_> = ids
            .into_iter()
            .filter_map(|id| self.arena.get(id).map(|slot| (id, *slot)))
            .collect();
        if entries.len() > PARALLEL_SORT_THRESHOLD {
            entries.par_sort_unstable_by(|a, b| a.1.position_cmp(&b.1));
        } else {
            entries.sort_unstable_by(|a, b| a.1.position_cmp(&b.1));
        }
        entries
    }

    /// Clear every in-memory structure
    fn clear_structures(&mut self) {
        self.recycle.clear(&mut self.arena);
        self.index.get_mut().clear();
        self.arena.clear();
        self.queued_puts.clear();
        self.bytes_free = 0;
    }
}

/// One indexed disk cache region, shared between callers and background threads
pub(crate) struct Region<K: DiskKey> {
    pub config: IndexedDiskCacheConfig,
    pub state: RwLock<RegionState<K>>,
    hit_count: AtomicU64,
}

impl<K: DiskKey> Region<K> {
    /// Open the region's files and load persisted keys
    ///
    /// Never fails: initialization errors are logged and leave the region
    /// un-alive, which turns every later operation into a no-op.
    pub fn open(config: IndexedDiskCacheConfig) -> Arc<Self> {
        let limit = IndexLimit::from_config(config.max_key_size, config.disk_limit_type);
        let region = Arc::new(Self {
            state: RwLock::new(RegionState::new(limit)),
            hit_count: AtomicU64::new(0),
            config,
        });

        info!(region = %region.name(), dir = ?region.config.disk_path, ?limit, "Opening indexed disk cache");

        let mut guard = region.state.write();
        let st = &mut *guard;
        match region.initialize(st) {
            Ok(()) => {
                st.status = RegionStatus::Alive;
                info!(region = %region.name(), keys = st.index.get_mut().len(), "Indexed disk cache is alive");

                // Count a pass in case the previous run never got to its final optimization
                if !st.index.get_mut().is_empty() {
                    region.maybe_optimize_real_time(st);
                }
            }
            Err(e) => {
                error!(
                    region = %region.name(),
                    dir = ?region.config.disk_path,
                    "Failure initializing disk cache: {}", e
                );
                if let Some(files) = st.files.take() {
                    files.close().ok();
                }
            }
        }
        drop(guard);

        region
    }

    pub fn name(&self) -> &str {
        &self.config.region_name
    }

    fn initialize(&self, st: &mut RegionState<K>) -> Result<()> {
        let files = RegionFiles::open(&self.config)?;

        if self.config.clear_disk_on_startup {
            info!(region = %self.name(), "clear_disk_on_startup is set, ignoring persisted data");
            files.keys.reset()?;
            files.data.reset()?;
            st.files = Some(files);
            return Ok(());
        }

        let has_keys = files.keys.length()? > 0;
        st.files = Some(files);

        if has_keys {
            self.initialize_from_persisted(st)
        } else {
            let files = st.files()?;
            if files.data.length()? > 0 {
                files.data.reset()?;
            }
            Ok(())
        }
    }

    fn initialize_from_persisted(&self, st: &mut RegionState<K>) -> Result<()> {
        self.load_keys(st);

        if st.index.get_mut().is_empty() {
            st.files()?.data.reset()?;
            return Ok(());
        }

        if self.check_key_data_consistency(st, self.config.check_overlaps_on_startup) {
            st.startup_size = st.index.get_mut().len();
        } else {
            st.clear_structures();
            let files = st.files()?;
            files.keys.reset()?;
            files.data.reset()?;
            warn!(region = %self.name(), "Corruption detected, resetting data and key files");
        }
        Ok(())
    }

    /// Load the key file into the index
    ///
    /// A key file that cannot be read or parsed leaves the index empty.
    fn load_keys(&self, st: &mut RegionState<K>) {
        debug!(region = %self.name(), "Loading keys");
        st.clear_structures();

        let entries = match self.read_key_file(st) {
            Ok(entries) => entries,
            Err(e) => {
                error!(region = %self.name(), "Problem loading keys: {}", e);
                return;
            }
        };

        let found = entries.len();
        for (key, slot) in entries {
            let id = st.arena.insert(slot);
            let insertion = st.index.get_mut().insert(key, id, slot.length);
            if let Some(old) = insertion.replaced {
                st.arena.release(old);
            }
            for (_, evicted) in insertion.evicted {
                self.retire(st, evicted);
            }
        }

        info!(
            region = %self.name(),
            found,
            loaded = st.index.get_mut().len(),
            max_key_size = self.config.max_key_size,
            "Loaded keys"
        );
    }

    fn read_key_file(&self, st: &RegionState<K>) -> Result<Vec<(K, SlotDescriptor)>> {
        let keys = &st.files()?.keys;
        let length = keys.length()?;
        let payload_len = length
            .checked_sub(super::record_file::HEADER_SIZE_BYTES)
            .and_then(|len| u32::try_from(len).ok())
            .ok_or_else(|| Error::Corruption(format!("key file length {} is not a record", length)))?;

        let payload = keys.read(&SlotDescriptor::new(0, payload_len))?;
        serde_json::from_slice(&payload)
            .map_err(|e| Error::SerializationError(format!("Failed to parse key file: {}", e)))
    }

    /// Persist the whole index to the key file, replacing its contents
    pub fn save_keys(&self, st: &RegionState<K>) -> Result<()> {
        let files = st.files()?;
        let entries: Vec<(K, SlotDescriptor)> = {
            let index = st.index.lock();
            index
                .iter()
                .filter_map(|(key, id)| st.arena.get(id).map(|slot| (key.clone(), *slot)))
                .collect()
        };

        info!(region = %self.name(), keys = entries.len(), "Saving keys");
        files.keys.reset()?;

        if !entries.is_empty() {
            let payload = serde_json::to_vec(&entries)
                .map_err(|e| Error::SerializationError(format!("Failed to serialize keys: {}", e)))?;
            let length = u32::try_from(payload.len()).map_err(|_| {
                Error::InvalidArgument(format!("key file payload of {} bytes is too large", payload.len()))
            })?;
            files.keys.write(&SlotDescriptor::new(0, length), &payload)?;
        }
        files.keys.sync()?;
        Ok(())
    }

    /// Check descriptors against the data file
    ///
    /// Every record must end within the file. With `check_overlaps`, records
    /// are also sorted by position and checked pairwise for overlap.
    pub fn check_key_data_consistency(&self, st: &RegionState<K>, check_overlaps: bool) -> bool {
        let timer = Instant::now();
        debug!(region = %self.name(), "Performing consistency check");

        let file_length = match st.files().and_then(|f| f.data.length()) {
            Ok(length) => length,
            Err(e) => {
                error!(region = %self.name(), "Consistency check could not stat data file: {}", e);
                return false;
            }
        };

        let mut is_ok = true;
        {
            let index = st.index.lock();
            for (_, id) in index.iter() {
                let Some(slot) = st.arena.get(id) else {
                    warn!(region = %self.name(), %id, "Index references a missing descriptor");
                    is_ok = false;
                    break;
                };
                if slot.checked_end().map_or(true, |end| end > file_length) {
                    warn!(region = %self.name(), %slot, file_length, "The data file is corrupted");
                    is_ok = false;
                    break;
                }
            }
        }

        if is_ok && check_overlaps {
            let sorted: Vec<SlotDescriptor> =
                st.position_sorted().into_iter().map(|(_, slot)| slot).collect();
            if let Some(slot) = find_overlap(&sorted) {
                error!(region = %self.name(), %slot, "Corrupt file: overlapping records");
                is_ok = false;
            }
        }

        info!(
            region = %self.name(),
            is_ok,
            elapsed = ?timer.elapsed(),
            "Finished consistency check"
        );
        is_ok
    }

    /// Hand a descriptor that no key references any more to the recycle bin
    ///
    /// While compacting the bin is closed, so the descriptor is dropped and
    /// its bytes stay orphaned until the next pass.
    pub fn retire(&self, st: &mut RegionState<K>, id: DescriptorId) {
        let Some(slot) = st.arena.get(id).copied() else {
            return;
        };
        st.bytes_free += slot.record_size();

        if st.do_recycle {
            st.recycle.insert(&st.arena, id);
            debug!(region = %self.name(), %slot, "Recycled slot");
        } else {
            st.arena.release(id);
        }
    }

    /// Store a payload under `key`
    ///
    /// Returns `Ok(false)` when the key was pushed out of a bounded index by
    /// its own insertion, in which case nothing is written.
    pub fn put_bytes(self: &Arc<Self>, key: K, data: &[u8]) -> Result<bool> {
        let length = u32::try_from(data.len()).map_err(|_| {
            Error::InvalidArgument(format!("payload of {} bytes exceeds the record limit", data.len()))
        })?;

        let mut guard = self.state.write();
        let st = &mut *guard;
        st.ensure_alive(self.name())?;
        let end_of_file = st.files()?.data.length()?;

        let existing = st.index.get_mut().peek(&key);
        let reusable = existing.filter(|id| {
            st.arena
                .get(*id)
                .map(|slot| length <= slot.length)
                .unwrap_or(false)
        });

        let (id, appended) = match reusable {
            Some(id) => {
                if let Some(slot) = st.arena.get_mut(id) {
                    slot.length = length;
                }
                (id, false)
            }
            None => self.allocate(st, length, end_of_file),
        };

        let insertion = st.index.get_mut().insert(key.clone(), id, length);

        if st.queue_input && reusable.is_none() {
            st.queued_puts.push(id);
            debug!(region = %self.name(), queued = st.queued_puts.len(), "Added to queued put list");
        }

        if let Some(old) = insertion.replaced.filter(|old| *old != id) {
            self.retire(st, old);
        }

        let mut self_evicted = false;
        for (evicted_key, evicted_id) in insertion.evicted {
            debug!(region = %self.name(), key = ?evicted_key, "Evicting key from key store");
            if evicted_key == key {
                self_evicted = true;
                if appended {
                    // Never written, so the slot lies past the end of the file
                    st.arena.release(evicted_id);
                    continue;
                }
            }
            self.retire(st, evicted_id);
            self.maybe_optimize_real_time(st);
        }
        if self_evicted {
            debug!(region = %self.name(), ?key, "Key evicted by its own insertion, skipping write");
            return Ok(false);
        }

        let slot = st
            .arena
            .get(id)
            .copied()
            .ok_or_else(|| Error::Storage(format!("descriptor {} vanished during put", id)))?;

        let written = st.files()?.data.write(&slot, data);
        if let Err(e) = written {
            // The slot's contents are undefined now; the key must not point at it
            if st.index.get_mut().remove(&key) == Some(id) {
                if appended {
                    st.arena.release(id);
                } else {
                    self.retire(st, id);
                }
            }
            return Err(e);
        }

        debug!(region = %self.name(), ?key, %slot, "Put to file");
        Ok(true)
    }

    /// Pick a slot for a new record: recycled if possible, else end of file
    ///
    /// The flag is set when the slot was appended.
    fn allocate(&self, st: &mut RegionState<K>, length: u32, end_of_file: u64) -> (DescriptorId, bool) {
        if st.do_recycle {
            if let Some(id) = st.recycle.take_ceiling(length) {
                if let Some(slot) = st.arena.get_mut(id) {
                    debug!(region = %self.name(), %slot, length, "Using recycled slot");
                    slot.length = length;
                    st.bytes_free = st.bytes_free.saturating_sub(slot.record_size());
                    st.recycle_count += 1;
                    return (id, false);
                }
            }
        }
        (st.arena.insert(SlotDescriptor::new(end_of_file, length)), true)
    }

    /// Read the payload stored under `key`
    pub fn get_bytes(&self, key: &K) -> Result<Option<Vec<u8>>> {
        let st = self.state.read();
        st.ensure_alive(self.name())?;

        let Some(id) = st.index.lock().get(key) else {
            return Ok(None);
        };
        let slot = st.arena.get(id).copied().ok_or_else(|| {
            Error::Corruption(format!("key {:?} references missing descriptor {}", key, id))
        })?;

        debug!(region = %self.name(), ?key, %slot, "Found on disk");
        st.files()?.data.read(&slot).map(Some)
    }

    /// Re-run the consistency check against the current index
    pub fn verify(&self, check_overlaps: bool) -> bool {
        let st = self.state.read();
        st.is_alive() && self.check_key_data_consistency(&st, check_overlaps)
    }

    pub fn record_hit(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove every key covered by `removal`
    pub fn remove(self: &Arc<Self>, removal: &RemovalKey<K>) -> Result<bool> {
        let mut guard = self.state.write();
        let st = &mut *guard;
        st.ensure_alive(self.name())?;

        let keys = match removal {
            RemovalKey::Exact(key) => vec![key.clone()],
            _ => st.index.get_mut().matching_keys(|key| removal.matches(key)),
        };

        let mut removed = false;
        for key in keys {
            if let Some(id) = st.index.get_mut().remove(&key) {
                self.retire(st, id);
                removed = true;
            }
            debug!(region = %self.name(), ?key, removed, "Disk removal");
        }

        if removed {
            self.maybe_optimize_real_time(st);
        }
        Ok(removed)
    }

    /// Delete and recreate both files and forget every key
    ///
    /// Last-resort recovery for corruption, and the implementation of remove-all.
    pub fn reset(&self) {
        warn!(region = %self.name(), "Resetting cache");

        let mut guard = self.state.write();
        let st = &mut *guard;
        if !st.is_alive() {
            debug!(region = %self.name(), status = ?st.status, "Skipping reset of inactive region");
            return;
        }

        if let Some(files) = st.files.take() {
            if let Err(e) = files.close() {
                debug!(region = %self.name(), "Failure closing files before reset: {}", e);
            }
        }
        for path in [self.config.data_file_path(), self.config.key_file_path()] {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(region = %self.name(), ?path, "Could not delete file: {}", e);
            }
        }

        st.clear_structures();
        st.generation += 1;

        match RegionFiles::open(&self.config) {
            Ok(files) => st.files = Some(files),
            Err(e) => {
                error!(region = %self.name(), "Failure resetting state: {}", e);
                st.status = RegionStatus::Closed;
            }
        }
    }

    pub fn key_set(&self) -> Result<HashSet<K>> {
        let st = self.state.read();
        st.ensure_alive(self.name())?;
        let keys = st.index.lock().keys();
        Ok(keys.into_iter().collect())
    }

    /// Keys whose name satisfies the predicate
    pub fn matching_keys<F: Fn(&K) -> bool>(&self, predicate: F) -> Result<Vec<K>> {
        let st = self.state.read();
        st.ensure_alive(self.name())?;
        let keys = st.index.lock().matching_keys(predicate);
        Ok(keys)
    }

    /// Current descriptor of a key
    pub fn slot_of(&self, key: &K) -> Option<SlotDescriptor> {
        let st = self.state.read();
        let id = st.index.lock().peek(key)?;
        st.arena.get(id).copied()
    }

    pub fn live_slots(&self) -> Vec<SlotDescriptor> {
        let st = self.state.read();
        st.position_sorted().into_iter().map(|(_, slot)| slot).collect()
    }

    pub fn free_slots(&self) -> Vec<SlotDescriptor> {
        let st = self.state.read();
        st.recycle
            .ids()
            .filter_map(|id| st.arena.get(id).copied())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().index.lock().len()
    }

    pub fn status(&self) -> RegionStatus {
        self.state.read().status
    }

    pub fn data_file_length(&self) -> Result<u64> {
        let st = self.state.read();
        st.files()?.data.length()
    }

    pub fn stats(&self) -> DiskCacheStats {
        let st = self.state.read();
        let data_file_length = st
            .files
            .as_ref()
            .and_then(|files| files.data.length().ok())
            .unwrap_or(0);

        let key_count = st.index.lock().len();

        DiskCacheStats {
            region_name: self.name().to_string(),
            alive: st.is_alive(),
            key_count,
            data_file_length,
            max_key_size: self.config.max_key_size,
            hit_count: self.hit_count.load(Ordering::Relaxed),
            bytes_free: st.bytes_free,
            remove_count: st.remove_count,
            times_optimized: st.times_optimized,
            recycle_count: st.recycle_count,
            recycle_bin_size: st.recycle.len(),
            startup_size: st.startup_size,
        }
    }

    /// Log every key with its position at debug level
    pub fn dump(&self) {
        let st = self.state.read();
        let index = st.index.lock();
        debug!(region = %self.name(), keys = index.len(), "[dump] Number of keys");
        for (key, id) in index.iter() {
            if let Some(slot) = st.arena.get(id) {
                debug!(region = %self.name(), ?key, pos = slot.position, len = slot.length, "[dump] Disk element");
            }
        }
    }
}
