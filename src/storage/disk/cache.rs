//! Typed cache facade over a region
//!
//! [`IndexedDiskCache`] is the caller-facing API. It serializes values,
//! forwards bytes to the region and turns failures into the best-effort
//! results a cache tier is expected to give: a failed put is `false`, a
//! failed get is a miss. Corruption found while reading resets the region.

use super::descriptor::SlotDescriptor;
use super::key::{DiskKey, RemovalKey};
use super::region::{Region, RegionStatus};
use super::serializer::{CompressingSerializer, ElementSerializer, JsonSerializer};
use super::stats::DiskCacheStats;
use crate::config::IndexedDiskCacheConfig;
use crate::error::{Error, Result};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Disk-resident cache region storing values of type `V` under keys of type `K`
///
/// Cloning is cheap; clones share the same region.
pub struct IndexedDiskCache<K: DiskKey, V> {
    region: Arc<Region<K>>,
    serializer: Arc<dyn ElementSerializer<V>>,
}

impl<K: DiskKey, V> Clone for IndexedDiskCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            region: Arc::clone(&self.region),
            serializer: Arc::clone(&self.serializer),
        }
    }
}

impl<K: DiskKey, V: Serialize + DeserializeOwned + 'static> IndexedDiskCache<K, V> {
    /// Open a region storing values as JSON
    pub fn new(config: IndexedDiskCacheConfig) -> Result<Self> {
        Self::with_serializer(config, Arc::new(JsonSerializer::new()))
    }

    /// Open a region storing values as zstd-compressed JSON
    pub fn compressed(config: IndexedDiskCacheConfig) -> Result<Self> {
        Self::with_serializer(
            config,
            Arc::new(CompressingSerializer::new(JsonSerializer::new())),
        )
    }
}

impl<K: DiskKey, V> IndexedDiskCache<K, V> {
    /// Open a region with a custom serializer
    ///
    /// Only an invalid configuration is an error. If the files cannot be
    /// opened the cache is returned un-alive and every operation is a no-op.
    pub fn with_serializer(
        config: IndexedDiskCacheConfig,
        serializer: Arc<dyn ElementSerializer<V>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            region: Region::open(config),
            serializer,
        })
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn config(&self) -> &IndexedDiskCacheConfig {
        &self.region.config
    }

    /// Store a value, returning whether it is now cached
    pub fn put(&self, key: K, value: &V) -> bool {
        let data = match self.serializer.serialize(value) {
            Ok(data) => data,
            Err(e) => {
                error!(region = %self.name(), ?key, "Failure serializing element: {}", e);
                return false;
            }
        };

        match self.region.put_bytes(key, &data) {
            Ok(stored) => stored,
            Err(Error::NotAlive(reason)) => {
                debug!(region = %self.name(), "Put skipped: {}", reason);
                false
            }
            Err(e) => {
                error!(region = %self.name(), "Failure updating element: {}", e);
                false
            }
        }
    }

    /// Fetch a value; any failure is a miss
    pub fn get(&self, key: &K) -> Option<V> {
        let bytes = match self.region.get_bytes(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(Error::NotAlive(reason)) => {
                debug!(region = %self.name(), "Get skipped: {}", reason);
                return None;
            }
            Err(e) if e.is_corruption() => {
                warn!(region = %self.name(), ?key, "Corrupted record, resetting region: {}", e);
                self.region.reset();
                return None;
            }
            Err(e) => {
                error!(region = %self.name(), ?key, "Failure getting from disk: {}", e);
                return None;
            }
        };

        match self.serializer.deserialize(&bytes) {
            Ok(value) => {
                self.region.record_hit();
                Some(value)
            }
            Err(e) => {
                warn!(region = %self.name(), ?key, "Undecodable record, resetting region: {}", e);
                self.region.reset();
                None
            }
        }
    }

    /// Fetch every value whose key name fully matches `pattern`
    ///
    /// Keys without a name never match. Keys removed between the scan and
    /// the read are left out.
    pub fn get_matching(&self, pattern: &str) -> Result<HashMap<K, V>> {
        let regex = Regex::new(&format!("^(?:{})$", pattern))
            .map_err(|e| Error::InvalidArgument(format!("Invalid key pattern {:?}: {}", pattern, e)))?;

        let keys = match self
            .region
            .matching_keys(|key| key.name().map_or(false, |name| regex.is_match(name)))
        {
            Ok(keys) => keys,
            Err(e) => {
                debug!(region = %self.name(), "Get matching skipped: {}", e);
                return Ok(HashMap::new());
            }
        };

        Ok(keys
            .into_iter()
            .filter_map(|key| self.get(&key).map(|value| (key, value)))
            .collect())
    }

    /// Remove a key, a name prefix, or a whole group
    ///
    /// Returns whether anything was removed.
    pub fn remove(&self, key: impl Into<RemovalKey<K>>) -> bool {
        match self.region.remove(&key.into()) {
            Ok(removed) => removed,
            Err(Error::NotAlive(reason)) => {
                debug!(region = %self.name(), "Remove skipped: {}", reason);
                false
            }
            Err(e) => {
                error!(region = %self.name(), "Failure removing element: {}", e);
                false
            }
        }
    }

    /// Drop every entry and both files
    pub fn remove_all(&self) {
        self.region.reset();
    }

    /// Snapshot of the stored keys
    pub fn key_set(&self) -> HashSet<K> {
        self.region.key_set().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the index to the key file now
    pub fn save_keys(&self) -> Result<()> {
        let st = self.region.state.write();
        if !st.is_alive() {
            return Err(Error::NotAlive(format!("region {} is {:?}", self.name(), st.status)));
        }
        self.region.save_keys(&st)
    }

    /// Compact the data file and wait for the pass to finish
    ///
    /// Joins a pass that is already running instead of starting a second one.
    pub fn optimize(&self) -> bool {
        match self.region.optimize() {
            Ok(()) => true,
            Err(e) => {
                warn!(region = %self.name(), "Optimization not run: {}", e);
                false
            }
        }
    }

    /// Check every record against the data file, optionally for overlaps too
    pub fn verify(&self, check_overlaps: bool) -> bool {
        self.region.verify(check_overlaps)
    }

    pub fn stats(&self) -> DiskCacheStats {
        self.region.stats()
    }

    /// Log every key and its position at debug level
    pub fn dump(&self) {
        self.region.dump();
    }

    /// Where a key's record currently lives
    pub fn slot_of(&self, key: &K) -> Option<SlotDescriptor> {
        self.region.slot_of(key)
    }

    /// Live records in file order
    pub fn live_slots(&self) -> Vec<SlotDescriptor> {
        self.region.live_slots()
    }

    /// Slots waiting in the recycle bin
    pub fn free_slots(&self) -> Vec<SlotDescriptor> {
        self.region.free_slots()
    }

    pub fn data_file_length(&self) -> u64 {
        self.region.data_file_length().unwrap_or(0)
    }

    pub fn is_alive(&self) -> bool {
        self.status() == RegionStatus::Alive
    }

    pub fn status(&self) -> RegionStatus {
        self.region.status()
    }

    /// Persist keys and close the files
    ///
    /// Waits for a running compaction, or runs a final one when configured
    /// and anything was freed. Gives up after `dispose_timeout`.
    pub fn dispose(&self) {
        self.region.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::key::{GroupAttrName, GroupId};
    use std::path::{Path, PathBuf};

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("diskcache_{}_{}", name, std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        dir
    }

    fn open(dir: &Path) -> Result<IndexedDiskCache<String, String>> {
        IndexedDiskCache::new(IndexedDiskCacheConfig::new("test", dir).with_max_key_size(0))
    }

    #[test]
    fn test_put_get_remove() -> Result<()> {
        let dir = test_dir("put_get_remove");
        let cache = open(&dir)?;
        assert!(cache.is_alive());

        assert!(cache.put("a".to_string(), &"alpha".to_string()));
        assert_eq!(cache.get(&"a".to_string()), Some("alpha".to_string()));
        assert_eq!(cache.stats().hit_count, 1);

        assert!(cache.remove("a".to_string()));
        assert!(!cache.remove("a".to_string()));
        assert_eq!(cache.get(&"a".to_string()), None);

        cache.dispose();
        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn test_shrinking_update_reuses_slot() -> Result<()> {
        let dir = test_dir("shrink_update");
        let cache = open(&dir)?;

        cache.put("a".to_string(), &"x".repeat(100));
        let before = cache.slot_of(&"a".to_string());
        cache.put("a".to_string(), &"y".repeat(10));
        let after = cache.slot_of(&"a".to_string());

        assert_eq!(before.map(|s| s.position), after.map(|s| s.position));
        assert!(cache.free_slots().is_empty());
        assert_eq!(cache.get(&"a".to_string()), Some("y".repeat(10)));

        cache.dispose();
        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn test_growing_update_retires_old_slot() -> Result<()> {
        let dir = test_dir("grow_update");
        let cache = open(&dir)?;

        cache.put("a".to_string(), &"x".repeat(10));
        let before = cache.slot_of(&"a".to_string());
        cache.put("a".to_string(), &"y".repeat(100));

        assert_eq!(cache.free_slots(), before.into_iter().collect::<Vec<_>>());
        assert!(cache.stats().bytes_free > 0);

        cache.dispose();
        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn test_get_matching() -> Result<()> {
        let dir = test_dir("get_matching");
        let cache = open(&dir)?;

        cache.put("user:1".to_string(), &"ada".to_string());
        cache.put("user:2".to_string(), &"grace".to_string());
        cache.put("order:1".to_string(), &"book".to_string());

        let users = cache.get_matching("user:\\d+")?;
        assert_eq!(users.len(), 2);
        assert_eq!(users.get("user:2"), Some(&"grace".to_string()));

        // Full match only
        assert!(cache.get_matching("user")?.is_empty());
        assert!(cache.get_matching("(unclosed").is_err());

        cache.dispose();
        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn test_group_removal() -> Result<()> {
        let dir = test_dir("group_removal");
        let cache: IndexedDiskCache<GroupAttrName, u32> = IndexedDiskCache::new(
            IndexedDiskCacheConfig::new("groups", &dir),
        )?;

        let carts = GroupId::new("shop", "carts");
        let wishlists = GroupId::new("shop", "wishlists");
        cache.put(GroupAttrName::new(carts.clone(), "ada"), &1);
        cache.put(GroupAttrName::new(carts.clone(), "grace"), &2);
        cache.put(GroupAttrName::new(wishlists.clone(), "ada"), &3);

        assert!(cache.remove(RemovalKey::HierGroup(carts.clone())));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&GroupAttrName::new(wishlists, "ada")), Some(3));
        assert!(!cache.remove(RemovalKey::HierGroup(carts)));

        cache.dispose();
        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn test_operations_after_dispose_are_noops() -> Result<()> {
        let dir = test_dir("after_dispose");
        let cache = open(&dir)?;
        cache.put("a".to_string(), &"alpha".to_string());
        cache.dispose();

        assert_eq!(cache.status(), RegionStatus::Closed);
        assert!(!cache.put("b".to_string(), &"beta".to_string()));
        assert_eq!(cache.get(&"a".to_string()), None);
        assert!(!cache.remove("a".to_string()));
        assert!(cache.key_set().is_empty());
        assert!(cache.save_keys().is_err());
        assert!(!cache.optimize());

        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn test_undecodable_record_resets_region() -> Result<()> {
        let dir = test_dir("undecodable");
        let config = IndexedDiskCacheConfig::new("mixed", &dir);

        let writer: IndexedDiskCache<String, String> = IndexedDiskCache::new(config.clone())?;
        writer.put("a".to_string(), &"not a number".to_string());
        writer.dispose();

        let reader: IndexedDiskCache<String, u64> = IndexedDiskCache::new(config)?;
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.get(&"a".to_string()), None);
        assert!(reader.is_alive());
        assert!(reader.is_empty());

        reader.dispose();
        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = IndexedDiskCacheConfig::new("", "/tmp");
        assert!(IndexedDiskCache::<String, String>::new(config).is_err());
    }
}
