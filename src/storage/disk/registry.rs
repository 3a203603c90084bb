//! Named disk cache regions
//!
//! A registry hands out one [`IndexedDiskCache`] per region name, opening
//! it on first use from a shared base configuration. Each region gets its
//! own pair of files under the base `disk_path`.

use super::cache::IndexedDiskCache;
use super::key::DiskKey;
use super::serializer::{ElementSerializer, JsonSerializer};
use crate::config::IndexedDiskCacheConfig;
use crate::error::Result;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Registry of disk cache regions sharing a key type, value type and serializer
pub struct DiskCacheRegistry<K: DiskKey, V> {
    base_config: IndexedDiskCacheConfig,
    serializer: Arc<dyn ElementSerializer<V>>,
    regions: RwLock<HashMap<String, IndexedDiskCache<K, V>>>,
}

impl<K: DiskKey, V: Serialize + DeserializeOwned + 'static> DiskCacheRegistry<K, V> {
    /// Registry whose regions store values as JSON
    pub fn json(base_config: IndexedDiskCacheConfig) -> Self {
        Self::new(base_config, Arc::new(JsonSerializer::new()))
    }
}

impl<K: DiskKey, V> DiskCacheRegistry<K, V> {
    pub fn new(base_config: IndexedDiskCacheConfig, serializer: Arc<dyn ElementSerializer<V>>) -> Self {
        Self {
            base_config,
            serializer,
            regions: RwLock::new(HashMap::new()),
        }
    }

    /// Return the named region, opening it if needed
    pub fn get_or_create(&self, name: &str) -> Result<IndexedDiskCache<K, V>> {
        if let Some(cache) = self.regions.read().get(name) {
            return Ok(cache.clone());
        }

        let mut regions = self.regions.write();
        // Another caller may have opened it between the two locks
        if let Some(cache) = regions.get(name) {
            return Ok(cache.clone());
        }

        let config = self.base_config.clone().with_region_name(name);
        let cache = IndexedDiskCache::with_serializer(config, Arc::clone(&self.serializer))?;
        info!(region = %name, "Registered disk cache region");
        regions.insert(name.to_string(), cache.clone());
        Ok(cache)
    }

    pub fn get(&self, name: &str) -> Option<IndexedDiskCache<K, V>> {
        self.regions.read().get(name).cloned()
    }

    /// Names of the open regions, sorted
    pub fn region_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.regions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispose and forget one region
    pub fn dispose(&self, name: &str) -> bool {
        let removed = self.regions.write().remove(name);
        match removed {
            Some(cache) => {
                cache.dispose();
                true
            }
            None => false,
        }
    }

    /// Dispose every region
    pub fn dispose_all(&self) {
        let regions: Vec<_> = self.regions.write().drain().collect();
        info!(count = regions.len(), "Disposing all disk cache regions");
        for (_, cache) in regions {
            cache.dispose();
        }
    }

    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
