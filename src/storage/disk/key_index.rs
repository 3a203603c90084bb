//! In-memory key index for the disk cache
//!
//! Maps keys to descriptor ids. Bounded indexes evict in LRU order; the
//! evicted entries are handed back to the caller, which owns the recycle bin.

use super::descriptor::DescriptorId;
use super::record_file::HEADER_SIZE_BYTES;
use crate::config::DiskLimitType;
use lru::LruCache;
use std::collections::HashMap;
use std::hash::Hash;

/// How the index is bounded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexLimit {
    Unbounded,
    /// At most this many keys
    Count(usize),
    /// At most this many kilobytes of stored records
    SizeKb(u64),
}

impl IndexLimit {
    /// `max_key_size == 0` means unbounded
    pub fn from_config(max_key_size: usize, limit_type: DiskLimitType) -> Self {
        match (max_key_size, limit_type) {
            (0, _) => IndexLimit::Unbounded,
            (max, DiskLimitType::Count) => IndexLimit::Count(max),
            (max, DiskLimitType::Size) => IndexLimit::SizeKb(max as u64),
        }
    }
}

/// Kilobyte charge of one record, rounded up per entry
pub fn kb_charge(length: u32) -> u64 {
    (length as u64 + HEADER_SIZE_BYTES) / 1024 + 1
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    id: DescriptorId,
    charge_kb: u64,
}

enum Entries<K: Hash + Eq> {
    Plain(HashMap<K, IndexEntry>),
    Lru(LruCache<K, IndexEntry>),
}

/// Result of an insert
#[derive(Debug)]
pub struct Insertion<K> {
    /// Id previously stored under the key
    pub replaced: Option<DescriptorId>,
    /// Entries pushed out by the bound, least recently used first
    pub evicted: Vec<(K, DescriptorId)>,
}

/// Key → descriptor id map with an optional LRU bound
pub struct KeyIndex<K: Hash + Eq> {
    entries: Entries<K>,
    limit: IndexLimit,
    content_kb: u64,
}

impl<K: Hash + Eq + Clone> KeyIndex<K> {
    pub fn new(limit: IndexLimit) -> Self {
        let entries = match limit {
            IndexLimit::Unbounded => Entries::Plain(HashMap::new()),
            _ => Entries::Lru(LruCache::unbounded()),
        };
        Self {
            entries,
            limit,
            content_kb: 0,
        }
    }

    /// Look up a key, marking it most recently used
    pub fn get(&mut self, key: &K) -> Option<DescriptorId> {
        match &mut self.entries {
            Entries::Plain(map) => map.get(key).map(|e| e.id),
            Entries::Lru(cache) => cache.get(key).map(|e| e.id),
        }
    }

    /// Look up a key without touching recency
    pub fn peek(&self, key: &K) -> Option<DescriptorId> {
        match &self.entries {
            Entries::Plain(map) => map.get(key).map(|e| e.id),
            Entries::Lru(cache) => cache.peek(key).map(|e| e.id),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    /// Insert or replace, then enforce the bound
    pub fn insert(&mut self, key: K, id: DescriptorId, length: u32) -> Insertion<K> {
        let entry = IndexEntry {
            id,
            charge_kb: kb_charge(length),
        };
        self.content_kb += entry.charge_kb;

        let previous = match &mut self.entries {
            Entries::Plain(map) => map.insert(key, entry),
            Entries::Lru(cache) => cache.put(key, entry),
        };
        if let Some(old) = previous {
            self.content_kb -= old.charge_kb;
        }

        Insertion {
            replaced: previous.map(|e| e.id),
            evicted: self.evict_overflow(),
        }
    }

    fn evict_overflow(&mut self) -> Vec<(K, DescriptorId)> {
        let mut evicted = Vec::new();
        let Entries::Lru(cache) = &mut self.entries else {
            return evicted;
        };

        loop {
            let over = match self.limit {
                IndexLimit::Unbounded => false,
                IndexLimit::Count(max) => cache.len() > max,
                IndexLimit::SizeKb(max) => self.content_kb > max && !cache.is_empty(),
            };
            if !over {
                break;
            }
            match cache.pop_lru() {
                Some((key, entry)) => {
                    self.content_kb -= entry.charge_kb;
                    evicted.push((key, entry.id));
                }
                None => break,
            }
        }
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<DescriptorId> {
        let removed = match &mut self.entries {
            Entries::Plain(map) => map.remove(key),
            Entries::Lru(cache) => cache.pop(key),
        };
        removed.map(|entry| {
            self.content_kb -= entry.charge_kb;
            entry.id
        })
    }

    /// Keys matching a predicate
    pub fn matching_keys<F: Fn(&K) -> bool>(&self, predicate: F) -> Vec<K> {
        self.iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Every stored descriptor id
    pub fn ids(&self) -> Vec<DescriptorId> {
        self.iter().map(|(_, id)| id).collect()
    }

    /// Iterate over `(key, id)` pairs in unspecified order
    pub fn iter(&self) -> Box<dyn Iterator<Item = (&K, DescriptorId)> + '_> {
        match &self.entries {
            Entries::Plain(map) => Box::new(map.iter().map(|(k, e)| (k, e.id))),
            Entries::Lru(cache) => Box::new(cache.iter().map(|(k, e)| (k, e.id))),
        }
    }

    pub fn len(&self) -> usize {
        match &self.entries {
            Entries::Plain(map) => map.len(),
            Entries::Lru(cache) => cache.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kilobytes charged by the current entries
    pub fn content_kb(&self) -> u64 {
        self.content_kb
    }

    pub fn clear(&mut self) {
        match &mut self.entries {
            Entries::Plain(map) => map.clear(),
            Entries::Lru(cache) => cache.clear(),
        }
        self.content_kb = 0;
    }
}
