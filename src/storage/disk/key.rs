//! Key types understood by the disk cache
//!
//! Keys are opaque to the storage core except for two optional views used by
//! group removal and pattern matching: a textual name and a group id.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// Bound for keys stored in a disk cache region
pub trait DiskKey:
    Clone + Eq + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Textual name, used by prefix removal and pattern matching
    fn name(&self) -> Option<&str> {
        None
    }

    /// Group membership, used by group removal
    fn group_id(&self) -> Option<&GroupId> {
        None
    }
}

impl DiskKey for String {
    fn name(&self) -> Option<&str> {
        Some(self.as_str())
    }
}

impl DiskKey for u64 {}

/// Identifies a named group of entries within a cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId {
    pub cache_name: String,
    pub group_name: String,
}

impl GroupId {
    pub fn new(cache_name: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            group_name: group_name.into(),
        }
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[groupId={}, {}]", self.cache_name, self.group_name)
    }
}

/// One attribute of a group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupAttrName {
    pub group_id: GroupId,
    pub attr_name: String,
}

impl GroupAttrName {
    pub fn new(group_id: GroupId, attr_name: impl Into<String>) -> Self {
        Self {
            group_id,
            attr_name: attr_name.into(),
        }
    }
}

impl DiskKey for GroupAttrName {
    fn group_id(&self) -> Option<&GroupId> {
        Some(&self.group_id)
    }
}

/// Key type mixing plain names and group attributes in one region
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKey {
    Name(String),
    Attr(GroupAttrName),
}

impl DiskKey for CacheKey {
    fn name(&self) -> Option<&str> {
        match self {
            CacheKey::Name(name) => Some(name),
            CacheKey::Attr(_) => None,
        }
    }

    fn group_id(&self) -> Option<&GroupId> {
        match self {
            CacheKey::Name(_) => None,
            CacheKey::Attr(attr) => Some(&attr.group_id),
        }
    }
}

impl From<&str> for CacheKey {
    fn from(name: &str) -> Self {
        CacheKey::Name(name.to_string())
    }
}

impl From<GroupAttrName> for CacheKey {
    fn from(attr: GroupAttrName) -> Self {
        CacheKey::Attr(attr)
    }
}

/// What a removal targets, chosen by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalKey<K> {
    /// A single key
    Exact(K),
    /// Every key whose name starts with the prefix
    PrefixGroup(String),
    /// Every group attribute of the group
    HierGroup(GroupId),
}

impl<K: DiskKey> RemovalKey<K> {
    /// Whether `key` is covered by this removal
    pub fn matches(&self, key: &K) -> bool {
        match self {
            RemovalKey::Exact(exact) => exact == key,
            RemovalKey::PrefixGroup(prefix) => key
                .name()
                .map(|name| name.starts_with(prefix.as_str()))
                .unwrap_or(false),
            RemovalKey::HierGroup(group) => key.group_id() == Some(group),
        }
    }
}

impl<K> From<K> for RemovalKey<K> {
    fn from(key: K) -> Self {
        RemovalKey::Exact(key)
    }
}
