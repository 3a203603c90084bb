//! End-to-end tests for indexed disk cache regions

use photondb_diskcache::error::Result;
use photondb_diskcache::storage::disk::descriptor::find_overlap;
use photondb_diskcache::{
    DiskLimitType, ElementSerializer, IndexedDiskCache, IndexedDiskCacheConfig, RegionStatus,
    RemovalKey,
};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

/// Stores byte payloads unchanged so record lengths are exact
struct RawSerializer;

impl ElementSerializer<Vec<u8>> for RawSerializer {
    fn serialize(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

fn raw_cache(config: IndexedDiskCacheConfig) -> Result<IndexedDiskCache<String, Vec<u8>>> {
    IndexedDiskCache::with_serializer(config, Arc::new(RawSerializer))
}

fn key(name: &str) -> String {
    name.to_string()
}

#[test]
fn test_round_trip() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let cache: IndexedDiskCache<String, Vec<String>> =
        IndexedDiskCache::new(IndexedDiskCacheConfig::new("round_trip", temp_dir.path()))?;

    let tags = vec!["rust".to_string(), "cache".to_string()];
    assert!(cache.put(key("tags"), &tags));
    assert_eq!(cache.get(&key("tags")), Some(tags));
    assert_eq!(cache.get(&key("missing")), None);
    assert_eq!(cache.len(), 1);

    cache.dispose();
    Ok(())
}

#[test]
fn test_remove_is_idempotent() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let cache = raw_cache(IndexedDiskCacheConfig::new("remove", temp_dir.path()))?;

    cache.put(key("a"), &vec![1u8; 32]);
    assert!(cache.remove(key("a")));
    assert!(!cache.remove(key("a")));
    assert_eq!(cache.get(&key("a")), None);
    assert_eq!(cache.stats().bytes_free, 36);

    cache.dispose();
    Ok(())
}

#[test]
fn test_freed_slot_reused_by_smaller_record() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let cache = raw_cache(IndexedDiskCacheConfig::new("reuse", temp_dir.path()))?;

    cache.put(key("a"), &vec![b'a'; 100]);
    cache.put(key("c"), &vec![b'c'; 100]);
    let a_slot = cache.slot_of(&key("a")).map(|s| s.position);
    let file_length = cache.data_file_length();

    assert!(cache.remove(key("a")));
    assert!(cache.put(key("b"), &vec![b'b'; 80]));

    assert_eq!(cache.slot_of(&key("b")).map(|s| s.position), a_slot);
    assert_eq!(cache.data_file_length(), file_length);
    assert_eq!(cache.get(&key("b")), Some(vec![b'b'; 80]));
    assert_eq!(cache.get(&key("c")), Some(vec![b'c'; 100]));

    let stats = cache.stats();
    assert_eq!(stats.recycle_count, 1);
    assert_eq!(stats.recycle_bin_size, 0);
    // The unused tail of the reused slot still counts as free
    assert_eq!(stats.bytes_free, 104 - 84);

    cache.dispose();
    Ok(())
}

#[test]
fn test_larger_record_does_not_fit_freed_slot() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let cache = raw_cache(IndexedDiskCacheConfig::new("no_fit", temp_dir.path()))?;

    cache.put(key("a"), &vec![0u8; 50]);
    cache.remove(key("a"));
    cache.put(key("b"), &vec![0u8; 51]);

    assert_eq!(cache.slot_of(&key("b")).map(|s| s.position), Some(54));
    assert_eq!(cache.free_slots().len(), 1);

    cache.dispose();
    Ok(())
}

#[test]
fn test_count_limited_eviction_recycles_slot() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let cache = raw_cache(
        IndexedDiskCacheConfig::new("evict", temp_dir.path()).with_max_key_size(2),
    )?;

    cache.put(key("k1"), &vec![1u8; 10]);
    let k1_position = cache.slot_of(&key("k1")).map(|s| s.position);
    cache.put(key("k2"), &vec![2u8; 10]);
    cache.put(key("k3"), &vec![3u8; 10]);

    assert_eq!(cache.get(&key("k1")), None);
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.free_slots().len(), 1);

    // The next new key takes the evicted slot
    cache.put(key("k4"), &vec![4u8; 10]);
    assert_eq!(cache.slot_of(&key("k4")).map(|s| s.position), k1_position);
    assert_eq!(cache.get(&key("k4")), Some(vec![4u8; 10]));
    assert_eq!(cache.get(&key("k3")), Some(vec![3u8; 10]));

    cache.dispose();
    Ok(())
}

#[test]
fn test_size_limited_eviction() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let cache = raw_cache(
        IndexedDiskCacheConfig::new("size", temp_dir.path())
            .with_max_key_size(4)
            .with_disk_limit_type(DiskLimitType::Size),
    )?;

    // Each record is charged 2 KB
    cache.put(key("a"), &vec![0u8; 1500]);
    cache.put(key("b"), &vec![0u8; 1500]);
    cache.put(key("c"), &vec![0u8; 1500]);
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get(&key("a")), None);

    // Too big to ever fit: evicts everything including itself, nothing is written
    let before = cache.data_file_length();
    assert!(!cache.put(key("huge"), &vec![0u8; 8000]));
    assert_eq!(cache.get(&key("huge")), None);
    assert_eq!(cache.data_file_length(), before);
    assert!(cache.verify(true));

    cache.dispose();
    Ok(())
}

#[test]
fn test_corrupted_data_file_resets_region() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = IndexedDiskCacheConfig::new("corrupt", temp_dir.path());
    let cache = raw_cache(config.clone())?;

    cache.put(key("a"), &vec![1u8; 64]);
    cache.put(key("b"), &vec![2u8; 64]);

    // Chop the second record in half behind the cache's back
    let data = std::fs::OpenOptions::new()
        .write(true)
        .open(config.data_file_path())?;
    data.set_len(68 + 30)?;
    drop(data);

    assert_eq!(cache.get(&key("b")), None);
    assert!(cache.is_alive());
    assert!(cache.is_empty());
    assert_eq!(cache.data_file_length(), 0);

    // Still usable afterwards
    assert!(cache.put(key("c"), &vec![3u8; 8]));
    assert_eq!(cache.get(&key("c")), Some(vec![3u8; 8]));

    cache.dispose();
    Ok(())
}

#[test]
fn test_truncated_data_file_detected_on_startup() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = IndexedDiskCacheConfig::new("startup_check", temp_dir.path())
        .with_optimize_on_shutdown(false);

    let cache = raw_cache(config.clone())?;
    cache.put(key("a"), &vec![1u8; 64]);
    cache.put(key("b"), &vec![2u8; 64]);
    cache.dispose();

    let data = std::fs::OpenOptions::new()
        .write(true)
        .open(config.data_file_path())?;
    data.set_len(100)?;
    drop(data);

    let reopened = raw_cache(config.clone())?;
    assert!(reopened.is_alive());
    assert!(reopened.is_empty());
    assert_eq!(std::fs::metadata(config.key_file_path())?.len(), 0);

    reopened.dispose();
    Ok(())
}

#[test]
fn test_key_file_position_near_u64_max_resets_on_startup() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = IndexedDiskCacheConfig::new("wrapping", temp_dir.path());

    let payload = br#"[["a",{"position":18446744073709551614,"length":8}]]"#;
    let mut record = (payload.len() as u32).to_be_bytes().to_vec();
    record.extend_from_slice(payload);
    std::fs::write(config.key_file_path(), &record)?;
    std::fs::write(config.data_file_path(), [0u8; 16])?;

    let reopened = raw_cache(config.clone())?;
    assert!(reopened.is_alive());
    assert!(reopened.is_empty());
    assert_eq!(reopened.get(&key("a")), None);
    assert_eq!(std::fs::metadata(config.key_file_path())?.len(), 0);
    assert_eq!(reopened.data_file_length(), 0);

    reopened.dispose();
    Ok(())
}

#[test]
fn test_optimize_compacts_and_preserves_content() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let cache = raw_cache(IndexedDiskCacheConfig::new("compact", temp_dir.path()))?;

    for i in 0..20u8 {
        cache.put(format!("key{}", i), &vec![i; 100]);
    }
    for i in (0..20u8).step_by(2) {
        cache.remove(format!("key{}", i));
    }
    let before = cache.data_file_length();
    assert_eq!(before, 20 * 104);

    assert!(cache.optimize());

    assert_eq!(cache.data_file_length(), 10 * 104);
    for i in (1..20u8).step_by(2) {
        assert_eq!(cache.get(&format!("key{}", i)), Some(vec![i; 100]));
    }
    let live = cache.live_slots();
    assert_eq!(live.first().map(|s| s.position), Some(0));
    assert_eq!(find_overlap(&live), None);

    let stats = cache.stats();
    assert_eq!(stats.times_optimized, 1);
    assert_eq!(stats.bytes_free, 0);
    assert_eq!(stats.recycle_bin_size, 0);
    assert!(cache.verify(true));

    cache.dispose();
    Ok(())
}

#[test]
fn test_real_time_optimization_after_removals() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = IndexedDiskCacheConfig::new("real_time", temp_dir.path())
        .with_optimize_at_remove_count(2)
        .with_optimize_on_shutdown(false);
    let cache = raw_cache(config.clone())?;

    for i in 0..5u8 {
        cache.put(format!("key{}", i), &vec![i; 16]);
    }
    // The third counted removal starts a pass
    cache.remove(key("key0"));
    cache.remove(key("key1"));
    cache.remove(key("key2"));

    // Dispose waits for the running pass
    cache.dispose();
    assert_eq!(cache.status(), RegionStatus::Closed);
    assert_eq!(cache.stats().times_optimized, 1);
    assert_eq!(std::fs::metadata(config.data_file_path())?.len(), 2 * 20);

    let reopened = raw_cache(config)?;
    assert_eq!(reopened.get(&key("key3")), Some(vec![3u8; 16]));
    assert_eq!(reopened.get(&key("key4")), Some(vec![4u8; 16]));
    reopened.dispose();
    Ok(())
}

#[test]
fn test_shutdown_optimization() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = IndexedDiskCacheConfig::new("shutdown", temp_dir.path());
    let cache = raw_cache(config.clone())?;

    cache.put(key("a"), &vec![1u8; 100]);
    cache.put(key("b"), &vec![2u8; 100]);
    cache.remove(key("a"));
    cache.dispose();

    assert_eq!(std::fs::metadata(config.data_file_path())?.len(), 104);

    let reopened = raw_cache(config)?;
    assert_eq!(reopened.slot_of(&key("b")).map(|s| s.position), Some(0));
    assert_eq!(reopened.get(&key("b")), Some(vec![2u8; 100]));
    reopened.dispose();
    Ok(())
}

#[test]
fn test_persistence_across_restart() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = IndexedDiskCacheConfig::new("persist", temp_dir.path());

    let cache: IndexedDiskCache<String, String> = IndexedDiskCache::new(config.clone())?;
    for i in 0..50 {
        cache.put(format!("key{}", i), &format!("value{}", i));
    }
    cache.dispose();

    let reopened: IndexedDiskCache<String, String> = IndexedDiskCache::new(config)?;
    assert_eq!(reopened.len(), 50);
    assert_eq!(reopened.stats().startup_size, 50);
    for i in 0..50 {
        assert_eq!(reopened.get(&format!("key{}", i)), Some(format!("value{}", i)));
    }
    reopened.dispose();
    Ok(())
}

#[test]
fn test_clear_disk_on_startup() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = IndexedDiskCacheConfig::new("clear", temp_dir.path());

    let cache = raw_cache(config.clone())?;
    cache.put(key("a"), &vec![1u8; 10]);
    cache.dispose();

    let cleared = raw_cache(config.clone().with_clear_disk_on_startup(true))?;
    assert!(cleared.is_alive());
    assert!(cleared.is_empty());
    assert_eq!(cleared.data_file_length(), 0);
    assert_eq!(std::fs::metadata(config.key_file_path())?.len(), 0);
    cleared.dispose();
    Ok(())
}

#[test]
fn test_remove_all() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let cache = raw_cache(IndexedDiskCacheConfig::new("remove_all", temp_dir.path()))?;

    for i in 0..10u8 {
        cache.put(format!("key{}", i), &vec![i; 10]);
    }
    cache.remove_all();

    assert!(cache.is_alive());
    assert!(cache.key_set().is_empty());
    assert_eq!(cache.data_file_length(), 0);
    assert!(cache.put(key("again"), &vec![1u8; 4]));

    cache.dispose();
    Ok(())
}

#[test]
fn test_prefix_removal() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let cache: IndexedDiskCache<String, u32> =
        IndexedDiskCache::new(IndexedDiskCacheConfig::new("prefix", temp_dir.path()))?;

    cache.put(key("user:1"), &1);
    cache.put(key("user:2"), &2);
    cache.put(key("order:1"), &3);

    assert!(cache.remove(RemovalKey::PrefixGroup("user:".to_string())));
    assert_eq!(cache.key_set().into_iter().collect::<Vec<_>>(), vec![key("order:1")]);
    assert!(!cache.remove(RemovalKey::PrefixGroup("user:".to_string())));

    cache.dispose();
    Ok(())
}

#[test]
fn test_save_keys_without_dispose() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = IndexedDiskCacheConfig::new("save_keys", temp_dir.path());
    let cache = raw_cache(config.clone())?;

    cache.put(key("a"), &vec![7u8; 12]);
    cache.save_keys()?;
    assert!(std::fs::metadata(config.key_file_path())?.len() > 4);

    cache.dispose();
    Ok(())
}

#[test]
fn test_concurrent_disjoint_keys() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let cache = raw_cache(
        IndexedDiskCacheConfig::new("concurrent", temp_dir.path())
            .with_max_key_size(0)
            .with_optimize_at_remove_count(20),
    )?;

    let handles: Vec<_> = (0..4u8)
        .map(|t| {
            let cache = cache.clone();
            thread::spawn(move || {
                for i in 0..200u32 {
                    let k = format!("t{}-{}", t, i % 25);
                    let len = 16 + (i as usize * 7 + t as usize * 13) % 300;
                    let value = vec![t.wrapping_mul(31).wrapping_add(i as u8); len];

                    assert!(cache.put(k.clone(), &value));
                    assert_eq!(cache.get(&k), Some(value));
                    if i % 3 == 0 {
                        assert!(cache.remove(k.clone()));
                        assert_eq!(cache.get(&k), None);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().is_ok());
    }

    assert!(cache.optimize());
    assert!(cache.verify(true));
    assert_eq!(find_overlap(&cache.live_slots()), None);

    cache.dispose();
    Ok(())
}
