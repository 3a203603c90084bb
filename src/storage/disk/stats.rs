//! Region statistics

use serde::Serialize;

/// Point-in-time counters of one region
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskCacheStats {
    pub region_name: String,
    pub alive: bool,
    pub key_count: usize,
    pub data_file_length: u64,
    pub max_key_size: usize,
    pub hit_count: u64,
    /// Bytes held by removed or superseded records
    pub bytes_free: u64,
    /// Removals and evictions counted toward the next real-time optimization
    pub remove_count: u32,
    pub times_optimized: u32,
    /// Number of puts served from the recycle bin
    pub recycle_count: u64,
    pub recycle_bin_size: usize,
    /// Keys loaded from the key file at startup
    pub startup_size: usize,
}

impl DiskCacheStats {
    /// Share of the data file occupied by free bytes
    pub fn fragmentation_ratio(&self) -> f64 {
        if self.data_file_length > 0 {
            self.bytes_free as f64 / self.data_file_length as f64
        } else {
            0.0
        }
    }
}
