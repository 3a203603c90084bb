//! Region configuration
//!
//! Configuration is plain data: it can be built in code with the `with_*`
//! methods or loaded from TOML.
//!
//! ```toml
//! region_name = "sessions"
//! disk_path = "/var/cache/photondb"
//! max_key_size = 10000
//! disk_limit_type = "count"
//! optimize_at_remove_count = 300
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What `max_key_size` counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskLimitType {
    /// Number of keys
    #[default]
    Count,
    /// Kilobytes of stored records
    Size,
}

/// Settings for one indexed disk cache region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexedDiskCacheConfig {
    /// Region name; also the base name of the region's files
    pub region_name: String,
    /// Directory holding the `.data` and `.key` files
    pub disk_path: PathBuf,
    /// Index bound, in keys or kilobytes depending on `disk_limit_type` (0 = unbounded)
    pub max_key_size: usize,
    pub disk_limit_type: DiskLimitType,
    /// Compact the data file after this many removals (0 = never in real time)
    pub optimize_at_remove_count: u32,
    /// Compact once on dispose if any bytes were freed
    pub optimize_on_shutdown: bool,
    /// Ignore persisted data when opening
    pub clear_disk_on_startup: bool,
    /// Also look for overlapping records when validating persisted keys
    pub check_overlaps_on_startup: bool,
    /// Upper bound on how long dispose waits for shutdown work
    pub dispose_timeout_secs: u64,
}

impl Default for IndexedDiskCacheConfig {
    fn default() -> Self {
        Self {
            region_name: "default".to_string(),
            disk_path: PathBuf::from("data/diskcache"),
            max_key_size: 5000,
            disk_limit_type: DiskLimitType::Count,
            optimize_at_remove_count: 0,
            optimize_on_shutdown: true,
            clear_disk_on_startup: false,
            check_overlaps_on_startup: false,
            dispose_timeout_secs: 60,
        }
    }
}

impl IndexedDiskCacheConfig {
    /// Create a configuration for a region stored under `disk_path`
    pub fn new(region_name: impl Into<String>, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            region_name: region_name.into(),
            disk_path: disk_path.into(),
            ..Self::default()
        }
    }

    pub fn with_region_name(mut self, name: impl Into<String>) -> Self {
        self.region_name = name.into();
        self
    }

    pub fn with_disk_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk_path = path.into();
        self
    }

    pub fn with_max_key_size(mut self, max: usize) -> Self {
        self.max_key_size = max;
        self
    }

    pub fn with_disk_limit_type(mut self, limit_type: DiskLimitType) -> Self {
        self.disk_limit_type = limit_type;
        self
    }

    pub fn with_optimize_at_remove_count(mut self, count: u32) -> Self {
        self.optimize_at_remove_count = count;
        self
    }

    pub fn with_optimize_on_shutdown(mut self, enabled: bool) -> Self {
        self.optimize_on_shutdown = enabled;
        self
    }

    pub fn with_clear_disk_on_startup(mut self, enabled: bool) -> Self {
        self.clear_disk_on_startup = enabled;
        self
    }

    pub fn with_check_overlaps_on_startup(mut self, enabled: bool) -> Self {
        self.check_overlaps_on_startup = enabled;
        self
    }

    pub fn with_dispose_timeout(mut self, timeout: Duration) -> Self {
        self.dispose_timeout_secs = timeout.as_secs();
        self
    }

    /// Whether removals trigger compaction while running
    pub fn real_time_optimization_enabled(&self) -> bool {
        self.optimize_at_remove_count > 0
    }

    pub fn dispose_timeout(&self) -> Duration {
        Duration::from_secs(self.dispose_timeout_secs)
    }

    /// Region name reduced to `[a-zA-Z0-9-_.]`, other characters become `_`
    pub fn file_name(&self) -> String {
        self.region_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    pub fn data_file_path(&self) -> PathBuf {
        self.disk_path.join(format!("{}.data", self.file_name()))
    }

    pub fn key_file_path(&self) -> PathBuf {
        self.disk_path.join(format!("{}.key", self.file_name()))
    }

    /// Check for settings that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.region_name.is_empty() {
            return Err(Error::Config("region_name must not be empty".to_string()));
        }
        if self.disk_path.as_os_str().is_empty() {
            return Err(Error::Config("disk_path must not be empty".to_string()));
        }
        if self.dispose_timeout_secs == 0 {
            return Err(Error::Config(
                "dispose_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| Error::Config(format!("Invalid disk cache config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IndexedDiskCacheConfig::default();
        assert_eq!(config.max_key_size, 5000);
        assert_eq!(config.disk_limit_type, DiskLimitType::Count);
        assert!(!config.real_time_optimization_enabled());
        assert!(config.optimize_on_shutdown);
        assert!(!config.clear_disk_on_startup);
        assert_eq!(config.dispose_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_file_name_sanitized() {
        let config = IndexedDiskCacheConfig::new("users/v2 cache:*", "/tmp");
        assert_eq!(config.file_name(), "users_v2_cache__");
        assert_eq!(
            config.data_file_path(),
            PathBuf::from("/tmp/users_v2_cache__.data")
        );
        assert_eq!(
            config.key_file_path(),
            PathBuf::from("/tmp/users_v2_cache__.key")
        );
    }

    #[test]
    fn test_from_toml() -> Result<()> {
        let config = IndexedDiskCacheConfig::from_toml_str(
            r#"
            region_name = "sessions"
            disk_path = "/var/cache"
            max_key_size = 2048
            disk_limit_type = "size"
            optimize_at_remove_count = 10
            "#,
        )?;

        assert_eq!(config.region_name, "sessions");
        assert_eq!(config.disk_limit_type, DiskLimitType::Size);
        assert_eq!(config.max_key_size, 2048);
        assert!(config.real_time_optimization_enabled());
        // Unspecified fields keep their defaults
        assert!(config.optimize_on_shutdown);
        Ok(())
    }

    #[test]
    fn test_invalid_config() {
        assert!(IndexedDiskCacheConfig::from_toml_str("region_name = \"\"").is_err());
        assert!(IndexedDiskCacheConfig::from_toml_str("max_key_size = \"many\"").is_err());
    }
}
