// PhotonDB Disk Cache - Rust Implementation
// An indexed, self-compacting disk cache region

#![warn(rust_2018_idioms)]

pub mod config;
pub mod storage;

// Re-exports for convenience
pub use config::{DiskLimitType, IndexedDiskCacheConfig};
pub use storage::disk::{
    CacheKey, CompressingSerializer, DiskCacheRegistry, DiskCacheStats, DiskKey,
    ElementSerializer, GroupAttrName, GroupId, IndexedDiskCache, JsonSerializer, RegionStatus,
    RemovalKey, SlotDescriptor,
};

/// Disk cache error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Storage error: {0}")]
        Storage(String),

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),

        #[error("Corruption: {0}")]
        Corruption(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Serialization error: {0}")]
        SerializationError(String),

        #[error("Not alive: {0}")]
        NotAlive(String),

        #[error("Configuration error: {0}")]
        Config(String),
    }

    impl Error {
        /// Whether the error means the region's files disagree with its index
        pub fn is_corruption(&self) -> bool {
            matches!(self, Error::Corruption(_))
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
