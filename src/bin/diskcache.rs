//! PhotonDB Disk Cache Admin Binary
//!
//! Command-line access to one disk cache region for inspection and
//! maintenance:
//! - Statistics and consistency checks
//! - Listing, reading, writing and removing keys
//! - Compaction and clearing
//!
//! # Examples
//!
//! ```bash
//! # Show region statistics
//! diskcache --dir data/diskcache --region sessions stats
//!
//! # Check records against the data file, including overlaps
//! diskcache --region sessions verify --overlaps
//!
//! # Store and read a JSON value
//! diskcache --region sessions put user:1 '{"name": "ada"}'
//! diskcache --region sessions get user:1
//!
//! # Remove every key starting with "user:"
//! diskcache --region sessions remove user: --prefix
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use photondb_diskcache::{IndexedDiskCache, IndexedDiskCacheConfig, RemovalKey};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PhotonDB Disk Cache - region inspection and maintenance
#[derive(Parser, Debug)]
#[command(name = "diskcache")]
#[command(version = photondb_diskcache::VERSION)]
#[command(about = "PhotonDB Disk Cache - region inspection and maintenance", long_about = None)]
#[command(author = "Anton Feldmann <afeldman@lynqtech.com>")]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Directory holding the region files
    #[arg(long, global = true, env = "DISKCACHE_DIR")]
    dir: Option<PathBuf>,

    /// Region name
    #[arg(long, global = true, env = "DISKCACHE_REGION")]
    region: Option<String>,

    /// TOML configuration file; --dir and --region override it
    #[arg(long, global = true, env = "DISKCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "DISKCACHE_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show region statistics as JSON
    Stats,

    /// Check every record against the data file
    Verify {
        /// Also check records for overlap
        #[arg(long)]
        overlaps: bool,
    },

    /// List all keys
    Keys,

    /// Print the value stored under a key
    ///
    /// A corrupt record resets the whole region; run `verify` first on a suspect region.
    Get {
        /// Key
        key: String,
    },

    /// Store a JSON value under a key
    Put {
        /// Key
        key: String,
        /// Value as JSON
        json: String,
    },

    /// Remove a key, or every key with a prefix
    Remove {
        /// Key, or prefix with --prefix
        key: String,
        /// Treat the key as a name prefix
        #[arg(long)]
        prefix: bool,
    },

    /// Compact the data file
    Optimize,

    /// Remove every entry and truncate both files
    Clear,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli)?;

    let config = load_config(&cli)?;
    info!(region = %config.region_name, dir = ?config.disk_path, "Opening region");

    let cache: IndexedDiskCache<String, Value> = IndexedDiskCache::new(config)?;
    if !cache.is_alive() {
        anyhow::bail!("region {} could not be opened", cache.name());
    }

    let result = run_command(&cache, cli.command);
    cache.dispose();
    result
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "diskcache.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Build the region configuration from the file and flags
fn load_config(cli: &Cli) -> anyhow::Result<IndexedDiskCacheConfig> {
    let mut config = match &cli.config {
        Some(path) => IndexedDiskCacheConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => IndexedDiskCacheConfig::default(),
    };

    if let Some(dir) = &cli.dir {
        config = config.with_disk_path(dir);
    }
    if let Some(region) = &cli.region {
        config = config.with_region_name(region);
    }

    config.validate()?;
    Ok(config)
}

fn run_command(cache: &IndexedDiskCache<String, Value>, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Stats => {
            let stats = cache.stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Commands::Verify { overlaps } => {
            if cache.verify(overlaps) {
                println!("✅ Region '{}' is consistent ({} keys)", cache.name(), cache.len());
                Ok(())
            } else {
                anyhow::bail!("region {} failed the consistency check", cache.name())
            }
        }
        Commands::Keys => {
            let mut keys: Vec<String> = cache.key_set().into_iter().collect();
            keys.sort();
            for key in keys {
                println!("{}", key);
            }
            Ok(())
        }
        Commands::Get { key } => {
            let value = read_value(cache, &key)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Commands::Put { key, json } => {
            let value: Value = serde_json::from_str(&json).context("value is not valid JSON")?;
            if cache.put(key.clone(), &value) {
                println!("✅ Stored '{}'", key);
                Ok(())
            } else {
                anyhow::bail!("failed to store '{}'", key)
            }
        }
        Commands::Remove { key, prefix } => {
            let removal = if prefix {
                RemovalKey::PrefixGroup(key.clone())
            } else {
                RemovalKey::Exact(key.clone())
            };
            if cache.remove(removal) {
                println!("✅ Removed '{}'", key);
            } else {
                warn!(%key, "Nothing removed");
                println!("⚠️  Nothing matched '{}'", key);
            }
            Ok(())
        }
        Commands::Optimize => {
            let before = cache.data_file_length();
            if !cache.optimize() {
                anyhow::bail!("optimization did not run");
            }
            println!(
                "✅ Optimized '{}': {} → {} bytes",
                cache.name(),
                before,
                cache.data_file_length()
            );
            Ok(())
        }
        Commands::Clear => {
            cache.remove_all();
            println!("✅ Cleared '{}'", cache.name());
            Ok(())
        }
    }
}

/// Read one value, reporting when an unreadable record cleared the region
fn read_value(cache: &IndexedDiskCache<String, Value>, key: &str) -> anyhow::Result<Value> {
    let key = key.to_string();
    let indexed = cache.slot_of(&key).is_some();

    match cache.get(&key) {
        Some(value) => Ok(value),
        None if indexed && cache.is_empty() => {
            warn!(region = %cache.name(), %key, "Unreadable record cleared the region");
            println!(
                "⚠️  The record for '{}' was unreadable and region '{}' has been cleared",
                key,
                cache.name()
            );
            anyhow::bail!("key '{}' was corrupt, region '{}' was cleared", key, cache.name())
        }
        None if indexed => anyhow::bail!("key '{}' could not be read", key),
        None => anyhow::bail!("key '{}' not found", key),
    }
}
