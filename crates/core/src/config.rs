//! Storage configuration via `versiondb.toml`
//!
//! One file configures the state store, the receipt store and the composite
//! router. On first open a commented default file is written; edit it and
//! restart to change settings.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed in the node's data directory.
pub const CONFIG_FILE_NAME: &str = "versiondb.toml";

/// Minimum number of changelog entries the state store's WAL retains.
pub const MIN_WAL_ENTRIES_TO_KEEP: u64 = 1000;

// ============================================================================
// State store
// ============================================================================

/// MVCC state store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateStoreConfig {
    /// Registered backend name (`"fjall"` or `"memory"`).
    pub backend: String,
    /// Depth of the async apply queue; `<= 0` applies synchronously.
    pub async_write_buffer: i64,
    /// Versions to retain below the latest; `0` keeps everything.
    pub keep_recent: i64,
    /// Seconds between pruning runs.
    pub prune_interval_seconds: u64,
    /// Parallel batches used by bulk import.
    pub import_num_workers: usize,
    /// Keep the newest version at or below the prune height.
    pub keep_last_version: bool,
    /// Seconds between metrics snapshots; `0` disables the collector.
    pub metrics_interval_seconds: u64,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            backend: "fjall".to_string(),
            async_write_buffer: 100,
            keep_recent: 100_000,
            prune_interval_seconds: 600,
            import_num_workers: 1,
            keep_last_version: true,
            metrics_interval_seconds: 10,
        }
    }
}

impl StateStoreConfig {
    /// Small synchronous configuration for tests.
    pub fn for_testing() -> Self {
        Self {
            backend: "memory".to_string(),
            async_write_buffer: 0,
            keep_recent: 0,
            prune_interval_seconds: 1,
            import_num_workers: 2,
            keep_last_version: true,
            metrics_interval_seconds: 0,
        }
    }

    /// Builder: async write buffer depth.
    pub fn with_async_write_buffer(mut self, depth: i64) -> Self {
        self.async_write_buffer = depth;
        self
    }

    /// Builder: retention window.
    pub fn with_keep_recent(mut self, keep_recent: i64) -> Self {
        self.keep_recent = keep_recent;
        self
    }

    /// Builder: keep-last-version policy.
    pub fn with_keep_last_version(mut self, keep: bool) -> Self {
        self.keep_last_version = keep;
        self
    }

    /// Builder: backend name.
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    /// Prune interval as a duration.
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_seconds.max(1))
    }

    /// Entries the changelog WAL keeps behind its tail.
    pub fn wal_keep_recent(&self) -> u64 {
        let queued = self.async_write_buffer.max(0) as u64 + 1;
        MIN_WAL_ENTRIES_TO_KEEP.max(queued)
    }

    /// Validate settings.
    pub fn validate(&self) -> Result<()> {
        if self.keep_recent < 0 {
            return Err(Error::InvalidConfig(format!(
                "keep_recent must be >= 0, got {}",
                self.keep_recent
            )));
        }
        if self.backend.is_empty() {
            return Err(Error::InvalidConfig("backend must not be empty".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Receipt store
// ============================================================================

/// Receipt store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptBackend {
    /// Receipts as versioned pairs in an MVCC engine.
    Mvcc,
    /// Rotating columnar files protected by a WAL.
    Columnar,
}

/// Receipt store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiptStoreConfig {
    /// Backend selection.
    pub backend: ReceiptBackend,
    /// Blocks retained below the latest; `0` keeps everything.
    pub keep_recent: i64,
    /// Seconds between pruning runs.
    pub prune_interval_seconds: u64,
    /// Completed blocks buffered before a flush to the current file pair.
    pub block_flush_interval: u64,
    /// Blocks per rotation file pair.
    pub max_blocks_per_file: u64,
    /// Blocks per cache generation for the MVCC backend.
    pub cache_rotate_interval: u64,
    /// Async write depth of the MVCC backend.
    pub async_write_buffer: i64,
}

impl Default for ReceiptStoreConfig {
    fn default() -> Self {
        Self {
            backend: ReceiptBackend::Mvcc,
            keep_recent: 100_000,
            prune_interval_seconds: 600,
            block_flush_interval: 1,
            max_blocks_per_file: 500,
            cache_rotate_interval: 500,
            async_write_buffer: 100,
        }
    }
}

impl ReceiptStoreConfig {
    /// Builder: backend.
    pub fn with_backend(mut self, backend: ReceiptBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Builder: blocks per file.
    pub fn with_max_blocks_per_file(mut self, blocks: u64) -> Self {
        self.max_blocks_per_file = blocks;
        self
    }

    /// Builder: flush interval in blocks.
    pub fn with_block_flush_interval(mut self, blocks: u64) -> Self {
        self.block_flush_interval = blocks;
        self
    }

    /// Builder: retention window.
    pub fn with_keep_recent(mut self, keep_recent: i64) -> Self {
        self.keep_recent = keep_recent;
        self
    }

    /// Builder: blocks per cache generation.
    pub fn with_cache_rotate_interval(mut self, blocks: u64) -> Self {
        self.cache_rotate_interval = blocks;
        self
    }

    /// Builder: async write depth of the MVCC backend.
    pub fn with_async_write_buffer(mut self, depth: i64) -> Self {
        self.async_write_buffer = depth;
        self
    }

    /// Prune interval as a duration.
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_seconds.max(1))
    }

    /// Validate settings.
    pub fn validate(&self) -> Result<()> {
        if self.keep_recent < 0 {
            return Err(Error::InvalidConfig(format!(
                "receipt keep_recent must be >= 0, got {}",
                self.keep_recent
            )));
        }
        if self.max_blocks_per_file == 0 {
            return Err(Error::InvalidConfig(
                "max_blocks_per_file must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Composite router
// ============================================================================

/// Where writes for the routed key family go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Everything to the primary.
    #[default]
    PrimaryOnly,
    /// Family keys to both stores.
    DualWrite,
    /// Family keys only to the secondary.
    SplitWrite,
}

/// Where reads for the routed key family go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Everything from the primary.
    #[default]
    PrimaryOnly,
    /// Family keys from the secondary, falling back to the primary on miss.
    SecondaryFirst,
    /// Family keys only from the secondary.
    SplitRead,
}

/// Composite router settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Write policy for the key family.
    pub write_mode: WriteMode,
    /// Read policy for the key family.
    pub read_mode: ReadMode,
    /// Namespace holding the key family.
    pub family_namespace: String,
    /// Key prefixes of the family; empty means the whole namespace.
    pub family_prefixes: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            write_mode: WriteMode::PrimaryOnly,
            read_mode: ReadMode::PrimaryOnly,
            family_namespace: "evm".to_string(),
            family_prefixes: Vec::new(),
        }
    }
}

impl RouterConfig {
    /// Decoded `family_prefixes`.
    pub fn family_prefix_bytes(&self) -> Result<Vec<Vec<u8>>> {
        self.family_prefixes.iter().map(|p| decode_hex(p)).collect()
    }

    /// Validate settings.
    pub fn validate(&self) -> Result<()> {
        if self.family_namespace.is_empty() {
            return Err(Error::InvalidConfig("router family_namespace is empty".into()));
        }
        self.family_prefix_bytes().map(|_| ())
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.len() % 2 != 0 {
        return Err(Error::InvalidConfig(format!("odd-length hex prefix {:?}", s)));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            digits
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| Error::InvalidConfig(format!("invalid hex prefix {:?}", s)))
        })
        .collect()
}

// ============================================================================
// Root
// ============================================================================

/// Storage configuration loaded from `versiondb.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `[state_store]` section
    pub state_store: StateStoreConfig,
    /// `[receipt_store]` section
    pub receipt_store: ReceiptStoreConfig,
    /// `[router]` section
    pub router: RouterConfig,
}

impl StorageConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# versiondb storage configuration

[state_store]
# Registered backend: "fjall" (default) or "memory"
backend = "fjall"
# Async apply queue depth; <= 0 applies every changeset synchronously
async_write_buffer = 100
# Versions kept below the latest; 0 keeps everything
keep_recent = 100000
prune_interval_seconds = 600
import_num_workers = 1
# Keep the newest version at or below the prune height
keep_last_version = true
# Seconds between metrics snapshots; 0 disables
metrics_interval_seconds = 10

[receipt_store]
# "mvcc" (default) or "columnar"
backend = "mvcc"
keep_recent = 100000
prune_interval_seconds = 600
# Columnar backend: completed blocks per flush and blocks per file pair
block_flush_interval = 1
max_blocks_per_file = 500
# MVCC backend: blocks per cache generation
cache_rotate_interval = 500
async_write_buffer = 100

[router]
# "primary_only", "dual_write" or "split_write"
write_mode = "primary_only"
# "primary_only", "secondary_first" or "split_read"
read_mode = "primary_only"
family_namespace = "evm"
family_prefixes = []
"#
    }

    /// Parse config from TOML text and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: StorageConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate config from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| match e {
            Error::Serialization(msg) => Error::Serialization(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                msg
            )),
            other => other,
        })
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.state_store.validate()?;
        self.receipt_store.validate()?;
        self.router.validate()
    }
}
