//! Configuration for mapkv
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MapKvError, Result};

/// Main configuration for a mapkv store
#[derive(Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Path of the data file. Sibling files are derived from it:
    ///   {path}           (append-only log, memory mapped)
    ///   {path}.crc       (meta info)
    ///   {path}.compact   (only while a compaction is in flight)
    pub path: PathBuf,

    /// Capacity hint for a newly created data file (in bytes)
    pub initial_capacity: usize,

    /// Sync strategy: how often to flush the mapping to disk
    pub sync_strategy: SyncStrategy,

    /// Fraction of dead bytes in the log above which a growing append
    /// compacts instead of enlarging the file. Must be in (0, 1].
    pub compaction_threshold: f64,

    /// What to do when no meta record matches the log
    pub recovery_policy: RecoveryPolicy,

    // -------------------------------------------------------------------------
    // Encryption Configuration
    // -------------------------------------------------------------------------
    /// Passphrase for AES-CFB encryption (None = plaintext store)
    pub encryption_key: Option<String>,

    // -------------------------------------------------------------------------
    // Process Configuration
    // -------------------------------------------------------------------------
    /// Whether other processes may open the same files
    pub process_mode: ProcessMode,

    /// How long to wait for the inter-process lock (None = block forever)
    pub lock_timeout: Option<Duration>,
}

/// Mapping sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// msync after every write (safest, slowest)
    EveryWrite,

    /// msync after N unsynced writes (balanced durability/performance)
    EveryNWrites { count: usize },

    /// Leave write-back to the OS; flush only on sync()/close()
    OnClose,
}

/// Single-process stores skip the inter-process lock entirely
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    SingleProcess,
    MultiProcess,
}

/// Recovery granularity when the log does not match any meta record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPolicy {
    /// Treat the whole log as suspect and start empty
    Discard,

    /// Keep every entry that decodes cleanly from offset 0
    Recover,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("initial_capacity", &self.initial_capacity)
            .field("sync_strategy", &self.sync_strategy)
            .field("compaction_threshold", &self.compaction_threshold)
            .field("recovery_policy", &self.recovery_policy)
            .field("encrypted", &self.encryption_key.is_some())
            .field("process_mode", &self.process_mode)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./mapkv_data/default"),
            initial_capacity: 4096,
            sync_strategy: SyncStrategy::OnClose,
            compaction_threshold: 0.5,
            recovery_policy: RecoveryPolicy::Discard,
            encryption_key: None,
            process_mode: ProcessMode::SingleProcess,
            lock_timeout: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check invariants that `open` relies on
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(MapKvError::Config("store path is empty".to_string()));
        }
        if self.path.file_name().is_none() {
            return Err(MapKvError::Config(format!(
                "store path has no file name: {}",
                self.path.display()
            )));
        }
        if !(self.compaction_threshold > 0.0 && self.compaction_threshold <= 1.0) {
            return Err(MapKvError::Config(format!(
                "compaction_threshold must be in (0, 1], got {}",
                self.compaction_threshold
            )));
        }
        if let SyncStrategy::EveryNWrites { count: 0 } = self.sync_strategy {
            return Err(MapKvError::Config(
                "EveryNWrites count must be at least 1".to_string(),
            ));
        }
        if matches!(&self.encryption_key, Some(k) if k.is_empty()) {
            return Err(MapKvError::Config("encryption key is empty".to_string()));
        }
        Ok(())
    }

    pub fn is_multi_process(&self) -> bool {
        self.process_mode == ProcessMode::MultiProcess
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data file path
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Set the initial capacity hint (in bytes)
    pub fn initial_capacity(mut self, size: usize) -> Self {
        self.config.initial_capacity = size;
        self
    }

    /// Set the sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Set the dead-byte ratio that triggers automatic compaction
    pub fn compaction_threshold(mut self, ratio: f64) -> Self {
        self.config.compaction_threshold = ratio;
        self
    }

    /// Set the recovery policy for a log that fails its checksum
    pub fn recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.config.recovery_policy = policy;
        self
    }

    /// Enable encryption with the given passphrase
    pub fn encryption_key(mut self, key: impl Into<String>) -> Self {
        self.config.encryption_key = Some(key.into());
        self
    }

    /// Set the process mode
    pub fn process_mode(mut self, mode: ProcessMode) -> Self {
        self.config.process_mode = mode;
        self
    }

    /// Shorthand for `process_mode(ProcessMode::MultiProcess)`
    pub fn multi_process(self) -> Self {
        self.process_mode(ProcessMode::MultiProcess)
    }

    /// Set the inter-process lock timeout
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
