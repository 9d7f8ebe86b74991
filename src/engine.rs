//! Engine Module
//!
//! The key-value store that coordinates all components.
//!
//! ## Responsibilities
//! - Replay the log on open and rebuild the index
//! - Append entries, keep the running CRC and commit meta info
//! - Compact (rewrite) the log when dead entries dominate
//! - Pick up commits made by other processes in multi-process mode

use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::buffer::Buffer;
use crate::checksum::ChecksumGuard;
use crate::codec::Value;
use crate::config::{Config, RecoveryPolicy, SyncStrategy};
use crate::crypto::{CryptoGuard, Iv};
use crate::error::{MapKvError, Result};
use crate::index::{Index, IndexEntry};
use crate::log::{encode_entry, replay, EntryRef, ReplayResult};
use crate::storage::{
    grown_capacity, round_to_page, InterProcessLock, MappedFile, MetaFile, MetaInfo, StorePaths,
    FLAG_ENCRYPTED, FORMAT_VERSION,
};

/// Offsets in the index and meta record are u32
pub const MAX_LOG_SIZE: usize = u32::MAX as usize;

/// A memory-mapped key-value store
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Writes** (set/remove/compact): take the inter-process lock
///   exclusively, then `inner` for writing. Growth and remapping only
///   happen here, so no reader can be looking at the old mapping.
/// - **Reads** (get/contains/keys): take the inter-process lock shared,
///   then `inner` for reading. Many readers run concurrently.
/// - Lock order is always inter-process lock → `inner`.
///
/// In single-process mode the inter-process lock is a no-op.
pub struct Store {
    /// Configuration the store was opened with
    config: Config,

    /// Advisory lock over the data file
    lock: InterProcessLock,

    /// Everything that moves when the log changes
    inner: RwLock<Inner>,
}

/// Cipher material for a (re)written log
struct CipherSetup {
    crypto: Option<CryptoGuard>,
    flags: u32,
    iv: Iv,
    key_check: u32,
}

impl CipherSetup {
    /// New IV for `passphrase`, or plaintext for None
    fn fresh(passphrase: Option<&str>) -> Self {
        match passphrase {
            Some(pass) => {
                let iv = CryptoGuard::generate_iv();
                Self {
                    crypto: Some(CryptoGuard::new(pass, iv)),
                    flags: FLAG_ENCRYPTED,
                    iv,
                    key_check: CryptoGuard::key_check(pass, &iv),
                }
            }
            None => Self {
                crypto: None,
                flags: 0,
                iv: [0u8; 16],
                key_check: 0,
            },
        }
    }
}

struct Inner {
    config: Config,
    paths: StorePaths,

    /// Mapped log
    data: MappedFile,

    /// Mapped `.crc` file
    meta_file: MetaFile,

    /// Last record this handle committed or loaded
    meta: MetaInfo,

    /// Bytes of log in use (may run ahead of `meta` only inside append)
    actual_size: usize,

    index: Index,
    checksum: ChecksumGuard,

    /// Positioned at `actual_size` when the store is encrypted
    crypto: Option<CryptoGuard>,
    passphrase: Option<String>,

    /// Appends since the last flush
    unsynced_writes: usize,
}

impl Store {
    /// Open or create a store with the given config
    ///
    /// On startup:
    /// 1. Create the parent directory if needed
    /// 2. Map the data file and the meta file
    /// 3. Finish or discard an interrupted rewrite
    /// 4. Validate the log against meta info and replay it
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        // Step 1: Parent directory
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| open_failure(parent, e))?;
            }
        }

        // Step 2: Files
        let paths = StorePaths::new(&config.path);
        let data = MappedFile::open(&paths.data, config.initial_capacity)
            .map_err(|e| open_failure_from(&paths.data, e))?;
        let meta_file =
            MetaFile::open(&paths.meta).map_err(|e| open_failure_from(&paths.meta, e))?;

        let lock = if config.is_multi_process() {
            InterProcessLock::open(&paths.data, config.lock_timeout)?
        } else {
            InterProcessLock::disabled()
        };

        // Steps 3-4 may repair files, so they run exclusively
        let inner = {
            let _guard = lock.acquire_exclusive()?;
            Inner::load(config.clone(), paths, data, meta_file)?
        };

        info!(
            path = %config.path.display(),
            keys = inner.index.len(),
            actual_size = inner.actual_size,
            total_size = inner.data.len(),
            encrypted = inner.crypto.is_some(),
            "store opened"
        );

        Ok(Self {
            config,
            lock,
            inner: RwLock::new(inner),
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data file path
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let config = Config {
            path: path.as_ref().to_path_buf(),
            ..Config::default()
        };
        Self::open(config)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get a value by key
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.read(|inner| inner.get(key))
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        self.read(|inner| Ok(inner.index.contains(key)))
    }

    /// All live keys, sorted
    pub fn all_keys(&self) -> Result<Vec<String>> {
        self.read(|inner| Ok(inner.index.keys()))
    }

    /// Number of live keys
    pub fn count(&self) -> Result<usize> {
        self.read(|inner| Ok(inner.index.len()))
    }

    /// Encoded size of a key's value
    pub fn value_size(&self, key: &str) -> Result<Option<usize>> {
        self.read(|inner| Ok(inner.index.get(key).map(|e| e.len as usize)))
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        Ok(self.get(key)?.and_then(|v| v.as_bool()))
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.get(key)?.and_then(|v| v.as_int()))
    }

    pub fn get_uint(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.get(key)?.and_then(|v| v.as_uint()))
    }

    pub fn get_float(&self, key: &str) -> Result<Option<f32>> {
        Ok(self.get(key)?.and_then(|v| v.as_float()))
    }

    pub fn get_double(&self, key: &str) -> Result<Option<f64>> {
        Ok(self.get(key)?.and_then(|v| v.as_double()))
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get(key)?.and_then(|v| match v {
            Value::String(s) => Some(s),
            _ => None,
        }))
    }

    pub fn get_bytes(&self, key: &str) -> Result<Option<bytes::Bytes>> {
        Ok(self.get(key)?.and_then(|v| match v {
            Value::Bytes(b) => Some(b),
            _ => None,
        }))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Set a key, replacing any previous value
    ///
    /// Steps:
    /// 1. Encode the entry
    /// 2. Acquire the exclusive lock, pick up other processes' commits
    /// 3. Make room (compacting or growing)
    /// 4. Append, extend the CRC, commit meta info
    /// 5. Update the index
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        validate_key(key)?;
        let value = value.into();
        value.check_depth()?;
        let encoded = value.encode();
        self.write(|inner| inner.append(key, encoded.as_slice()))
    }

    pub fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set(key, Value::Bool(value))
    }

    pub fn set_int(&self, key: &str, value: i64) -> Result<()> {
        self.set(key, Value::Int(value))
    }

    pub fn set_uint(&self, key: &str, value: u64) -> Result<()> {
        self.set(key, Value::UInt(value))
    }

    pub fn set_float(&self, key: &str, value: f32) -> Result<()> {
        self.set(key, Value::Float(value))
    }

    pub fn set_double(&self, key: &str, value: f64) -> Result<()> {
        self.set(key, Value::Double(value))
    }

    pub fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.set(key, Value::from(value))
    }

    pub fn set_bytes(&self, key: &str, value: &[u8]) -> Result<()> {
        self.set(key, Value::from(value))
    }

    /// Remove a key by appending a tombstone
    ///
    /// Absent keys are left alone (nothing is appended).
    pub fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.write(|inner| inner.remove(key).map(|_| ()))
    }

    /// Remove several keys under one lock acquisition.
    /// Returns how many of them were present.
    pub fn remove_many<S: AsRef<str>>(&self, keys: &[S]) -> Result<usize> {
        for key in keys {
            validate_key(key.as_ref())?;
        }
        self.write(|inner| {
            let mut removed = 0;
            for key in keys {
                if inner.remove(key.as_ref())? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    /// Rewrite the log with live entries only
    ///
    /// A no-op when the log holds no dead entries.
    pub fn compact(&self) -> Result<()> {
        self.write(|inner| {
            if inner.dead_bytes() == 0 {
                debug!("compaction skipped: no dead entries");
                return Ok(());
            }
            let setup = inner.same_cipher();
            inner.rewrite(setup, "compact")
        })
    }

    /// Drop every key and shrink the file back to its initial capacity
    pub fn clear_all(&self) -> Result<()> {
        self.write(|inner| inner.clear())
    }

    /// Shrink the data file to the smallest capacity holding the log
    pub fn trim(&self) -> Result<()> {
        self.write(|inner| inner.trim())
    }

    /// Change the encryption key (None decrypts the store)
    ///
    /// Rewrites the whole log under the new key and a fresh IV.
    pub fn rekey(&self, new_key: Option<&str>) -> Result<()> {
        if matches!(new_key, Some(k) if k.is_empty()) {
            return Err(MapKvError::Config("encryption key is empty".to_string()));
        }
        self.write(|inner| {
            if inner.passphrase.as_deref() == new_key {
                return Ok(());
            }
            inner.rewrite(CipherSetup::fresh(new_key), "rekey")?;
            inner.passphrase = new_key.map(str::to_owned);
            Ok(())
        })
    }

    /// Flush the data and meta mappings to disk
    pub fn sync(&self) -> Result<()> {
        self.inner.write().sync()
    }

    /// Reload if another process committed since our last operation.
    /// Returns true if anything was reloaded.
    pub fn check_content_changed(&self) -> Result<bool> {
        if !self.lock.is_enabled() {
            return Ok(false);
        }
        let _ipc = self.lock.acquire_shared()?;
        let mut inner = self.inner.write();
        if inner.is_current() {
            return Ok(false);
        }
        inner.sync_with_peers(false)?;
        Ok(true)
    }

    /// Close the store gracefully
    ///
    /// Flushes both mappings; the lock and mappings are released on drop.
    pub fn close(self) -> Result<()> {
        self.sync()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Bytes of log in use
    pub fn actual_size(&self) -> usize {
        self.inner.read().actual_size
    }

    /// Mapped capacity of the data file
    pub fn total_size(&self) -> usize {
        self.inner.read().data.len()
    }

    /// Generation counter bumped by every full rewrite
    pub fn sequence_id(&self) -> u64 {
        self.inner.read().meta.sequence_id
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.read().crypto.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether `key` is the passphrase currently protecting the store
    pub(crate) fn has_encryption_key(&self, key: Option<&str>) -> bool {
        self.inner.read().passphrase.as_deref() == key
    }

    // =========================================================================
    // Locking helpers
    // =========================================================================

    fn read<T>(&self, f: impl FnOnce(&Inner) -> Result<T>) -> Result<T> {
        let _ipc = self.lock.acquire_shared()?;
        if self.lock.is_enabled() && !self.inner.read().is_current() {
            self.inner.write().sync_with_peers(false)?;
        }
        let inner = self.inner.read();
        f(&inner)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let _ipc = self.lock.acquire_exclusive()?;
        let mut inner = self.inner.write();
        if self.lock.is_enabled() {
            // A peer may have resized the file without a new meta record
            inner.data.reload()?;
            inner.sync_with_peers(true)?;
        }
        f(&mut inner)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.inner.get_mut().sync() {
            warn!(path = %self.config.path.display(), error = %e, "failed to flush store on drop");
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.config.path)
            .field("process_mode", &self.config.process_mode)
            .finish_non_exhaustive()
    }
}

impl Inner {
    // =========================================================================
    // Loading
    // =========================================================================

    fn load(config: Config, paths: StorePaths, data: MappedFile, meta_file: MetaFile) -> Result<Self> {
        let passphrase = config.encryption_key.clone();
        let mut inner = Self {
            config,
            paths,
            data,
            meta_file,
            meta: MetaInfo::empty(),
            actual_size: 0,
            index: Index::new(),
            checksum: ChecksumGuard::new(),
            crypto: None,
            passphrase,
            unsynced_writes: 0,
        };
        // The file may have changed size between mapping and locking
        inner.data.reload()?;
        inner.finish_interrupted_rewrite()?;
        inner.recover()?;
        Ok(inner)
    }

    /// Roll an interrupted rewrite forward if its meta record was already
    /// published, otherwise drop the staging file
    fn finish_interrupted_rewrite(&mut self) -> Result<()> {
        if !self.paths.compact.exists() {
            return Ok(());
        }
        let staged = fs::read(&self.paths.compact)?;

        match self.meta_file.latest() {
            Some(m)
                if m.actual_size as usize == staged.len()
                    && ChecksumGuard::verify(&staged, m.crc_digest)
                    && !self.log_matches(&m) =>
            {
                warn!(
                    path = %self.paths.data.display(),
                    size = staged.len(),
                    "completing interrupted log rewrite"
                );
                self.data.ensure_capacity(staged.len())?;
                self.data.write_at(0, &staged)?;
                let end = self.data.len();
                self.data.zero_range(staged.len(), end);
                self.data.flush()?;
            }
            _ => debug!(path = %self.paths.compact.display(), "discarding stale rewrite staging file"),
        }

        fs::remove_file(&self.paths.compact)?;
        Ok(())
    }

    /// Pick the newest meta record the log satisfies and replay it
    fn recover(&mut self) -> Result<()> {
        let records = self.meta_file.records();

        if let Some((_, m)) = records.iter().find(|(_, m)| m.format_version != FORMAT_VERSION) {
            return Err(MapKvError::Open(format!(
                "unsupported format version {} (expected {})",
                m.format_version, FORMAT_VERSION
            )));
        }

        let Some(newest) = records.first().map(|(_, m)| *m) else {
            return self.recover_without_meta();
        };

        for (slot, candidate) in &records {
            if self.log_matches(candidate) {
                if candidate != &newest {
                    warn!(slot, "newest meta record does not match the log; using previous commit");
                }
                return self.load_committed(*candidate, true);
            }
        }

        warn!(
            path = %self.paths.data.display(),
            actual_size = newest.actual_size,
            "log checksum mismatch"
        );
        match self.config.recovery_policy {
            RecoveryPolicy::Discard => self.start_fresh(Some(newest)),
            RecoveryPolicy::Recover => self.recover_prefix(newest),
        }
    }

    fn recover_without_meta(&mut self) -> Result<()> {
        // Without the IV an encrypted log cannot be read back
        if self.config.recovery_policy == RecoveryPolicy::Recover && self.passphrase.is_none() {
            let mut index = Index::new();
            let end = self.data.len();
            let result = self.replay_range(None, 0, end, &mut index);
            if result.entries_replayed > 0 {
                warn!(
                    entries = result.entries_replayed,
                    "meta record missing; recovered entries from the log"
                );
                let meta = MetaInfo::empty();
                return self.finish_recovery(index, None, result.valid_len, meta);
            }
        }
        debug!(path = %self.paths.data.display(), "no meta record; starting empty");
        self.start_fresh(None)
    }

    /// Whether the first `actual_size` bytes hash to the record's CRC
    fn log_matches(&self, meta: &MetaInfo) -> bool {
        let size = meta.actual_size as usize;
        size <= self.data.len() && ChecksumGuard::verify(&self.data.as_slice()[..size], meta.crc_digest)
    }

    /// Cipher for a committed record, checking the configured passphrase
    fn crypto_for(&self, meta: &MetaInfo) -> Result<Option<CryptoGuard>> {
        match (meta.is_encrypted(), self.passphrase.as_deref()) {
            (false, None) => Ok(None),
            (true, None) => Err(MapKvError::Open(
                "store is encrypted but no encryption key was supplied".to_string(),
            )),
            (false, Some(_)) => Err(MapKvError::Open(
                "store is not encrypted; open without a key and call rekey".to_string(),
            )),
            (true, Some(pass)) => {
                if CryptoGuard::key_check(pass, &meta.iv) != meta.key_check {
                    return Err(MapKvError::Open("wrong encryption key".to_string()));
                }
                Ok(Some(CryptoGuard::new(pass, meta.iv)))
            }
        }
    }

    /// Replay a log that matched `meta`. With `repair`, decode failures
    /// are handled per recovery policy; without it they are errors.
    fn load_committed(&mut self, meta: MetaInfo, repair: bool) -> Result<()> {
        // An empty plaintext store can take on encryption at open
        if meta.actual_size == 0 && !meta.is_encrypted() && self.passphrase.is_some() {
            return if repair {
                self.start_fresh(Some(meta))
            } else {
                Err(MapKvError::Open(
                    "store was reset without encryption by another process".to_string(),
                ))
            };
        }

        let crypto = self.crypto_for(&meta)?;
        let size = meta.actual_size as usize;
        let mut index = Index::new();
        let result = self.replay_range(crypto.as_ref(), 0, size, &mut index);

        if let Some(err) = &result.error {
            let detail = format!("entry at offset {} does not decode: {}", result.valid_len, err);
            if !repair {
                return Err(MapKvError::Corruption(detail));
            }
            warn!(%detail, "log passed its checksum but is unreadable");
            if meta.is_encrypted() && result.entries_replayed == 0 {
                return Err(MapKvError::Open(format!(
                    "log does not decrypt with the supplied key: {}",
                    detail
                )));
            }
            return match self.config.recovery_policy {
                RecoveryPolicy::Discard => self.start_fresh(Some(meta)),
                RecoveryPolicy::Recover => {
                    self.finish_recovery(index, crypto, result.valid_len, meta)
                }
            };
        }

        self.install(index, crypto, size, meta);
        debug!(
            entries = result.entries_replayed,
            tombstones = result.tombstones,
            keys = self.index.len(),
            "log replayed"
        );
        Ok(())
    }

    /// Keep whatever decodes from offset 0 up to the newest record's size
    fn recover_prefix(&mut self, newest: MetaInfo) -> Result<()> {
        let crypto = self.crypto_for(&newest)?;
        let bound = (newest.actual_size as usize).min(self.data.len());
        let mut index = Index::new();
        let result = self.replay_range(crypto.as_ref(), 0, bound, &mut index);
        warn!(
            kept_entries = result.entries_replayed,
            kept_bytes = result.valid_len,
            lost_bytes = newest.actual_size as usize - result.valid_len,
            "recovered log prefix"
        );
        self.finish_recovery(index, crypto, result.valid_len, newest)
    }

    /// Adopt a recovered prefix of `keep` bytes and commit it
    fn finish_recovery(
        &mut self,
        index: Index,
        crypto: Option<CryptoGuard>,
        keep: usize,
        base: MetaInfo,
    ) -> Result<()> {
        let end = self.data.len();
        self.data.zero_range(keep, end);
        let checksum = ChecksumGuard::compute(&self.data.as_slice()[..keep]);
        let meta = MetaInfo {
            actual_size: keep as u32,
            crc_digest: checksum.digest(),
            sequence_id: base.sequence_id + 1,
            ..base
        };
        self.install(index, crypto, keep, meta);
        self.data.flush()?;
        self.commit(meta, true)
    }

    /// Reset to an empty log under the configured cipher
    fn start_fresh(&mut self, previous: Option<MetaInfo>) -> Result<()> {
        if previous.is_some() {
            warn!(path = %self.paths.data.display(), "discarding log contents");
        }
        let setup = CipherSetup::fresh(self.passphrase.as_deref());
        let meta = MetaInfo {
            format_version: FORMAT_VERSION,
            actual_size: 0,
            crc_digest: 0,
            sequence_id: previous.map_or(0, |m| m.sequence_id + 1),
            flags: setup.flags,
            iv: setup.iv,
            key_check: setup.key_check,
        };
        let end = self.data.len();
        self.data.zero_range(0, end);
        self.install(Index::new(), setup.crypto, 0, meta);
        self.commit(meta, true)
    }

    /// Swap in freshly loaded state
    fn install(&mut self, index: Index, crypto: Option<CryptoGuard>, size: usize, meta: MetaInfo) {
        self.index = index;
        self.actual_size = size;
        self.checksum = ChecksumGuard::with_digest(meta.crc_digest);
        self.crypto = crypto;
        if let Some(c) = &mut self.crypto {
            let state = c.state_at(&self.data.as_slice()[..size]);
            c.restore(state);
        }
        self.meta = meta;
    }

    /// Replay `[start, end)` of the log into `index`
    fn replay_range(
        &self,
        crypto: Option<&CryptoGuard>,
        start: usize,
        end: usize,
        index: &mut Index,
    ) -> ReplayResult {
        let ciphertext = &self.data.as_slice()[..end];
        let plain: Cow<'_, [u8]> = match crypto {
            Some(c) => {
                let mut buf = ciphertext[start..].to_vec();
                c.decrypt_at(c.state_at(&ciphertext[..start]), &mut buf);
                Cow::Owned(buf)
            }
            None => Cow::Borrowed(&ciphertext[start..]),
        };
        replay(&plain, start, |entry| apply_entry(index, crypto, ciphertext, entry))
    }

    // =========================================================================
    // Other processes
    // =========================================================================

    /// Whether the newest meta record is the one we last saw
    fn is_current(&self) -> bool {
        self.meta_file.latest().map_or(true, |m| m == self.meta)
    }

    /// Catch up with commits made by other processes
    fn sync_with_peers(&mut self, repair: bool) -> Result<()> {
        let Some(latest) = self.meta_file.latest() else {
            return Ok(());
        };
        if latest == self.meta {
            return Ok(());
        }
        self.data.reload()?;

        let appended_only = latest.sequence_id == self.meta.sequence_id
            && latest.flags == self.meta.flags
            && latest.iv == self.meta.iv
            && latest.actual_size > self.meta.actual_size;
        if appended_only && self.apply_peer_appends(&latest)? {
            return Ok(());
        }

        if !self.log_matches(&latest) {
            return Err(MapKvError::Corruption(
                "log written by another process does not match its meta record".to_string(),
            ));
        }
        debug!(sequence_id = latest.sequence_id, "reloading log rewritten by another process");
        self.load_committed(latest, repair)
    }

    /// Replay only the bytes another process appended
    fn apply_peer_appends(&mut self, latest: &MetaInfo) -> Result<bool> {
        let start = self.actual_size;
        let end = latest.actual_size as usize;
        if end > self.data.len() {
            return Ok(false);
        }

        let mut checksum = self.checksum;
        checksum.update(&self.data.as_slice()[start..end]);
        if checksum.digest() != latest.crc_digest {
            return Ok(false);
        }

        let mut index = std::mem::take(&mut self.index);
        let result = self.replay_range(self.crypto.as_ref(), start, end, &mut index);
        self.index = index;
        if let Some(err) = result.error {
            return Err(MapKvError::Corruption(format!(
                "entry appended by another process at offset {} does not decode: {}",
                result.valid_len, err
            )));
        }

        self.actual_size = end;
        self.checksum = checksum;
        if let Some(c) = &mut self.crypto {
            let state = c.state_at(&self.data.as_slice()[..end]);
            c.restore(state);
        }
        self.meta = *latest;
        debug!(entries = result.entries_replayed, "applied appends from another process");
        Ok(true)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    fn get(&self, key: &str) -> Result<Option<Value>> {
        let Some(entry) = self.index.get(key) else {
            return Ok(None);
        };
        let raw = self.read_plain(entry)?;
        Ok(Some(Value::decode(&raw)?))
    }

    /// Value bytes of an index entry, decrypted
    fn read_plain(&self, entry: &IndexEntry) -> Result<Vec<u8>> {
        let mut raw = self
            .data
            .as_slice()
            .get(entry.range())
            .ok_or_else(|| {
                MapKvError::Corruption(format!(
                    "index points past the mapping: {:?} of {}",
                    entry.range(),
                    self.data.len()
                ))
            })?
            .to_vec();

        if let Some(crypto) = &self.crypto {
            let state = entry.snapshot.ok_or_else(|| {
                MapKvError::Corruption("encrypted entry has no cipher snapshot".to_string())
            })?;
            crypto.decrypt_at(state, &mut raw);
        }
        Ok(raw)
    }

    fn dead_bytes(&self) -> usize {
        self.actual_size.saturating_sub(self.index.live_bytes())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Tombstone `key`; false if it was not present
    fn remove(&mut self, key: &str) -> Result<bool> {
        if !self.index.contains(key) {
            return Ok(false);
        }
        self.append(key, &[])?;
        Ok(true)
    }

    /// Append one entry (empty `value` = tombstone) and commit it
    fn append(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let mut entry = encode_entry(key, value);
        let requested = self.actual_size + entry.len();
        if requested > MAX_LOG_SIZE {
            return Err(MapKvError::CapacityExceeded {
                requested,
                limit: MAX_LOG_SIZE,
            });
        }

        self.ensure_space(entry.len())?;

        let start = self.actual_size;
        let prev_checksum = self.checksum;
        let prev_state = self.crypto.as_ref().map(|c| c.snapshot());

        let snapshot = match &mut self.crypto {
            Some(c) => {
                let (head, tail) = entry.buf.as_mut_slice().split_at_mut(entry.value_offset);
                c.encrypt(head);
                let state = c.snapshot();
                c.encrypt(tail);
                Some(state)
            }
            None => None,
        };

        self.data.write_at(start, entry.buf.as_slice())?;
        self.checksum.update(entry.buf.as_slice());
        self.actual_size = start + entry.len();

        if let Err(e) = self.commit_append() {
            // Nothing past the last committed record is visible
            self.actual_size = start;
            self.checksum = prev_checksum;
            if let (Some(c), Some(state)) = (&mut self.crypto, prev_state) {
                c.restore(state);
            }
            return Err(e);
        }

        if value.is_empty() {
            self.index.remove(key);
        } else {
            self.index.insert(
                key.to_owned(),
                IndexEntry {
                    offset: (start + entry.value_offset) as u32,
                    len: value.len() as u32,
                    entry_len: entry.len() as u32,
                    snapshot,
                },
            );
        }
        Ok(())
    }

    /// Make room for `extra` more bytes, compacting first if the log is
    /// mostly dead entries
    fn ensure_space(&mut self, extra: usize) -> Result<()> {
        if self.actual_size + extra <= self.data.len() {
            return Ok(());
        }

        let dead = self.dead_bytes();
        if dead > 0
            && dead as f64 / self.actual_size as f64 >= self.config.compaction_threshold
        {
            let setup = self.same_cipher();
            self.rewrite(setup, "auto-compact")?;
        }

        self.data.ensure_capacity(self.actual_size + extra)?;
        Ok(())
    }

    /// Commit the current size/CRC, flushing per sync strategy
    fn commit_append(&mut self) -> Result<()> {
        self.unsynced_writes += 1;
        let durable = match self.config.sync_strategy {
            SyncStrategy::EveryWrite => true,
            SyncStrategy::EveryNWrites { count } => self.unsynced_writes >= count,
            SyncStrategy::OnClose => false,
        };
        if durable {
            self.data.flush()?;
        }

        let meta = MetaInfo {
            actual_size: self.actual_size as u32,
            crc_digest: self.checksum.digest(),
            ..self.meta
        };
        self.commit(meta, durable)?;

        if durable {
            self.unsynced_writes = 0;
        }
        Ok(())
    }

    fn commit(&mut self, meta: MetaInfo, durable: bool) -> Result<()> {
        self.meta_file.write(&meta, durable)?;
        self.meta = meta;
        Ok(())
    }

    /// Cipher setup for a rewrite that keeps the current passphrase
    fn same_cipher(&self) -> CipherSetup {
        CipherSetup::fresh(self.passphrase.as_deref())
    }

    /// Rewrite the log with live entries only, under `setup`
    ///
    /// Crash safety:
    /// 1. Build the new log in memory
    /// 2. Stage it in `{path}.compact` and fsync
    /// 3. Publish the meta record describing it
    /// 4. Copy it over the data file, flush, right-size
    /// 5. Remove the staging file
    ///
    /// A crash before 3 leaves the old log and its record intact; a crash
    /// after 3 is rolled forward from the staging file on the next open.
    fn rewrite(&mut self, setup: CipherSetup, reason: &str) -> Result<()> {
        let old_size = self.actual_size;

        // Step 1: plaintext live log, in original append order
        let mut log = Buffer::with_capacity(self.index.live_bytes());
        let mut layout = Vec::with_capacity(self.index.len());
        for (key, entry) in self.index.entries_by_offset() {
            let value = self.read_plain(entry)?;
            let encoded = encode_entry(key, &value);
            let start = log.len();
            layout.push((key.to_owned(), start, encoded.value_offset, encoded.len()));
            log.extend_from_slice(encoded.buf.as_slice());
        }

        let mut crypto = setup.crypto;
        let mut index = Index::new();
        for (key, start, value_offset, entry_len) in layout {
            let snapshot = match &mut crypto {
                Some(c) => {
                    let bytes = &mut log.as_mut_slice()[start..start + entry_len];
                    let (head, tail) = bytes.split_at_mut(value_offset);
                    c.encrypt(head);
                    let state = c.snapshot();
                    c.encrypt(tail);
                    Some(state)
                }
                None => None,
            };
            index.insert(
                key,
                IndexEntry {
                    offset: (start + value_offset) as u32,
                    len: (entry_len - value_offset) as u32,
                    entry_len: entry_len as u32,
                    snapshot,
                },
            );
        }

        let new_size = log.len();
        let checksum = ChecksumGuard::compute(log.as_slice());
        let meta = MetaInfo {
            format_version: FORMAT_VERSION,
            actual_size: new_size as u32,
            crc_digest: checksum.digest(),
            sequence_id: self.meta.sequence_id + 1,
            flags: setup.flags,
            iv: setup.iv,
            key_check: setup.key_check,
        };

        // Step 2: stage
        write_staging_file(&self.paths.compact, log.as_slice())?;

        // Step 3: publish
        self.commit(meta, true)?;

        // Step 4: copy in place
        self.data.write_at(0, log.as_slice())?;
        self.data.zero_range(new_size, old_size);
        self.data.flush()?;
        let target = grown_capacity(new_size).max(round_to_page(self.config.initial_capacity));
        if target < self.data.len() {
            self.data.truncate(target)?;
        }

        // Step 5: done
        fs::remove_file(&self.paths.compact)?;

        self.index = index;
        self.actual_size = new_size;
        self.checksum = checksum;
        self.crypto = crypto;
        self.unsynced_writes = 0;

        info!(
            reason,
            old_size,
            new_size,
            keys = self.index.len(),
            sequence_id = meta.sequence_id,
            "log rewritten"
        );
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        let setup = self.same_cipher();
        let meta = MetaInfo {
            format_version: FORMAT_VERSION,
            actual_size: 0,
            crc_digest: 0,
            sequence_id: self.meta.sequence_id + 1,
            flags: setup.flags,
            iv: setup.iv,
            key_check: setup.key_check,
        };
        // An empty log matches any data, so publishing first is safe
        self.commit(meta, true)?;

        let old_size = self.actual_size;
        self.data.zero_range(0, old_size);
        self.data.truncate(self.config.initial_capacity)?;

        self.index.clear();
        self.actual_size = 0;
        self.checksum.reset();
        self.crypto = setup.crypto;
        self.unsynced_writes = 0;
        info!(path = %self.paths.data.display(), "store cleared");
        Ok(())
    }

    fn trim(&mut self) -> Result<()> {
        let target = grown_capacity(self.actual_size);
        if target >= self.data.len() {
            return Ok(());
        }
        let old_size = self.data.len();
        self.data.truncate(target)?;
        info!(old_size, new_size = self.data.len(), "data file trimmed");
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.data.flush()?;
        self.meta_file.flush()?;
        self.unsynced_writes = 0;
        Ok(())
    }
}

/// Index one replayed entry
fn apply_entry(
    index: &mut Index,
    crypto: Option<&CryptoGuard>,
    ciphertext: &[u8],
    entry: EntryRef<'_>,
) {
    if entry.is_tombstone() {
        index.remove(entry.key);
        return;
    }
    let snapshot = crypto.map(|c| c.state_at(&ciphertext[..entry.value_offset]));
    index.insert(
        entry.key.to_owned(),
        IndexEntry {
            offset: entry.value_offset as u32,
            len: entry.value.len() as u32,
            entry_len: entry.size() as u32,
            snapshot,
        },
    );
}

fn write_staging_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(MapKvError::InvalidKey("key must not be empty".to_string()));
    }
    Ok(())
}

/// Permission/path problems while opening surface as `Open`
fn open_failure(path: &Path, e: io::Error) -> MapKvError {
    match e.kind() {
        io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound => {
            MapKvError::Open(format!("cannot open {}: {}", path.display(), e))
        }
        _ => MapKvError::Io(e),
    }
}

fn open_failure_from(path: &Path, e: MapKvError) -> MapKvError {
    match e {
        MapKvError::Io(io) => open_failure(path, io),
        other => other,
    }
}
