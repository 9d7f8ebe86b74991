//! Meta Info
//!
//! Small fixed-layout record describing the committed log, kept in the
//! `.crc` file next to the data file.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────┬─────────┐
//! │ Slot 0 (128)                 │ Slot 1 (128)                 │ unused  │
//! │ ┌────────────┬─────────────┐ │ ┌────────────┬─────────────┐ │         │
//! │ │ Record (44)│ RecordCRC(4)│ │ │ Record (44)│ RecordCRC(4)│ │         │
//! │ └────────────┴─────────────┘ │ └────────────┴─────────────┘ │         │
//! └──────────────────────────────┴──────────────────────────────┴─────────┘
//! ```
//! Each commit overwrites the slot that does NOT hold the newest record,
//! so a torn write can only destroy the record being written; the
//! previous commit stays readable in the other slot.

use std::cmp::Reverse;
use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::crypto::Iv;
use crate::error::{MapKvError, Result};

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// Size of the meta file
pub const META_FILE_SIZE: usize = 4096;

/// Bytes reserved per slot
pub const SLOT_SIZE: usize = 128;

/// Number of alternating slots
pub const SLOT_COUNT: usize = 2;

/// Log is AES-CFB encrypted
pub const FLAG_ENCRYPTED: u32 = 1;

/// Committed state of the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaInfo {
    pub format_version: u32,
    /// Bytes of log in use
    pub actual_size: u32,
    /// CRC32 of the log's first `actual_size` bytes
    pub crc_digest: u32,
    /// Bumped by every full rewrite of the log
    pub sequence_id: u64,
    pub flags: u32,
    /// AES-CFB IV (zero when unencrypted)
    pub iv: Iv,
    /// Passphrase fingerprint (zero when unencrypted)
    pub key_check: u32,
}

impl MetaInfo {
    /// Record for a newly created, empty store
    pub fn empty() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            actual_size: 0,
            crc_digest: 0,
            sequence_id: 0,
            flags: 0,
            iv: [0u8; 16],
            key_check: 0,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    /// Commit order: later generations first, then longer logs
    pub fn ordering_key(&self) -> (u64, u32) {
        (self.sequence_id, self.actual_size)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = bincode::serialize(self)
            .map_err(|e| MapKvError::Corruption(format!("failed to encode meta record: {}", e)))?;
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        debug_assert!(bytes.len() <= SLOT_SIZE);
        Ok(bytes)
    }

    /// Parse one slot; None if it is blank, torn or garbage
    fn decode(slot: &[u8]) -> Option<Self> {
        let record_len = bincode::serialized_size(&Self::empty()).ok()? as usize;
        if slot.len() < record_len + 4 || slot[..record_len + 4].iter().all(|&b| b == 0) {
            return None;
        }
        let (record, rest) = slot.split_at(record_len);
        let stored_crc = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
        if crc32fast::hash(record) != stored_crc {
            return None;
        }
        bincode::deserialize(record).ok()
    }
}

/// The mapped `.crc` file
pub struct MetaFile {
    mmap: MmapMut,
}

impl MetaFile {
    /// Open or create the meta file
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if (file.metadata()?.len() as usize) < META_FILE_SIZE {
            file.set_len(META_FILE_SIZE as u64)?;
        }

        // SAFETY: the meta file has a fixed length and is only written
        // under the exclusive inter-process lock.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(MapKvError::Mapping)?;
        Ok(Self { mmap })
    }

    /// Every readable record, newest first, with its slot number
    pub fn records(&self) -> Vec<(usize, MetaInfo)> {
        let mut records: Vec<(usize, MetaInfo)> = (0..SLOT_COUNT)
            .filter_map(|slot| {
                let start = slot * SLOT_SIZE;
                MetaInfo::decode(&self.mmap[start..start + SLOT_SIZE]).map(|m| (slot, m))
            })
            .collect();
        records.sort_by_key(|(_, m)| Reverse(m.ordering_key()));
        records
    }

    /// Newest readable record, if any
    pub fn latest(&self) -> Option<MetaInfo> {
        self.records().first().map(|(_, m)| *m)
    }

    /// Commit a record into the slot not holding the newest one.
    /// With `durable`, the slot is flushed before returning.
    pub fn write(&mut self, info: &MetaInfo, durable: bool) -> Result<()> {
        let slot = match self.records().first() {
            Some((newest, _)) => (newest + 1) % SLOT_COUNT,
            None => 0,
        };
        let bytes = info.encode()?;
        let start = slot * SLOT_SIZE;
        self.mmap[start..start + bytes.len()].copy_from_slice(&bytes);
        self.mmap[start + bytes.len()..start + SLOT_SIZE].fill(0);

        if durable {
            self.mmap.flush_range(start, SLOT_SIZE)?;
        }
        trace!(
            slot,
            actual_size = info.actual_size,
            sequence_id = info.sequence_id,
            "meta record written"
        );
        Ok(())
    }

    /// Destroy the record in `slot` (tests simulate torn writes with this)
    pub fn corrupt_slot(&mut self, slot: usize) {
        let start = slot * SLOT_SIZE;
        self.mmap[start] ^= 0xff;
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}
