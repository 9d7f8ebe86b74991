//! Index Module
//!
//! In-memory map from key to the location of its latest value in the log.
//!
//! ## Responsibilities
//! - Point lookups without touching the log
//! - Last-write-wins: inserting a key replaces its previous location
//! - Track live bytes so the engine knows how much a compaction reclaims
//!
//! ## Data Structure Choice
//! Plain `HashMap`: the index is purely derived state, rebuilt by replay,
//! and all access is already serialized by the engine's RwLock. Only point
//! lookups are needed, so there is no reason to keep keys ordered.

mod table;

pub use table::Index;

use crate::crypto::CipherState;

/// Where a key's current value lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Absolute log offset of the first value byte
    pub offset: u32,

    /// Encoded value length
    pub len: u32,

    /// Framed size of the whole entry (key + value + length prefixes)
    pub entry_len: u32,

    /// Cipher position at `offset` (encrypted stores only)
    pub snapshot: Option<CipherState>,
}

impl IndexEntry {
    pub fn range(&self) -> std::ops::Range<usize> {
        let start = self.offset as usize;
        start..start + self.len as usize
    }
}
