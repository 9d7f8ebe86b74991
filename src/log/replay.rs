//! Log replay
//!
//! Walks a plaintext log from its start, handing each complete entry to
//! a visitor. Replay never fails outright: it stops at the first entry
//! that does not decode and reports where, so the caller can decide
//! between treating that as corruption or keeping the clean prefix.

use crate::codec::{CodedReader, DecodeError};

use super::entry::{decode_entry, EntryRef};

/// Outcome of a replay
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayResult {
    /// Entries handed to the visitor (tombstones included)
    pub entries_replayed: u64,

    /// Of those, how many were tombstones
    pub tombstones: u64,

    /// Bytes covered by complete entries
    pub valid_len: usize,

    /// Why replay stopped before the end of the input, if it did
    pub error: Option<DecodeError>,
}

impl ReplayResult {
    /// Whether the whole input decoded
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// Replay `log`, whose first byte sits at absolute offset `base`
pub fn replay<'a, F>(log: &'a [u8], base: usize, mut visit: F) -> ReplayResult
where
    F: FnMut(EntryRef<'a>),
{
    let mut reader = CodedReader::new(log);
    let mut result = ReplayResult::default();

    while !reader.is_at_end() {
        match decode_entry(&mut reader, base) {
            Ok(entry) => {
                result.entries_replayed += 1;
                if entry.is_tombstone() {
                    result.tombstones += 1;
                }
                result.valid_len = reader.position();
                visit(entry);
            }
            Err(e) => {
                result.error = Some(e);
                break;
            }
        }
    }

    result
}
