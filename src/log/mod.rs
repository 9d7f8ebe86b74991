//! Log Module
//!
//! The append-only log that lives in the data file.
//!
//! ## Responsibilities
//! - Frame key/value entries for appending
//! - Tombstones for removed keys
//! - Replay from offset 0 to rebuild the index
//!
//! ## Entry Format
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ Entry 1                                     │
//! │ ┌──────────┬─────┬──────────┬─────────────┐ │
//! │ │KeyLen(v) │ Key │ValLen(v) │ Value       │ │
//! │ └──────────┴─────┴──────────┴─────────────┘ │
//! ├─────────────────────────────────────────────┤
//! │ Entry 2 ...                                 │
//! └─────────────────────────────────────────────┘
//! (v) = varint. ValLen 0 = tombstone. Integrity is covered by the
//! whole-log CRC in the meta record, not per entry.
//! ```

mod entry;
mod replay;

pub use entry::{decode_entry, encode_entry, entry_size, EncodedEntry, EntryRef};
pub use replay::{replay, ReplayResult};
