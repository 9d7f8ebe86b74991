//! Codec Module
//!
//! Compact protobuf-style binary encoding used by the log.
//!
//! ## Primitives
//! - varint:  little-endian base-128, 7 data bits per byte,
//!            MSB = continuation flag, at most 10 bytes
//! - fixed32 / fixed64: little-endian
//! - bytes:   varint(len) + raw bytes
//!
//! ## Values
//! ```text
//! ┌─────────┬──────────────────────────────────┐
//! │ Tag (1) │ Payload (depends on tag)         │
//! └─────────┴──────────────────────────────────┘
//! ```
//! - 0x01 BOOL:   1 byte
//! - 0x02 INT:    zig-zag varint
//! - 0x03 UINT:   varint
//! - 0x04 FLOAT:  fixed32
//! - 0x05 DOUBLE: fixed64
//! - 0x06 STRING: varint(len) + UTF-8
//! - 0x07 BYTES:  varint(len) + raw
//! - 0x08 NESTED: varint(count) + count × bytes(encoded value)

mod reader;
mod value;
mod writer;

use thiserror::Error;

pub use reader::CodedReader;
pub use value::{Value, ValueTag, MAX_NESTING_DEPTH};
pub use writer::CodedWriter;

/// Longest legal varint encoding of a u64
pub const MAX_VARINT_LEN: usize = 10;

/// Errors produced while decoding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Input ended before a complete item was read
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// Input is complete but not a valid encoding
    #[error("malformed input: {0}")]
    Malformed(String),
}

/// Number of bytes `value` occupies as a varint
pub fn varint_size(mut value: u64) -> usize {
    let mut size = 1;
    while value >= 0x80 {
        value >>= 7;
        size += 1;
    }
    size
}

/// Size of a length-prefixed blob of `len` bytes
pub fn bytes_size(len: usize) -> usize {
    varint_size(len as u64) + len
}

pub(crate) fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub(crate) fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}
