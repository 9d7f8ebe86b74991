//! Log entry framing

use crate::buffer::Buffer;
use crate::codec::{bytes_size, CodedReader, CodedWriter, DecodeError};

/// A framed entry ready to be appended
#[derive(Debug)]
pub struct EncodedEntry {
    pub buf: Buffer,
    /// Offset of the value bytes within `buf`
    pub value_offset: usize,
}

impl EncodedEntry {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn value_len(&self) -> usize {
        self.buf.len() - self.value_offset
    }
}

/// Frame `key` → `value`. An empty `value` frames a tombstone.
pub fn encode_entry(key: &str, value: &[u8]) -> EncodedEntry {
    let mut buf = Buffer::with_capacity(entry_size(key.len(), value.len()));
    let mut writer = CodedWriter::new(&mut buf);
    writer.write_string(key);
    writer.write_varint(value.len() as u64);
    let value_offset = writer.position();
    writer.write_raw(value);
    EncodedEntry { buf, value_offset }
}

/// Framed size of an entry
pub fn entry_size(key_len: usize, value_len: usize) -> usize {
    bytes_size(key_len) + bytes_size(value_len)
}

/// An entry borrowed from the (plaintext) log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRef<'a> {
    pub key: &'a str,
    pub value: &'a [u8],
    /// Absolute offset of the first byte of the entry
    pub offset: usize,
    /// Absolute offset of the first value byte
    pub value_offset: usize,
}

impl EntryRef<'_> {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }

    /// Framed size of this entry
    pub fn size(&self) -> usize {
        entry_size(self.key.len(), self.value.len())
    }
}

/// Decode the entry at the reader's cursor. `base` is the absolute log
/// offset of the reader's position 0.
pub fn decode_entry<'a>(
    reader: &mut CodedReader<'a>,
    base: usize,
) -> Result<EntryRef<'a>, DecodeError> {
    let offset = base + reader.position();
    let key = reader.read_string()?;
    if key.is_empty() {
        return Err(DecodeError::Malformed(format!("empty key at offset {}", offset)));
    }
    let value = reader.read_bytes()?;
    let value_offset = base + reader.position() - value.len();
    Ok(EntryRef {
        key,
        value,
        offset,
        value_offset,
    })
}
