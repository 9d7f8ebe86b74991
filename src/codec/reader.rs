//! Coded reader
//!
//! Forward-only decoder over a byte slice. Every read is bounds-checked
//! against the logical end; nothing here panics on hostile input.

use super::{DecodeError, MAX_VARINT_LEN};

/// Reads encoded primitives from a slice
pub struct CodedReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> CodedReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current cursor offset from the start of the slice
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Rewind to the start (used for replay)
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    /// Move the cursor to an absolute offset within the slice
    pub fn seek(&mut self, pos: usize) -> Result<(), DecodeError> {
        if pos > self.data.len() {
            return Err(DecodeError::Truncated {
                needed: pos,
                remaining: self.data.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn read_raw_byte(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.data.get(self.pos).ok_or(DecodeError::Truncated {
            needed: 1,
            remaining: 0,
        })?;
        self.pos += 1;
        Ok(byte)
    }

    /// Borrow the next `len` bytes
    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(DecodeError::Truncated {
                needed: len,
                remaining,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let mut result: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.read_raw_byte()?;
            let low = (byte & 0x7f) as u64;

            // The 10th byte may only carry the top bit of a u64
            if i == MAX_VARINT_LEN - 1 && low > 1 {
                return Err(DecodeError::Malformed("varint overflows u64".to_string()));
            }

            result |= low << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(DecodeError::Malformed(format!(
            "varint longer than {} bytes",
            MAX_VARINT_LEN
        )))
    }

    pub fn read_fixed32(&mut self) -> Result<u32, DecodeError> {
        let raw = self.read_raw(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn read_fixed64(&mut self) -> Result<u64, DecodeError> {
        let raw = self.read_raw(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(raw);
        Ok(u64::from_le_bytes(arr))
    }

    /// Length-prefixed blob; a declared length past the end is `Truncated`
    pub fn read_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_varint()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::Truncated {
            needed: usize::MAX,
            remaining: self.remaining(),
        })?;
        self.read_raw(len)
    }

    pub fn read_string(&mut self) -> Result<&'a str, DecodeError> {
        let raw = self.read_bytes()?;
        std::str::from_utf8(raw).map_err(|e| DecodeError::Malformed(format!("invalid UTF-8: {}", e)))
    }
}
