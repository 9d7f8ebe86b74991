//! Coded writer
//!
//! Append-only encoder over a `Buffer`.

use crate::buffer::Buffer;

/// Appends encoded primitives to a buffer
pub struct CodedWriter<'a> {
    buf: &'a mut Buffer,
}

impl<'a> CodedWriter<'a> {
    pub fn new(buf: &'a mut Buffer) -> Self {
        Self { buf }
    }

    /// Bytes written to the underlying buffer so far
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn write_raw_byte(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    pub fn write_raw(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Base-128 varint, low groups first
    pub fn write_varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.push((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    pub fn write_fixed32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_fixed64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Length-prefixed blob
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.write_varint(data.len() as u64);
        self.buf.extend_from_slice(data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }
}
