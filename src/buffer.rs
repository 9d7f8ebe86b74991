//! Buffer
//!
//! Growable byte region with an explicit length vs capacity split.
//!
//! Used for staging encoded entries before they are copied into the
//! mapping, and for building the compacted log. `freeze()` hands the
//! contents out as `Bytes`, which slice and clone without copying.

use bytes::{BufMut, Bytes, BytesMut};

/// Owned, growable byte buffer
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Buffer {
    inner: BytesMut,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: BytesMut::with_capacity(capacity),
        }
    }

    /// Number of initialized bytes
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Bytes that can be written without reallocating
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Make room for at least `additional` more bytes
    pub fn reserve(&mut self, additional: usize) {
        self.inner.reserve(additional);
    }

    pub fn push(&mut self, byte: u8) {
        self.inner.put_u8(byte);
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.inner.extend_from_slice(data);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.inner
    }

    /// Drop the contents, keeping the allocation
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Shorten to `len` bytes (no-op if already shorter)
    pub fn truncate(&mut self, len: usize) {
        self.inner.truncate(len);
    }

    /// Convert into an immutable, cheaply cloneable view
    pub fn freeze(self) -> Bytes {
        self.inner.freeze()
    }

    /// Split off the current contents, leaving this buffer empty but
    /// still usable for further writes
    pub fn take(&mut self) -> Bytes {
        self.inner.split().freeze()
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.inner
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Self {
            inner: BytesMut::from(data),
        }
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self {
            inner: BytesMut::from(&data[..]),
        }
    }
}
