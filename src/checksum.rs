//! Checksum Guard
//!
//! Running CRC32 over the log. Appends extend the digest incrementally;
//! the full log is only rescanned on open.

/// Incremental CRC32 of `[0, actual_size)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChecksumGuard {
    digest: u32,
}

impl ChecksumGuard {
    /// Digest of the empty log
    pub fn new() -> Self {
        Self { digest: 0 }
    }

    /// Resume from a previously persisted digest
    pub fn with_digest(digest: u32) -> Self {
        Self { digest }
    }

    /// Digest of `data` from scratch
    pub fn compute(data: &[u8]) -> Self {
        let mut guard = Self::new();
        guard.update(data);
        guard
    }

    /// Extend the digest with bytes appended to the log
    pub fn update(&mut self, data: &[u8]) {
        let mut hasher = crc32fast::Hasher::new_with_initial(self.digest);
        hasher.update(data);
        self.digest = hasher.finalize();
    }

    pub fn digest(&self) -> u32 {
        self.digest
    }

    pub fn reset(&mut self) {
        self.digest = 0;
    }

    /// Whether `data` hashes to `expected`
    pub fn verify(data: &[u8], expected: u32) -> bool {
        Self::compute(data).digest == expected
    }
}
