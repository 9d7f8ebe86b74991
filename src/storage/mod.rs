//! Storage Module
//!
//! Files backing a store and the OS primitives around them.
//!
//! ## Responsibilities
//! - Map the data file and grow/shrink it (`MappedFile`)
//! - Persist the committed log state (`MetaFile`, `MetaInfo`)
//! - Coordinate processes sharing the files (`InterProcessLock`)
//!
//! ## Files
//! ```text
//! {path}            data file: raw log from byte 0, zero padded to capacity
//! {path}.crc        meta file: two alternating MetaInfo slots
//! {path}.compact    compacted log, present only while a rewrite is in flight
//! ```

mod lock;
mod meta;
mod mmap;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub use lock::{InterProcessLock, LockGuard, LockMode};
pub use meta::{MetaFile, MetaInfo, FLAG_ENCRYPTED, FORMAT_VERSION, META_FILE_SIZE};
pub use mmap::{grown_capacity, round_to_page, MappedFile, PAGE_SIZE};

/// Paths of the files belonging to one store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub data: PathBuf,
    pub meta: PathBuf,
    pub compact: PathBuf,
}

impl StorePaths {
    pub fn new(data: &Path) -> Self {
        Self {
            data: data.to_path_buf(),
            meta: Self::sibling(data, ".crc"),
            compact: Self::sibling(data, ".compact"),
        }
    }

    /// "{dir}/name" → "{dir}/name{suffix}"
    fn sibling(data: &Path, suffix: &str) -> PathBuf {
        let mut name: OsString = data.file_name().map(OsString::from).unwrap_or_default();
        name.push(suffix);
        data.with_file_name(name)
    }
}
