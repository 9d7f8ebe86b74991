//! Memory-mapped data file
//!
//! Owns the single OS mapping of a store's data file. Growth enlarges the
//! file and remaps; callers only ever hold offsets, never pointers, so a
//! remap cannot leave anything dangling.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::debug;

use crate::error::{MapKvError, Result};

/// Allocation granularity for the data file
pub const PAGE_SIZE: usize = 4096;

/// Smallest page multiple holding `size` bytes (at least one page)
pub fn round_to_page(size: usize) -> usize {
    let pages = size.div_ceil(PAGE_SIZE).max(1);
    pages * PAGE_SIZE
}

/// Capacity chosen when `required` bytes must fit: the next power of two,
/// which is always a page multiple once it reaches one page
pub fn grown_capacity(required: usize) -> usize {
    required.max(PAGE_SIZE).next_power_of_two()
}

/// A read-write shared mapping of one file
pub struct MappedFile {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    size: usize,
}

impl MappedFile {
    /// Open or create the file with at least `initial_size` bytes mapped
    pub fn open(path: &Path, initial_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let current = file.metadata()?.len() as usize;
        let size = round_to_page(current.max(initial_size));
        if current != size {
            file.set_len(size as u64)?;
        }

        let mmap = Self::map(&file)?;
        debug!(path = %path.display(), size, "mapped data file");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            mmap,
            size,
        })
    }

    /// Grow so that `required` bytes fit. Returns true if the file grew.
    pub fn ensure_capacity(&mut self, required: usize) -> Result<bool> {
        if required <= self.size {
            return Ok(false);
        }
        let new_size = grown_capacity(required);
        debug!(
            path = %self.path.display(),
            old_size = self.size,
            new_size,
            "growing data file"
        );
        self.resize(new_size)?;
        Ok(true)
    }

    /// Shrink (or grow) the file to a page multiple holding `size` bytes
    pub fn truncate(&mut self, size: usize) -> Result<()> {
        let new_size = round_to_page(size);
        if new_size == self.size {
            return Ok(());
        }
        debug!(
            path = %self.path.display(),
            old_size = self.size,
            new_size,
            "resizing data file"
        );
        self.resize(new_size)
    }

    /// Remap if another process changed the file length.
    /// Returns true if the mapping was replaced.
    pub fn reload(&mut self) -> Result<bool> {
        let on_disk = self.file.metadata()?.len() as usize;
        if on_disk == self.size {
            return Ok(false);
        }
        self.mmap = Self::map(&self.file)?;
        self.size = on_disk;
        Ok(true)
    }

    /// Force dirty pages to durable storage
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Copy `data` into the mapping at `offset`
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.size)
            .ok_or_else(|| {
                MapKvError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "write of {} bytes at {} exceeds mapping of {} bytes",
                        data.len(),
                        offset,
                        self.size
                    ),
                ))
            })?;
        self.mmap[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Zero `[from, to)`, clamped to the mapping
    pub fn zero_range(&mut self, from: usize, to: usize) {
        let to = to.min(self.size);
        if from < to {
            self.mmap[from..to].fill(0);
        }
    }

    /// Mapped capacity in bytes
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mmap[..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn resize(&mut self, new_size: usize) -> Result<()> {
        self.mmap.flush()?;
        self.file.set_len(new_size as u64)?;
        self.mmap = Self::map(&self.file)?;
        self.size = new_size;
        Ok(())
    }

    fn map(file: &File) -> Result<MmapMut> {
        // SAFETY: the mapping is only reached through &self/&mut self of the
        // owning MappedFile, and length changes by cooperating processes are
        // serialized through the inter-process lock and followed by reload().
        unsafe { MmapMut::map_mut(file) }.map_err(MapKvError::Mapping)
    }
}
