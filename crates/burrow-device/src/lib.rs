//! Raw byte-addressed I/O for the burrowdb pager.
//!
//! The device layer abstracts the environment file behind the [`Device`]
//! trait: positional read and write, truncate, sync, and per-page memory
//! mapping. Two implementations exist: [`FileDevice`] over a real file and
//! [`MemDevice`] over a byte vector (used by unit tests in the layers
//! above). In-memory-database mode never constructs a device at all; the
//! pager short-circuits to arena allocation instead.
//!
//! All operations are synchronous. I/O failures surface verbatim as
//! `BurrowError::Io`; nothing here retries.

mod file;
mod memory;

pub use file::FileDevice;
pub use memory::MemDevice;

use burrow_error::Result;

/// A memory-mapped page region.
///
/// The mapping covers exactly one page of the environment file. Dropping
/// the value unmaps the region.
#[derive(Debug)]
pub struct MappedPage {
    map: memmap2::MmapMut,
}

impl MappedPage {
    pub(crate) fn new(map: memmap2::MmapMut) -> Self {
        Self { map }
    }

    /// The mapped page bytes.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    /// The mapped page bytes, mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

/// Raw byte-addressed I/O over the environment file.
///
/// Offsets are absolute byte positions; the pager only ever passes
/// page-aligned offsets and whole-page lengths.
pub trait Device {
    /// Read exactly `buf.len()` bytes starting at `offset`.
    ///
    /// A read past the end of the file is a `ShortRead` error; the pager
    /// never asks for pages it has not placed.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `data` starting at `offset`.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// The current file length in bytes.
    fn len(&self) -> Result<u64>;

    /// Whether the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Grow or shrink the file to `new_len` bytes.
    fn truncate(&mut self, new_len: u64) -> Result<()>;

    /// Flush written data to stable storage.
    fn sync(&mut self) -> Result<()>;

    /// Map one page at `offset` into memory.
    ///
    /// Returns `None` if this device cannot map (the pager then falls back
    /// to a heap buffer and `read_at`).
    fn map_page(&mut self, offset: u64, len: usize) -> Result<Option<MappedPage>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Device is consumed as a trait object by the pager; keep it that way.
    #[test]
    fn device_is_object_safe() {
        fn _accepts_dyn(_d: &mut dyn Device) {}
    }
}
