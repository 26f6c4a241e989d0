//! Persistent accounting of reusable page areas.
//!
//! The freelist is page-granular: every area it manages is exactly one
//! page. On disk it is a chain of `Freelist`-type pages rooted in the
//! environment header; in memory it is a plain vector, loaded when the
//! environment opens and written back when the pager flushes. Chain pages
//! are environment metadata and are read and written straight through the
//! device, not through the page cache.

use burrow_device::Device;
use burrow_error::{BurrowError, Result};
use burrow_types::{codec, PageAddress, PageType};
use tracing::{debug, trace};

/// Byte offset of the next-chain-page link inside a freelist page.
const NEXT_OFFSET: usize = 8;
/// Byte offset of the entry count.
const COUNT_OFFSET: usize = 16;
/// Byte offset of the first entry.
const ENTRIES_OFFSET: usize = 20;

/// Persistent record of freed page addresses available for reuse.
#[derive(Debug, Default)]
pub struct Freelist {
    free: Vec<PageAddress>,
    /// Pages holding the on-disk chain. The chain grows to its
    /// high-watermark and is rewritten in place on every persist.
    chain: Vec<PageAddress>,
    dirty: bool,
}

fn entries_per_page(page_size: usize) -> usize {
    (page_size - ENTRIES_OFFSET) / 8
}

impl Freelist {
    /// An empty freelist for a fresh environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the freelist chain rooted at `root` (0 means empty).
    pub fn load(device: &mut dyn Device, root: PageAddress, page_size: usize) -> Result<Self> {
        let mut list = Self::default();
        let mut next = root;
        let mut buf = vec![0u8; page_size];
        while next != 0 {
            if list.chain.contains(&next) {
                return Err(BurrowError::internal("freelist chain cycle"));
            }
            device.read_at(next, &mut buf)?;
            if PageType::from_u8(buf[0]) != Some(PageType::Freelist) {
                return Err(BurrowError::internal(format!(
                    "page {next:#x} is not a freelist page"
                )));
            }
            list.chain.push(next);
            let count = codec::get_u32(&buf, COUNT_OFFSET) as usize;
            if count > entries_per_page(page_size) {
                return Err(BurrowError::internal("freelist entry count out of range"));
            }
            for i in 0..count {
                list.free.push(codec::get_u64(&buf, ENTRIES_OFFSET + i * 8));
            }
            next = codec::get_u64(&buf, NEXT_OFFSET);
        }
        debug!(entries = list.free.len(), chain = list.chain.len(), "loaded freelist");
        Ok(list)
    }

    /// Number of free areas currently recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.free.len()
    }

    /// Whether no free areas are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Pop a page-aligned area of `size` bytes, or `None` if the list is
    /// empty. A returned offset is no longer on the list.
    pub fn alloc_area(&mut self, size: usize, page_size: usize) -> Option<PageAddress> {
        debug_assert_eq!(size, page_size, "freelist areas are page-granular");
        let addr = self.free.pop()?;
        trace!(addr, "reusing freed page");
        self.dirty = true;
        Some(addr)
    }

    /// Record a freed area for later reuse.
    pub fn add_area(&mut self, offset: PageAddress, size: usize, page_size: usize) {
        debug_assert_eq!(size, page_size, "freelist areas are page-granular");
        debug_assert!(!self.free.contains(&offset), "area already on freelist");
        self.free.push(offset);
        self.dirty = true;
    }

    /// Write the chain back to the device and return the chain root
    /// address (0 when the chain was never needed).
    ///
    /// Chain pages are taken from the free pool first, then from file
    /// extension; once part of the chain, a page stays there.
    pub fn persist(&mut self, device: &mut dyn Device, page_size: usize) -> Result<PageAddress> {
        let cap = entries_per_page(page_size);
        loop {
            let needed = self.free.len().div_ceil(cap);
            if self.chain.len() >= needed {
                break;
            }
            let addr = match self.free.pop() {
                Some(addr) => addr,
                None => {
                    let len = device.len()?;
                    device.truncate(len + page_size as u64)?;
                    len
                }
            };
            self.chain.push(addr);
        }

        let mut buf = vec![0u8; page_size];
        for (i, &addr) in self.chain.iter().enumerate() {
            buf.fill(0);
            buf[0] = PageType::Freelist as u8;
            let next = self.chain.get(i + 1).copied().unwrap_or(0);
            codec::put_u64(&mut buf, NEXT_OFFSET, next);
            let entries = self
                .free
                .iter()
                .skip(i * cap)
                .take(cap)
                .collect::<Vec<_>>();
            codec::put_u32(&mut buf, COUNT_OFFSET, entries.len() as u32);
            for (j, &&entry) in entries.iter().enumerate() {
                codec::put_u64(&mut buf, ENTRIES_OFFSET + j * 8, entry);
            }
            device.write_at(addr, &buf)?;
        }

        self.dirty = false;
        Ok(self.chain.first().copied().unwrap_or(0))
    }
}
