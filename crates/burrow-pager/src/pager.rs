//! The paged file manager: fetch, alloc, flush and free.

use std::collections::HashMap;
use std::rc::Rc;

use burrow_device::Device;
use burrow_error::{BurrowError, Result};
use burrow_types::flags::{EnvFlags, PageIoFlags};
use burrow_types::{PageAddress, PageSize, PageType, PAGE_HEADER_SIZE};
use tracing::{debug, trace, warn};

use crate::cache::PageCache;
use crate::freelist::Freelist;
use crate::page::{handle, Page, PageBuf, PageHandle};

/// The private page map of one transaction.
///
/// A transaction sees its own uncommitted buffers first on every fetch,
/// and every page it touches stays pinned (the set holds a handle) until
/// commit or abort clears the set.
#[derive(Debug, Default)]
pub struct TxnPageSet {
    pages: HashMap<PageAddress, PageHandle>,
}

impl TxnPageSet {
    /// An empty page set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a page in the transaction's private map.
    #[must_use]
    pub fn get(&self, address: PageAddress) -> Option<PageHandle> {
        self.pages.get(&address).map(Rc::clone)
    }

    /// Register a page with the transaction, pinning it.
    pub fn add(&mut self, page: &PageHandle) {
        let address = page.borrow().address();
        self.pages.entry(address).or_insert_with(|| Rc::clone(page));
    }

    /// Release every pinned page.
    pub fn clear(&mut self) {
        self.pages.clear();
    }

    /// Number of pinned pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Pager over one environment file (or the in-memory arena).
///
/// Owns the device, the bounded page cache and the freelist. All page
/// traffic of the B+tree, the blob allocator and the environment goes
/// through here.
pub struct Pager {
    /// `None` for in-memory databases, which never touch a device.
    device: Option<Box<dyn Device>>,
    cache: PageCache,
    freelist: Freelist,
    page_size: PageSize,
    env_flags: EnvFlags,
    /// Next synthetic address handed out in in-memory mode. Starts past
    /// zero so that 0 keeps meaning "unplaced".
    next_arena_address: PageAddress,
    /// Count of device page writes, observable for eviction tests.
    device_writes: u64,
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("page_size", &self.page_size)
            .field("cached_pages", &self.cache.len())
            .field("free_pages", &self.freelist.len())
            .field("in_memory", &self.in_memory())
            .finish_non_exhaustive()
    }
}

impl Pager {
    /// Create a pager. `device` must be `Some` unless `IN_MEMORY_DB` is
    /// set, in which case it must be `None`.
    #[must_use]
    pub fn new(
        device: Option<Box<dyn Device>>,
        page_size: PageSize,
        cache_capacity: usize,
        env_flags: EnvFlags,
    ) -> Self {
        let in_memory = env_flags.contains(EnvFlags::IN_MEMORY_DB);
        debug_assert_eq!(device.is_none(), in_memory);
        Self {
            device,
            cache: PageCache::new(cache_capacity, page_size.as_usize(), in_memory),
            freelist: Freelist::new(),
            page_size,
            env_flags,
            next_arena_address: page_size.as_usize() as u64,
            device_writes: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    #[inline]
    #[must_use]
    pub fn in_memory(&self) -> bool {
        self.env_flags.contains(EnvFlags::IN_MEMORY_DB)
    }

    #[inline]
    #[must_use]
    fn use_mmap(&self) -> bool {
        self.env_flags.contains(EnvFlags::USE_MMAP) && !self.in_memory()
    }

    #[inline]
    #[must_use]
    fn write_through(&self) -> bool {
        self.env_flags.contains(EnvFlags::WRITE_THROUGH)
    }

    /// The page cache (read-only; mutation goes through pager operations).
    #[must_use]
    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    /// Device page writes performed so far.
    #[must_use]
    pub fn device_write_count(&self) -> u64 {
        self.device_writes
    }

    /// Direct device access for environment-level metadata (the header
    /// page), which lives outside the page cache.
    pub fn device_mut(&mut self) -> Option<&mut (dyn Device + '_)> {
        self.device.as_mut().map(|d| &mut **d as &mut (dyn Device + '_))
    }

    /// Load the persistent freelist rooted at `root`.
    pub fn load_freelist(&mut self, root: PageAddress) -> Result<()> {
        if self.in_memory() || root == 0 {
            return Ok(());
        }
        let page_size = self.page_size.as_usize();
        let device = self.device.as_deref_mut().expect("file-backed pager has a device");
        self.freelist = Freelist::load(device, root, page_size)?;
        Ok(())
    }

    /// Write the freelist chain back; returns the new chain root.
    pub fn persist_freelist(&mut self) -> Result<PageAddress> {
        if self.in_memory() {
            return Ok(0);
        }
        let page_size = self.page_size.as_usize();
        let device = self.device.as_deref_mut().expect("file-backed pager has a device");
        self.freelist.persist(device, page_size)
    }

    /// Flush written data to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(device) = self.device.as_deref_mut() {
            device.sync()?;
        }
        Ok(())
    }

    // --- Fetch ---

    /// Fetch the page at `address`, pinned for the caller.
    ///
    /// Resolution order: the transaction's private map, then the cache,
    /// then the device. `ONLY_FROM_CACHE` turns a device read into a miss
    /// (`Ok(None)`). Admission is checked before a device read; when the
    /// budget is exhausted and no victim exists the fetch fails with
    /// `CacheFull` and the caller must flush first.
    pub fn fetch_page(
        &mut self,
        mut txn: Option<&mut TxnPageSet>,
        address: PageAddress,
        flags: PageIoFlags,
    ) -> Result<Option<PageHandle>> {
        if let Some(txn) = txn.as_deref_mut() {
            if let Some(page) = txn.get(address) {
                return Ok(Some(page));
            }
        }

        if let Some(page) = self.cache.get(address) {
            if let Some(txn) = txn.as_deref_mut() {
                txn.add(&page);
            }
            return Ok(Some(page));
        }

        if flags.contains(PageIoFlags::ONLY_FROM_CACHE) {
            return Ok(None);
        }

        // All pages of an in-memory database are arena-resident; a cache
        // miss here means the address is garbage.
        assert!(
            !self.in_memory(),
            "device fetch from an in-memory database (address {address:#x})"
        );

        if !self.cache.can_admit() {
            warn!(address, "page cache is full");
            return Err(BurrowError::CacheFull);
        }

        // Errors below this point drop the partially constructed page,
        // releasing its buffer with it.
        let page = self.allocate_descriptor()?;
        self.read_into(&page, address)?;
        page.borrow_mut().set_address(address);

        if let Some(txn) = txn {
            txn.add(&page);
        }
        self.cache.put(&page);
        Ok(Some(page))
    }

    // --- Alloc ---

    /// Allocate a fresh page of `page_type`, placed via the freelist or by
    /// extending the file. In-memory databases place pages in the arena
    /// under a synthetic address.
    pub fn alloc_page(
        &mut self,
        page_type: PageType,
        txn: Option<&mut TxnPageSet>,
        flags: PageIoFlags,
    ) -> Result<PageHandle> {
        if !self.cache.can_admit() {
            warn!("page cache is full, cannot allocate");
            return Err(BurrowError::CacheFull);
        }

        let page_size = self.page_size.as_usize();
        let page = self.allocate_descriptor()?;

        if self.in_memory() {
            let address = self.next_arena_address;
            self.next_arena_address += page_size as u64;
            page.borrow_mut().set_address(address);
        } else {
            let mut address = 0;
            if !flags.contains(PageIoFlags::IGNORE_FREELIST) {
                address = self
                    .freelist
                    .alloc_area(page_size, page_size)
                    .unwrap_or(0);
            }
            if address == 0 {
                let device = self
                    .device
                    .as_deref_mut()
                    .expect("file-backed pager has a device");
                // Offset 0 is the environment header; allocation starts
                // behind it even on a file that has not been headed yet.
                let end = device.len()?.max(page_size as u64);
                device.truncate(end + page_size as u64)?;
                address = end;
                trace!(address, "extended file by one page");
            }
            if self.use_mmap() {
                self.map_or_heap(&page, address)?;
            }
            page.borrow_mut().set_address(address);
        }

        {
            let mut p = page.borrow_mut();
            p.data_mut()[..PAGE_HEADER_SIZE].fill(0);
            p.data_mut()[0] = page_type as u8;
            p.set_page_type(page_type);
            p.set_dirty(false);
        }

        match txn {
            Some(txn) => txn.add(&page),
            // Without a transaction the cache could otherwise victimize
            // the page before the caller ever writes it.
            None => page.borrow_mut().set_in_use(true),
        }

        self.cache.put(&page);
        Ok(page)
    }

    // --- Flush / free ---

    /// Hand a page back to the cache, writing it through first when the
    /// environment is in write-through mode and the page is dirty.
    ///
    /// `flags` is accepted for a future force-write mode and currently
    /// unused.
    pub fn flush_page(&mut self, page: &PageHandle, _flags: PageIoFlags) -> Result<()> {
        if self.in_memory() {
            // Arena pages have nothing to write back; a dirty in-memory
            // page is a contradiction.
            page.borrow_mut().set_dirty(false);
        } else if self.write_through() && page.borrow().is_dirty() {
            self.write_page(page)?;
        }
        self.cache.put(page);
        Ok(())
    }

    /// Mark a page delete-pending. The area is reclaimed at flush time;
    /// until then the page is never handed out again.
    ///
    /// Extended-key purging for B+tree leaves happens in the layer that
    /// understands key layout, before it calls down here.
    pub fn free_page(&mut self, page: &PageHandle, _flags: PageIoFlags) -> Result<()> {
        let address = {
            let mut p = page.borrow_mut();
            assert!(!p.is_delete_pending(), "freeing a page twice");
            p.set_delete_pending();
            p.set_in_use(false);
            p.set_dirty(false);
            p.address()
        };
        if self.in_memory() {
            // Arena pages are reclaimed immediately; there is no flush.
            self.cache.remove(address);
        }
        Ok(())
    }

    /// Walk the cache: reclaim delete-pending areas, write dirty pages,
    /// and (unless `NO_DELETE`) drop every unpinned descriptor.
    pub fn flush_all(&mut self, flags: PageIoFlags) -> Result<()> {
        let page_size = self.page_size.as_usize();
        for address in self.cache.addresses() {
            let Some(page) = self.cache.remove(address) else {
                continue;
            };
            let (pending, dirty) = {
                let p = page.borrow();
                (p.is_delete_pending(), p.is_dirty())
            };

            if pending && !self.in_memory() {
                self.freelist.add_area(address, page_size, page_size);
                continue;
            }
            if dirty && !self.in_memory() {
                self.write_page(&page)?;
            }

            let keep = flags.contains(PageIoFlags::NO_DELETE)
                || self.in_memory()
                || Rc::strong_count(&page) > 1;
            if keep {
                self.cache.put(&page);
            }
        }
        debug!(resident = self.cache.len(), "flushed cache");
        Ok(())
    }

    /// Write one page through to the device and clear its dirty flag.
    pub fn write_page(&mut self, page: &PageHandle) -> Result<()> {
        assert!(
            !self.in_memory(),
            "cannot write a page of an in-memory database"
        );
        {
            let p = page.borrow();
            assert!(
                p.has_buffer(),
                "writing page {:#x}, but page has no buffer",
                p.address()
            );
            let device = self
                .device
                .as_deref_mut()
                .expect("file-backed pager has a device");
            device.write_at(p.address(), p.data())?;
        }
        page.borrow_mut().set_dirty(false);
        self.device_writes += 1;
        Ok(())
    }

    // --- Internals ---

    /// Produce a page descriptor: fresh when the budget permits, else by
    /// evicting the LRU victim (writing it through first when dirty).
    fn allocate_descriptor(&mut self) -> Result<PageHandle> {
        let page_size = self.page_size.as_usize();

        if self.cache.has_room() {
            let buf = if self.use_mmap() {
                // The buffer becomes the map itself at read time.
                PageBuf::Released
            } else {
                PageBuf::heap(page_size)
            };
            return Ok(handle(Page::new(buf)));
        }

        let victim = self.cache.take_unused().ok_or(BurrowError::CacheFull)?;
        if victim.borrow().is_dirty() && !self.in_memory() {
            self.write_page(&victim)?;
        }
        {
            let mut v = victim.borrow_mut();
            // Dropping the old buffer unmaps or frees it depending on its
            // allocation kind.
            let _old = v.release_buf();
            let buf = if self.use_mmap() {
                PageBuf::Released
            } else {
                PageBuf::heap(page_size)
            };
            v.reset(buf);
        }
        Ok(victim)
    }

    /// Fill a descriptor's buffer from the device at `address`.
    fn read_into(&mut self, page: &PageHandle, address: PageAddress) -> Result<()> {
        if self.use_mmap() {
            self.map_or_heap(page, address)?;
            if !page.borrow().is_heap_backed() {
                return Ok(());
            }
        }
        let device = self
            .device
            .as_deref_mut()
            .expect("file-backed pager has a device");
        let mut p = page.borrow_mut();
        device.read_at(address, p.data_mut())?;
        Ok(())
    }

    /// Install a mapping of `address` as the page buffer, or fall back to
    /// a heap buffer when the device cannot map.
    fn map_or_heap(&mut self, page: &PageHandle, address: PageAddress) -> Result<()> {
        let page_size = self.page_size.as_usize();
        let device = self
            .device
            .as_deref_mut()
            .expect("file-backed pager has a device");
        match device.map_page(address, page_size)? {
            Some(map) => page.borrow_mut().set_buf(PageBuf::Mapped(map)),
            None => {
                if !page.borrow().has_buffer() {
                    page.borrow_mut().set_buf(PageBuf::heap(page_size));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_device::MemDevice;

    const PS: u32 = 1024;

    fn file_pager(cache_pages: usize) -> Pager {
        let page_size = PageSize::new(PS).unwrap();
        Pager::new(
            Some(Box::new(MemDevice::new())),
            page_size,
            cache_pages * PS as usize,
            EnvFlags::empty(),
        )
    }

    fn mem_pager() -> Pager {
        let page_size = PageSize::new(PS).unwrap();
        Pager::new(None, page_size, PS as usize, EnvFlags::IN_MEMORY_DB)
    }

    #[test]
    fn alloc_extends_the_file() {
        let mut pager = file_pager(8);
        let a = pager
            .alloc_page(PageType::Blob, None, PageIoFlags::default())
            .unwrap();
        let b = pager
            .alloc_page(PageType::Blob, None, PageIoFlags::default())
            .unwrap();
        assert_eq!(a.borrow().address(), u64::from(PS));
        assert_eq!(b.borrow().address(), 2 * u64::from(PS));
        assert_eq!(a.borrow().page_type(), PageType::Blob);
        assert!(!a.borrow().is_dirty());
    }

    #[test]
    fn fetch_returns_the_cached_handle() {
        let mut pager = file_pager(8);
        let page = pager
            .alloc_page(PageType::BtreeIndex, None, PageIoFlags::default())
            .unwrap();
        let address = page.borrow().address();
        let fetched = pager
            .fetch_page(None, address, PageIoFlags::default())
            .unwrap()
            .unwrap();
        assert!(Rc::ptr_eq(&page, &fetched));
    }

    #[test]
    fn only_from_cache_misses_cleanly() {
        let mut pager = file_pager(8);
        let miss = pager
            .fetch_page(None, 64 * u64::from(PS), PageIoFlags::ONLY_FROM_CACHE)
            .unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn fetch_reads_from_device_after_drop_from_cache() {
        let mut pager = file_pager(8);
        let page = pager
            .alloc_page(PageType::Blob, None, PageIoFlags::default())
            .unwrap();
        let address = page.borrow().address();
        page.borrow_mut().data_mut()[100] = 0x5A;
        page.borrow_mut().set_dirty(true);
        page.borrow_mut().set_in_use(false);
        drop(page);
        pager.flush_all(PageIoFlags::default()).unwrap();
        assert_eq!(pager.cache().len(), 0);

        let again = pager
            .fetch_page(None, address, PageIoFlags::default())
            .unwrap()
            .unwrap();
        assert_eq!(again.borrow().data()[100], 0x5A);
    }

    #[test]
    fn txn_map_is_consulted_first() {
        let mut pager = file_pager(8);
        let mut txn = TxnPageSet::new();
        let page = pager
            .alloc_page(PageType::Blob, Some(&mut txn), PageIoFlags::default())
            .unwrap();
        let address = page.borrow().address();
        assert_eq!(txn.len(), 1);

        let fetched = pager
            .fetch_page(Some(&mut txn), address, PageIoFlags::default())
            .unwrap()
            .unwrap();
        assert!(Rc::ptr_eq(&page, &fetched));
    }

    #[test]
    fn eviction_replaces_the_lru_clean_page() {
        let mut pager = file_pager(2);
        let mut addresses = Vec::new();
        for _ in 0..2 {
            let p = pager
                .alloc_page(PageType::Blob, None, PageIoFlags::default())
                .unwrap();
            p.borrow_mut().set_in_use(false);
            addresses.push(p.borrow().address());
        }
        // Cache is at capacity with clean, unpinned pages; one more alloc
        // succeeds by evicting.
        let p = pager
            .alloc_page(PageType::Blob, None, PageIoFlags::default())
            .unwrap();
        p.borrow_mut().set_in_use(false);
        assert_eq!(pager.cache().len(), 2);
        assert_eq!(pager.device_write_count(), 0, "clean eviction writes nothing");
    }

    #[test]
    fn evicting_a_dirty_page_writes_it_first() {
        let mut pager = file_pager(2);
        for _ in 0..2 {
            let p = pager
                .alloc_page(PageType::Blob, None, PageIoFlags::default())
                .unwrap();
            p.borrow_mut().set_dirty(true);
            p.borrow_mut().set_in_use(false);
        }
        let before = pager.device_write_count();
        let _ = pager
            .alloc_page(PageType::Blob, None, PageIoFlags::default())
            .unwrap();
        assert_eq!(pager.device_write_count(), before + 1);
    }

    #[test]
    fn cache_full_when_everything_is_pinned() {
        let mut pager = file_pager(2);
        let _a = pager
            .alloc_page(PageType::Blob, None, PageIoFlags::default())
            .unwrap();
        let _b = pager
            .alloc_page(PageType::Blob, None, PageIoFlags::default())
            .unwrap();
        // Both pages are pinned by the handles above (and in-use).
        let err = pager
            .alloc_page(PageType::Blob, None, PageIoFlags::default())
            .unwrap_err();
        assert!(matches!(err, BurrowError::CacheFull));
    }

    #[test]
    fn freed_pages_return_through_the_freelist() {
        let mut pager = file_pager(8);
        let page = pager
            .alloc_page(PageType::Blob, None, PageIoFlags::default())
            .unwrap();
        let address = page.borrow().address();
        pager.free_page(&page, PageIoFlags::default()).unwrap();
        drop(page);
        pager.flush_all(PageIoFlags::default()).unwrap();

        let reused = pager
            .alloc_page(PageType::Blob, None, PageIoFlags::default())
            .unwrap();
        assert_eq!(reused.borrow().address(), address);
    }

    #[test]
    fn ignore_freelist_always_extends() {
        let mut pager = file_pager(8);
        let page = pager
            .alloc_page(PageType::Blob, None, PageIoFlags::default())
            .unwrap();
        let freed = page.borrow().address();
        pager.free_page(&page, PageIoFlags::default()).unwrap();
        drop(page);
        pager.flush_all(PageIoFlags::default()).unwrap();

        let fresh = pager
            .alloc_page(PageType::Blob, None, PageIoFlags::IGNORE_FREELIST)
            .unwrap();
        assert_ne!(fresh.borrow().address(), freed);
    }

    #[test]
    fn write_through_mode_writes_on_flush_page() {
        let page_size = PageSize::new(PS).unwrap();
        let mut pager = Pager::new(
            Some(Box::new(MemDevice::new())),
            page_size,
            8 * PS as usize,
            EnvFlags::WRITE_THROUGH,
        );
        let page = pager
            .alloc_page(PageType::Blob, None, PageIoFlags::default())
            .unwrap();
        page.borrow_mut().set_dirty(true);
        let before = pager.device_write_count();
        pager.flush_page(&page, PageIoFlags::default()).unwrap();
        assert_eq!(pager.device_write_count(), before + 1);
        assert!(!page.borrow().is_dirty());
    }

    #[test]
    fn in_memory_allocates_synthetic_addresses() {
        let mut pager = mem_pager();
        let a = pager
            .alloc_page(PageType::BtreeRoot, None, PageIoFlags::default())
            .unwrap();
        let b = pager
            .alloc_page(PageType::BtreeIndex, None, PageIoFlags::default())
            .unwrap();
        assert_ne!(a.borrow().address(), 0);
        assert_ne!(a.borrow().address(), b.borrow().address());

        // The arena cache is unbounded and serves fetches directly.
        let addr = a.borrow().address();
        let fetched = pager
            .fetch_page(None, addr, PageIoFlags::default())
            .unwrap()
            .unwrap();
        assert!(Rc::ptr_eq(&a, &fetched));
    }

    #[test]
    #[should_panic(expected = "device fetch from an in-memory database")]
    fn in_memory_device_fetch_is_an_invariant_violation() {
        let mut pager = mem_pager();
        let _ = pager.fetch_page(None, 0xDEAD_000, PageIoFlags::default());
    }

    #[test]
    fn flush_all_keeps_pinned_pages_resident() {
        let mut pager = file_pager(8);
        let pinned = pager
            .alloc_page(PageType::Blob, None, PageIoFlags::default())
            .unwrap();
        let loose = pager
            .alloc_page(PageType::Blob, None, PageIoFlags::default())
            .unwrap();
        loose.borrow_mut().set_in_use(false);
        let loose_addr = loose.borrow().address();
        drop(loose);

        pager.flush_all(PageIoFlags::default()).unwrap();
        assert!(pager.cache().contains(pinned.borrow().address()));
        assert!(!pager.cache().contains(loose_addr));
    }
}
