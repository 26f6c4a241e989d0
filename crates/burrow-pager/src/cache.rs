//! Size-bounded page cache with LRU-style victim selection.

use std::collections::HashMap;
use std::rc::Rc;

use burrow_types::PageAddress;
use tracing::trace;

use crate::page::PageHandle;

/// Bounded collection of resident pages keyed by disk address.
///
/// The budget is expressed in bytes; every resident page accounts for one
/// page size. Victim selection walks the residency map for the unpinned
/// page with the lowest cache counter (the LRU clock is a monotonically
/// increasing tick stamped on every touch).
///
/// In-memory databases run the cache unbounded: their pages are the data
/// itself and can never be evicted or written back.
#[derive(Debug)]
pub struct PageCache {
    capacity: usize,
    page_size: usize,
    unbounded: bool,
    map: HashMap<PageAddress, PageHandle>,
    tick: u64,
}

impl PageCache {
    /// Create a cache with the given byte capacity.
    #[must_use]
    pub fn new(capacity: usize, page_size: usize, unbounded: bool) -> Self {
        Self {
            capacity,
            page_size,
            unbounded,
            map: HashMap::new(),
            tick: 0,
        }
    }

    /// Bytes currently held by resident pages.
    #[inline]
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.map.len() * self.page_size
    }

    /// The configured byte capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of resident pages.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no pages are resident.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whether one more page fits without evicting.
    #[must_use]
    pub fn has_room(&self) -> bool {
        self.unbounded || self.used_bytes() + self.page_size <= self.capacity
    }

    /// Whether one more page can be admitted at all: either there is room,
    /// or an eviction victim exists.
    #[must_use]
    pub fn can_admit(&self) -> bool {
        self.has_room() || self.find_victim().is_some()
    }

    /// Look up a resident page and stamp it most-recently-used.
    pub fn get(&mut self, address: PageAddress) -> Option<PageHandle> {
        let tick = self.next_tick();
        self.map.get(&address).map(|h| {
            h.borrow_mut().set_cache_counter(tick);
            Rc::clone(h)
        })
    }

    /// Whether a page is resident without touching its LRU stamp.
    #[must_use]
    pub fn contains(&self, address: PageAddress) -> bool {
        self.map.contains_key(&address)
    }

    /// Insert (or re-register) a page, stamping it most-recently-used.
    ///
    /// Each resident address appears exactly once: re-putting a page that
    /// is already resident only refreshes its stamp.
    pub fn put(&mut self, page: &PageHandle) {
        let address = page.borrow().address();
        debug_assert_ne!(address, 0, "cannot cache an unplaced page");
        let tick = self.next_tick();
        page.borrow_mut().set_cache_counter(tick);
        self.map.insert(address, Rc::clone(page));
        debug_assert!(
            self.unbounded || self.used_bytes() <= self.capacity,
            "cache over budget: {} > {}",
            self.used_bytes(),
            self.capacity
        );
    }

    /// Drop a page from the residency map.
    pub fn remove(&mut self, address: PageAddress) -> Option<PageHandle> {
        self.map.remove(&address)
    }

    /// Remove and return the best eviction victim.
    ///
    /// A victim is unpinned (no transaction or cursor holds its handle),
    /// not marked in-use, not awaiting delete, and has the lowest cache
    /// counter of all such pages. Returns `None` when every resident page
    /// is pinned.
    pub fn take_unused(&mut self) -> Option<PageHandle> {
        let address = self.find_victim()?;
        trace!(address, "evicting page");
        self.map.remove(&address)
    }

    /// Addresses of all resident pages (unordered).
    #[must_use]
    pub fn addresses(&self) -> Vec<PageAddress> {
        self.map.keys().copied().collect()
    }

    fn find_victim(&self) -> Option<PageAddress> {
        if self.unbounded {
            return None;
        }
        self.map
            .iter()
            .filter(|(_, h)| {
                if Rc::strong_count(h) > 1 {
                    return false;
                }
                let p = h.borrow();
                !p.is_in_use() && !p.is_delete_pending()
            })
            .min_by_key(|(_, h)| h.borrow().cache_counter())
            .map(|(addr, _)| *addr)
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}
