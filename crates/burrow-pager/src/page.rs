//! The page descriptor: a fixed-size buffer tagged with its disk address.

use std::cell::RefCell;
use std::rc::Rc;

use burrow_device::MappedPage;
use burrow_types::{DatabaseName, PageAddress, PageType};

/// A shared handle to a resident page.
///
/// The cache holds one handle per resident page; transactions and cursors
/// clone the handle to pin the page. A page whose handle is shared
/// (`Rc::strong_count > 1`) is never selected as an eviction victim, which
/// is how cursor and transaction pinning is realized.
pub type PageHandle = Rc<RefCell<Page>>;

/// The backing buffer of a page.
///
/// `Heap` buffers are owned allocations filled by positional reads;
/// `Mapped` buffers are per-page memory maps (`USE_MMAP` mode). `Released`
/// marks a descriptor whose buffer has been handed back; touching the data
/// of such a page is an invariant violation.
#[derive(Debug)]
pub enum PageBuf {
    Heap(Box<[u8]>),
    Mapped(MappedPage),
    Released,
}

impl PageBuf {
    /// Allocate a zeroed heap buffer of `len` bytes.
    #[must_use]
    pub fn heap(len: usize) -> Self {
        Self::Heap(vec![0u8; len].into_boxed_slice())
    }

    /// Whether a buffer is present.
    #[must_use]
    pub fn is_present(&self) -> bool {
        !matches!(self, Self::Released)
    }
}

/// A fixed-size page buffer and its descriptor state.
#[derive(Debug)]
pub struct Page {
    /// Disk address (byte offset) of this page; 0 while unplaced. For
    /// in-memory databases this is a synthetic arena address.
    address: PageAddress,
    page_type: PageType,
    /// The database this page belongs to; 0 for environment-level pages.
    owner: DatabaseName,
    dirty: bool,
    /// The payload was logically freed; the area is reclaimed at flush
    /// time and the page is never re-handed out before that.
    delete_pending: bool,
    /// Keep-alive mark for pages allocated outside a transaction.
    in_use: bool,
    /// LRU clock value; the cache victimizes the lowest.
    cache_counter: u64,
    buf: PageBuf,
}

impl Page {
    /// Create a descriptor with the given buffer and no disk placement.
    #[must_use]
    pub fn new(buf: PageBuf) -> Self {
        Self {
            address: 0,
            page_type: PageType::Undefined,
            owner: 0,
            dirty: false,
            delete_pending: false,
            in_use: false,
            cache_counter: 0,
            buf,
        }
    }

    /// Reset every descriptor field, keeping nothing from the previous
    /// life of this page. Used when an evicted descriptor is recycled.
    pub fn reset(&mut self, buf: PageBuf) {
        *self = Self::new(buf);
    }

    #[inline]
    #[must_use]
    pub fn address(&self) -> PageAddress {
        self.address
    }

    pub fn set_address(&mut self, address: PageAddress) {
        self.address = address;
    }

    #[inline]
    #[must_use]
    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn set_page_type(&mut self, ty: PageType) {
        self.page_type = ty;
    }

    #[inline]
    #[must_use]
    pub fn owner(&self) -> DatabaseName {
        self.owner
    }

    pub fn set_owner(&mut self, owner: DatabaseName) {
        self.owner = owner;
    }

    #[inline]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    #[inline]
    #[must_use]
    pub fn is_delete_pending(&self) -> bool {
        self.delete_pending
    }

    pub fn set_delete_pending(&mut self) {
        self.delete_pending = true;
    }

    #[inline]
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    pub fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    #[inline]
    #[must_use]
    pub fn cache_counter(&self) -> u64 {
        self.cache_counter
    }

    pub fn set_cache_counter(&mut self, counter: u64) {
        self.cache_counter = counter;
    }

    /// Whether the buffer is heap-allocated (as opposed to a memory map).
    #[must_use]
    pub fn is_heap_backed(&self) -> bool {
        matches!(self.buf, PageBuf::Heap(_))
    }

    /// Whether a buffer is present at all.
    #[must_use]
    pub fn has_buffer(&self) -> bool {
        self.buf.is_present()
    }

    /// Install a buffer (used when mmap mode maps the page at read time).
    pub fn set_buf(&mut self, buf: PageBuf) {
        self.buf = buf;
    }

    /// Drop the buffer, leaving the descriptor alive.
    pub fn release_buf(&mut self) -> PageBuf {
        std::mem::replace(&mut self.buf, PageBuf::Released)
    }

    /// The page payload.
    ///
    /// Panics if the buffer has been released; every read, write or
    /// inspection of a page requires a present buffer.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match &self.buf {
            PageBuf::Heap(b) => b,
            PageBuf::Mapped(m) => m.as_slice(),
            PageBuf::Released => panic!("page {:#x} has no buffer", self.address),
        }
    }

    /// The page payload, mutably. Panics if the buffer has been released.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.buf {
            PageBuf::Heap(b) => b,
            PageBuf::Mapped(m) => m.as_mut_slice(),
            PageBuf::Released => panic!("page {:#x} has no buffer", self.address),
        }
    }
}

/// Wrap a page in a shareable handle.
#[must_use]
pub fn handle(page: Page) -> PageHandle {
    Rc::new(RefCell::new(page))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_page_is_unplaced_and_clean() {
        let page = Page::new(PageBuf::heap(4096));
        assert_eq!(page.address(), 0);
        assert_eq!(page.page_type(), PageType::Undefined);
        assert!(!page.is_dirty());
        assert!(!page.is_delete_pending());
        assert!(page.has_buffer());
        assert!(page.is_heap_backed());
    }

    #[test]
    fn reset_clears_everything() {
        let mut page = Page::new(PageBuf::heap(64));
        page.set_address(4096);
        page.set_dirty(true);
        page.set_delete_pending();
        page.set_owner(3);
        page.reset(PageBuf::heap(64));
        assert_eq!(page.address(), 0);
        assert!(!page.is_dirty());
        assert!(!page.is_delete_pending());
        assert_eq!(page.owner(), 0);
    }

    #[test]
    fn data_round_trip() {
        let mut page = Page::new(PageBuf::heap(128));
        page.data_mut()[7] = 0xAA;
        assert_eq!(page.data()[7], 0xAA);
    }

    #[test]
    #[should_panic(expected = "has no buffer")]
    fn released_buffer_panics_on_access() {
        let mut page = Page::new(PageBuf::heap(64));
        page.release_buf();
        let _ = page.data();
    }

    #[test]
    fn handle_pin_is_visible_in_strong_count() {
        let h = handle(Page::new(PageBuf::heap(64)));
        assert_eq!(Rc::strong_count(&h), 1);
        let pin = Rc::clone(&h);
        assert_eq!(Rc::strong_count(&h), 2);
        drop(pin);
        assert_eq!(Rc::strong_count(&h), 1);
    }
}
