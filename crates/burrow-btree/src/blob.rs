//! Blob allocator: variable-length byte sequences on chained pages.
//!
//! A blob is addressed by a single id. On disk the id is the address of
//! the first chunk page; chunks carry a next-link and the first chunk
//! records the total byte length. For in-memory databases blobs live in
//! an arena map under synthetic ids and never touch pages.

use std::collections::HashMap;

use burrow_error::{BurrowError, Result};
use burrow_pager::{Pager, TxnPageSet};
use burrow_types::flags::PageIoFlags;
use burrow_types::{codec, PageAddress, PageType};
use tracing::trace;

/// Chunk-relative offset of the next-chunk link.
const NEXT_OFFSET: usize = 8;
/// Chunk-relative offset of the total blob size (first chunk only).
const SIZE_OFFSET: usize = 16;
/// Chunk-relative offset of the payload.
const PAYLOAD_OFFSET: usize = 24;

fn chunk_capacity(page_size: usize) -> usize {
    page_size - PAYLOAD_OFFSET
}

/// Blob storage for one environment.
#[derive(Debug, Default)]
pub struct BlobStore {
    /// In-memory-database arena; unused for file-backed environments.
    arena: HashMap<u64, Vec<u8>>,
    next_arena_id: u64,
}

impl BlobStore {
    /// An empty blob store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            arena: HashMap::new(),
            next_arena_id: 1,
        }
    }

    /// Store `data` as a new blob and return its id.
    pub fn allocate(
        &mut self,
        pager: &mut Pager,
        mut txn: Option<&mut TxnPageSet>,
        data: &[u8],
    ) -> Result<u64> {
        if pager.in_memory() {
            let id = self.next_arena_id;
            self.next_arena_id += 1;
            self.arena.insert(id, data.to_vec());
            return Ok(id);
        }

        let page_size = pager.page_size().as_usize();
        let cap = chunk_capacity(page_size);
        let chunk_count = data.len().div_ceil(cap).max(1);

        let mut pages = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            pages.push(pager.alloc_page(PageType::Blob, txn.as_deref_mut(), PageIoFlags::default())?);
        }

        for (i, page) in pages.iter().enumerate() {
            let next = pages
                .get(i + 1)
                .map_or(0, |p| p.borrow().address());
            let chunk = &data[(i * cap).min(data.len())..((i + 1) * cap).min(data.len())];
            {
                let mut p = page.borrow_mut();
                let buf = p.data_mut();
                codec::put_u64(buf, NEXT_OFFSET, next);
                codec::put_u64(buf, SIZE_OFFSET, if i == 0 { data.len() as u64 } else { 0 });
                buf[PAYLOAD_OFFSET..PAYLOAD_OFFSET + chunk.len()].copy_from_slice(chunk);
                p.set_dirty(true);
                p.set_in_use(false);
            }
            pager.flush_page(page, PageIoFlags::default())?;
        }

        let id = pages[0].borrow().address();
        trace!(id, size = data.len(), chunks = chunk_count, "allocated blob");
        Ok(id)
    }

    /// Read a blob's full payload.
    pub fn read(
        &mut self,
        pager: &mut Pager,
        mut txn: Option<&mut TxnPageSet>,
        blob_id: u64,
    ) -> Result<Vec<u8>> {
        if pager.in_memory() {
            return self
                .arena
                .get(&blob_id)
                .cloned()
                .ok_or(BurrowError::KeyNotFound);
        }

        let page_size = pager.page_size().as_usize();
        let cap = chunk_capacity(page_size);

        let mut out = Vec::new();
        let mut next = blob_id;
        let mut remaining = usize::MAX;
        while next != 0 && remaining > 0 {
            let page = pager
                .fetch_page(txn.as_deref_mut(), next, PageIoFlags::default())?
                .ok_or_else(|| BurrowError::internal("blob chunk missing"))?;
            let p = page.borrow();
            let buf = p.data();
            if remaining == usize::MAX {
                remaining = usize::try_from(codec::get_u64(buf, SIZE_OFFSET))
                    .map_err(|_| BurrowError::internal("blob size out of range"))?;
                out.reserve(remaining);
            }
            let take = remaining.min(cap);
            out.extend_from_slice(&buf[PAYLOAD_OFFSET..PAYLOAD_OFFSET + take]);
            remaining -= take;
            next = codec::get_u64(buf, NEXT_OFFSET);
        }
        Ok(out)
    }

    /// Replace a blob's payload, returning the (possibly new) id.
    ///
    /// A same-length overwrite happens in place; otherwise the old chain
    /// is freed and a new one allocated.
    pub fn overwrite(
        &mut self,
        pager: &mut Pager,
        mut txn: Option<&mut TxnPageSet>,
        blob_id: u64,
        data: &[u8],
    ) -> Result<u64> {
        if pager.in_memory() {
            let slot = self
                .arena
                .get_mut(&blob_id)
                .ok_or(BurrowError::KeyNotFound)?;
            *slot = data.to_vec();
            return Ok(blob_id);
        }

        let old = self.read(pager, txn.as_deref_mut(), blob_id)?;
        if old.len() == data.len() {
            self.write_in_place(pager, txn, blob_id, data)?;
            return Ok(blob_id);
        }
        self.free(pager, txn.as_deref_mut(), blob_id)?;
        self.allocate(pager, txn, data)
    }

    /// Release a blob's storage.
    pub fn free(
        &mut self,
        pager: &mut Pager,
        mut txn: Option<&mut TxnPageSet>,
        blob_id: u64,
    ) -> Result<()> {
        if pager.in_memory() {
            self.arena.remove(&blob_id);
            return Ok(());
        }

        let mut next = blob_id;
        while next != 0 {
            let page = pager
                .fetch_page(txn.as_deref_mut(), next, PageIoFlags::default())?
                .ok_or_else(|| BurrowError::internal("blob chunk missing"))?;
            next = codec::get_u64(page.borrow().data(), NEXT_OFFSET);
            pager.free_page(&page, PageIoFlags::default())?;
        }
        trace!(blob_id, "freed blob");
        Ok(())
    }

    fn write_in_place(
        &mut self,
        pager: &mut Pager,
        mut txn: Option<&mut TxnPageSet>,
        blob_id: u64,
        data: &[u8],
    ) -> Result<()> {
        let page_size = pager.page_size().as_usize();
        let cap = chunk_capacity(page_size);

        let mut next = blob_id;
        let mut written = 0usize;
        while next != 0 && written < data.len() {
            let page = pager
                .fetch_page(txn.as_deref_mut(), next, PageIoFlags::default())?
                .ok_or_else(|| BurrowError::internal("blob chunk missing"))?;
            let take = (data.len() - written).min(cap);
            {
                let mut p = page.borrow_mut();
                let buf = p.data_mut();
                next = codec::get_u64(buf, NEXT_OFFSET);
                buf[PAYLOAD_OFFSET..PAYLOAD_OFFSET + take]
                    .copy_from_slice(&data[written..written + take]);
                p.set_dirty(true);
            }
            pager.flush_page(&page, PageIoFlags::default())?;
            written += take;
        }
        Ok(())
    }
}
