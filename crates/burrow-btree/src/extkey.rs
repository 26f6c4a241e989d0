//! The extended-key cache.
//!
//! Memoizes the fully assembled form of keys whose suffixes live in
//! blobs, so the comparator does not re-read the blob on every descent.
//! Keyed by the suffix blob id; the bucket count is a power of two so the
//! hash is a mask. New entries are prepended to their bucket chain.
//!
//! The cache shares its byte budget with the page cache: an insert that
//! would push the combined usage past the page-cache capacity fails with
//! `CacheFull` and the caller proceeds without caching. There is no
//! eviction. Entries are immutable; an update is remove + insert.

use burrow_error::{BurrowError, Result};
use tracing::trace;

const BUCKET_COUNT: usize = 128;

#[derive(Debug)]
struct ExtKey {
    blob_id: u64,
    /// The complete key: in-node prefix followed by the blob suffix.
    data: Vec<u8>,
}

/// Hash map of reassembled extended keys, one per suffix blob.
#[derive(Debug)]
pub struct ExtKeyCache {
    buckets: Vec<Vec<ExtKey>>,
    used_bytes: usize,
}

impl Default for ExtKeyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtKeyCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        debug_assert!(BUCKET_COUNT.is_power_of_two());
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
            used_bytes: 0,
        }
    }

    /// Bytes held by cached keys.
    #[inline]
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Number of cached keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Whether the cache holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_of(blob_id: u64) -> usize {
        (blob_id as usize) & (BUCKET_COUNT - 1)
    }

    /// Insert the assembled key for `blob_id`.
    ///
    /// `page_cache_used` and `page_cache_capacity` describe the page cache
    /// this cache shares its budget with. Inserting a blob id twice is a
    /// programming error.
    pub fn insert(
        &mut self,
        blob_id: u64,
        data: Vec<u8>,
        page_cache_used: usize,
        page_cache_capacity: usize,
    ) -> Result<()> {
        let h = Self::bucket_of(blob_id);
        debug_assert!(
            !self.buckets[h].iter().any(|e| e.blob_id == blob_id),
            "extended key (blob id {blob_id}) is already in the cache"
        );

        if page_cache_used + self.used_bytes + data.len() > page_cache_capacity {
            return Err(BurrowError::CacheFull);
        }

        let size = data.len();
        self.buckets[h].insert(0, ExtKey { blob_id, data });
        self.used_bytes += size;
        trace!(blob_id, size, "cached extended key");
        Ok(())
    }

    /// Fetch the assembled key for `blob_id`.
    pub fn fetch(&self, blob_id: u64) -> Result<&[u8]> {
        self.buckets[Self::bucket_of(blob_id)]
            .iter()
            .find(|e| e.blob_id == blob_id)
            .map(|e| e.data.as_slice())
            .ok_or(BurrowError::KeyNotFound)
    }

    /// Drop the entry for `blob_id`.
    pub fn remove(&mut self, blob_id: u64) -> Result<()> {
        let bucket = &mut self.buckets[Self::bucket_of(blob_id)];
        let pos = bucket
            .iter()
            .position(|e| e.blob_id == blob_id)
            .ok_or(BurrowError::KeyNotFound)?;
        let removed = bucket.remove(pos);
        self.used_bytes -= removed.data.len();
        Ok(())
    }
}
