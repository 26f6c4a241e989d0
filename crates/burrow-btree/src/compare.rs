//! The two-stage key comparison protocol.
//!
//! Ordered lookups compare key slots that may be extended (suffix in a
//! blob). The fast path compares in-node bytes only; a prefix comparator
//! may settle the ordering without ever touching a blob, and only when it
//! cannot does the protocol materialize the full keys, consulting the
//! extended-key cache before reading the suffix blob.

use std::cmp::Ordering;

use burrow_error::Result;
use burrow_pager::{Pager, TxnPageSet};
use burrow_types::{codec, ADDRESS_SIZE};

use crate::blob::BlobStore;
use crate::extkey::ExtKeyCache;

/// Full-key comparison, installed per database.
pub type FullCompareFn = fn(&[u8], &[u8]) -> Ordering;

/// Outcome of a prefix comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixDecision {
    /// The prefixes settle the ordering.
    Decided(Ordering),
    /// The prefixes are equal; the full keys are required.
    NeedFullKey,
}

/// Prefix comparison over the in-node bytes, installed per database.
///
/// Arguments are `(lhs_prefix, lhs_full_len, rhs_prefix, rhs_full_len)`.
pub type PrefixCompareFn = fn(&[u8], usize, &[u8], usize) -> PrefixDecision;

/// Lexicographic memcmp; on equal prefixes the shorter key is greater.
///
/// The tiebreak is part of the on-disk ordering contract.
#[must_use]
pub fn default_full_compare(lhs: &[u8], rhs: &[u8]) -> Ordering {
    let min = lhs.len().min(rhs.len());
    match lhs[..min].cmp(&rhs[..min]) {
        Ordering::Equal => rhs.len().cmp(&lhs.len()),
        ord => ord,
    }
}

/// Memcmp of the common prefix; asks for the full keys when it is equal.
#[must_use]
pub fn default_prefix_compare(
    lhs: &[u8],
    _lhs_full_len: usize,
    rhs: &[u8],
    _rhs_full_len: usize,
) -> PrefixDecision {
    let min = lhs.len().min(rhs.len());
    match lhs[..min].cmp(&rhs[..min]) {
        Ordering::Equal => PrefixDecision::NeedFullKey,
        ord => PrefixDecision::Decided(ord),
    }
}

/// The comparison functions of one database.
#[derive(Debug, Clone, Copy)]
pub struct Comparator {
    pub full: FullCompareFn,
    pub prefix: Option<PrefixCompareFn>,
}

impl Default for Comparator {
    fn default() -> Self {
        Self {
            full: default_full_compare,
            prefix: Some(default_prefix_compare),
        }
    }
}

/// One side of a comparison.
///
/// For a plain key, `slot` is exactly the key bytes. For an extended key,
/// `slot` is the full in-node slot (`key_size` bytes ending in the suffix
/// blob id) and `full_len` is the real key length.
#[derive(Debug, Clone, Copy)]
pub struct KeyRef<'a> {
    pub slot: &'a [u8],
    pub full_len: usize,
    pub extended: bool,
}

impl<'a> KeyRef<'a> {
    /// A plain (non-extended) key.
    #[must_use]
    pub fn plain(key: &'a [u8]) -> Self {
        Self {
            slot: key,
            full_len: key.len(),
            extended: false,
        }
    }

    /// The in-node prefix bytes of this side.
    #[must_use]
    fn prefix(&self, key_size: usize) -> &'a [u8] {
        if self.extended {
            &self.slot[..key_size - ADDRESS_SIZE]
        } else {
            self.slot
        }
    }

    /// The suffix blob id of an extended side.
    fn blob_id(&self, key_size: usize) -> u64 {
        debug_assert!(self.extended);
        codec::get_u64(self.slot, key_size - ADDRESS_SIZE)
    }
}

impl Comparator {
    /// Compare two keys, materializing extended sides only when the
    /// prefix comparison cannot settle the ordering.
    ///
    /// Materialized keys are inserted into the extended-key cache on a
    /// best-effort basis; a full cache never fails the comparison. For
    /// in-memory databases the cache is bypassed entirely.
    #[allow(clippy::too_many_arguments)]
    pub fn compare_keys(
        &self,
        key_size: usize,
        pager: &mut Pager,
        blobs: &mut BlobStore,
        extkeys: &mut Option<ExtKeyCache>,
        mut txn: Option<&mut TxnPageSet>,
        lhs: KeyRef<'_>,
        rhs: KeyRef<'_>,
    ) -> Result<Ordering> {
        if !lhs.extended && !rhs.extended {
            return Ok((self.full)(lhs.slot, rhs.slot));
        }

        if let Some(prefix) = self.prefix {
            match prefix(
                lhs.prefix(key_size),
                lhs.full_len,
                rhs.prefix(key_size),
                rhs.full_len,
            ) {
                PrefixDecision::Decided(ord) => return Ok(ord),
                PrefixDecision::NeedFullKey => {}
            }
        }

        let lhs_full = if lhs.extended {
            Some(materialize(&lhs, key_size, pager, blobs, extkeys, txn.as_deref_mut())?)
        } else {
            None
        };
        let rhs_full = if rhs.extended {
            Some(materialize(&rhs, key_size, pager, blobs, extkeys, txn)?)
        } else {
            None
        };

        let l = lhs_full.as_deref().unwrap_or(lhs.slot);
        let r = rhs_full.as_deref().unwrap_or(rhs.slot);
        Ok((self.full)(l, r))
    }
}

/// Reassemble an extended key: in-node prefix followed by the blob
/// suffix, via the extended-key cache when possible.
pub(crate) fn materialize(
    key: &KeyRef<'_>,
    key_size: usize,
    pager: &mut Pager,
    blobs: &mut BlobStore,
    extkeys: &mut Option<ExtKeyCache>,
    txn: Option<&mut TxnPageSet>,
) -> Result<Vec<u8>> {
    let blob_id = key.blob_id(key_size);

    // In in-memory databases the cache would only duplicate arena data.
    let use_cache = !pager.in_memory();

    if use_cache {
        if let Some(cache) = extkeys.as_ref() {
            if let Ok(bytes) = cache.fetch(blob_id) {
                debug_assert_eq!(bytes.len(), key.full_len, "cached key length mismatch");
                return Ok(bytes.to_vec());
            }
        }
    }

    let suffix = blobs.read(pager, txn, blob_id)?;
    let mut full = Vec::with_capacity(key.full_len);
    full.extend_from_slice(&key.slot[..key_size - ADDRESS_SIZE]);
    full.extend_from_slice(&suffix);
    debug_assert_eq!(full.len(), key.full_len, "assembled key length mismatch");

    if use_cache {
        let cache = extkeys.get_or_insert_with(ExtKeyCache::new);
        // Best effort: a full cache is not an error here.
        let _ = cache.insert(
            blob_id,
            full.clone(),
            pager.cache().used_bytes(),
            pager.cache().capacity(),
        );
    }

    Ok(full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_device::MemDevice;
    use burrow_types::flags::EnvFlags;
    use burrow_types::PageSize;
    use proptest::prelude::*;

    #[test]
    fn equal_keys_compare_equal() {
        assert_eq!(default_full_compare(b"abc", b"abc"), Ordering::Equal);
    }

    #[test]
    fn plain_lexicographic_order() {
        assert_eq!(default_full_compare(b"abc", b"abd"), Ordering::Less);
        assert_eq!(default_full_compare(b"b", b"a"), Ordering::Greater);
    }

    #[test]
    fn shorter_key_is_greater_on_equal_prefix() {
        assert_eq!(default_full_compare(b"ab", b"abc"), Ordering::Greater);
        assert_eq!(default_full_compare(b"abc", b"ab"), Ordering::Less);
    }

    #[test]
    fn prefix_compare_decides_or_defers() {
        assert_eq!(
            default_prefix_compare(b"aa", 10, b"ab", 12),
            PrefixDecision::Decided(Ordering::Less)
        );
        assert_eq!(
            default_prefix_compare(b"aa", 10, b"aa", 12),
            PrefixDecision::NeedFullKey
        );
    }

    proptest! {
        // Antisymmetry of the default compare, including the tiebreak.
        #[test]
        fn compare_is_antisymmetric(a in proptest::collection::vec(any::<u8>(), 0..64),
                                    b in proptest::collection::vec(any::<u8>(), 0..64)) {
            let ab = default_full_compare(&a, &b);
            let ba = default_full_compare(&b, &a);
            prop_assert_eq!(ab, ba.reverse());
        }

        // Sorting with the comparator is stable under input permutation.
        #[test]
        fn sort_is_permutation_independent(mut keys in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..16), 0..32)) {
            let mut shuffled = keys.clone();
            shuffled.reverse();
            keys.sort_by(|a, b| default_full_compare(a, b));
            shuffled.sort_by(|a, b| default_full_compare(a, b));
            prop_assert_eq!(keys, shuffled);
        }
    }

    // --- Extended-key materialization ---

    const KS: usize = 16;

    fn file_pager() -> Pager {
        Pager::new(
            Some(Box::new(MemDevice::new())),
            PageSize::new(1024).unwrap(),
            64 * 1024,
            EnvFlags::empty(),
        )
    }

    /// Build an extended slot for `key`: prefix bytes + suffix blob id.
    fn ext_slot(
        pager: &mut Pager,
        blobs: &mut BlobStore,
        key: &[u8],
    ) -> (Vec<u8>, usize) {
        assert!(key.len() > KS);
        let suffix = &key[KS - ADDRESS_SIZE..];
        let blob_id = blobs.allocate(pager, None, suffix).unwrap();
        let mut slot = vec![0u8; KS];
        slot[..KS - ADDRESS_SIZE].copy_from_slice(&key[..KS - ADDRESS_SIZE]);
        codec::put_u64(&mut slot, KS - ADDRESS_SIZE, blob_id);
        (slot, key.len())
    }

    #[test]
    fn extended_vs_plain_compares_on_full_key() {
        let mut pager = file_pager();
        let mut blobs = BlobStore::new();
        let mut extkeys = None;
        let cmp = Comparator::default();

        let long_key = b"same-prefix-0123456789-AAAA".to_vec();
        let (slot, full_len) = ext_slot(&mut pager, &mut blobs, &long_key);
        let ext = KeyRef {
            slot: &slot,
            full_len,
            extended: true,
        };

        let probe = b"same-prefix-0123456789-BBBB".to_vec();
        let ord = cmp
            .compare_keys(
                KS,
                &mut pager,
                &mut blobs,
                &mut extkeys,
                None,
                ext,
                KeyRef::plain(&probe),
            )
            .unwrap();
        assert_eq!(ord, Ordering::Less);

        // The materialized key landed in the lazily created cache.
        assert_eq!(extkeys.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn second_compare_hits_the_cache() {
        let mut pager = file_pager();
        let mut blobs = BlobStore::new();
        let mut extkeys = None;
        let cmp = Comparator::default();

        let long_key = b"prefix-prefix-prefix-SUFFIX".to_vec();
        let (slot, full_len) = ext_slot(&mut pager, &mut blobs, &long_key);
        let ext = KeyRef {
            slot: &slot,
            full_len,
            extended: true,
        };

        let exact = long_key.clone();
        for _ in 0..2 {
            let ord = cmp
                .compare_keys(
                    KS,
                    &mut pager,
                    &mut blobs,
                    &mut extkeys,
                    None,
                    ext,
                    KeyRef::plain(&exact),
                )
                .unwrap();
            assert_eq!(ord, Ordering::Equal);
        }
        assert_eq!(extkeys.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn prefix_difference_avoids_materialization() {
        let mut pager = file_pager();
        let mut blobs = BlobStore::new();
        let mut extkeys = None;
        let cmp = Comparator::default();

        let long_key = b"aaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec();
        let (slot, full_len) = ext_slot(&mut pager, &mut blobs, &long_key);
        let ext = KeyRef {
            slot: &slot,
            full_len,
            extended: true,
        };

        let probe = b"zzz".to_vec();
        let ord = cmp
            .compare_keys(
                KS,
                &mut pager,
                &mut blobs,
                &mut extkeys,
                None,
                ext,
                KeyRef::plain(&probe),
            )
            .unwrap();
        assert_eq!(ord, Ordering::Less);
        // The prefix settled it; no cache was ever created.
        assert!(extkeys.is_none());
    }
}
