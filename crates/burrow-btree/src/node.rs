//! B+tree node layout over raw page bytes.
//!
//! A node occupies the page payload behind the page header. Keys live in
//! fixed-size slots of `key_size` bytes; a key longer than the slot keeps
//! its first `key_size - 8` bytes in the node and ends in the blob id of
//! the remainder (`KEY_IS_EXTENDED`). Records are referenced, never stored
//! in the node: empty, inline (up to 8 bytes in the reference field
//! itself), a blob id, or a duplicate-table blob id.
//!
//! ```text
//! page:  [page header][node header][entry 0][entry 1]...
//! entry: [record u64][rec meta][key meta][key slot]
//! ```

use burrow_types::{codec, PageAddress, ADDRESS_SIZE, PAGE_HEADER_SIZE};

/// Key flag: the key is longer than the slot; the slot tail is a blob id.
pub const KEY_IS_EXTENDED: u8 = 0x01;

/// Record flag: record bytes are stored inline in the reference field.
const RECORD_INLINE: u8 = 0x01;
/// Record flag: the record is empty.
const RECORD_EMPTY: u8 = 0x02;
/// Record flag: the reference field is a duplicate-table blob id.
const RECORD_DUPTABLE: u8 = 0x04;

// Node header offsets, relative to the start of the page.
const LEVEL_OFFSET: usize = PAGE_HEADER_SIZE;
const COUNT_OFFSET: usize = PAGE_HEADER_SIZE + 2;
const LEFT_OFFSET: usize = PAGE_HEADER_SIZE + 4;
const RIGHT_OFFSET: usize = PAGE_HEADER_SIZE + 12;
const DOWN_OFFSET: usize = PAGE_HEADER_SIZE + 20;
/// First entry starts here.
const ENTRIES_OFFSET: usize = PAGE_HEADER_SIZE + 28;

// Entry-relative offsets.
const E_RECORD: usize = 0;
const E_REC_FLAGS: usize = 8;
const E_REC_LEN: usize = 9;
const E_KEY_FLAGS: usize = 10;
const E_KEY_LEN: usize = 12;
const E_KEY: usize = 16;
/// Entry bytes in front of the key slot.
const ENTRY_OVERHEAD: usize = 16;

/// Number of entries a node can hold.
#[must_use]
pub fn node_capacity(page_size: usize, key_size: usize) -> usize {
    (page_size - ENTRIES_OFFSET) / (ENTRY_OVERHEAD + key_size)
}

/// A record reference as stored in an entry (or a duplicate-table line).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordRef {
    /// The record exists and is empty.
    Empty,
    /// Up to 8 record bytes stored in the reference field itself.
    Inline(Vec<u8>),
    /// The record lives in a blob.
    Blob(PageAddress),
    /// The key has duplicates; the field names the duplicate table blob.
    DupTable(PageAddress),
}

impl RecordRef {
    /// Largest record stored inline.
    pub const INLINE_MAX: usize = 8;

    /// Encode into the raw `(field, flags, len)` triple.
    #[must_use]
    pub fn encode(&self) -> ([u8; 8], u8, u8) {
        match self {
            Self::Empty => ([0; 8], RECORD_EMPTY, 0),
            Self::Inline(bytes) => {
                debug_assert!(bytes.len() <= Self::INLINE_MAX);
                let mut field = [0u8; 8];
                field[..bytes.len()].copy_from_slice(bytes);
                (field, RECORD_INLINE, bytes.len() as u8)
            }
            Self::Blob(id) => {
                let mut field = [0u8; 8];
                codec::put_u64(&mut field, 0, *id);
                (field, 0, 0)
            }
            Self::DupTable(id) => {
                let mut field = [0u8; 8];
                codec::put_u64(&mut field, 0, *id);
                (field, RECORD_DUPTABLE, 0)
            }
        }
    }

    /// Decode from the raw triple.
    #[must_use]
    pub fn decode(field: [u8; 8], flags: u8, len: u8) -> Self {
        if flags & RECORD_DUPTABLE != 0 {
            Self::DupTable(codec::get_u64(&field, 0))
        } else if flags & RECORD_EMPTY != 0 {
            Self::Empty
        } else if flags & RECORD_INLINE != 0 {
            Self::Inline(field[..len as usize].to_vec())
        } else {
            Self::Blob(codec::get_u64(&field, 0))
        }
    }

    /// Whether this reference names a duplicate table.
    #[must_use]
    pub fn is_dup_table(&self) -> bool {
        matches!(self, Self::DupTable(_))
    }
}

/// An entry copied out of a node, used when entries move between pages.
#[derive(Debug, Clone)]
pub struct Entry {
    pub record: RecordRef,
    pub key_flags: u8,
    /// Real (full) key length; larger than the slot for extended keys.
    pub key_len: u16,
    /// Exactly `key_size` bytes: the in-node key image.
    pub key_slot: Vec<u8>,
}

impl Entry {
    /// The blob id of an extended key's suffix (the slot tail).
    #[must_use]
    pub fn ext_blob_id(&self) -> Option<PageAddress> {
        if self.key_flags & KEY_IS_EXTENDED != 0 {
            let tail = self.key_slot.len() - ADDRESS_SIZE;
            Some(codec::get_u64(&self.key_slot, tail))
        } else {
            None
        }
    }
}

/// Read-only view of a node inside a page buffer.
pub struct NodeView<'a> {
    data: &'a [u8],
    key_size: usize,
}

impl<'a> NodeView<'a> {
    #[must_use]
    pub fn new(data: &'a [u8], key_size: usize) -> Self {
        Self { data, key_size }
    }

    #[inline]
    #[must_use]
    pub fn level(&self) -> u8 {
        self.data[LEVEL_OFFSET]
    }

    #[inline]
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        codec::get_u16(self.data, COUNT_OFFSET) as usize
    }

    #[inline]
    #[must_use]
    pub fn left(&self) -> PageAddress {
        codec::get_u64(self.data, LEFT_OFFSET)
    }

    #[inline]
    #[must_use]
    pub fn right(&self) -> PageAddress {
        codec::get_u64(self.data, RIGHT_OFFSET)
    }

    /// Leftmost child of an inner node.
    #[inline]
    #[must_use]
    pub fn down(&self) -> PageAddress {
        codec::get_u64(self.data, DOWN_OFFSET)
    }

    fn entry_offset(&self, index: usize) -> usize {
        ENTRIES_OFFSET + index * (ENTRY_OVERHEAD + self.key_size)
    }

    /// The key slot bytes of entry `index`.
    #[must_use]
    pub fn key_slot(&self, index: usize) -> &[u8] {
        debug_assert!(index < self.count());
        let off = self.entry_offset(index) + E_KEY;
        &self.data[off..off + self.key_size]
    }

    /// The `(key_flags, key_len)` of entry `index`.
    #[must_use]
    pub fn key_meta(&self, index: usize) -> (u8, u16) {
        let off = self.entry_offset(index);
        (
            self.data[off + E_KEY_FLAGS],
            codec::get_u16(self.data, off + E_KEY_LEN),
        )
    }

    /// The record reference of entry `index`.
    #[must_use]
    pub fn record(&self, index: usize) -> RecordRef {
        let off = self.entry_offset(index);
        let field: [u8; 8] = self.data[off + E_RECORD..off + E_RECORD + 8]
            .try_into()
            .expect("record field is 8 bytes");
        RecordRef::decode(field, self.data[off + E_REC_FLAGS], self.data[off + E_REC_LEN])
    }

    /// The child address carried by inner-node entry `index`.
    #[must_use]
    pub fn child(&self, index: usize) -> PageAddress {
        debug_assert!(!self.is_leaf());
        let off = self.entry_offset(index);
        codec::get_u64(self.data, off + E_RECORD)
    }

    /// Copy entry `index` out of the node.
    #[must_use]
    pub fn entry(&self, index: usize) -> Entry {
        let (key_flags, key_len) = self.key_meta(index);
        Entry {
            record: self.record(index),
            key_flags,
            key_len,
            key_slot: self.key_slot(index).to_vec(),
        }
    }
}

/// Mutable view of a node inside a page buffer.
pub struct NodeViewMut<'a> {
    data: &'a mut [u8],
    key_size: usize,
}

impl<'a> NodeViewMut<'a> {
    #[must_use]
    pub fn new(data: &'a mut [u8], key_size: usize) -> Self {
        Self { data, key_size }
    }

    #[must_use]
    pub fn as_view(&self) -> NodeView<'_> {
        NodeView::new(self.data, self.key_size)
    }

    /// Zero the node header and stamp the level.
    pub fn init(&mut self, level: u8) {
        self.data[PAGE_HEADER_SIZE..ENTRIES_OFFSET].fill(0);
        self.data[LEVEL_OFFSET] = level;
    }

    pub fn set_count(&mut self, count: usize) {
        codec::put_u16(self.data, COUNT_OFFSET, count as u16);
    }

    pub fn set_left(&mut self, left: PageAddress) {
        codec::put_u64(self.data, LEFT_OFFSET, left);
    }

    pub fn set_right(&mut self, right: PageAddress) {
        codec::put_u64(self.data, RIGHT_OFFSET, right);
    }

    pub fn set_down(&mut self, down: PageAddress) {
        codec::put_u64(self.data, DOWN_OFFSET, down);
    }

    fn entry_offset(&self, index: usize) -> usize {
        ENTRIES_OFFSET + index * (ENTRY_OVERHEAD + self.key_size)
    }

    fn entry_size(&self) -> usize {
        ENTRY_OVERHEAD + self.key_size
    }

    /// Overwrite entry `index` in place.
    pub fn write_entry(&mut self, index: usize, entry: &Entry) {
        debug_assert_eq!(entry.key_slot.len(), self.key_size);
        let off = self.entry_offset(index);
        let (field, rec_flags, rec_len) = entry.record.encode();
        self.data[off + E_RECORD..off + E_RECORD + 8].copy_from_slice(&field);
        self.data[off + E_REC_FLAGS] = rec_flags;
        self.data[off + E_REC_LEN] = rec_len;
        self.data[off + E_KEY_FLAGS] = entry.key_flags;
        self.data[off + E_KEY_FLAGS + 1] = 0;
        codec::put_u16(self.data, off + E_KEY_LEN, entry.key_len);
        self.data[off + E_KEY_LEN + 2..off + E_KEY].fill(0);
        self.data[off + E_KEY..off + E_KEY + self.key_size].copy_from_slice(&entry.key_slot);
    }

    /// Overwrite only the record reference of entry `index`.
    pub fn write_record(&mut self, index: usize, record: &RecordRef) {
        let off = self.entry_offset(index);
        let (field, rec_flags, rec_len) = record.encode();
        self.data[off + E_RECORD..off + E_RECORD + 8].copy_from_slice(&field);
        self.data[off + E_REC_FLAGS] = rec_flags;
        self.data[off + E_REC_LEN] = rec_len;
    }

    /// Overwrite the child address of inner-node entry `index`.
    pub fn write_child(&mut self, index: usize, child: PageAddress) {
        let off = self.entry_offset(index);
        codec::put_u64(self.data, off + E_RECORD, child);
        self.data[off + E_REC_FLAGS] = 0;
        self.data[off + E_REC_LEN] = 0;
    }

    /// Insert an entry at `index`, shifting the tail right.
    pub fn insert_entry(&mut self, index: usize, entry: &Entry) {
        let count = self.as_view().count();
        debug_assert!(index <= count);
        let es = self.entry_size();
        let src = self.entry_offset(index);
        let end = self.entry_offset(count);
        self.data.copy_within(src..end, src + es);
        self.write_entry(index, entry);
        self.set_count(count + 1);
    }

    /// Remove the entry at `index`, shifting the tail left.
    pub fn remove_entry(&mut self, index: usize) {
        let count = self.as_view().count();
        debug_assert!(index < count);
        let es = self.entry_size();
        let src = self.entry_offset(index + 1);
        let end = self.entry_offset(count);
        self.data.copy_within(src..end, src - es);
        self.set_count(count - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS: usize = 1024;
    const KS: usize = 16;

    fn slot(bytes: &[u8]) -> Vec<u8> {
        let mut v = vec![0u8; KS];
        v[..bytes.len()].copy_from_slice(bytes);
        v
    }

    fn entry(key: &[u8], record: RecordRef) -> Entry {
        Entry {
            record,
            key_flags: 0,
            key_len: key.len() as u16,
            key_slot: slot(key),
        }
    }

    #[test]
    fn capacity_leaves_room_for_headers() {
        let cap = node_capacity(PS, KS);
        assert!(cap > 0);
        assert!(ENTRIES_OFFSET + cap * (ENTRY_OVERHEAD + KS) <= PS);
    }

    #[test]
    fn record_ref_encoding_round_trips() {
        for r in [
            RecordRef::Empty,
            RecordRef::Inline(b"tiny".to_vec()),
            RecordRef::Inline(b"12345678".to_vec()),
            RecordRef::Blob(0xABCD_EF00),
            RecordRef::DupTable(42),
        ] {
            let (field, flags, len) = r.encode();
            assert_eq!(RecordRef::decode(field, flags, len), r);
        }
    }

    #[test]
    fn init_and_header_round_trip() {
        let mut buf = vec![0u8; PS];
        let mut node = NodeViewMut::new(&mut buf, KS);
        node.init(2);
        node.set_left(100);
        node.set_right(200);
        node.set_down(300);
        node.set_count(0);

        let view = NodeView::new(&buf, KS);
        assert_eq!(view.level(), 2);
        assert!(!view.is_leaf());
        assert_eq!(view.left(), 100);
        assert_eq!(view.right(), 200);
        assert_eq!(view.down(), 300);
        assert_eq!(view.count(), 0);
    }

    #[test]
    fn insert_keeps_order_and_shifts() {
        let mut buf = vec![0u8; PS];
        let mut node = NodeViewMut::new(&mut buf, KS);
        node.init(0);
        node.insert_entry(0, &entry(b"bb", RecordRef::Empty));
        node.insert_entry(0, &entry(b"aa", RecordRef::Inline(b"x".to_vec())));
        node.insert_entry(2, &entry(b"cc", RecordRef::Blob(7)));

        let view = NodeView::new(&buf, KS);
        assert_eq!(view.count(), 3);
        assert_eq!(&view.key_slot(0)[..2], b"aa");
        assert_eq!(&view.key_slot(1)[..2], b"bb");
        assert_eq!(&view.key_slot(2)[..2], b"cc");
        assert_eq!(view.record(1), RecordRef::Empty);
        assert_eq!(view.record(2), RecordRef::Blob(7));
    }

    #[test]
    fn remove_shifts_left() {
        let mut buf = vec![0u8; PS];
        let mut node = NodeViewMut::new(&mut buf, KS);
        node.init(0);
        for (i, k) in [b"aa", b"bb", b"cc"].iter().enumerate() {
            node.insert_entry(i, &entry(*k, RecordRef::Empty));
        }
        node.remove_entry(1);

        let view = NodeView::new(&buf, KS);
        assert_eq!(view.count(), 2);
        assert_eq!(&view.key_slot(0)[..2], b"aa");
        assert_eq!(&view.key_slot(1)[..2], b"cc");
    }

    #[test]
    fn extended_entry_exposes_blob_id() {
        let mut key_slot = vec![0u8; KS];
        key_slot[..KS - 8].copy_from_slice(&[b'k'; KS - 8]);
        codec::put_u64(&mut key_slot, KS - 8, 0xFEED);
        let e = Entry {
            record: RecordRef::Empty,
            key_flags: KEY_IS_EXTENDED,
            key_len: 100,
            key_slot,
        };
        assert_eq!(e.ext_blob_id(), Some(0xFEED));

        let plain = entry(b"aa", RecordRef::Empty);
        assert_eq!(plain.ext_blob_id(), None);
    }

    #[test]
    fn write_record_preserves_key() {
        let mut buf = vec![0u8; PS];
        let mut node = NodeViewMut::new(&mut buf, KS);
        node.init(0);
        node.insert_entry(0, &entry(b"kk", RecordRef::Empty));
        node.write_record(0, &RecordRef::DupTable(99));

        let view = NodeView::new(&buf, KS);
        assert_eq!(view.record(0), RecordRef::DupTable(99));
        assert_eq!(&view.key_slot(0)[..2], b"kk");
    }
}
