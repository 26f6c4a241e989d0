//! B+tree operations: find, insert, erase, ordered traversal.
//!
//! Nodes are split preemptively on the way down, so a parent always has
//! room for the separator of a splitting child. Leaves are chained
//! through sibling links for cursor traversal; erase leaves an empty
//! leaf in the chain rather than rebalancing, and traversal skips it.
//!
//! The tree consumes the pager through fetch/alloc/flush/free only and
//! never holds a page borrow across a pager call.

use std::cmp::Ordering;

use burrow_error::{BurrowError, Result};
use burrow_pager::{PageHandle, Pager, TxnPageSet};
use burrow_types::flags::{InsertFlags, PageIoFlags};
use burrow_types::{codec, DatabaseName, PageAddress, PageType, ADDRESS_SIZE};
use tracing::{debug, trace};

use crate::blob::BlobStore;
use crate::compare::{materialize, Comparator, KeyRef};
use crate::extkey::ExtKeyCache;
use crate::node::{node_capacity, Entry, NodeView, NodeViewMut, RecordRef, KEY_IS_EXTENDED};

/// Everything key-aware tree code needs besides the tree itself.
pub struct KeyEnv<'a> {
    pub pager: &'a mut Pager,
    pub blobs: &'a mut BlobStore,
    pub extkeys: &'a mut Option<ExtKeyCache>,
    pub comparator: &'a Comparator,
}

/// A coupled position: a leaf page and a slot inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtreePos {
    pub page: PageAddress,
    pub slot: usize,
}

/// One per-database B+tree.
#[derive(Debug, Clone)]
pub struct Btree {
    root: PageAddress,
    db: DatabaseName,
    key_size: usize,
    dup_enabled: bool,
}

/// Copied-out node header fields, so no borrow outlives the copy.
struct NodeMeta {
    is_leaf: bool,
    count: usize,
    left: PageAddress,
    right: PageAddress,
    down: PageAddress,
}

impl Btree {
    /// Create a new tree with an empty leaf root.
    pub fn create(
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        db: DatabaseName,
        key_size: usize,
        dup_enabled: bool,
    ) -> Result<Self> {
        let page = env.pager.alloc_page(
            PageType::BtreeRoot,
            txn.as_deref_mut(),
            PageIoFlags::default(),
        )?;
        let root = {
            let mut p = page.borrow_mut();
            p.set_owner(db);
            let ks = key_size;
            NodeViewMut::new(p.data_mut(), ks).init(0);
            p.set_dirty(true);
            p.set_in_use(false);
            p.address()
        };
        env.pager.flush_page(&page, PageIoFlags::default())?;
        debug!(db, root, "created btree");
        Ok(Self {
            root,
            db,
            key_size,
            dup_enabled,
        })
    }

    /// Reattach to a tree whose root is recorded in the directory.
    #[must_use]
    pub fn open(root: PageAddress, db: DatabaseName, key_size: usize, dup_enabled: bool) -> Self {
        Self {
            root,
            db,
            key_size,
            dup_enabled,
        }
    }

    /// The current root page address.
    #[must_use]
    pub fn root(&self) -> PageAddress {
        self.root
    }

    /// The fixed key slot size.
    #[must_use]
    pub fn key_size(&self) -> usize {
        self.key_size
    }

    // --- Lookup ---

    /// Exact lookup.
    pub fn find(
        &self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        key: &[u8],
    ) -> Result<Option<BtreePos>> {
        let leaf = self.descend(env, txn.as_deref_mut(), key)?;
        let page = self.fetch(env, txn.as_deref_mut(), leaf)?;
        let (slot, exact) = self.search_node(env, txn, &page, KeyRef::plain(key))?;
        Ok(exact.then_some(BtreePos { page: leaf, slot }))
    }

    /// Position of the first entry that compares greater-or-equal to
    /// `key`, and whether it is an exact match.
    pub fn locate_ge(
        &self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        key: &[u8],
    ) -> Result<(Option<BtreePos>, bool)> {
        let leaf = self.descend(env, txn.as_deref_mut(), key)?;
        let page = self.fetch(env, txn.as_deref_mut(), leaf)?;
        let (slot, exact) = self.search_node(env, txn.as_deref_mut(), &page, KeyRef::plain(key))?;
        let count = self.meta(&page).count;
        if slot < count {
            return Ok((Some(BtreePos { page: leaf, slot }), exact));
        }
        // Past the last entry of this leaf; the successor lives to the right.
        Ok((self.skip_right(env, txn, self.meta(&page).right)?, false))
    }

    // --- Traversal ---

    /// First entry in key order.
    pub fn first(
        &self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
    ) -> Result<Option<BtreePos>> {
        let mut addr = self.root;
        loop {
            let page = self.fetch(env, txn.as_deref_mut(), addr)?;
            let meta = self.meta(&page);
            if meta.is_leaf {
                if meta.count > 0 {
                    return Ok(Some(BtreePos { page: addr, slot: 0 }));
                }
                return self.skip_right(env, txn, meta.right);
            }
            addr = meta.down;
        }
    }

    /// Last entry in key order.
    pub fn last(
        &self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
    ) -> Result<Option<BtreePos>> {
        let mut addr = self.root;
        loop {
            let page = self.fetch(env, txn.as_deref_mut(), addr)?;
            let meta = self.meta(&page);
            if meta.is_leaf {
                if meta.count > 0 {
                    return Ok(Some(BtreePos {
                        page: addr,
                        slot: meta.count - 1,
                    }));
                }
                return self.skip_left(env, txn, meta.left);
            }
            addr = if meta.count > 0 {
                let p = page.borrow();
                NodeView::new(p.data(), self.key_size).child(meta.count - 1)
            } else {
                meta.down
            };
        }
    }

    /// Successor of `pos`, or `None` at the end of the key space.
    pub fn next(
        &self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        pos: BtreePos,
    ) -> Result<Option<BtreePos>> {
        let page = self.fetch(env, txn.as_deref_mut(), pos.page)?;
        let meta = self.meta(&page);
        if pos.slot + 1 < meta.count {
            return Ok(Some(BtreePos {
                page: pos.page,
                slot: pos.slot + 1,
            }));
        }
        self.skip_right(env, txn, meta.right)
    }

    /// Predecessor of `pos`, or `None` at the start of the key space.
    pub fn previous(
        &self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        pos: BtreePos,
    ) -> Result<Option<BtreePos>> {
        if pos.slot > 0 {
            return Ok(Some(BtreePos {
                page: pos.page,
                slot: pos.slot - 1,
            }));
        }
        let page = self.fetch(env, txn.as_deref_mut(), pos.page)?;
        self.skip_left(env, txn, self.meta(&page).left)
    }

    // --- Entry access ---

    /// The full key at `pos`, with extended keys reassembled.
    pub fn key_of(
        &self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        pos: BtreePos,
    ) -> Result<Vec<u8>> {
        let page = self.fetch(env, txn.as_deref_mut(), pos.page)?;
        let entry = {
            let p = page.borrow();
            NodeView::new(p.data(), self.key_size).entry(pos.slot)
        };
        if entry.key_flags & KEY_IS_EXTENDED != 0 {
            let key_ref = KeyRef {
                slot: &entry.key_slot,
                full_len: entry.key_len as usize,
                extended: true,
            };
            materialize(
                &key_ref,
                self.key_size,
                env.pager,
                env.blobs,
                env.extkeys,
                txn,
            )
        } else {
            Ok(entry.key_slot[..entry.key_len as usize].to_vec())
        }
    }

    /// The record references at `pos`: the duplicate table if one exists,
    /// otherwise the entry's single reference.
    pub fn dup_refs(
        &self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        pos: BtreePos,
    ) -> Result<Vec<RecordRef>> {
        let page = self.fetch(env, txn.as_deref_mut(), pos.page)?;
        let record = {
            let p = page.borrow();
            NodeView::new(p.data(), self.key_size).record(pos.slot)
        };
        match record {
            RecordRef::DupTable(id) => read_dup_table(env, txn, id),
            other => Ok(vec![other]),
        }
    }

    /// Number of duplicates at `pos` (1 for a unique key).
    pub fn dup_count(
        &self,
        env: &mut KeyEnv<'_>,
        txn: Option<&mut TxnPageSet>,
        pos: BtreePos,
    ) -> Result<usize> {
        Ok(self.dup_refs(env, txn, pos)?.len())
    }

    /// The record bytes of duplicate `dup_index` (0-based) at `pos`.
    pub fn record_of(
        &self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        pos: BtreePos,
        dup_index: usize,
    ) -> Result<Vec<u8>> {
        let refs = self.dup_refs(env, txn.as_deref_mut(), pos)?;
        let record = refs.get(dup_index).ok_or(BurrowError::KeyNotFound)?;
        record_bytes(env, txn, record)
    }

    // --- Insert ---

    /// Insert a key/record pair.
    ///
    /// `OVERWRITE` replaces the record of an existing key; `DUPLICATE`
    /// appends another record to it. Without either flag an existing key
    /// fails with `DuplicateKey`.
    pub fn insert(
        &mut self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<BtreePos> {
        let cap = self.capacity(env);

        // Grow the tree when the root itself is full, then split full
        // children on the way down; a parent therefore always has room.
        {
            let page = self.fetch(env, txn.as_deref_mut(), self.root)?;
            if self.meta(&page).count >= cap {
                self.grow_root(env, txn.as_deref_mut())?;
            }
        }

        let mut addr = self.root;
        loop {
            let page = self.fetch(env, txn.as_deref_mut(), addr)?;
            let meta = self.meta(&page);
            if meta.is_leaf {
                return self.insert_into_leaf(env, txn, addr, key, record, flags);
            }

            let (idx, exact) =
                self.search_node(env, txn.as_deref_mut(), &page, KeyRef::plain(key))?;
            let child = self.child_for(&page, idx, exact);
            let child_page = self.fetch(env, txn.as_deref_mut(), child)?;
            if self.meta(&child_page).count >= cap {
                drop(child_page);
                self.split_child(env, txn.as_deref_mut(), addr, child)?;
                // One separator was added; re-route through this node.
                continue;
            }
            addr = child;
        }
    }

    /// Replace the record of duplicate `dup_index` at `pos` in place.
    pub fn overwrite(
        &mut self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        pos: BtreePos,
        dup_index: usize,
        record: &[u8],
    ) -> Result<()> {
        let page = self.fetch(env, txn.as_deref_mut(), pos.page)?;
        let current = {
            let p = page.borrow();
            NodeView::new(p.data(), self.key_size).record(pos.slot)
        };
        match current {
            RecordRef::DupTable(id) => {
                let mut refs = read_dup_table(env, txn.as_deref_mut(), id)?;
                let slot = refs.get_mut(dup_index).ok_or(BurrowError::KeyNotFound)?;
                free_record(env, txn.as_deref_mut(), slot)?;
                *slot = make_record_ref(env, txn.as_deref_mut(), record)?;
                let new_id =
                    env.blobs
                        .overwrite(env.pager, txn.as_deref_mut(), id, &write_dup_table(&refs))?;
                self.write_record_at(env, txn, &page, pos.slot, &RecordRef::DupTable(new_id))
            }
            other => {
                if dup_index != 0 {
                    return Err(BurrowError::KeyNotFound);
                }
                free_record(env, txn.as_deref_mut(), &other)?;
                let fresh = make_record_ref(env, txn.as_deref_mut(), record)?;
                self.write_record_at(env, txn, &page, pos.slot, &fresh)
            }
        }
    }

    // --- Erase ---

    /// Erase a key and all of its duplicates.
    pub fn erase(
        &mut self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        key: &[u8],
    ) -> Result<()> {
        let leaf = self.descend(env, txn.as_deref_mut(), key)?;
        let page = self.fetch(env, txn.as_deref_mut(), leaf)?;
        let (slot, exact) =
            self.search_node(env, txn.as_deref_mut(), &page, KeyRef::plain(key))?;
        if !exact {
            return Err(BurrowError::KeyNotFound);
        }
        self.free_entry_payload(env, txn.as_deref_mut(), &page, slot)?;
        {
            let mut p = page.borrow_mut();
            let ks = self.key_size;
            NodeViewMut::new(p.data_mut(), ks).remove_entry(slot);
            p.set_dirty(true);
        }
        env.pager.flush_page(&page, PageIoFlags::default())?;
        trace!(db = self.db, "erased key");
        Ok(())
    }

    /// Erase one duplicate (0-based index) of a key.
    pub fn erase_duplicate(
        &mut self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        key: &[u8],
        dup_index: usize,
    ) -> Result<()> {
        let Some(pos) = self.find(env, txn.as_deref_mut(), key)? else {
            return Err(BurrowError::KeyNotFound);
        };
        let page = self.fetch(env, txn.as_deref_mut(), pos.page)?;
        let current = {
            let p = page.borrow();
            NodeView::new(p.data(), self.key_size).record(pos.slot)
        };
        match current {
            RecordRef::DupTable(id) => {
                let mut refs = read_dup_table(env, txn.as_deref_mut(), id)?;
                if dup_index >= refs.len() {
                    return Err(BurrowError::KeyNotFound);
                }
                let removed = refs.remove(dup_index);
                free_record(env, txn.as_deref_mut(), &removed)?;
                if refs.len() == 1 {
                    env.blobs.free(env.pager, txn.as_deref_mut(), id)?;
                    let last = refs.remove(0);
                    self.write_record_at(env, txn, &page, pos.slot, &last)
                } else {
                    let new_id = env.blobs.overwrite(
                        env.pager,
                        txn.as_deref_mut(),
                        id,
                        &write_dup_table(&refs),
                    )?;
                    self.write_record_at(env, txn, &page, pos.slot, &RecordRef::DupTable(new_id))
                }
            }
            _ if dup_index == 0 => {
                drop(page);
                self.erase(env, txn, key)
            }
            _ => Err(BurrowError::KeyNotFound),
        }
    }

    /// Free every page and blob of this tree (database removal).
    pub fn free_all(&mut self, env: &mut KeyEnv<'_>, mut txn: Option<&mut TxnPageSet>) -> Result<()> {
        self.free_subtree(env, txn.as_deref_mut(), self.root)?;
        self.root = 0;
        Ok(())
    }

    // --- Internals ---

    fn capacity(&self, env: &KeyEnv<'_>) -> usize {
        node_capacity(env.pager.page_size().as_usize(), self.key_size)
    }

    fn fetch(
        &self,
        env: &mut KeyEnv<'_>,
        txn: Option<&mut TxnPageSet>,
        addr: PageAddress,
    ) -> Result<PageHandle> {
        env.pager
            .fetch_page(txn, addr, PageIoFlags::default())?
            .ok_or_else(|| BurrowError::internal(format!("btree page {addr:#x} unavailable")))
    }

    fn meta(&self, page: &PageHandle) -> NodeMeta {
        let p = page.borrow();
        let node = NodeView::new(p.data(), self.key_size);
        NodeMeta {
            is_leaf: node.is_leaf(),
            count: node.count(),
            left: node.left(),
            right: node.right(),
            down: node.down(),
        }
    }

    /// Walk right through the leaf chain to the first non-empty leaf.
    fn skip_right(
        &self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        mut addr: PageAddress,
    ) -> Result<Option<BtreePos>> {
        while addr != 0 {
            let page = self.fetch(env, txn.as_deref_mut(), addr)?;
            let meta = self.meta(&page);
            if meta.count > 0 {
                return Ok(Some(BtreePos { page: addr, slot: 0 }));
            }
            addr = meta.right;
        }
        Ok(None)
    }

    /// Walk left through the leaf chain to the first non-empty leaf.
    fn skip_left(
        &self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        mut addr: PageAddress,
    ) -> Result<Option<BtreePos>> {
        while addr != 0 {
            let page = self.fetch(env, txn.as_deref_mut(), addr)?;
            let meta = self.meta(&page);
            if meta.count > 0 {
                return Ok(Some(BtreePos {
                    page: addr,
                    slot: meta.count - 1,
                }));
            }
            addr = meta.left;
        }
        Ok(None)
    }

    /// Descend to the leaf that covers `key`.
    fn descend(
        &self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        key: &[u8],
    ) -> Result<PageAddress> {
        let mut addr = self.root;
        loop {
            let page = self.fetch(env, txn.as_deref_mut(), addr)?;
            if self.meta(&page).is_leaf {
                return Ok(addr);
            }
            let (idx, exact) =
                self.search_node(env, txn.as_deref_mut(), &page, KeyRef::plain(key))?;
            addr = self.child_for(&page, idx, exact);
        }
    }

    /// Child to descend into, given the search result in an inner node.
    fn child_for(&self, page: &PageHandle, idx: usize, exact: bool) -> PageAddress {
        let p = page.borrow();
        let node = NodeView::new(p.data(), self.key_size);
        if exact {
            node.child(idx)
        } else if idx == 0 {
            node.down()
        } else {
            node.child(idx - 1)
        }
    }

    /// Binary search inside a node: index of the first entry that is
    /// greater-or-equal to `key`, plus an exact-match flag.
    fn search_node(
        &self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        page: &PageHandle,
        key: KeyRef<'_>,
    ) -> Result<(usize, bool)> {
        let count = self.meta(page).count;
        let mut lo = 0;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.compare_key_with_entry(env, txn.as_deref_mut(), page, mid, key)? {
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
                Ordering::Equal => return Ok((mid, true)),
            }
        }
        Ok((lo, false))
    }

    /// Compare `key` against entry `index`. The entry's slot is copied
    /// out so that no page borrow is held across the comparison.
    fn compare_key_with_entry(
        &self,
        env: &mut KeyEnv<'_>,
        txn: Option<&mut TxnPageSet>,
        page: &PageHandle,
        index: usize,
        key: KeyRef<'_>,
    ) -> Result<Ordering> {
        let (slot, key_flags, key_len) = {
            let p = page.borrow();
            let node = NodeView::new(p.data(), self.key_size);
            let (kf, kl) = node.key_meta(index);
            (node.key_slot(index).to_vec(), kf, kl)
        };
        let entry_ref = entry_key_ref(&slot, key_flags, key_len);
        env.comparator.compare_keys(
            self.key_size,
            env.pager,
            env.blobs,
            env.extkeys,
            txn,
            key,
            entry_ref,
        )
    }

    /// Put a new root above the current (full) one.
    fn grow_root(&mut self, env: &mut KeyEnv<'_>, mut txn: Option<&mut TxnPageSet>) -> Result<()> {
        let old_root = self.root;
        let old_page = self.fetch(env, txn.as_deref_mut(), old_root)?;
        let old_level = {
            let p = old_page.borrow();
            NodeView::new(p.data(), self.key_size).level()
        };

        let page = env.pager.alloc_page(
            PageType::BtreeRoot,
            txn.as_deref_mut(),
            PageIoFlags::default(),
        )?;
        let new_root = {
            let mut p = page.borrow_mut();
            p.set_owner(self.db);
            let ks = self.key_size;
            let mut node = NodeViewMut::new(p.data_mut(), ks);
            node.init(old_level + 1);
            node.set_down(old_root);
            p.set_dirty(true);
            p.set_in_use(false);
            p.address()
        };
        env.pager.flush_page(&page, PageIoFlags::default())?;

        {
            let mut p = old_page.borrow_mut();
            p.set_page_type(PageType::BtreeIndex);
            p.data_mut()[0] = PageType::BtreeIndex as u8;
            p.set_dirty(true);
        }
        env.pager.flush_page(&old_page, PageIoFlags::default())?;

        self.root = new_root;
        debug!(db = self.db, new_root, "grew btree root");
        Ok(())
    }

    /// Split a full child and insert the separator into `parent`, which
    /// is guaranteed to have room.
    fn split_child(
        &mut self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        parent: PageAddress,
        child: PageAddress,
    ) -> Result<()> {
        let child_page = self.fetch(env, txn.as_deref_mut(), child)?;
        let (is_leaf, level, count, child_right) = {
            let p = child_page.borrow();
            let node = NodeView::new(p.data(), self.key_size);
            (node.is_leaf(), node.level(), node.count(), node.right())
        };
        let mid = count / 2;

        let right_page = env.pager.alloc_page(
            PageType::BtreeIndex,
            txn.as_deref_mut(),
            PageIoFlags::default(),
        )?;
        let right_addr = {
            let mut p = right_page.borrow_mut();
            p.set_owner(self.db);
            p.set_in_use(false);
            p.address()
        };

        let mut separator: Entry;
        if is_leaf {
            // Move the upper half; the separator is a copy of the first
            // moved key (with its own suffix blob, so ownership stays
            // one-entry-one-blob).
            let moved: Vec<Entry> = {
                let p = child_page.borrow();
                let node = NodeView::new(p.data(), self.key_size);
                (mid..count).map(|i| node.entry(i)).collect()
            };
            {
                let mut p = right_page.borrow_mut();
                let ks = self.key_size;
                let mut node = NodeViewMut::new(p.data_mut(), ks);
                node.init(0);
                for (i, e) in moved.iter().enumerate() {
                    node.insert_entry(i, e);
                }
                node.set_left(child);
                node.set_right(child_right);
                p.set_dirty(true);
            }
            {
                let mut p = child_page.borrow_mut();
                let ks = self.key_size;
                let mut node = NodeViewMut::new(p.data_mut(), ks);
                node.set_count(mid);
                node.set_right(right_addr);
                p.set_dirty(true);
            }
            if child_right != 0 {
                let old_right = self.fetch(env, txn.as_deref_mut(), child_right)?;
                {
                    let mut p = old_right.borrow_mut();
                    let ks = self.key_size;
                    NodeViewMut::new(p.data_mut(), ks).set_left(right_addr);
                    p.set_dirty(true);
                }
                env.pager.flush_page(&old_right, PageIoFlags::default())?;
            }

            separator = moved[0].clone();
            separator.record = RecordRef::Blob(right_addr);
            if separator.key_flags & KEY_IS_EXTENDED != 0 {
                // The separator gets its own copy of the suffix blob.
                let old_id = separator.ext_blob_id().expect("extended key has a blob id");
                let suffix = env.blobs.read(env.pager, txn.as_deref_mut(), old_id)?;
                let new_id = env.blobs.allocate(env.pager, txn.as_deref_mut(), &suffix)?;
                let tail = self.key_size - ADDRESS_SIZE;
                codec::put_u64(&mut separator.key_slot, tail, new_id);
            }
        } else {
            // The median moves up; its child becomes the right node's
            // leftmost child.
            let (median, median_child, moved): (Entry, PageAddress, Vec<Entry>) = {
                let p = child_page.borrow();
                let node = NodeView::new(p.data(), self.key_size);
                (
                    node.entry(mid),
                    node.child(mid),
                    (mid + 1..count).map(|i| node.entry(i)).collect(),
                )
            };
            {
                let mut p = right_page.borrow_mut();
                let ks = self.key_size;
                let mut node = NodeViewMut::new(p.data_mut(), ks);
                node.init(level);
                node.set_down(median_child);
                for (i, e) in moved.iter().enumerate() {
                    node.insert_entry(i, e);
                }
                p.set_dirty(true);
            }
            {
                let mut p = child_page.borrow_mut();
                let ks = self.key_size;
                NodeViewMut::new(p.data_mut(), ks).set_count(mid);
                p.set_dirty(true);
            }
            separator = median;
            separator.record = RecordRef::Blob(right_addr);
        }

        env.pager.flush_page(&right_page, PageIoFlags::default())?;
        env.pager.flush_page(&child_page, PageIoFlags::default())?;

        // Insert the separator into the parent.
        let parent_page = self.fetch(env, txn.as_deref_mut(), parent)?;
        let sep_ref = entry_key_ref(&separator.key_slot, separator.key_flags, separator.key_len);
        let (idx, exact) = self.search_node(env, txn.as_deref_mut(), &parent_page, sep_ref)?;
        debug_assert!(!exact, "separator already present in parent");
        {
            let mut p = parent_page.borrow_mut();
            let ks = self.key_size;
            let mut node = NodeViewMut::new(p.data_mut(), ks);
            node.insert_entry(idx, &separator);
            node.write_child(idx, right_addr);
            p.set_dirty(true);
        }
        env.pager.flush_page(&parent_page, PageIoFlags::default())?;
        trace!(db = self.db, child, right_addr, "split node");
        Ok(())
    }

    fn insert_into_leaf(
        &mut self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        leaf: PageAddress,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<BtreePos> {
        let page = self.fetch(env, txn.as_deref_mut(), leaf)?;
        let (idx, exact) =
            self.search_node(env, txn.as_deref_mut(), &page, KeyRef::plain(key))?;

        if exact {
            if flags.contains(InsertFlags::DUPLICATE) && self.dup_enabled {
                self.append_duplicate(env, txn, &page, idx, record)?;
            } else if flags.contains(InsertFlags::OVERWRITE) {
                self.overwrite(env, txn, BtreePos { page: leaf, slot: idx }, 0, record)?;
            } else {
                return Err(BurrowError::DuplicateKey);
            }
            return Ok(BtreePos { page: leaf, slot: idx });
        }

        let record_ref = make_record_ref(env, txn.as_deref_mut(), record)?;
        let entry = self.make_entry(env, txn.as_deref_mut(), key, record_ref)?;
        {
            let mut p = page.borrow_mut();
            let ks = self.key_size;
            NodeViewMut::new(p.data_mut(), ks).insert_entry(idx, &entry);
            p.set_dirty(true);
        }
        env.pager.flush_page(&page, PageIoFlags::default())?;
        Ok(BtreePos { page: leaf, slot: idx })
    }

    /// Build a leaf entry for `key`, spilling long keys into a blob.
    fn make_entry(
        &self,
        env: &mut KeyEnv<'_>,
        txn: Option<&mut TxnPageSet>,
        key: &[u8],
        record: RecordRef,
    ) -> Result<Entry> {
        let mut key_slot = vec![0u8; self.key_size];
        let (key_flags, key_len) = if key.len() <= self.key_size {
            key_slot[..key.len()].copy_from_slice(key);
            (0u8, key.len() as u16)
        } else {
            let prefix_len = self.key_size - ADDRESS_SIZE;
            let blob_id = env.blobs.allocate(env.pager, txn, &key[prefix_len..])?;
            key_slot[..prefix_len].copy_from_slice(&key[..prefix_len]);
            codec::put_u64(&mut key_slot, prefix_len, blob_id);
            (KEY_IS_EXTENDED, key.len() as u16)
        };
        Ok(Entry {
            record,
            key_flags,
            key_len,
            key_slot,
        })
    }

    /// Append a duplicate record to the entry at `slot`.
    fn append_duplicate(
        &mut self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        page: &PageHandle,
        slot: usize,
        record: &[u8],
    ) -> Result<()> {
        let current = {
            let p = page.borrow();
            NodeView::new(p.data(), self.key_size).record(slot)
        };
        let fresh = make_record_ref(env, txn.as_deref_mut(), record)?;
        let table_ref = match current {
            RecordRef::DupTable(id) => {
                let mut refs = read_dup_table(env, txn.as_deref_mut(), id)?;
                refs.push(fresh);
                let new_id =
                    env.blobs
                        .overwrite(env.pager, txn.as_deref_mut(), id, &write_dup_table(&refs))?;
                RecordRef::DupTable(new_id)
            }
            first => {
                let refs = vec![first, fresh];
                let id = env
                    .blobs
                    .allocate(env.pager, txn.as_deref_mut(), &write_dup_table(&refs))?;
                RecordRef::DupTable(id)
            }
        };
        self.write_record_at(env, txn, page, slot, &table_ref)
    }

    fn write_record_at(
        &self,
        env: &mut KeyEnv<'_>,
        _txn: Option<&mut TxnPageSet>,
        page: &PageHandle,
        slot: usize,
        record: &RecordRef,
    ) -> Result<()> {
        {
            let mut p = page.borrow_mut();
            let ks = self.key_size;
            NodeViewMut::new(p.data_mut(), ks).write_record(slot, record);
            p.set_dirty(true);
        }
        env.pager.flush_page(page, PageIoFlags::default())
    }

    /// Free the blobs owned by the entry at `slot`: the extended-key
    /// suffix (purging its cache entry) and the record or duplicate
    /// table.
    fn free_entry_payload(
        &self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        page: &PageHandle,
        slot: usize,
    ) -> Result<()> {
        let entry = {
            let p = page.borrow();
            NodeView::new(p.data(), self.key_size).entry(slot)
        };
        if let Some(blob_id) = entry.ext_blob_id() {
            if let Some(cache) = env.extkeys.as_mut() {
                let _ = cache.remove(blob_id);
            }
            env.blobs.free(env.pager, txn.as_deref_mut(), blob_id)?;
        }
        match entry.record {
            RecordRef::DupTable(id) => {
                let refs = read_dup_table(env, txn.as_deref_mut(), id)?;
                for r in &refs {
                    free_record(env, txn.as_deref_mut(), r)?;
                }
                env.blobs.free(env.pager, txn, id)?;
            }
            other => free_record(env, txn, &other)?,
        }
        Ok(())
    }

    fn free_subtree(
        &mut self,
        env: &mut KeyEnv<'_>,
        mut txn: Option<&mut TxnPageSet>,
        addr: PageAddress,
    ) -> Result<()> {
        let page = self.fetch(env, txn.as_deref_mut(), addr)?;
        let meta = self.meta(&page);
        if meta.is_leaf {
            for slot in 0..meta.count {
                self.free_entry_payload(env, txn.as_deref_mut(), &page, slot)?;
            }
        } else {
            self.free_subtree(env, txn.as_deref_mut(), meta.down)?;
            for i in 0..meta.count {
                let (child, ext_blob) = {
                    let p = page.borrow();
                    let node = NodeView::new(p.data(), self.key_size);
                    (node.child(i), node.entry(i).ext_blob_id())
                };
                self.free_subtree(env, txn.as_deref_mut(), child)?;
                if let Some(blob_id) = ext_blob {
                    if let Some(cache) = env.extkeys.as_mut() {
                        let _ = cache.remove(blob_id);
                    }
                    env.blobs.free(env.pager, txn.as_deref_mut(), blob_id)?;
                }
            }
        }
        env.pager.free_page(&page, PageIoFlags::default())?;
        Ok(())
    }
}

/// Build a `KeyRef` for an entry's stored key image.
fn entry_key_ref(slot: &[u8], key_flags: u8, key_len: u16) -> KeyRef<'_> {
    if key_flags & KEY_IS_EXTENDED != 0 {
        KeyRef {
            slot,
            full_len: key_len as usize,
            extended: true,
        }
    } else {
        KeyRef {
            slot: &slot[..key_len as usize],
            full_len: key_len as usize,
            extended: false,
        }
    }
}

/// Turn record bytes into a reference, spilling large records to a blob.
fn make_record_ref(
    env: &mut KeyEnv<'_>,
    txn: Option<&mut TxnPageSet>,
    record: &[u8],
) -> Result<RecordRef> {
    if record.is_empty() {
        Ok(RecordRef::Empty)
    } else if record.len() <= RecordRef::INLINE_MAX {
        Ok(RecordRef::Inline(record.to_vec()))
    } else {
        Ok(RecordRef::Blob(env.blobs.allocate(env.pager, txn, record)?))
    }
}

/// Resolve a record reference to its bytes.
fn record_bytes(
    env: &mut KeyEnv<'_>,
    txn: Option<&mut TxnPageSet>,
    record: &RecordRef,
) -> Result<Vec<u8>> {
    match record {
        RecordRef::Empty => Ok(Vec::new()),
        RecordRef::Inline(bytes) => Ok(bytes.clone()),
        RecordRef::Blob(id) => env.blobs.read(env.pager, txn, *id),
        RecordRef::DupTable(_) => Err(BurrowError::internal("nested duplicate table")),
    }
}

/// Release blob storage behind a single record reference.
fn free_record(
    env: &mut KeyEnv<'_>,
    txn: Option<&mut TxnPageSet>,
    record: &RecordRef,
) -> Result<()> {
    if let RecordRef::Blob(id) = record {
        env.blobs.free(env.pager, txn, *id)?;
    }
    Ok(())
}

/// Duplicate table wire format: count, then 16 bytes per reference.
fn write_dup_table(refs: &[RecordRef]) -> Vec<u8> {
    let mut out = vec![0u8; 4 + refs.len() * 16];
    codec::put_u32(&mut out, 0, refs.len() as u32);
    for (i, r) in refs.iter().enumerate() {
        let off = 4 + i * 16;
        let (field, flags, len) = r.encode();
        out[off] = flags;
        out[off + 1] = len;
        out[off + 8..off + 16].copy_from_slice(&field);
    }
    out
}

fn read_dup_table(
    env: &mut KeyEnv<'_>,
    txn: Option<&mut TxnPageSet>,
    table_id: u64,
) -> Result<Vec<RecordRef>> {
    let bytes = env.blobs.read(env.pager, txn, table_id)?;
    if bytes.len() < 4 {
        return Err(BurrowError::internal("duplicate table truncated"));
    }
    let count = codec::get_u32(&bytes, 0) as usize;
    if bytes.len() < 4 + count * 16 {
        return Err(BurrowError::internal("duplicate table truncated"));
    }
    let mut refs = Vec::with_capacity(count);
    for i in 0..count {
        let off = 4 + i * 16;
        let field: [u8; 8] = bytes[off + 8..off + 16].try_into().expect("field is 8 bytes");
        refs.push(RecordRef::decode(field, bytes[off], bytes[off + 1]));
    }
    Ok(refs)
}
