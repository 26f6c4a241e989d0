//! The dual-mode cursor: a traversal handle over the B+tree and the
//! transaction op chains.
//!
//! A cursor is NIL, coupled to a B+tree position, or coupled to a txn op
//! chain; both inner sides keep their own position so the merge logic
//! can consolidate committed and in-flight state. A per-key duplicate
//! cache holds the merged duplicate lines of the current key;
//! `dupecache_index` is 1-based and 0 means "not in duplicate mode".
//!
//! Movement is a two-way merge: each direction picks the winning side by
//! comparing the two candidate keys, skipping keys whose merged
//! duplicate set is empty (fully erased in the transaction).

use std::cmp::Ordering;

use burrow_btree::{BtreePos, KeyEnv};
use burrow_error::{BurrowError, Result};
use burrow_pager::PageHandle;
use burrow_types::flags::{CursorMoveFlags, InsertFlags, PageIoFlags};
use burrow_types::DatabaseName;
use tracing::trace;

use crate::db::DbState;
use crate::env::{CursorId, Environment};
use crate::txn::{TxnId, TxnOpKind, TxnState};

/// Which inner cursor(s) a nil-check or detach applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sides {
    Btree,
    Txn,
    Both,
}

/// The B+tree side of a cursor.
#[derive(Debug, Clone)]
pub(crate) enum BtreeSide {
    Nil,
    /// Positioned on a leaf entry; the handle pins the page.
    Coupled { pos: BtreePos, page: PageHandle },
    /// Detached onto a key copy after a structural change; re-located on
    /// the next use.
    Uncoupled { key: Vec<u8> },
}

/// The transaction side of a cursor.
#[derive(Debug, Clone)]
pub(crate) enum TxnSide {
    Nil,
    /// Positioned on the op chain of `key`.
    Coupled { key: Vec<u8> },
}

/// Which side owns the public position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Coupling {
    Nil,
    Btree,
    Txn,
}

/// One line of the duplicate cache: a committed duplicate (by its index
/// in the btree duplicate table) or an in-flight op (by sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DupeLine {
    Btree(usize),
    TxnOp(u64),
}

/// The previous cursor operation; steers NEXT/PREVIOUS continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LastOp {
    None,
    Find,
    Insert,
    Next,
    Previous,
}

/// `last_cmp` value meaning "compare again before trusting this".
pub(crate) const CMP_NEEDS_REFRESH: i32 = 2;

#[derive(Debug, Clone)]
pub(crate) struct CursorState {
    pub db: DatabaseName,
    pub txn: Option<TxnId>,
    pub btree: BtreeSide,
    pub txn_side: TxnSide,
    pub coupling: Coupling,
    pub dupecache: Vec<DupeLine>,
    /// 1-based index into `dupecache`; 0 = not in duplicate mode.
    pub dupecache_index: u32,
    pub last_op: LastOp,
    /// Result of the last btree-vs-txn key compare; any value outside
    /// {-1, 0, +1} means it needs a refresh.
    pub last_cmp: i32,
}

impl CursorState {
    fn new(db: DatabaseName, txn: Option<TxnId>) -> Self {
        Self {
            db,
            txn,
            btree: BtreeSide::Nil,
            txn_side: TxnSide::Nil,
            coupling: Coupling::Nil,
            dupecache: Vec::new(),
            dupecache_index: 0,
            last_op: LastOp::None,
            last_cmp: CMP_NEEDS_REFRESH,
        }
    }

    /// Whether the given side(s) are detached.
    pub(crate) fn is_nil(&self, what: Sides) -> bool {
        let btree_nil = matches!(self.btree, BtreeSide::Nil);
        let txn_nil = matches!(self.txn_side, TxnSide::Nil);
        match what {
            Sides::Btree => btree_nil,
            Sides::Txn => txn_nil,
            Sides::Both => btree_nil && txn_nil,
        }
    }

    /// Detach the given side(s); detaching both clears the public
    /// coupling and the duplicate cache.
    pub(crate) fn set_to_nil(&mut self, what: Sides) {
        if matches!(what, Sides::Btree | Sides::Both) {
            self.btree = BtreeSide::Nil;
        }
        if matches!(what, Sides::Txn | Sides::Both) {
            self.txn_side = TxnSide::Nil;
        }
        if self.is_nil(Sides::Both) {
            self.coupling = Coupling::Nil;
            self.dupecache.clear();
            self.dupecache_index = 0;
            self.last_cmp = CMP_NEEDS_REFRESH;
        }
    }
}

/// A forward or backward step through the merged key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

impl Environment {
    // --- Cursor lifecycle ---

    /// Create a cursor over `db`, optionally bound to a transaction.
    pub fn cursor_create(&mut self, db: DatabaseName, txn: Option<TxnId>) -> Result<CursorId> {
        if !self.dbs.contains_key(&db) {
            return Err(BurrowError::DatabaseNotFound { name: db });
        }
        if let Some(tid) = txn {
            if !self.txns.contains_key(&tid) {
                return Err(BurrowError::inv_parameter("unknown transaction"));
            }
        }
        let id = self.next_cursor_id;
        self.next_cursor_id += 1;
        self.cursors.insert(id, CursorState::new(db, txn));
        trace!(cursor = id, db, "created cursor");
        Ok(id)
    }

    /// Clone a cursor: duplicate cache and both inner positions.
    pub fn cursor_clone(&mut self, cursor: CursorId) -> Result<CursorId> {
        let state = self
            .cursors
            .get(&cursor)
            .ok_or_else(|| BurrowError::inv_parameter("unknown cursor"))?
            .clone();
        let id = self.next_cursor_id;
        self.next_cursor_id += 1;
        self.cursors.insert(id, state);
        Ok(id)
    }

    /// Close a cursor, releasing its pins.
    pub fn cursor_close(&mut self, cursor: CursorId) -> Result<()> {
        self.cursors
            .remove(&cursor)
            .map(|_| ())
            .ok_or_else(|| BurrowError::inv_parameter("unknown cursor"))
    }

    // --- Cursor operations ---

    /// Position the cursor on `key` and return its (first) record.
    pub fn cursor_find(&mut self, cursor: CursorId, key: &[u8]) -> Result<Vec<u8>> {
        self.validate_key(key)?;
        let mut cur = self.take_cursor(cursor)?;
        let result = self.do_find(&mut cur, key);
        self.cursors.insert(cursor, cur);
        result
    }

    /// Move the cursor and return the key/record it lands on.
    pub fn cursor_move(
        &mut self,
        cursor: CursorId,
        flags: CursorMoveFlags,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut cur = self.take_cursor(cursor)?;
        let result = self.do_move(&mut cur, flags);
        self.cursors.insert(cursor, cur);
        result
    }

    /// Insert through the cursor; the cursor couples to the new entry.
    pub fn cursor_insert(
        &mut self,
        cursor: CursorId,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        self.validate_key(key)?;
        let mut cur = self.take_cursor(cursor)?;
        let result = self.do_insert(&mut cur, key, record, flags);
        self.cursors.insert(cursor, cur);
        result
    }

    /// Overwrite the record of the current (duplicate) position without
    /// moving the cursor.
    pub fn cursor_overwrite(&mut self, cursor: CursorId, record: &[u8]) -> Result<()> {
        let mut cur = self.take_cursor(cursor)?;
        let result = self.do_overwrite(&mut cur, record);
        self.cursors.insert(cursor, cur);
        result
    }

    /// Erase the current key (or the current duplicate); the cursor goes
    /// NIL on success.
    pub fn cursor_erase(&mut self, cursor: CursorId) -> Result<()> {
        let mut cur = self.take_cursor(cursor)?;
        let result = self.do_erase(&mut cur);
        self.cursors.insert(cursor, cur);
        result
    }

    /// Whether the given side(s) of the cursor are detached.
    pub fn cursor_is_nil(&self, cursor: CursorId, what: Sides) -> Result<bool> {
        self.cursors
            .get(&cursor)
            .map(|c| c.is_nil(what))
            .ok_or_else(|| BurrowError::inv_parameter("unknown cursor"))
    }

    /// Detach the given side(s) of the cursor.
    pub fn cursor_set_to_nil(&mut self, cursor: CursorId, what: Sides) -> Result<()> {
        self.cursors
            .get_mut(&cursor)
            .map(|c| c.set_to_nil(what))
            .ok_or_else(|| BurrowError::inv_parameter("unknown cursor"))
    }

    /// Number of duplicates of the current key (at least 1).
    pub fn cursor_get_duplicate_count(&mut self, cursor: CursorId) -> Result<u32> {
        let mut cur = self.take_cursor(cursor)?;
        let result = self.do_duplicate_count(&mut cur);
        self.cursors.insert(cursor, cur);
        result
    }

    // --- Implementation ---

    fn take_cursor(&mut self, cursor: CursorId) -> Result<CursorState> {
        self.cursors
            .remove(&cursor)
            .ok_or_else(|| BurrowError::inv_parameter("unknown cursor"))
    }

    fn do_find(&mut self, cur: &mut CursorState, key: &[u8]) -> Result<Vec<u8>> {
        cur.dupecache.clear();
        cur.dupecache_index = 0;
        cur.last_cmp = CMP_NEEDS_REFRESH;

        let pos = self.locate_exact(cur.db, cur.txn, key)?;
        let has_ops = self.txn_has_ops(cur, key);
        let lines = self.build_dupe_lines(cur.db, cur.txn, key, pos)?;

        if lines.is_empty() {
            cur.set_to_nil(Sides::Both);
            if has_ops && self.txn_saw_erase(cur, key) {
                return Err(BurrowError::KeyErasedInTxn);
            }
            return Err(BurrowError::KeyNotFound);
        }

        self.couple(cur, pos, has_ops.then(|| key.to_vec()))?;
        cur.dupecache = lines;
        cur.dupecache_index = 1;
        cur.last_op = LastOp::Find;
        self.resolve_line_record(cur.db, cur.txn, pos, cur.dupecache[0])
    }

    fn do_move(
        &mut self,
        cur: &mut CursorState,
        flags: CursorMoveFlags,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let dirs = flags
            & (CursorMoveFlags::FIRST
                | CursorMoveFlags::LAST
                | CursorMoveFlags::NEXT
                | CursorMoveFlags::PREVIOUS);
        if dirs.bits().count_ones() != 1 {
            return Err(BurrowError::inv_parameter(
                "exactly one move direction is required",
            ));
        }

        if flags.contains(CursorMoveFlags::FIRST) {
            return self.move_to_end(cur, Direction::Forward);
        }
        if flags.contains(CursorMoveFlags::LAST) {
            return self.move_to_end(cur, Direction::Backward);
        }

        // NEXT / PREVIOUS on a NIL cursor start from the matching end.
        if cur.coupling == Coupling::Nil {
            let dir = if flags.contains(CursorMoveFlags::NEXT) {
                Direction::Forward
            } else {
                Direction::Backward
            };
            return self.move_to_end(cur, dir);
        }

        let only_dups = flags.contains(CursorMoveFlags::ONLY_DUPLICATES);
        let skip_dups = flags.contains(CursorMoveFlags::SKIP_DUPLICATES);

        // Duplicate navigation stays on the current key.
        if !skip_dups && cur.dupecache_index > 0 {
            self.refresh_dupecache(cur)?;
            if flags.contains(CursorMoveFlags::NEXT) {
                if (cur.dupecache_index as usize) < cur.dupecache.len() {
                    cur.dupecache_index += 1;
                    cur.last_op = LastOp::Next;
                    return self.current_entry(cur);
                }
            } else if cur.dupecache_index > 1 {
                cur.dupecache_index -= 1;
                cur.last_op = LastOp::Previous;
                return self.current_entry(cur);
            }
            if only_dups {
                return Err(BurrowError::KeyNotFound);
            }
        } else if only_dups {
            return Err(BurrowError::KeyNotFound);
        }

        let direction = if flags.contains(CursorMoveFlags::NEXT) {
            Direction::Forward
        } else {
            Direction::Backward
        };
        let anchor = self.current_key(cur)?;
        let bt = self.btree_neighbor(cur.db, cur.txn, &anchor, direction)?;
        let tx = self.txn_neighbor(cur, &anchor, direction);
        let result = self.emit_candidates(cur, bt, tx, direction);
        cur.last_op = match direction {
            Direction::Forward => LastOp::Next,
            Direction::Backward => LastOp::Previous,
        };
        result
    }

    fn move_to_end(
        &mut self,
        cur: &mut CursorState,
        direction: Direction,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let bt = self.btree_end(cur.db, cur.txn, direction)?;
        let tx = self.txn_end(cur, direction);
        let result = self.emit_candidates(cur, bt, tx, direction);
        cur.last_op = match direction {
            Direction::Forward => LastOp::Next,
            Direction::Backward => LastOp::Previous,
        };
        result
    }

    /// The merge loop: pick the winning candidate for `direction`,
    /// skipping keys whose merged duplicate set is empty.
    fn emit_candidates(
        &mut self,
        cur: &mut CursorState,
        mut bt: Option<(BtreePos, Vec<u8>)>,
        mut tx: Option<Vec<u8>>,
        direction: Direction,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        loop {
            match (bt.take(), tx.take()) {
                (None, None) => {
                    cur.set_to_nil(Sides::Both);
                    return Err(BurrowError::KeyNotFound);
                }
                (Some((pos, bkey)), None) => {
                    // No in-flight ops can exist for this key, or the txn
                    // side would still have a candidate.
                    let lines = self.build_dupe_lines(cur.db, cur.txn, &bkey, Some(pos))?;
                    if lines.is_empty() {
                        bt = self.btree_neighbor(cur.db, cur.txn, &bkey, direction)?;
                        continue;
                    }
                    cur.last_cmp = CMP_NEEDS_REFRESH;
                    return self.finish_emit(cur, Some(pos), None, bkey, lines, direction);
                }
                (None, Some(tkey)) => {
                    let lines = self.build_dupe_lines(cur.db, cur.txn, &tkey, None)?;
                    if lines.is_empty() {
                        tx = self.txn_neighbor(cur, &tkey, direction);
                        continue;
                    }
                    cur.last_cmp = CMP_NEEDS_REFRESH;
                    return self.finish_emit(cur, None, Some(tkey.clone()), tkey, lines, direction);
                }
                (Some((pos, bkey)), Some(tkey)) => {
                    let full = self.full_compare_fn(cur.db)?;
                    let cmp = full(&bkey, &tkey);
                    cur.last_cmp = match cmp {
                        Ordering::Less => -1,
                        Ordering::Equal => 0,
                        Ordering::Greater => 1,
                    };
                    let btree_wins = match direction {
                        Direction::Forward => cmp == Ordering::Less,
                        Direction::Backward => cmp == Ordering::Greater,
                    };
                    if cmp == Ordering::Equal {
                        let lines =
                            self.build_dupe_lines(cur.db, cur.txn, &bkey, Some(pos))?;
                        if lines.is_empty() {
                            bt = self.btree_neighbor(cur.db, cur.txn, &bkey, direction)?;
                            tx = self.txn_neighbor(cur, &tkey, direction);
                            continue;
                        }
                        return self
                            .finish_emit(cur, Some(pos), Some(tkey), bkey, lines, direction);
                    }
                    if btree_wins {
                        let lines =
                            self.build_dupe_lines(cur.db, cur.txn, &bkey, Some(pos))?;
                        if lines.is_empty() {
                            bt = self.btree_neighbor(cur.db, cur.txn, &bkey, direction)?;
                            tx = Some(tkey);
                            continue;
                        }
                        return self.finish_emit(cur, Some(pos), None, bkey, lines, direction);
                    }
                    let lines = self.build_dupe_lines(cur.db, cur.txn, &tkey, None)?;
                    if lines.is_empty() {
                        bt = Some((pos, bkey));
                        tx = self.txn_neighbor(cur, &tkey, direction);
                        continue;
                    }
                    return self.finish_emit(cur, None, Some(tkey.clone()), tkey, lines, direction);
                }
            }
        }
    }

    /// Couple the cursor to the winning side and return its entry.
    fn finish_emit(
        &mut self,
        cur: &mut CursorState,
        pos: Option<BtreePos>,
        txn_key: Option<Vec<u8>>,
        key: Vec<u8>,
        lines: Vec<DupeLine>,
        direction: Direction,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        self.couple(cur, pos, txn_key)?;
        cur.dupecache = lines;
        cur.dupecache_index = match direction {
            Direction::Forward => 1,
            Direction::Backward => cur.dupecache.len() as u32,
        };
        let line = cur.dupecache[cur.dupecache_index as usize - 1];
        let record = self.resolve_line_record(cur.db, cur.txn, pos, line)?;
        Ok((key, record))
    }

    /// Install side states: txn wins representation whenever it has ops
    /// for the key; the btree side stays positioned (kept in sync).
    fn couple(
        &mut self,
        cur: &mut CursorState,
        pos: Option<BtreePos>,
        txn_key: Option<Vec<u8>>,
    ) -> Result<()> {
        cur.btree = match pos {
            Some(pos) => {
                let page = self
                    .pager
                    .fetch_page(None, pos.page, PageIoFlags::default())?
                    .ok_or_else(|| BurrowError::internal("coupled page unavailable"))?;
                BtreeSide::Coupled { pos, page }
            }
            None => BtreeSide::Nil,
        };
        match txn_key {
            Some(key) => {
                cur.txn_side = TxnSide::Coupled { key };
                cur.coupling = Coupling::Txn;
            }
            None => {
                cur.txn_side = TxnSide::Nil;
                cur.coupling = if matches!(cur.btree, BtreeSide::Nil) {
                    Coupling::Nil
                } else {
                    Coupling::Btree
                };
            }
        }
        Ok(())
    }

    fn do_insert(
        &mut self,
        cur: &mut CursorState,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        if let Some(tid) = cur.txn {
            self.check_txn_write(cur.db, tid, key, flags)?;
            let dup = flags.contains(InsertFlags::DUPLICATE);
            let state = self
                .txns
                .get_mut(&tid)
                .ok_or_else(|| BurrowError::inv_parameter("unknown transaction"))?;
            state.push_op(
                cur.db,
                key.to_vec(),
                TxnOpKind::Insert {
                    record: record.to_vec(),
                    flags,
                },
            );
            let pos = self.locate_exact(cur.db, cur.txn, key)?;
            self.couple(cur, pos, Some(key.to_vec()))?;
            cur.dupecache = self.build_dupe_lines(cur.db, cur.txn, key, pos)?;
            cur.dupecache_index = if dup { cur.dupecache.len() as u32 } else { 1 };
        } else {
            self.uncouple_db_cursors(cur.db)?;
            self.insert(cur.db, None, key, record, flags)?;
            let pos = self.locate_exact(cur.db, None, key)?;
            self.couple(cur, pos, None)?;
            cur.dupecache = self.build_dupe_lines(cur.db, None, key, pos)?;
            cur.dupecache_index = if flags.contains(InsertFlags::DUPLICATE) {
                cur.dupecache.len() as u32
            } else {
                1
            };
        }
        cur.last_op = LastOp::Insert;
        cur.last_cmp = CMP_NEEDS_REFRESH;
        Ok(())
    }

    fn do_overwrite(&mut self, cur: &mut CursorState, record: &[u8]) -> Result<()> {
        if cur.coupling == Coupling::Nil {
            return Err(BurrowError::inv_parameter("cursor is nil"));
        }
        let key = self.current_key(cur)?;
        let dup_index = cur.dupecache_index.saturating_sub(1) as usize;

        if let Some(tid) = cur.txn {
            self.check_txn_conflict_with_others(cur.db, tid, &key)?;
            let state = self
                .txns
                .get_mut(&tid)
                .ok_or_else(|| BurrowError::inv_parameter("unknown transaction"))?;
            let seq = state.push_op(
                cur.db,
                key.clone(),
                TxnOpKind::Overwrite {
                    dup_index,
                    record: record.to_vec(),
                },
            );
            // Replace the matching duplicate line in place.
            if let Some(line) = cur.dupecache.get_mut(dup_index) {
                *line = DupeLine::TxnOp(seq);
            }
            cur.txn_side = TxnSide::Coupled { key };
            cur.coupling = Coupling::Txn;
            return Ok(());
        }

        let pos = self
            .ensure_btree_coupled(cur)?
            .ok_or(BurrowError::KeyNotFound)?;
        let db_state = self
            .dbs
            .get_mut(&cur.db)
            .ok_or(BurrowError::DatabaseNotFound { name: cur.db })?;
        let DbState {
            ref mut btree,
            ref mut extkeys,
            ref comparator,
            ..
        } = *db_state;
        let mut env = KeyEnv {
            pager: &mut self.pager,
            blobs: &mut self.blobs,
            extkeys,
            comparator,
        };
        btree.overwrite(&mut env, None, pos, dup_index, record)
    }

    fn do_erase(&mut self, cur: &mut CursorState) -> Result<()> {
        if cur.coupling == Coupling::Nil {
            return Err(BurrowError::inv_parameter("cursor is nil"));
        }
        let key = self.current_key(cur)?;
        self.refresh_dupecache(cur)?;
        let erase_one_dup = cur.dupecache_index > 0 && cur.dupecache.len() > 1;
        let dup_index = cur.dupecache_index.saturating_sub(1) as usize;

        if let Some(tid) = cur.txn {
            self.check_txn_conflict_with_others(cur.db, tid, &key)?;
            let state = self
                .txns
                .get_mut(&tid)
                .ok_or_else(|| BurrowError::inv_parameter("unknown transaction"))?;
            state.push_op(
                cur.db,
                key,
                TxnOpKind::Erase {
                    dup_index: erase_one_dup.then_some(dup_index),
                },
            );
            cur.set_to_nil(Sides::Both);
            return Ok(());
        }

        self.uncouple_db_cursors(cur.db)?;
        let db_state = self
            .dbs
            .get_mut(&cur.db)
            .ok_or(BurrowError::DatabaseNotFound { name: cur.db })?;
        let DbState {
            ref mut btree,
            ref mut extkeys,
            ref comparator,
            ..
        } = *db_state;
        let mut env = KeyEnv {
            pager: &mut self.pager,
            blobs: &mut self.blobs,
            extkeys,
            comparator,
        };
        if erase_one_dup {
            btree.erase_duplicate(&mut env, None, &key, dup_index)?;
        } else {
            btree.erase(&mut env, None, &key)?;
        }
        cur.set_to_nil(Sides::Both);
        Ok(())
    }

    fn do_duplicate_count(&mut self, cur: &mut CursorState) -> Result<u32> {
        if cur.coupling == Coupling::Nil {
            return Err(BurrowError::inv_parameter("cursor is nil"));
        }
        self.refresh_dupecache(cur)?;
        Ok((cur.dupecache.len() as u32).max(1))
    }

    /// Probe the txn op chain for the btree side's current key.
    ///
    /// Returns `KeyErasedInTxn` when a visible whole-key erase shadows
    /// the btree entry.
    pub fn cursor_check_if_btree_key_is_erased_or_overwritten(
        &mut self,
        cursor: CursorId,
    ) -> Result<()> {
        let cur = self.take_cursor(cursor)?;
        let result = self.check_btree_key_shadowing(&cur);
        self.cursors.insert(cursor, cur);
        result
    }

    fn check_btree_key_shadowing(&mut self, cur: &CursorState) -> Result<()> {
        let key = match &cur.btree {
            BtreeSide::Nil => return Err(BurrowError::inv_parameter("btree cursor is nil")),
            BtreeSide::Uncoupled { key } => key.clone(),
            BtreeSide::Coupled { pos, .. } => self.btree_key_at(cur.db, cur.txn, *pos)?,
        };
        if self.txn_saw_erase(cur, &key)
            && self
                .txn_state(cur)
                .is_some_and(|t| t.newest_record(cur.db, &key).is_none())
        {
            return Err(BurrowError::KeyErasedInTxn);
        }
        Ok(())
    }

    // --- Shared lookup helpers (also used by Environment::find) ---

    /// First record of `key` under the merged (btree + txn) view.
    pub(crate) fn merged_first_record(
        &mut self,
        db: DatabaseName,
        txn: Option<TxnId>,
        key: &[u8],
    ) -> Result<Vec<u8>> {
        if !self.dbs.contains_key(&db) {
            return Err(BurrowError::DatabaseNotFound { name: db });
        }
        let pos = self.locate_exact(db, txn, key)?;
        let lines = self.build_dupe_lines(db, txn, key, pos)?;
        match lines.first() {
            Some(line) => self.resolve_line_record(db, txn, pos, *line),
            None => {
                let erased = txn
                    .and_then(|tid| self.txns.get(&tid))
                    .is_some_and(|t| t.ops_for(db, key).next().is_some());
                if erased {
                    Err(BurrowError::KeyErasedInTxn)
                } else {
                    Err(BurrowError::KeyNotFound)
                }
            }
        }
    }

    /// Build the merged duplicate lines for `key`: the btree duplicate
    /// table first, then the txn ops applied in commit order.
    pub(crate) fn build_dupe_lines(
        &mut self,
        db: DatabaseName,
        txn: Option<TxnId>,
        key: &[u8],
        pos: Option<BtreePos>,
    ) -> Result<Vec<DupeLine>> {
        let mut lines = Vec::new();

        if let Some(pos) = pos {
            let count = {
                let db_state = self
                    .dbs
                    .get_mut(&db)
                    .ok_or(BurrowError::DatabaseNotFound { name: db })?;
                let DbState {
                    ref btree,
                    ref mut extkeys,
                    ref comparator,
                    ..
                } = *db_state;
                let mut pages = txn.and_then(|tid| self.txns.get_mut(&tid)).map(|t| &mut t.pages);
                let mut env = KeyEnv {
                    pager: &mut self.pager,
                    blobs: &mut self.blobs,
                    extkeys,
                    comparator,
                };
                btree.dup_count(&mut env, pages.as_deref_mut(), pos)?
            };
            for i in 0..count {
                lines.push(DupeLine::Btree(i));
            }
        }

        if let Some(tid) = txn {
            if let Some(state) = self.txns.get(&tid) {
                for op in state.ops_for(db, key) {
                    match &op.kind {
                        TxnOpKind::Insert { .. } => lines.push(DupeLine::TxnOp(op.seq)),
                        TxnOpKind::Erase { dup_index: None } => lines.clear(),
                        TxnOpKind::Erase {
                            dup_index: Some(i),
                        } => {
                            if *i < lines.len() {
                                lines.remove(*i);
                            }
                        }
                        TxnOpKind::Overwrite { dup_index, .. } => {
                            if let Some(line) = lines.get_mut(*dup_index) {
                                *line = DupeLine::TxnOp(op.seq);
                            }
                        }
                    }
                }
            }
        }

        Ok(lines)
    }

    /// Resolve one duplicate line to its record bytes.
    pub(crate) fn resolve_line_record(
        &mut self,
        db: DatabaseName,
        txn: Option<TxnId>,
        pos: Option<BtreePos>,
        line: DupeLine,
    ) -> Result<Vec<u8>> {
        match line {
            DupeLine::Btree(i) => {
                let pos = pos.ok_or_else(|| {
                    BurrowError::internal("btree duplicate line without a btree position")
                })?;
                let db_state = self
                    .dbs
                    .get_mut(&db)
                    .ok_or(BurrowError::DatabaseNotFound { name: db })?;
                let DbState {
                    ref btree,
                    ref mut extkeys,
                    ref comparator,
                    ..
                } = *db_state;
                let mut pages = txn.and_then(|tid| self.txns.get_mut(&tid)).map(|t| &mut t.pages);
                let mut env = KeyEnv {
                    pager: &mut self.pager,
                    blobs: &mut self.blobs,
                    extkeys,
                    comparator,
                };
                btree.record_of(&mut env, pages.as_deref_mut(), pos, i)
            }
            DupeLine::TxnOp(seq) => {
                let state = txn
                    .and_then(|tid| self.txns.get(&tid))
                    .ok_or_else(|| BurrowError::internal("txn line without a transaction"))?;
                match state.op_by_seq(seq).map(|op| &op.kind) {
                    Some(
                        TxnOpKind::Insert { record, .. } | TxnOpKind::Overwrite { record, .. },
                    ) => Ok(record.clone()),
                    _ => Err(BurrowError::internal("txn line does not carry a record")),
                }
            }
        }
    }

    // --- Position helpers ---

    fn txn_state(&self, cur: &CursorState) -> Option<&TxnState> {
        cur.txn.and_then(|tid| self.txns.get(&tid))
    }

    fn txn_has_ops(&self, cur: &CursorState, key: &[u8]) -> bool {
        self.txn_state(cur)
            .is_some_and(|t| t.ops_for(cur.db, key).next().is_some())
    }

    fn txn_saw_erase(&self, cur: &CursorState, key: &[u8]) -> bool {
        self.txn_state(cur).is_some_and(|t| {
            t.ops_for(cur.db, key)
                .any(|op| matches!(op.kind, TxnOpKind::Erase { dup_index: None }))
        })
    }

    /// The key the cursor currently stands on.
    fn current_key(&mut self, cur: &CursorState) -> Result<Vec<u8>> {
        match cur.coupling {
            Coupling::Nil => Err(BurrowError::inv_parameter("cursor is nil")),
            Coupling::Txn => match &cur.txn_side {
                TxnSide::Coupled { key } => Ok(key.clone()),
                TxnSide::Nil => Err(BurrowError::internal("txn-coupled cursor without a key")),
            },
            Coupling::Btree => match &cur.btree {
                BtreeSide::Coupled { pos, .. } => self.btree_key_at(cur.db, cur.txn, *pos),
                BtreeSide::Uncoupled { key } => Ok(key.clone()),
                BtreeSide::Nil => Err(BurrowError::internal("btree-coupled cursor without a position")),
            },
        }
    }

    /// Rebuild the duplicate cache for the current key if it was
    /// invalidated, clamping the index.
    fn refresh_dupecache(&mut self, cur: &mut CursorState) -> Result<()> {
        if !cur.dupecache.is_empty() {
            return Ok(());
        }
        let key = self.current_key(cur)?;
        let pos = self.locate_exact(cur.db, cur.txn, &key)?;
        cur.dupecache = self.build_dupe_lines(cur.db, cur.txn, &key, pos)?;
        if cur.dupecache_index as usize > cur.dupecache.len() {
            cur.dupecache_index = cur.dupecache.len() as u32;
        }
        if cur.dupecache_index == 0 && !cur.dupecache.is_empty() {
            cur.dupecache_index = 1;
        }
        Ok(())
    }

    /// Re-couple an uncoupled btree side to its key, if it still exists.
    fn ensure_btree_coupled(&mut self, cur: &mut CursorState) -> Result<Option<BtreePos>> {
        match &cur.btree {
            BtreeSide::Coupled { pos, .. } => Ok(Some(*pos)),
            BtreeSide::Nil => Ok(None),
            BtreeSide::Uncoupled { key } => {
                let key = key.clone();
                let pos = self.locate_exact(cur.db, cur.txn, &key)?;
                match pos {
                    Some(pos) => {
                        let page = self
                            .pager
                            .fetch_page(None, pos.page, PageIoFlags::default())?
                            .ok_or_else(|| BurrowError::internal("coupled page unavailable"))?;
                        cur.btree = BtreeSide::Coupled { pos, page };
                        Ok(Some(pos))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    /// Exact btree position of `key`, or `None`.
    fn locate_exact(
        &mut self,
        db: DatabaseName,
        txn: Option<TxnId>,
        key: &[u8],
    ) -> Result<Option<BtreePos>> {
        let db_state = self
            .dbs
            .get_mut(&db)
            .ok_or(BurrowError::DatabaseNotFound { name: db })?;
        let DbState {
            ref btree,
            ref mut extkeys,
            ref comparator,
            ..
        } = *db_state;
        let mut pages = txn.and_then(|tid| self.txns.get_mut(&tid)).map(|t| &mut t.pages);
        let mut env = KeyEnv {
            pager: &mut self.pager,
            blobs: &mut self.blobs,
            extkeys,
            comparator,
        };
        btree.find(&mut env, pages.as_deref_mut(), key)
    }

    fn btree_key_at(
        &mut self,
        db: DatabaseName,
        txn: Option<TxnId>,
        pos: BtreePos,
    ) -> Result<Vec<u8>> {
        let db_state = self
            .dbs
            .get_mut(&db)
            .ok_or(BurrowError::DatabaseNotFound { name: db })?;
        let DbState {
            ref btree,
            ref mut extkeys,
            ref comparator,
            ..
        } = *db_state;
        let mut pages = txn.and_then(|tid| self.txns.get_mut(&tid)).map(|t| &mut t.pages);
        let mut env = KeyEnv {
            pager: &mut self.pager,
            blobs: &mut self.blobs,
            extkeys,
            comparator,
        };
        btree.key_of(&mut env, pages.as_deref_mut(), pos)
    }

    /// First or last btree entry, with its key.
    fn btree_end(
        &mut self,
        db: DatabaseName,
        txn: Option<TxnId>,
        direction: Direction,
    ) -> Result<Option<(BtreePos, Vec<u8>)>> {
        let pos = {
            let db_state = self
                .dbs
                .get_mut(&db)
                .ok_or(BurrowError::DatabaseNotFound { name: db })?;
            let DbState {
                ref btree,
                ref mut extkeys,
                ref comparator,
                ..
            } = *db_state;
            let mut pages = txn.and_then(|tid| self.txns.get_mut(&tid)).map(|t| &mut t.pages);
            let mut env = KeyEnv {
                pager: &mut self.pager,
                blobs: &mut self.blobs,
                extkeys,
                comparator,
            };
            match direction {
                Direction::Forward => {
                    btree.first(&mut env, pages.as_deref_mut())?
                }
                Direction::Backward => {
                    btree.last(&mut env, pages.as_deref_mut())?
                }
            }
        };
        match pos {
            Some(pos) => {
                let key = self.btree_key_at(db, txn, pos)?;
                Ok(Some((pos, key)))
            }
            None => Ok(None),
        }
    }

    /// The btree entry adjacent to `anchor` in `direction`.
    fn btree_neighbor(
        &mut self,
        db: DatabaseName,
        txn: Option<TxnId>,
        anchor: &[u8],
        direction: Direction,
    ) -> Result<Option<(BtreePos, Vec<u8>)>> {
        let pos = {
            let db_state = self
                .dbs
                .get_mut(&db)
                .ok_or(BurrowError::DatabaseNotFound { name: db })?;
            let DbState {
                ref btree,
                ref mut extkeys,
                ref comparator,
                ..
            } = *db_state;
            let mut pages = txn.and_then(|tid| self.txns.get_mut(&tid)).map(|t| &mut t.pages);
            let mut env = KeyEnv {
                pager: &mut self.pager,
                blobs: &mut self.blobs,
                extkeys,
                comparator,
            };
            let (ge, exact) =
                btree.locate_ge(&mut env, pages.as_deref_mut(), anchor)?;
            match direction {
                Direction::Forward => match ge {
                    Some(pos) if exact => {
                        btree.next(&mut env, pages.as_deref_mut(), pos)?
                    }
                    other => other,
                },
                Direction::Backward => match ge {
                    // The first entry >= anchor; its predecessor is the
                    // greatest entry < anchor.
                    Some(pos) => {
                        btree.previous(&mut env, pages.as_deref_mut(), pos)?
                    }
                    None => btree.last(&mut env, pages.as_deref_mut())?,
                },
            }
        };
        match pos {
            Some(pos) => {
                let key = self.btree_key_at(db, txn, pos)?;
                Ok(Some((pos, key)))
            }
            None => Ok(None),
        }
    }

    fn full_compare_fn(&self, db: DatabaseName) -> Result<burrow_btree::FullCompareFn> {
        self.dbs
            .get(&db)
            .map(|d| d.comparator.full)
            .ok_or(BurrowError::DatabaseNotFound { name: db })
    }

    /// Sorted keys of the cursor's transaction for its database.
    fn sorted_txn_keys(&self, cur: &CursorState) -> Vec<Vec<u8>> {
        let Some(state) = self.txn_state(cur) else {
            return Vec::new();
        };
        let Ok(full) = self.full_compare_fn(cur.db) else {
            return Vec::new();
        };
        let mut keys = state.touched_keys(cur.db);
        keys.sort_by(|a, b| full(a, b));
        keys
    }

    /// First or last txn key.
    fn txn_end(&self, cur: &CursorState, direction: Direction) -> Option<Vec<u8>> {
        let keys = self.sorted_txn_keys(cur);
        match direction {
            Direction::Forward => keys.first().cloned(),
            Direction::Backward => keys.last().cloned(),
        }
    }

    /// The txn key adjacent to `anchor` in `direction`.
    fn txn_neighbor(
        &self,
        cur: &CursorState,
        anchor: &[u8],
        direction: Direction,
    ) -> Option<Vec<u8>> {
        let keys = self.sorted_txn_keys(cur);
        let full = self.full_compare_fn(cur.db).ok()?;
        match direction {
            Direction::Forward => keys
                .iter()
                .find(|k| full(k, anchor) == Ordering::Greater)
                .cloned(),
            Direction::Backward => keys
                .iter()
                .rev()
                .find(|k| full(k, anchor) == Ordering::Less)
                .cloned(),
        }
    }

    /// The entry the cursor currently stands on (after duplicate
    /// navigation).
    fn current_entry(&mut self, cur: &mut CursorState) -> Result<(Vec<u8>, Vec<u8>)> {
        let key = self.current_key(cur)?;
        let pos = self.ensure_btree_coupled(cur)?;
        let line = *cur
            .dupecache
            .get(cur.dupecache_index.saturating_sub(1) as usize)
            .ok_or_else(|| BurrowError::internal("duplicate index out of range"))?;
        let record = self.resolve_line_record(cur.db, cur.txn, pos, line)?;
        Ok((key, record))
    }

    /// Detach one cursor from its btree position onto a key copy.
    pub(crate) fn uncouple_cursor(&mut self, cursor: CursorId) -> Result<()> {
        let Some(mut cur) = self.cursors.remove(&cursor) else {
            return Ok(());
        };
        let result = (|| -> Result<()> {
            if let BtreeSide::Coupled { pos, .. } = &cur.btree {
                let key = self.btree_key_at(cur.db, cur.txn, *pos)?;
                cur.btree = BtreeSide::Uncoupled { key };
            }
            // Structural changes invalidate cached duplicate lines; they
            // are rebuilt on the next use.
            cur.dupecache.clear();
            cur.last_op = LastOp::None;
            cur.last_cmp = CMP_NEEDS_REFRESH;
            Ok(())
        })();
        self.cursors.insert(cursor, cur);
        result
    }
}
