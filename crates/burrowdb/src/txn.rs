//! In-flight transaction state: the private page map and the op chains.
//!
//! A transaction buffers its mutations as an ordered op list; nothing
//! touches the B+tree until commit. Cursors bound to the transaction
//! merge these ops with committed state; unbound readers never see them.

use burrow_pager::TxnPageSet;
use burrow_types::flags::InsertFlags;
use burrow_types::DatabaseName;

/// Identifier of an in-flight transaction.
pub type TxnId = u64;

/// One buffered mutation.
#[derive(Debug, Clone)]
pub enum TxnOpKind {
    Insert {
        record: Vec<u8>,
        flags: InsertFlags,
    },
    /// `dup_index` selects one duplicate (0-based); `None` erases the key
    /// with all its duplicates.
    Erase { dup_index: Option<usize> },
    Overwrite {
        dup_index: usize,
        record: Vec<u8>,
    },
}

/// A buffered mutation with its target and commit-order sequence number.
#[derive(Debug, Clone)]
pub struct TxnOp {
    pub seq: u64,
    pub db: DatabaseName,
    pub key: Vec<u8>,
    pub kind: TxnOpKind,
}

/// The visible end-state of a key inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTxnState {
    /// No ops touch this key.
    Untouched,
    /// The newest whole-key op is an erase.
    Erased,
    /// At least one insert/overwrite survives.
    Written,
}

/// State of one in-flight transaction.
#[derive(Debug, Default)]
pub struct TxnState {
    /// Pages this transaction touched; they stay pinned until the
    /// transaction ends.
    pub pages: TxnPageSet,
    /// Ops in commit order.
    pub ops: Vec<TxnOp>,
    next_seq: u64,
}

impl TxnState {
    /// A fresh transaction with no ops.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an op, stamping its sequence number.
    pub fn push_op(&mut self, db: DatabaseName, key: Vec<u8>, kind: TxnOpKind) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ops.push(TxnOp {
            seq,
            db,
            key,
            kind,
        });
        seq
    }

    /// Ops touching `key` in `db`, in commit order.
    pub fn ops_for<'a>(
        &'a self,
        db: DatabaseName,
        key: &'a [u8],
    ) -> impl Iterator<Item = &'a TxnOp> {
        self.ops
            .iter()
            .filter(move |op| op.db == db && op.key == key)
    }

    /// The op with sequence number `seq`.
    #[must_use]
    pub fn op_by_seq(&self, seq: u64) -> Option<&TxnOp> {
        self.ops.iter().find(|op| op.seq == seq)
    }

    /// The visible end-state of `key` under this transaction.
    #[must_use]
    pub fn key_state(&self, db: DatabaseName, key: &[u8]) -> KeyTxnState {
        let mut state = KeyTxnState::Untouched;
        for op in self.ops_for(db, key) {
            state = match op.kind {
                TxnOpKind::Insert { .. } | TxnOpKind::Overwrite { .. } => KeyTxnState::Written,
                TxnOpKind::Erase { dup_index: None } => KeyTxnState::Erased,
                // A single-duplicate erase leaves the key itself alive.
                TxnOpKind::Erase { dup_index: Some(_) } => state,
            };
        }
        state
    }

    /// The newest record written to `key`, if any op wrote one.
    #[must_use]
    pub fn newest_record(&self, db: DatabaseName, key: &[u8]) -> Option<&[u8]> {
        let mut newest = None;
        for op in self.ops.iter().filter(|op| op.db == db && op.key == key) {
            match &op.kind {
                TxnOpKind::Insert { record, .. } | TxnOpKind::Overwrite { record, .. } => {
                    newest = Some(record.as_slice());
                }
                TxnOpKind::Erase { dup_index: None } => newest = None,
                TxnOpKind::Erase { dup_index: Some(_) } => {}
            }
        }
        newest
    }

    /// Distinct keys of `db` touched by this transaction, unordered.
    #[must_use]
    pub fn touched_keys(&self, db: DatabaseName) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = Vec::new();
        for op in self.ops.iter().filter(|op| op.db == db) {
            if !keys.iter().any(|k| k == &op.key) {
                keys.push(op.key.clone());
            }
        }
        keys
    }
}
