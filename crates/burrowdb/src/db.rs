//! Open-database state.

use burrow_btree::{Btree, Comparator, ExtKeyCache};
use burrow_types::flags::DbFlags;
use burrow_types::DatabaseName;

/// Everything the environment keeps per open database.
///
/// The extended-key cache starts out absent and is created lazily by the
/// comparator on the first extended-key comparison (never for in-memory
/// environments). The comparator's functions are user-replaceable until
/// the first operation.
#[derive(Debug)]
pub(crate) struct DbState {
    pub name: DatabaseName,
    pub flags: DbFlags,
    pub btree: Btree,
    pub extkeys: Option<ExtKeyCache>,
    pub comparator: Comparator,
}

impl DbState {
    pub(crate) fn new(name: DatabaseName, flags: DbFlags, btree: Btree) -> Self {
        Self {
            name,
            flags,
            btree,
            extkeys: None,
            comparator: Comparator::default(),
        }
    }

    /// Whether this database accepts duplicate keys.
    pub(crate) fn duplicates_enabled(&self) -> bool {
        self.flags.contains(DbFlags::ENABLE_DUPLICATES)
    }
}
