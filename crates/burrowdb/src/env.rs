//! The environment: one file (or arena), many named databases.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use burrow_btree::{node_capacity, BlobStore, Btree, FullCompareFn, KeyEnv, PrefixCompareFn};
use burrow_device::{Device, FileDevice};
use burrow_error::{BurrowError, Result};
use burrow_pager::Pager;
use burrow_types::flags::{DbFlags, EnvFlags, InsertFlags, PageIoFlags};
use burrow_types::{DatabaseName, DbConfig, EnvConfig, ADDRESS_SIZE};
use tracing::{debug, info, warn};

use crate::cursor::CursorState;
use crate::db::DbState;
use crate::header::{DirEntry, Header};
use crate::txn::{KeyTxnState, TxnId, TxnOpKind, TxnState};

/// Identifier of an open cursor.
pub type CursorId = u64;

/// An embedded storage environment: a single file (or an in-memory
/// arena) hosting multiple named databases.
///
/// All operations go through the environment handle; the page cache and
/// the per-database extended-key caches are reachable only through it.
#[derive(Debug)]
pub struct Environment {
    pub(crate) pager: Pager,
    pub(crate) blobs: BlobStore,
    pub(crate) flags: EnvFlags,
    pub(crate) header: Header,
    pub(crate) path: Option<PathBuf>,
    pub(crate) dbs: HashMap<DatabaseName, DbState>,
    pub(crate) txns: HashMap<TxnId, TxnState>,
    pub(crate) next_txn_id: TxnId,
    pub(crate) cursors: HashMap<CursorId, CursorState>,
    pub(crate) next_cursor_id: CursorId,
}

impl Environment {
    // --- Lifecycle ---

    /// Create a new environment.
    ///
    /// `path` must be `Some` unless `IN_MEMORY_DB` is set, in which case
    /// it is ignored. An existing file is truncated.
    pub fn create(path: Option<&Path>, flags: EnvFlags, config: &EnvConfig) -> Result<Self> {
        Self::validate_flags(flags)?;
        if Header::byte_size(config.max_databases) > config.page_size.as_usize() {
            return Err(BurrowError::inv_parameter(
                "database directory does not fit in the header page",
            ));
        }
        if config.max_databases == 0 {
            return Err(BurrowError::inv_parameter("max_databases must be non-zero"));
        }

        let header = Header::new(config.page_size, config.max_databases);
        let in_memory = flags.contains(EnvFlags::IN_MEMORY_DB);

        let device: Option<Box<dyn Device>> = if in_memory {
            None
        } else {
            let path = path.ok_or_else(|| {
                BurrowError::inv_parameter("a file-backed environment needs a path")
            })?;
            let mut device = FileDevice::create(path)?;
            device.truncate(config.page_size.as_usize() as u64)?;
            device.write_at(0, &header.encode())?;
            Some(Box::new(device))
        };

        info!(
            page_size = config.page_size.get(),
            cache = config.cache_capacity,
            in_memory,
            "created environment"
        );
        Ok(Self {
            pager: Pager::new(device, config.page_size, config.cache_capacity, flags),
            blobs: BlobStore::new(),
            flags,
            header,
            path: path.map(Path::to_path_buf),
            dbs: HashMap::new(),
            txns: HashMap::new(),
            next_txn_id: 1,
            cursors: HashMap::new(),
            next_cursor_id: 1,
        })
    }

    /// Open an existing environment file.
    ///
    /// The page size and directory come from the header; `cache_capacity`
    /// bounds the page cache for this session.
    pub fn open(path: &Path, flags: EnvFlags, cache_capacity: usize) -> Result<Self> {
        Self::validate_flags(flags)?;
        if flags.contains(EnvFlags::IN_MEMORY_DB) {
            return Err(BurrowError::inv_parameter(
                "cannot open a file as an in-memory environment",
            ));
        }

        let mut device = FileDevice::open(path)?;
        // The fixed header fields sit inside the smallest legal page.
        let mut probe = vec![0u8; 1024];
        device.read_at(0, &mut probe)?;
        let page_size = Header::probe_page_size(&probe, path)?;
        let mut buf = vec![0u8; page_size.as_usize()];
        device.read_at(0, &mut buf)?;
        let header = Header::decode(&buf, path)?;

        let mut pager = Pager::new(
            Some(Box::new(device)),
            header.page_size,
            cache_capacity,
            flags,
        );
        pager.load_freelist(header.freelist_root)?;

        info!(path = %path.display(), page_size = header.page_size.get(), "opened environment");
        Ok(Self {
            pager,
            blobs: BlobStore::new(),
            flags,
            header,
            path: Some(path.to_path_buf()),
            dbs: HashMap::new(),
            txns: HashMap::new(),
            next_txn_id: 1,
            cursors: HashMap::new(),
            next_cursor_id: 1,
        })
    }

    fn validate_flags(flags: EnvFlags) -> Result<()> {
        // Hash indexes are declared but unimplemented; the factory
        // rejects them rather than guessing.
        if flags.contains(EnvFlags::USE_HASH) {
            warn!("hash indexes are not supported");
            return Err(BurrowError::Unsupported);
        }
        Ok(())
    }

    /// The environment flags.
    #[must_use]
    pub fn flags(&self) -> EnvFlags {
        self.flags
    }

    /// Write all dirty state: pages, freelist chain, directory roots and
    /// the header.
    pub fn flush(&mut self) -> Result<()> {
        self.pager.flush_all(PageIoFlags::NO_DELETE)?;
        self.write_header()?;
        self.pager.sync()
    }

    /// Close the environment, flushing everything.
    ///
    /// Open cursors are closed; in-flight transactions are aborted.
    pub fn close(mut self) -> Result<()> {
        let txn_ids: Vec<TxnId> = self.txns.keys().copied().collect();
        for id in txn_ids {
            self.abort(id)?;
        }
        self.cursors.clear();
        self.pager.flush_all(PageIoFlags::default())?;
        self.write_header()?;
        self.pager.sync()?;
        debug!("closed environment");
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        if self.flags.contains(EnvFlags::IN_MEMORY_DB) {
            return Ok(());
        }
        // Roots move on splits; copy them back into the directory.
        for db in self.dbs.values() {
            if let Some(slot) = self.header.slot_of(db.name) {
                self.header.directory[slot].root = db.btree.root();
            }
        }
        self.header.freelist_root = self.pager.persist_freelist()?;
        let encoded = self.header.encode();
        let device = self
            .pager
            .device_mut()
            .expect("file-backed environment has a device");
        device.write_at(0, &encoded)?;
        Ok(())
    }

    // --- Database management ---

    /// Create (and open) a database under `name`.
    pub fn create_database(
        &mut self,
        name: DatabaseName,
        flags: DbFlags,
        config: &DbConfig,
    ) -> Result<()> {
        if name == 0 {
            return Err(BurrowError::inv_parameter("database name must be non-zero"));
        }
        if self.header.slot_of(name).is_some() {
            return Err(BurrowError::inv_parameter(format!(
                "database {name} already exists"
            )));
        }
        let slot = self
            .header
            .free_slot()
            .ok_or(BurrowError::EnvironmentFull {
                max: self.header.max_databases,
            })?;

        let key_size = config.key_size as usize;
        if key_size <= ADDRESS_SIZE {
            return Err(BurrowError::inv_parameter(
                "key size must exceed the size of a blob id",
            ));
        }
        if node_capacity(self.header.page_size.as_usize(), key_size) < 4 {
            return Err(BurrowError::inv_parameter(
                "key size too large for the page size",
            ));
        }

        let btree = {
            let comparator = burrow_btree::Comparator::default();
            let mut extkeys = None;
            let mut env = KeyEnv {
                pager: &mut self.pager,
                blobs: &mut self.blobs,
                extkeys: &mut extkeys,
                comparator: &comparator,
            };
            Btree::create(
                &mut env,
                None,
                name,
                key_size,
                flags.contains(DbFlags::ENABLE_DUPLICATES),
            )?
        };

        self.header.directory[slot] = DirEntry {
            name,
            key_size: config.key_size,
            flags: flags.bits(),
            root: btree.root(),
        };
        self.dbs.insert(name, DbState::new(name, flags, btree));
        debug!(name, "created database");
        Ok(())
    }

    /// Open a database that exists in the directory.
    pub fn open_database(&mut self, name: DatabaseName) -> Result<()> {
        if self.dbs.contains_key(&name) {
            return Err(BurrowError::DatabaseAlreadyOpen { name });
        }
        let slot = self
            .header
            .slot_of(name)
            .ok_or(BurrowError::DatabaseNotFound { name })?;
        let entry = self.header.directory[slot];
        let flags = DbFlags::from_bits_truncate(entry.flags);
        let btree = Btree::open(
            entry.root,
            name,
            entry.key_size as usize,
            flags.contains(DbFlags::ENABLE_DUPLICATES),
        );
        self.dbs.insert(name, DbState::new(name, flags, btree));
        debug!(name, "opened database");
        Ok(())
    }

    /// Close an open database, dropping its cursors and caches.
    pub fn close_database(&mut self, name: DatabaseName) -> Result<()> {
        if !self.dbs.contains_key(&name) {
            return Err(BurrowError::DatabaseNotFound { name });
        }
        if self
            .txns
            .values()
            .any(|txn| txn.ops.iter().any(|op| op.db == name))
        {
            return Err(BurrowError::inv_parameter(
                "database has uncommitted transaction ops",
            ));
        }
        self.cursors.retain(|_, c| c.db != name);
        if let Some(db) = self.dbs.remove(&name) {
            if let Some(slot) = self.header.slot_of(name) {
                self.header.directory[slot].root = db.btree.root();
            }
        }
        debug!(name, "closed database");
        Ok(())
    }

    /// Remove a database and reclaim its pages. The database must not be
    /// open.
    pub fn erase_database(&mut self, name: DatabaseName) -> Result<()> {
        if self.dbs.contains_key(&name) {
            return Err(BurrowError::inv_parameter(
                "cannot erase an open database",
            ));
        }
        let slot = self
            .header
            .slot_of(name)
            .ok_or(BurrowError::DatabaseNotFound { name })?;
        let entry = self.header.directory[slot];

        let mut btree = Btree::open(entry.root, name, entry.key_size as usize, false);
        {
            let comparator = burrow_btree::Comparator::default();
            let mut extkeys = None;
            let mut env = KeyEnv {
                pager: &mut self.pager,
                blobs: &mut self.blobs,
                extkeys: &mut extkeys,
                comparator: &comparator,
            };
            btree.free_all(&mut env, None)?;
        }
        self.header.directory[slot] = DirEntry::default();
        self.pager.flush_all(PageIoFlags::NO_DELETE)?;
        debug!(name, "erased database");
        Ok(())
    }

    /// Names of all databases in the environment.
    #[must_use]
    pub fn database_names(&self) -> Vec<DatabaseName> {
        self.header.database_names()
    }

    /// Number of entries in the extended-key cache of `name` (0 when the
    /// cache was never created, as in in-memory environments).
    pub fn extkey_cache_len(&self, name: DatabaseName) -> Result<usize> {
        let db = self
            .dbs
            .get(&name)
            .ok_or(BurrowError::DatabaseNotFound { name })?;
        Ok(db.extkeys.as_ref().map_or(0, burrow_btree::ExtKeyCache::len))
    }

    /// Install a full-key comparison function for `name`.
    pub fn set_compare(&mut self, name: DatabaseName, full: FullCompareFn) -> Result<()> {
        let db = self
            .dbs
            .get_mut(&name)
            .ok_or(BurrowError::DatabaseNotFound { name })?;
        db.comparator.full = full;
        Ok(())
    }

    /// Install (or clear) a prefix comparison function for `name`.
    pub fn set_prefix_compare(
        &mut self,
        name: DatabaseName,
        prefix: Option<PrefixCompareFn>,
    ) -> Result<()> {
        let db = self
            .dbs
            .get_mut(&name)
            .ok_or(BurrowError::DatabaseNotFound { name })?;
        db.comparator.prefix = prefix;
        Ok(())
    }

    // --- Transactions ---

    /// Begin a transaction. Requires `ENABLE_TRANSACTIONS`.
    pub fn begin(&mut self) -> Result<TxnId> {
        if !self.flags.contains(EnvFlags::ENABLE_TRANSACTIONS) {
            return Err(BurrowError::inv_parameter(
                "environment was created without ENABLE_TRANSACTIONS",
            ));
        }
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        self.txns.insert(id, TxnState::new());
        debug!(txn = id, "began transaction");
        Ok(id)
    }

    /// Commit a transaction, applying its ops in order.
    pub fn commit(&mut self, txn: TxnId) -> Result<()> {
        let state = self
            .txns
            .remove(&txn)
            .ok_or_else(|| BurrowError::inv_parameter("unknown transaction"))?;

        let touched: Vec<DatabaseName> = {
            let mut dbs: Vec<DatabaseName> = state.ops.iter().map(|op| op.db).collect();
            dbs.dedup();
            dbs
        };
        for db in touched {
            self.uncouple_db_cursors(db)?;
        }

        let mut pages = state.pages;
        for op in &state.ops {
            let db_state = self
                .dbs
                .get_mut(&op.db)
                .ok_or(BurrowError::DatabaseNotFound { name: op.db })?;
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
            match &op.kind {
                TxnOpKind::Insert { record, flags } => {
                    btree.insert(&mut env, Some(&mut pages), &op.key, record, *flags)?;
                }
                TxnOpKind::Erase { dup_index: None } => {
                    btree.erase(&mut env, Some(&mut pages), &op.key)?;
                }
                TxnOpKind::Erase {
                    dup_index: Some(idx),
                } => {
                    btree.erase_duplicate(&mut env, Some(&mut pages), &op.key, *idx)?;
                }
                TxnOpKind::Overwrite { dup_index, record } => {
                    let pos = btree
                        .find(&mut env, Some(&mut pages), &op.key)?
                        .ok_or(BurrowError::KeyNotFound)?;
                    btree.overwrite(&mut env, Some(&mut pages), pos, *dup_index, record)?;
                }
            }
        }

        // Unpin the transaction's pages and drop its cursors.
        pages.clear();
        self.cursors.retain(|_, c| c.txn != Some(txn));
        debug!(txn, "committed transaction");
        Ok(())
    }

    /// Abort a transaction, discarding its ops.
    pub fn abort(&mut self, txn: TxnId) -> Result<()> {
        let mut state = self
            .txns
            .remove(&txn)
            .ok_or_else(|| BurrowError::inv_parameter("unknown transaction"))?;
        state.pages.clear();
        self.cursors.retain(|_, c| c.txn != Some(txn));
        debug!(txn, "aborted transaction");
        Ok(())
    }

    // --- Key/record operations ---

    /// Insert a key/record pair.
    pub fn insert(
        &mut self,
        name: DatabaseName,
        txn: Option<TxnId>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        self.validate_key(key)?;
        if !self.dbs.contains_key(&name) {
            return Err(BurrowError::DatabaseNotFound { name });
        }

        if let Some(tid) = txn {
            self.check_txn_write(name, tid, key, flags)?;
            let state = self
                .txns
                .get_mut(&tid)
                .ok_or_else(|| BurrowError::inv_parameter("unknown transaction"))?;
            state.push_op(
                name,
                key.to_vec(),
                TxnOpKind::Insert {
                    record: record.to_vec(),
                    flags,
                },
            );
            return Ok(());
        }

        self.uncouple_db_cursors(name)?;
        let db_state = self.dbs.get_mut(&name).expect("checked above");
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
        btree.insert(&mut env, None, key, record, flags)?;
        Ok(())
    }

    /// Look up the (first) record of `key`.
    pub fn find(
        &mut self,
        name: DatabaseName,
        txn: Option<TxnId>,
        key: &[u8],
    ) -> Result<Vec<u8>> {
        self.validate_key(key)?;
        match self.merged_first_record(name, txn, key) {
            Err(BurrowError::KeyErasedInTxn) => Err(BurrowError::KeyNotFound),
            other => other,
        }
    }

    /// Erase `key` and all of its duplicates.
    pub fn erase(
        &mut self,
        name: DatabaseName,
        txn: Option<TxnId>,
        key: &[u8],
    ) -> Result<()> {
        self.validate_key(key)?;
        if !self.dbs.contains_key(&name) {
            return Err(BurrowError::DatabaseNotFound { name });
        }

        if let Some(tid) = txn {
            // The key must be visible under the transaction.
            match self.find(name, Some(tid), key) {
                Ok(_) => {}
                Err(BurrowError::KeyNotFound) => return Err(BurrowError::KeyNotFound),
                Err(e) => return Err(e),
            }
            self.check_txn_conflict_with_others(name, tid, key)?;
            let state = self
                .txns
                .get_mut(&tid)
                .ok_or_else(|| BurrowError::inv_parameter("unknown transaction"))?;
            state.push_op(name, key.to_vec(), TxnOpKind::Erase { dup_index: None });
            return Ok(());
        }

        self.uncouple_db_cursors(name)?;
        let db_state = self.dbs.get_mut(&name).expect("checked above");
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
        btree.erase(&mut env, None, key)
    }

    // --- Internals shared with the cursor layer ---

    pub(crate) fn validate_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > usize::from(u16::MAX) {
            return Err(BurrowError::inv_parameter("key exceeds 65535 bytes"));
        }
        Ok(())
    }

    /// Conflict rules for a transactional write to `key`.
    pub(crate) fn check_txn_write(
        &mut self,
        name: DatabaseName,
        tid: TxnId,
        key: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        self.check_txn_conflict_with_others(name, tid, key)?;

        let relaxed =
            flags.contains(InsertFlags::OVERWRITE) || flags.contains(InsertFlags::DUPLICATE);
        if relaxed {
            return Ok(());
        }

        let own_written = self
            .txns
            .get(&tid)
            .ok_or_else(|| BurrowError::inv_parameter("unknown transaction"))?
            .key_state(name, key)
            == KeyTxnState::Written;
        if own_written {
            return Err(BurrowError::TxnConflict);
        }

        // A committed key also rejects a plain insert.
        if self.btree_find_pos(name, tid, key)?.is_some() {
            return Err(BurrowError::DuplicateKey);
        }
        Ok(())
    }

    /// A write collides with any other transaction's in-flight ops.
    pub(crate) fn check_txn_conflict_with_others(
        &self,
        name: DatabaseName,
        tid: TxnId,
        key: &[u8],
    ) -> Result<()> {
        for (other_id, other) in &self.txns {
            if *other_id != tid && other.ops_for(name, key).next().is_some() {
                return Err(BurrowError::TxnConflict);
            }
        }
        Ok(())
    }

    /// Exact btree lookup, registering pages with the transaction.
    pub(crate) fn btree_find_pos(
        &mut self,
        name: DatabaseName,
        tid: TxnId,
        key: &[u8],
    ) -> Result<Option<burrow_btree::BtreePos>> {
        let db_state = self
            .dbs
            .get_mut(&name)
            .ok_or(BurrowError::DatabaseNotFound { name })?;
        let DbState {
            ref btree,
            ref mut extkeys,
            ref comparator,
            ..
        } = *db_state;
        let txn_state = self.txns.get_mut(&tid);
        let mut env = KeyEnv {
            pager: &mut self.pager,
            blobs: &mut self.blobs,
            extkeys,
            comparator,
        };
        btree.find(&mut env, txn_state.map(|t| &mut t.pages), key)
    }

    /// Detach every btree-coupled cursor of `name` onto a key copy, so
    /// that a structural change cannot leave positions dangling.
    pub(crate) fn uncouple_db_cursors(&mut self, name: DatabaseName) -> Result<()> {
        let ids: Vec<CursorId> = self
            .cursors
            .iter()
            .filter(|(_, c)| c.db == name)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.uncouple_cursor(id)?;
        }
        Ok(())
    }
}
