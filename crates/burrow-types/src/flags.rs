//! Flag sets recognized by the environment, databases, pager and cursors.

bitflags::bitflags! {
    /// Environment open/create flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EnvFlags: u32 {
        /// Never touch disk; pages live in an arena. The extended-key cache
        /// is disabled in this mode.
        const IN_MEMORY_DB = 1 << 0;
        /// Use memory-mapped I/O for page reads; page buffers are the map.
        const USE_MMAP = 1 << 1;
        /// Flush dirty pages on every cache put.
        const WRITE_THROUGH = 1 << 2;
        /// Allow begin/commit/abort and the txn-coupled cursor mode.
        const ENABLE_TRANSACTIONS = 1 << 3;
        /// Reserved; the backend factory rejects this as unsupported.
        const USE_HASH = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Per-database flags, persisted in the directory slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DbFlags: u32 {
        /// A key may carry more than one record.
        const ENABLE_DUPLICATES = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Flags steering a single pager fetch/alloc/flush call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageIoFlags: u32 {
        /// Fetch: return a miss instead of reading from the device.
        const ONLY_FROM_CACHE = 1 << 0;
        /// Alloc: extend the file without consulting the freelist.
        const IGNORE_FREELIST = 1 << 1;
        /// Flush-all: write dirty pages but keep the descriptors alive.
        const NO_DELETE = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Flags for a single cursor move call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CursorMoveFlags: u32 {
        const FIRST = 1 << 0;
        const LAST = 1 << 1;
        const NEXT = 1 << 2;
        const PREVIOUS = 1 << 3;
        /// Skip over remaining duplicates of the current key.
        const SKIP_DUPLICATES = 1 << 4;
        /// Stay within the duplicates of the current key.
        const ONLY_DUPLICATES = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Flags for insert/overwrite operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InsertFlags: u32 {
        /// Replace the record if the key exists.
        const OVERWRITE = 1 << 0;
        /// Append a duplicate if the key exists (needs `ENABLE_DUPLICATES`).
        const DUPLICATE = 1 << 1;
    }
}
