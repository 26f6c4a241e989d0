use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for burrowdb operations.
///
/// Structured variants for the conditions the storage core raises itself;
/// device-level failures arrive through the `Io` conversion. Invariant
/// violations (writing a buffer-less page, device reads for an in-memory
/// database, double-inserting an extended key) are programming errors and
/// assert instead of surfacing here.
#[derive(Error, Debug)]
pub enum BurrowError {
    // === Environment / file errors ===
    /// The file exists but does not carry the burrowdb magic.
    #[error("file is not a burrowdb environment: '{path}'")]
    NotAnEnvironment { path: PathBuf },

    /// The file format version is newer than this build understands.
    #[error("unsupported format version {found} (this build reads up to {supported})")]
    VersionMismatch { found: u32, supported: u32 },

    /// All database directory slots in the environment header are taken.
    #[error("environment is full: all {max} database slots are in use")]
    EnvironmentFull { max: u16 },

    /// A database with this name is already open.
    #[error("database {name} is already open")]
    DatabaseAlreadyOpen { name: u16 },

    /// No database with this name exists in the environment.
    #[error("database {name} not found")]
    DatabaseNotFound { name: u16 },

    // === I/O errors ===
    /// Device-layer I/O failure (read, write, seek, truncate, map, unmap).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Fewer bytes than expected came back from a positional read.
    #[error("short read at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    // === Resource errors ===
    /// A buffer or structure allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// The page cache (or the combined page + extended-key budget) cannot
    /// admit another entry. The caller may flush and retry.
    #[error("cache is full")]
    CacheFull,

    // === Lookup / traversal results ===
    /// The key does not exist, or a cursor ran off the end of the key space.
    #[error("key not found")]
    KeyNotFound,

    /// A btree hit is shadowed by an erase in the current transaction.
    #[error("key was erased in the current transaction")]
    KeyErasedInTxn,

    // === Write conflicts ===
    /// An insert collides with an in-flight op on the same key.
    #[error("conflict with an uncommitted operation on the same key")]
    TxnConflict,

    /// The key already exists and neither overwrite nor duplicates were
    /// requested.
    #[error("duplicate key")]
    DuplicateKey,

    // === Usage errors ===
    /// A parameter failed validation.
    #[error("invalid parameter: {detail}")]
    InvParameter { detail: String },

    /// The requested backend or mode is not supported (e.g. hash indexes).
    #[error("unsupported operation")]
    Unsupported,

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl BurrowError {
    /// Create an invalid-parameter error.
    pub fn inv_parameter(detail: impl Into<String>) -> Self {
        Self::InvParameter {
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is informational rather than a failure.
    ///
    /// `KeyNotFound` and `KeyErasedInTxn` are expected outcomes of lookups
    /// and traversal; everything else aborts the calling operation.
    #[must_use]
    pub const fn is_informational(&self) -> bool {
        matches!(self, Self::KeyNotFound | Self::KeyErasedInTxn)
    }

    /// Whether the caller can recover by flushing caches and retrying.
    #[must_use]
    pub const fn is_cache_pressure(&self) -> bool {
        matches!(self, Self::CacheFull)
    }
}

/// Result type alias using `BurrowError`.
pub type Result<T> = std::result::Result<T, BurrowError>;
