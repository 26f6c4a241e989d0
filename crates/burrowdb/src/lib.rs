//! burrowdb: an embedded, single-process, sorted key-value storage
//! engine.
//!
//! One environment is one file (or a purely in-memory arena) hosting
//! multiple named databases. Keys are kept sorted by a per-database
//! comparator; cursors traverse them with transactional isolation for a
//! bounded set of in-flight updates.
//!
//! ```no_run
//! use burrowdb::{Environment, EnvConfig, EnvFlags, DbConfig, DbFlags, InsertFlags};
//!
//! # fn main() -> burrowdb::Result<()> {
//! let mut env = Environment::create(
//!     Some(std::path::Path::new("data.brw")),
//!     EnvFlags::empty(),
//!     &EnvConfig::default(),
//! )?;
//! env.create_database(1, DbFlags::empty(), &DbConfig::default())?;
//! env.insert(1, None, b"key", b"record", InsertFlags::default())?;
//! assert_eq!(env.find(1, None, b"key")?, b"record");
//! env.close()?;
//! # Ok(())
//! # }
//! ```

mod cursor;
mod db;
mod dump;
mod env;
mod header;
mod txn;

pub use burrow_error::{BurrowError, Result};
pub use burrow_types::flags::{CursorMoveFlags, DbFlags, EnvFlags, InsertFlags};
pub use burrow_types::{DatabaseName, DbConfig, EnvConfig, PageSize};
pub use cursor::Sides;
pub use env::{CursorId, Environment};
pub use txn::TxnId;
