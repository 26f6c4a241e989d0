//! B+tree backend for burrowdb.
//!
//! This crate holds everything that understands key layout: the node
//! format over raw page bytes, the blob allocator for overflow key and
//! record payloads, the extended-key cache that memoizes reassembled long
//! keys, the two-stage key comparison protocol, and the tree operations
//! (find, insert, erase, ordered traversal) the cursor layer drives.
//!
//! The crate consumes the pager exclusively through `fetch_page`,
//! `alloc_page`, `flush_page` and `free_page`.

mod blob;
mod compare;
mod extkey;
mod node;
mod tree;

pub use blob::BlobStore;
pub use compare::{
    default_full_compare, default_prefix_compare, Comparator, FullCompareFn, KeyRef,
    PrefixCompareFn, PrefixDecision,
};
pub use extkey::ExtKeyCache;
pub use node::{node_capacity, Entry, RecordRef, KEY_IS_EXTENDED};
pub use tree::{Btree, BtreePos, KeyEnv};
