//! Chain store for the dingo node.
//!
//! The canonical chain is a volatile suffix of at most `k` blocks held in
//! memory plus an immutable prefix flushed to a persistent store. Writers
//! (the chain-extension pipeline) take an exclusive lock around append and
//! rollback; readers take a shared lock for snapshots. Followers observe
//! the chain through [`ChainIter`], which reports rollbacks in-band.

mod chain;
mod iterator;
pub mod stores;

pub use chain::{ChainError, ChainStore};
pub use iterator::{ChainIter, ChainUpdate};
pub use stores::{Store, StoreBuilder, StoredBlock};
