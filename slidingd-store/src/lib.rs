//! Persistence and concurrency for sliding HLL sets.
//!
//! A [`SetManager`] owns a name registry of [`Set`]s backed by one embedded
//! RocksDB instance. Sets start *proxied* (no in-memory state) and fault in
//! on first use; small sets live as sparse point lists directly in the store
//! and are promoted to dense registers when they outgrow the list.

mod config;
mod db;
mod error;
mod manager;
mod set;

pub use config::{reconcile_precision, StoreConfig};
pub use db::{SparseAdd, SparseDb, SparseState};
pub use error::{Error, Result};
pub use manager::{CreateOptions, SetListEntry, SetManager, MULTI_OP_SIZE};
pub use set::{CounterSnapshot, Set, SetConfig};
