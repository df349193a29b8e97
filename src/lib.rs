//! searchstore: storage and retrieval engine for structured full-text search
//!
//! Persists an inverted index, a forward index, per-document metadata,
//! attributes and access control lists on top of an ordered key-value
//! store, and exposes posting-list iterators, structure iterators and
//! weighting primitives for a query evaluator built above it.
//!
//! ## Layers
//! - store boundary: ordered byte map with batched writes (`database`)
//! - leaf blocks: packed variable-length postings, ~1 KiB each (`blocks`)
//! - interning: string ↔ id key maps with deferred allocation (`keymap`)
//! - transactions: staged updates, one batched commit (`txn`)
//! - read side: posting/structure iterators, metadata readers (`iterator`,
//!   `metadata`)
//! - scoring: formula interpreter and weighting functions (`weighting`)

pub mod blocks;
pub mod codec;
pub mod config;
pub mod database;
pub mod iterator;
pub mod keymap;
pub mod metadata;
pub mod stats;
pub mod storage;
pub mod txn;
pub mod types;
pub mod weighting;

mod error;

pub use config::StorageConfig;
pub use error::{Result, StorageError};
pub use storage::Storage;
pub use txn::{StorageDocument, StorageTransaction};
pub use types::{DocNo, GlobalCounter, Index, IndexRange, Position, ScalarValue};
