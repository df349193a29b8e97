//! Ordered key-value store boundary
//!
//! The engine runs on any ordered byte-key / byte-value map that offers
//! point reads, forward cursors with upper-bound seek, and an atomic batched
//! write. [`MemDatabase`] is the bundled implementation backed by an ordered
//! in-memory map with an optional snapshot file.

mod key;
mod memdb;

pub use key::{DatabaseKey, KeyFamily, MAX_KEY_SIZE};
pub use memdb::MemDatabase;

use crate::error::Result;

/// One staged mutation of a [`WriteBatch`].
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Collects puts and deletes for one atomic write.
///
/// Later operations on the same key win, the store applies the batch in
/// order.
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Ordered byte-key / byte-value map.
pub trait Database: Send + Sync {
    /// Point read.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Apply all operations of `batch` atomically. With `sync` the write is
    /// durable before the call returns.
    fn write(&self, batch: WriteBatch, sync: bool) -> Result<()>;

    /// Fresh forward cursor over the current contents.
    fn cursor(&self) -> Box<dyn DatabaseCursor>;
}

/// Forward cursor over an ordered snapshot of the store.
pub trait DatabaseCursor: Send {
    /// Position on the first entry with key `>= key`. Returns that entry or
    /// `None` when no such entry exists.
    fn seek_upper_bound(&mut self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)>;

    /// Step to the entry after the current one.
    fn next(&mut self) -> Option<(Vec<u8>, Vec<u8>)>;
}
