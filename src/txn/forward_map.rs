//! Staged forward-index updates
//!
//! Tokens stage per `(typeno, docno)`; at commit each document's tokens are
//! cut into position-keyed blocks. Document deletion walks all term types
//! and erases the `(typeno, docno)` prefixes.

use super::scan_family_keys;
use crate::blocks::{ForwardIndexBlock, BLOCK_SOFT_SIZE};
use crate::codec;
use crate::database::{Database, DatabaseKey, KeyFamily, WriteBatch};
use crate::error::Result;
use crate::keymap::is_unknown;
use crate::types::{Index, Position};
use ahash::AHashMap;
use std::collections::BTreeMap;

#[derive(Default)]
pub struct ForwardIndexMap {
    map: AHashMap<(Index, Index), BTreeMap<Position, String>>,
    deleted_docs: Vec<Index>,
}

impl ForwardIndexMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_term(&mut self, typeno: Index, docno: Index, pos: Position, value: &str) {
        self.map
            .entry((typeno, docno))
            .or_default()
            .insert(pos, value.to_string());
    }

    /// Stage erasure of every forward-index record of a document.
    pub fn delete_document(&mut self, docno: Index) {
        self.deleted_docs.push(docno);
        self.map.retain(|(_, d), _| *d != docno);
    }

    pub fn rename_new_docnos(&mut self, rename: &AHashMap<Index, Index>) {
        let renamed: Vec<_> = self
            .map
            .drain()
            .map(|((typeno, docno), v)| {
                let docno = if is_unknown(docno) {
                    *rename.get(&docno).unwrap_or(&docno)
                } else {
                    docno
                };
                ((typeno, docno), v)
            })
            .collect();
        self.map.extend(renamed);
    }

    /// `max_typeno` bounds the type scan for staged document deletions.
    pub fn get_write_batch(
        &mut self,
        db: &dyn Database,
        max_typeno: Index,
        batch: &mut WriteBatch,
    ) -> Result<()> {
        for docno in self.deleted_docs.drain(..) {
            for typeno in 1..=max_typeno {
                let prefix =
                    DatabaseKey::with_elems(KeyFamily::ForwardIndex, &[typeno, docno])
                        .into_bytes();
                for key in scan_family_keys(db, &prefix)? {
                    batch.delete(key);
                }
            }
        }
        for ((typeno, docno), tokens) in std::mem::take(&mut self.map) {
            let prefix =
                DatabaseKey::with_elems(KeyFamily::ForwardIndex, &[typeno, docno]).into_bytes();
            // replacing a document: the old position blocks go away first
            for key in scan_family_keys(db, &prefix)? {
                batch.delete(key);
            }
            let mut pending: Vec<(Position, String)> = Vec::new();
            let mut pending_size = 0usize;
            let mut iter = tokens.into_iter().peekable();
            while let Some((pos, token)) = iter.next() {
                pending_size += token.len() + 2;
                pending.push((pos, token));
                if pending_size >= BLOCK_SOFT_SIZE || iter.peek().is_none() {
                    let id = pending.last().expect("nonempty chunk").0;
                    let mut blk = ForwardIndexBlock::from_bytes(id, &[]);
                    for (p, tok) in pending.drain(..) {
                        blk.append(p, &tok)?;
                    }
                    let mut key = prefix.clone();
                    codec::pack_index(&mut key, id);
                    batch.put(key, blk.to_bytes());
                    pending_size = 0;
                }
            }
        }
        Ok(())
    }
}
