//! Staged posinfo updates
//!
//! Per `(typeno, termno)` the map stages per-document position lists
//! (`Some`) and removals (`None`). At commit the affected tail of the term's
//! block family is decoded, merged with the staged postings and re-cut at
//! the soft block size.

use super::scan_affected_blocks;
use crate::blocks::{PosinfoBlock, PosinfoBlockBuilder, BLOCK_SOFT_SIZE};
use crate::codec;
use crate::database::{Database, DatabaseKey, KeyFamily, WriteBatch};
use crate::error::Result;
use crate::keymap::is_unknown;
use crate::types::{Index, Position};
use ahash::AHashMap;
use std::collections::BTreeMap;

#[derive(Default)]
pub struct PosinfoBlockMap {
    map: AHashMap<(Index, Index), BTreeMap<Index, Option<Vec<Position>>>>,
}

impl PosinfoBlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Stage the posting of one document; positions must be sorted unique.
    pub fn define_posting(
        &mut self,
        typeno: Index,
        termno: Index,
        docno: Index,
        positions: Vec<Position>,
    ) {
        self.map
            .entry((typeno, termno))
            .or_default()
            .insert(docno, Some(positions));
    }

    pub fn delete_posting(&mut self, typeno: Index, termno: Index, docno: Index) {
        self.map
            .entry((typeno, termno))
            .or_default()
            .insert(docno, None);
    }

    pub fn rename_new_termnos(&mut self, rename: &AHashMap<Index, Index>) {
        let renamed: Vec<_> = self
            .map
            .drain()
            .map(|((typeno, termno), v)| {
                let termno = if is_unknown(termno) {
                    *rename.get(&termno).unwrap_or(&termno)
                } else {
                    termno
                };
                ((typeno, termno), v)
            })
            .collect();
        self.map.extend(renamed);
    }

    pub fn rename_new_docnos(&mut self, rename: &AHashMap<Index, Index>) {
        for docs in self.map.values_mut() {
            let moved: Vec<(Index, Option<Vec<Position>>)> = docs
                .iter()
                .filter(|(d, _)| is_unknown(**d))
                .map(|(d, p)| (*d, p.clone()))
                .collect();
            for (d, p) in moved {
                docs.remove(&d);
                let stable = *rename.get(&d).unwrap_or(&d);
                docs.insert(stable, p);
            }
        }
    }

    pub fn get_write_batch(&mut self, db: &dyn Database, batch: &mut WriteBatch) -> Result<()> {
        for ((typeno, termno), staged) in std::mem::take(&mut self.map) {
            let Some((&first_affected, _)) = staged.iter().next() else {
                continue;
            };
            let prefix =
                DatabaseKey::with_elems(KeyFamily::PosInfoBlock, &[typeno, termno]).into_bytes();
            let tail = scan_affected_blocks(db, &prefix, first_affected)?;

            // decode the stored tail into a per-doc stream
            let mut stream: BTreeMap<Index, Vec<Position>> = BTreeMap::new();
            for (id, bytes) in &tail {
                let blk = PosinfoBlock::from_bytes(*id, bytes)?;
                let mut cursor = 0;
                let mut docno = blk.first_doc(&mut cursor);
                while docno != 0 {
                    stream.insert(docno, blk.positions_at(cursor));
                    docno = blk.next_doc(&mut cursor);
                }
                let mut key = prefix.clone();
                codec::pack_index(&mut key, *id);
                batch.delete(key);
            }
            for (docno, positions) in staged {
                match positions {
                    Some(p) => {
                        stream.insert(docno, p);
                    }
                    None => {
                        stream.remove(&docno);
                    }
                }
            }

            // re-cut the merged stream
            let mut builder = PosinfoBlockBuilder::new();
            let mut iter = stream.into_iter().peekable();
            while let Some((docno, positions)) = iter.next() {
                builder.append(docno, &positions)?;
                if builder.byte_size() >= BLOCK_SOFT_SIZE || iter.peek().is_none() {
                    let blk = builder.build()?;
                    let mut key = prefix.clone();
                    codec::pack_index(&mut key, blk.id());
                    batch.put(key, blk.to_bytes());
                    builder = PosinfoBlockBuilder::new();
                }
            }
        }
        Ok(())
    }
}
