//! Staged ff-block updates, mirroring the posinfo map on the `f` family

use super::scan_affected_blocks;
use crate::blocks::{FfBlock, FfBlockBuilder, BLOCK_SOFT_SIZE};
use crate::blocks::ff::FfCursor;
use crate::codec;
use crate::database::{Database, DatabaseKey, KeyFamily, WriteBatch};
use crate::error::Result;
use crate::keymap::is_unknown;
use crate::types::Index;
use ahash::AHashMap;
use std::collections::BTreeMap;

#[derive(Default)]
pub struct FfBlockMap {
    map: AHashMap<(Index, Index), BTreeMap<Index, Option<u32>>>,
}

impl FfBlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_ff(&mut self, typeno: Index, termno: Index, docno: Index, ff: u32) {
        self.map
            .entry((typeno, termno))
            .or_default()
            .insert(docno, Some(ff));
    }

    pub fn delete_ff(&mut self, typeno: Index, termno: Index, docno: Index) {
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
            let moved: Vec<(Index, Option<u32>)> = docs
                .iter()
                .filter(|(d, _)| is_unknown(**d))
                .map(|(d, f)| (*d, *f))
                .collect();
            for (d, f) in moved {
                docs.remove(&d);
                let stable = *rename.get(&d).unwrap_or(&d);
                docs.insert(stable, f);
            }
        }
    }

    pub fn get_write_batch(&mut self, db: &dyn Database, batch: &mut WriteBatch) -> Result<()> {
        for ((typeno, termno), staged) in std::mem::take(&mut self.map) {
            let Some((&first_affected, _)) = staged.iter().next() else {
                continue;
            };
            let prefix =
                DatabaseKey::with_elems(KeyFamily::FfBlock, &[typeno, termno]).into_bytes();
            let tail = scan_affected_blocks(db, &prefix, first_affected)?;

            let mut stream: BTreeMap<Index, u32> = BTreeMap::new();
            for (id, bytes) in &tail {
                let blk = FfBlock::from_bytes(*id, bytes)?;
                let mut cursor = FfCursor::default();
                let mut docno = blk.first_doc(&mut cursor);
                while docno != 0 {
                    stream.insert(docno, blk.ff_at(&cursor));
                    docno = blk.next_doc(&mut cursor);
                }
                let mut key = prefix.clone();
                codec::pack_index(&mut key, *id);
                batch.delete(key);
            }
            for (docno, ff) in staged {
                match ff {
                    Some(f) => {
                        stream.insert(docno, f);
                    }
                    None => {
                        stream.remove(&docno);
                    }
                }
            }

            let mut builder = FfBlockBuilder::new();
            let mut iter = stream.into_iter().peekable();
            while let Some((docno, ff)) = iter.next() {
                builder.append(docno, ff)?;
                if builder.byte_size() >= BLOCK_SOFT_SIZE || iter.peek().is_none() {
                    let blk = std::mem::take(&mut builder).build()?;
                    let mut key = prefix.clone();
                    codec::pack_index(&mut key, blk.id());
                    batch.put(key, blk.to_bytes());
                }
            }
        }
        Ok(())
    }
}
