//! Staged structure updates

use super::scan_affected_blocks;
use crate::blocks::structure::{StructureBlock, StructureCursor};
use crate::blocks::{StructureBlockBuilder, BLOCK_SOFT_SIZE};
use crate::codec;
use crate::database::{Database, DatabaseKey, KeyFamily, WriteBatch};
use crate::error::Result;
use crate::keymap::is_unknown;
use crate::types::{Index, IndexRange};
use ahash::AHashMap;
use std::collections::BTreeMap;

type DocStructures = Vec<(IndexRange, Vec<IndexRange>)>;

#[derive(Default)]
pub struct StructureMap {
    map: BTreeMap<Index, Option<DocStructures>>,
}

impl StructureMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn define_document(&mut self, docno: Index, structures: DocStructures) {
        self.map.insert(docno, Some(structures));
    }

    pub fn delete_document(&mut self, docno: Index) {
        self.map.insert(docno, None);
    }

    pub fn rename_new_docnos(&mut self, rename: &AHashMap<Index, Index>) {
        let moved: Vec<(Index, Option<DocStructures>)> = self
            .map
            .iter()
            .filter(|(d, _)| is_unknown(**d))
            .map(|(d, s)| (*d, s.clone()))
            .collect();
        for (docno, structures) in moved {
            self.map.remove(&docno);
            let stable = *rename.get(&docno).unwrap_or(&docno);
            self.map.insert(stable, structures);
        }
    }

    pub fn get_write_batch(&mut self, db: &dyn Database, batch: &mut WriteBatch) -> Result<()> {
        if self.map.is_empty() {
            return Ok(());
        }
        let first_affected = *self.map.keys().next().expect("nonempty map");
        let prefix = DatabaseKey::new(KeyFamily::StructBlock).into_bytes();
        let tail = scan_affected_blocks(db, &prefix, first_affected)?;

        let mut stream: BTreeMap<Index, DocStructures> = BTreeMap::new();
        for (id, bytes) in &tail {
            let blk = StructureBlock::from_bytes(*id, bytes)?;
            let mut cursor = StructureCursor::default();
            let mut docno = blk.first_doc(&mut cursor);
            while docno != 0 {
                let defs = blk.defs_at(&cursor);
                let structures = defs
                    .iter()
                    .map(|d| {
                        let sinks = blk
                            .members_of(d)
                            .iter()
                            .map(|m| IndexRange::new(m.start as Index, m.end as Index))
                            .collect();
                        (
                            IndexRange::new(d.header_start as Index, d.header_end as Index),
                            sinks,
                        )
                    })
                    .collect();
                stream.insert(docno, structures);
                docno = blk.next_doc(&mut cursor);
            }
            let mut key = prefix.clone();
            codec::pack_index(&mut key, *id);
            batch.delete(key);
        }
        for (docno, structures) in std::mem::take(&mut self.map) {
            match structures {
                Some(s) if !s.is_empty() => {
                    stream.insert(docno, s);
                }
                _ => {
                    stream.remove(&docno);
                }
            }
        }

        let mut builder = StructureBlockBuilder::new();
        let mut iter = stream.into_iter().peekable();
        while let Some((docno, structures)) = iter.next() {
            builder.append(docno, &structures)?;
            if builder.byte_size() >= BLOCK_SOFT_SIZE || iter.peek().is_none() {
                let blk = std::mem::take(&mut builder).build()?;
                let mut key = prefix.clone();
                codec::pack_index(&mut key, blk.id());
                batch.put(key, blk.to_bytes());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemDatabase;
    use crate::iterator::StructIterator;
    use std::sync::Arc;

    #[test]
    fn stage_merge_and_delete() {
        let db = Arc::new(MemDatabase::ephemeral());
        let mut map = StructureMap::new();
        map.define_document(2, vec![(IndexRange::new(1, 3), vec![IndexRange::new(5, 6)])]);
        map.define_document(4, vec![(IndexRange::new(2, 2), vec![IndexRange::new(3, 3)])]);
        let mut batch = WriteBatch::new();
        map.get_write_batch(db.as_ref(), &mut batch).unwrap();
        db.write(batch, false).unwrap();

        let mut itr = StructIterator::new(Arc::clone(&db) as _);
        assert_eq!(itr.skip_doc(1).unwrap(), 2);
        assert_eq!(itr.skip_pos_source(0), IndexRange::new(1, 3));
        assert_eq!(itr.skip_pos_sink(0), IndexRange::new(5, 6));
        assert_eq!(itr.skip_doc(3).unwrap(), 4);

        let mut map = StructureMap::new();
        map.delete_document(2);
        let mut batch = WriteBatch::new();
        map.get_write_batch(db.as_ref(), &mut batch).unwrap();
        db.write(batch, false).unwrap();
        let mut itr = StructIterator::new(Arc::clone(&db) as _);
        assert_eq!(itr.skip_doc(1).unwrap(), 4);
    }
}
