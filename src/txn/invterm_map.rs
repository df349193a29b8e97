//! Staged inverse-term blocks

use crate::blocks::{InvTerm, InvTermBlock};
use crate::database::{DatabaseKey, KeyFamily, WriteBatch};
use crate::error::Result;
use crate::keymap::is_unknown;
use crate::types::Index;
use ahash::AHashMap;

#[derive(Default)]
pub struct InvTermMap {
    puts: AHashMap<Index, Vec<InvTerm>>,
    deletes: Vec<Index>,
}

impl InvTermMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_block(&mut self, docno: Index, entries: Vec<InvTerm>) {
        self.puts.insert(docno, entries);
    }

    pub fn delete_block(&mut self, docno: Index) {
        self.puts.remove(&docno);
        self.deletes.push(docno);
    }

    pub fn rename_new_docnos(&mut self, rename: &AHashMap<Index, Index>) {
        let renamed: Vec<_> = self
            .puts
            .drain()
            .map(|(docno, v)| {
                let docno = if is_unknown(docno) {
                    *rename.get(&docno).unwrap_or(&docno)
                } else {
                    docno
                };
                (docno, v)
            })
            .collect();
        self.puts.extend(renamed);
    }

    pub fn rename_new_termnos(&mut self, rename: &AHashMap<Index, Index>) {
        for entries in self.puts.values_mut() {
            for e in entries.iter_mut() {
                if is_unknown(e.termno) {
                    e.termno = *rename.get(&e.termno).unwrap_or(&e.termno);
                }
            }
        }
    }

    pub fn get_write_batch(&mut self, batch: &mut WriteBatch) -> Result<()> {
        for docno in self.deletes.drain(..) {
            batch.delete(DatabaseKey::with_elem(KeyFamily::InvTerm, docno).into_bytes());
        }
        for (docno, entries) in std::mem::take(&mut self.puts) {
            let mut blk = InvTermBlock::from_bytes(docno, &[]);
            for e in &entries {
                blk.append(e);
            }
            batch.put(
                DatabaseKey::with_elem(KeyFamily::InvTerm, docno).into_bytes(),
                blk.to_bytes(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, MemDatabase};

    #[test]
    fn put_and_delete() {
        let db = MemDatabase::ephemeral();
        let mut map = InvTermMap::new();
        map.define_block(
            5,
            vec![InvTerm {
                typeno: 1,
                termno: 2,
                ff: 3,
                firstpos: 1,
            }],
        );
        let mut batch = WriteBatch::new();
        map.get_write_batch(&mut batch).unwrap();
        db.write(batch, false).unwrap();
        let key = DatabaseKey::with_elem(KeyFamily::InvTerm, 5);
        let bytes = db.get(key.as_bytes()).unwrap().unwrap();
        let blk = InvTermBlock::from_bytes(5, &bytes);
        assert_eq!(blk.entries().unwrap().len(), 1);

        let mut map = InvTermMap::new();
        map.delete_block(5);
        let mut batch = WriteBatch::new();
        map.get_write_batch(&mut batch).unwrap();
        db.write(batch, false).unwrap();
        assert!(db.get(key.as_bytes()).unwrap().is_none());
    }
}
