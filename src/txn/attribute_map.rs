//! Staged document attribute updates

use super::scan_family_keys;
use crate::database::{Database, DatabaseKey, KeyFamily, WriteBatch};
use crate::error::Result;
use crate::keymap::is_unknown;
use crate::types::Index;
use ahash::AHashMap;

#[derive(Default)]
pub struct AttributeMap {
    map: AHashMap<(Index, Index), Option<String>>,
    delete_all: Vec<Index>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, docno: Index, attrno: Index, value: &str) {
        self.map.insert((docno, attrno), Some(value.to_string()));
    }

    pub fn delete(&mut self, docno: Index, attrno: Index) {
        self.map.insert((docno, attrno), None);
    }

    /// Stage erasure of every attribute of a document.
    pub fn delete_document(&mut self, docno: Index) {
        self.map.retain(|(d, _), _| *d != docno);
        self.delete_all.push(docno);
    }

    pub fn rename_new_docnos(&mut self, rename: &AHashMap<Index, Index>) {
        let renamed: Vec<_> = self
            .map
            .drain()
            .map(|((docno, attrno), v)| {
                let docno = if is_unknown(docno) {
                    *rename.get(&docno).unwrap_or(&docno)
                } else {
                    docno
                };
                ((docno, attrno), v)
            })
            .collect();
        self.map.extend(renamed);
    }

    pub fn get_write_batch(&mut self, db: &dyn Database, batch: &mut WriteBatch) -> Result<()> {
        for docno in self.delete_all.drain(..) {
            let prefix = DatabaseKey::with_elem(KeyFamily::DocAttribute, docno).into_bytes();
            for key in scan_family_keys(db, &prefix)? {
                batch.delete(key);
            }
        }
        for ((docno, attrno), value) in std::mem::take(&mut self.map) {
            let key = DatabaseKey::with_elems(KeyFamily::DocAttribute, &[docno, attrno]);
            match value {
                Some(v) => batch.put(key.into_bytes(), v.into_bytes()),
                None => batch.delete(key.into_bytes()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemDatabase;

    fn get(db: &MemDatabase, docno: Index, attrno: Index) -> Option<String> {
        let key = DatabaseKey::with_elems(KeyFamily::DocAttribute, &[docno, attrno]);
        db.get(key.as_bytes())
            .unwrap()
            .map(|b| String::from_utf8(b).unwrap())
    }

    #[test]
    fn define_delete_and_wipe() {
        let db = MemDatabase::ephemeral();
        let mut map = AttributeMap::new();
        map.define(1, 1, "title one");
        map.define(1, 2, "author");
        map.define(2, 1, "title two");
        let mut batch = WriteBatch::new();
        map.get_write_batch(&db, &mut batch).unwrap();
        db.write(batch, false).unwrap();
        assert_eq!(get(&db, 1, 1).as_deref(), Some("title one"));

        let mut map = AttributeMap::new();
        map.delete(2, 1);
        map.delete_document(1);
        let mut batch = WriteBatch::new();
        map.get_write_batch(&db, &mut batch).unwrap();
        db.write(batch, false).unwrap();
        assert_eq!(get(&db, 1, 1), None);
        assert_eq!(get(&db, 1, 2), None);
        assert_eq!(get(&db, 2, 1), None);
    }
}
