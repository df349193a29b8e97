//! Staged metadata updates
//!
//! Values stage per `(docno, element handle)`; at commit they are grouped
//! by block number, merged into the loaded blocks and emitted together with
//! the refresh list for the shared block cache.

use crate::database::{Database, DatabaseKey, KeyFamily, WriteBatch};
use crate::error::Result;
use crate::keymap::is_unknown;
use crate::metadata::{MetaDataBlock, MetaDataDescription};
use crate::types::{Index, ScalarValue};
use ahash::AHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Default)]
pub struct MetaDataMap {
    map: BTreeMap<(Index, Index), ScalarValue>,
}

impl MetaDataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, docno: Index, handle: Index, value: ScalarValue) {
        self.map.insert((docno, handle), value);
    }

    /// Stage clearing of every column of a document.
    pub fn delete_document(&mut self, docno: Index, descr: &MetaDataDescription) {
        for handle in 0..descr.nof_elements() as Index {
            self.map.insert((docno, handle), ScalarValue::Null);
        }
    }

    pub fn rename_new_docnos(&mut self, rename: &AHashMap<Index, Index>) {
        let moved: Vec<((Index, Index), ScalarValue)> = self
            .map
            .iter()
            .filter(|((d, _), _)| is_unknown(*d))
            .map(|(k, v)| (*k, *v))
            .collect();
        for ((docno, handle), value) in moved {
            self.map.remove(&(docno, handle));
            let stable = *rename.get(&docno).unwrap_or(&docno);
            self.map.insert((stable, handle), value);
        }
    }

    /// Merge staged values into their blocks. Returns the block numbers
    /// whose contents changed so the shared cache can drop them.
    pub fn get_write_batch(
        &mut self,
        db: &dyn Database,
        descr: &Arc<MetaDataDescription>,
        batch: &mut WriteBatch,
        refresh_list: &mut Vec<Index>,
    ) -> Result<()> {
        if descr.is_empty() {
            self.map.clear();
            return Ok(());
        }
        let mut current: Option<MetaDataBlock> = None;
        for ((docno, handle), value) in std::mem::take(&mut self.map) {
            let blockno = MetaDataBlock::blockno_of(docno);
            if current.as_ref().map(|b| b.blockno()) != Some(blockno) {
                if let Some(done) = current.take() {
                    batch.put(
                        DatabaseKey::with_elem(KeyFamily::MetaData, done.blockno()).into_bytes(),
                        done.to_bytes(),
                    );
                }
                let key = DatabaseKey::with_elem(KeyFamily::MetaData, blockno);
                let blk = match db.get(key.as_bytes())? {
                    Some(bytes) => MetaDataBlock::from_bytes(Arc::clone(descr), blockno, &bytes)?,
                    None => MetaDataBlock::new(Arc::clone(descr), blockno),
                };
                refresh_list.push(blockno);
                current = Some(blk);
            }
            current
                .as_mut()
                .expect("block loaded")
                .set_value(MetaDataBlock::row_of(docno), handle, &value)?;
        }
        if let Some(done) = current.take() {
            batch.put(
                DatabaseKey::with_elem(KeyFamily::MetaData, done.blockno()).into_bytes(),
                done.to_bytes(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemDatabase;

    #[test]
    fn group_by_block_and_refresh() {
        let db = MemDatabase::ephemeral();
        let descr = Arc::new(MetaDataDescription::parse("doclen:uint16").unwrap());
        let mut map = MetaDataMap::new();
        map.define(1, 0, ScalarValue::UInt(3));
        map.define(1500, 0, ScalarValue::UInt(9));
        let mut batch = WriteBatch::new();
        let mut refresh = Vec::new();
        map.get_write_batch(&db, &descr, &mut batch, &mut refresh)
            .unwrap();
        assert_eq!(refresh, vec![0, 1]);
        assert_eq!(batch.len(), 2);
        db.write(batch, false).unwrap();

        let key = DatabaseKey::with_elem(KeyFamily::MetaData, 1);
        let bytes = db.get(key.as_bytes()).unwrap().unwrap();
        let blk = MetaDataBlock::from_bytes(descr, 1, &bytes).unwrap();
        assert_eq!(
            blk.get_value(MetaDataBlock::row_of(1500), 0).unwrap(),
            ScalarValue::UInt(9)
        );
    }
}
