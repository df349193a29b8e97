//! Metadata reader: per-document access through the block cache

use super::block::MetaDataBlock;
use super::cache::MetaDataBlockCache;
use crate::error::Result;
use crate::types::{Index, ScalarValue};
use std::sync::Arc;

pub struct MetaDataReader {
    cache: Arc<MetaDataBlockCache>,
    current: Option<Arc<MetaDataBlock>>,
    docno: Index,
}

impl MetaDataReader {
    pub fn new(cache: Arc<MetaDataBlockCache>) -> Self {
        Self {
            cache,
            current: None,
            docno: 0,
        }
    }

    pub fn element_handle(&self, name: &str) -> Result<Index> {
        self.cache.descr().element_handle(name)
    }

    pub fn has_element(&self, name: &str) -> bool {
        self.cache.descr().has_element(name)
    }

    pub fn nof_elements(&self) -> usize {
        self.cache.descr().nof_elements()
    }

    pub fn element_type(&self, handle: Index) -> Result<&'static str> {
        Ok(self.cache.descr().element(handle)?.mtype.type_name())
    }

    pub fn element_name(&self, handle: Index) -> Result<String> {
        Ok(self.cache.descr().element(handle)?.name.clone())
    }

    /// Position the reader on `docno`.
    pub fn skip_doc(&mut self, docno: Index) -> Result<()> {
        if docno != self.docno || self.current.is_none() {
            let blk = self.cache.get(docno)?;
            self.current = Some(blk);
            self.docno = docno;
        }
        Ok(())
    }

    /// Value of the column `handle` for the current document.
    pub fn get_value(&self, handle: Index) -> Result<ScalarValue> {
        match &self.current {
            Some(blk) => blk.get_value(MetaDataBlock::row_of(self.docno), handle),
            None => Ok(ScalarValue::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, DatabaseKey, KeyFamily, MemDatabase, WriteBatch};
    use crate::metadata::MetaDataDescription;

    #[test]
    fn reads_through_cache() {
        let db = Arc::new(MemDatabase::ephemeral());
        let descr = Arc::new(MetaDataDescription::parse("doclen:uint16").unwrap());
        let mut blk = MetaDataBlock::new(Arc::clone(&descr), 0);
        blk.set_value(3, 0, &ScalarValue::UInt(11)).unwrap();
        let mut batch = WriteBatch::new();
        batch.put(
            DatabaseKey::with_elem(KeyFamily::MetaData, 0).into_bytes(),
            blk.to_bytes(),
        );
        db.write(batch, false).unwrap();

        let cache = Arc::new(MetaDataBlockCache::new(db, descr, 1 << 20));
        let mut reader = MetaDataReader::new(cache);
        let handle = reader.element_handle("doclen").unwrap();
        reader.skip_doc(3).unwrap();
        assert_eq!(reader.get_value(handle).unwrap(), ScalarValue::UInt(11));
        reader.skip_doc(4).unwrap();
        assert_eq!(reader.get_value(handle).unwrap(), ScalarValue::UInt(0));
        assert!(reader.element_handle("nope").is_err());
    }
}
