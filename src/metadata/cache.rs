//! Metadata block cache
//!
//! Shared LRU over loaded metadata blocks. Readers go through the cache;
//! a commit publishes its refresh list here so changed blocks are dropped
//! and reloaded on the next access.

use super::block::{MetaDataBlock, METADATA_BLOCK_ROWS};
use super::description::MetaDataDescription;
use crate::database::{Database, DatabaseKey, KeyFamily};
use crate::error::Result;
use crate::types::Index;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

pub struct MetaDataBlockCache {
    db: Arc<dyn Database>,
    descr: Arc<MetaDataDescription>,
    cache: Mutex<LruCache<Index, Arc<MetaDataBlock>>>,
}

impl MetaDataBlockCache {
    /// `budget` is the configured cache size in bytes; at least one block is
    /// always held.
    pub fn new(db: Arc<dyn Database>, descr: Arc<MetaDataDescription>, budget: usize) -> Self {
        let block_bytes = (descr.bytesize().max(1)) * METADATA_BLOCK_ROWS;
        let capacity = (budget / block_bytes).max(1);
        Self {
            db,
            descr,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("nonzero cache capacity"),
            )),
        }
    }

    pub fn descr(&self) -> &Arc<MetaDataDescription> {
        &self.descr
    }

    /// Block covering `docno`, loaded through the cache. Absent blocks read
    /// as zeroed rows.
    pub fn get(&self, docno: Index) -> Result<Arc<MetaDataBlock>> {
        let blockno = MetaDataBlock::blockno_of(docno);
        if let Some(blk) = self.cache.lock().get(&blockno) {
            return Ok(Arc::clone(blk));
        }
        let key = DatabaseKey::with_elem(KeyFamily::MetaData, blockno);
        let blk = match self.db.get(key.as_bytes())? {
            Some(bytes) => {
                MetaDataBlock::from_bytes(Arc::clone(&self.descr), blockno, &bytes)?
            }
            None => MetaDataBlock::new(Arc::clone(&self.descr), blockno),
        };
        let blk = Arc::new(blk);
        self.cache.lock().put(blockno, Arc::clone(&blk));
        Ok(blk)
    }

    /// Drop the blocks named by a commit's refresh list.
    pub fn refresh(&self, blocknos: &[Index]) {
        let mut cache = self.cache.lock();
        for bn in blocknos {
            cache.pop(bn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{MemDatabase, WriteBatch};
    use crate::types::ScalarValue;

    fn setup() -> (Arc<MemDatabase>, Arc<MetaDataDescription>) {
        (
            Arc::new(MemDatabase::ephemeral()),
            Arc::new(MetaDataDescription::parse("doclen:uint16").unwrap()),
        )
    }

    #[test]
    fn absent_blocks_read_zero() {
        let (db, descr) = setup();
        let cache = MetaDataBlockCache::new(db, descr, 1024 * 1024);
        let blk = cache.get(5).unwrap();
        assert_eq!(blk.get_value(5, 0).unwrap(), ScalarValue::UInt(0));
    }

    #[test]
    fn refresh_invalidates() {
        let (db, descr) = setup();
        let cache = MetaDataBlockCache::new(Arc::clone(&db) as Arc<dyn Database>, Arc::clone(&descr), 1024 * 1024);
        // cache the zeroed block first
        assert_eq!(
            cache.get(7).unwrap().get_value(7, 0).unwrap(),
            ScalarValue::UInt(0)
        );
        // write the block behind the cache
        let mut blk = MetaDataBlock::new(Arc::clone(&descr), 0);
        blk.set_value(7, 0, &ScalarValue::UInt(9)).unwrap();
        let mut batch = WriteBatch::new();
        batch.put(
            DatabaseKey::with_elem(KeyFamily::MetaData, 0).into_bytes(),
            blk.to_bytes(),
        );
        db.write(batch, false).unwrap();
        // stale until refreshed
        assert_eq!(
            cache.get(7).unwrap().get_value(7, 0).unwrap(),
            ScalarValue::UInt(0)
        );
        cache.refresh(&[0]);
        assert_eq!(
            cache.get(7).unwrap().get_value(7, 0).unwrap(),
            ScalarValue::UInt(9)
        );
    }
}
