//! Staged document-frequency deltas

use crate::codec;
use crate::database::{Database, DatabaseKey, KeyFamily, WriteBatch};
use crate::error::{Result, StorageError};
use crate::keymap::is_unknown;
use crate::types::Index;
use ahash::AHashMap;

#[derive(Default)]
pub struct DocFrequencyMap {
    map: AHashMap<(Index, Index), i64>,
}

impl DocFrequencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, typeno: Index, termno: Index) {
        *self.map.entry((typeno, termno)).or_insert(0) += 1;
    }

    pub fn decrement(&mut self, typeno: Index, termno: Index) {
        *self.map.entry((typeno, termno)).or_insert(0) -= 1;
    }

    pub fn rename_new_termnos(&mut self, rename: &AHashMap<Index, Index>) -> Result<()> {
        let entries: Vec<_> = self.map.drain().collect();
        for ((typeno, termno), delta) in entries {
            let termno = if is_unknown(termno) {
                *rename.get(&termno).ok_or_else(|| {
                    StorageError::CorruptData(
                        "term number undefined in document frequency map".into(),
                    )
                })?
            } else {
                termno
            };
            *self.map.entry((typeno, termno)).or_insert(0) += delta;
        }
        Ok(())
    }

    pub fn get_write_batch(&mut self, db: &dyn Database, batch: &mut WriteBatch) -> Result<()> {
        for ((typeno, termno), delta) in std::mem::take(&mut self.map) {
            if delta == 0 {
                continue;
            }
            let key = DatabaseKey::with_elems(KeyFamily::DocFrequency, &[typeno, termno]);
            let old = match db.get(key.as_bytes())? {
                Some(bytes) => codec::unpack_global_counter(&bytes)?.0 as i64,
                None => 0,
            };
            let df = old + delta;
            if df < 0 {
                return Err(StorageError::CorruptData(
                    "document frequency became negative".into(),
                ));
            }
            let mut value = Vec::new();
            codec::pack_global_counter(&mut value, df as u64)?;
            batch.put(key.into_bytes(), value);
        }
        Ok(())
    }
}
