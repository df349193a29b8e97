//! Metadata blocks: 1024 fixed-width rows
//!
//! Block id = docno / 1024, row = docno mod 1024. Blocks always carry the
//! full row array; deleting a document zeroes its row.

use super::description::{read_element, write_element, MetaDataDescription};
use crate::error::{Result, StorageError};
use crate::types::{Index, ScalarValue};
use std::sync::Arc;

/// Rows per metadata block.
pub const METADATA_BLOCK_ROWS: usize = 1024;

/// One document's row inside a block.
#[derive(Debug, Clone)]
pub struct MetaDataRecord {
    descr: Arc<MetaDataDescription>,
    row: Vec<u8>,
}

impl MetaDataRecord {
    pub fn empty(descr: Arc<MetaDataDescription>) -> Self {
        let row = vec![0u8; descr.bytesize()];
        Self { descr, row }
    }

    pub fn get_value(&self, handle: Index) -> Result<ScalarValue> {
        let elem = self.descr.element(handle)?;
        Ok(read_element(&self.row, elem))
    }
}

/// One loaded metadata block.
#[derive(Debug, Clone)]
pub struct MetaDataBlock {
    descr: Arc<MetaDataDescription>,
    blockno: Index,
    data: Vec<u8>,
}

impl MetaDataBlock {
    /// Block number covering `docno`.
    pub fn blockno_of(docno: Index) -> Index {
        docno / METADATA_BLOCK_ROWS as Index
    }

    /// Row index of `docno` inside its block.
    pub fn row_of(docno: Index) -> usize {
        (docno % METADATA_BLOCK_ROWS as Index) as usize
    }

    /// Fresh zeroed block.
    pub fn new(descr: Arc<MetaDataDescription>, blockno: Index) -> Self {
        let data = vec![0u8; descr.bytesize() * METADATA_BLOCK_ROWS];
        Self {
            descr,
            blockno,
            data,
        }
    }

    pub fn from_bytes(
        descr: Arc<MetaDataDescription>,
        blockno: Index,
        bytes: &[u8],
    ) -> Result<Self> {
        if bytes.len() != descr.bytesize() * METADATA_BLOCK_ROWS {
            return Err(StorageError::CorruptData(format!(
                "metadata block {} has wrong size {}",
                blockno,
                bytes.len()
            )));
        }
        Ok(Self {
            descr,
            blockno,
            data: bytes.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.clone()
    }

    pub fn blockno(&self) -> Index {
        self.blockno
    }

    pub fn descr(&self) -> &Arc<MetaDataDescription> {
        &self.descr
    }

    fn row_slice(&self, row: usize) -> &[u8] {
        let w = self.descr.bytesize();
        &self.data[row * w..(row + 1) * w]
    }

    /// Copy of the record at `row`.
    pub fn record(&self, row: usize) -> MetaDataRecord {
        MetaDataRecord {
            descr: Arc::clone(&self.descr),
            row: self.row_slice(row).to_vec(),
        }
    }

    pub fn get_value(&self, row: usize, handle: Index) -> Result<ScalarValue> {
        let elem = self.descr.element(handle)?;
        Ok(read_element(self.row_slice(row), elem))
    }

    pub fn set_value(&mut self, row: usize, handle: Index, value: &ScalarValue) -> Result<()> {
        let elem = self.descr.element(handle)?.clone();
        let w = self.descr.bytesize();
        let slice = &mut self.data[row * w..(row + 1) * w];
        if value.defined() {
            write_element(slice, &elem, value);
        } else {
            let at = elem.offset;
            slice[at..at + elem.mtype.byte_size()].fill(0);
        }
        Ok(())
    }

    /// Zero the whole row of a deleted document.
    pub fn clear_row(&mut self, row: usize) {
        let w = self.descr.bytesize();
        self.data[row * w..(row + 1) * w].fill(0);
    }

    /// True when every row is zero.
    pub fn is_all_zero(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descr() -> Arc<MetaDataDescription> {
        Arc::new(MetaDataDescription::parse("doclen:uint16,w:float32").unwrap())
    }

    #[test]
    fn addressing() {
        assert_eq!(MetaDataBlock::blockno_of(0), 0);
        assert_eq!(MetaDataBlock::blockno_of(1023), 0);
        assert_eq!(MetaDataBlock::blockno_of(1024), 1);
        assert_eq!(MetaDataBlock::row_of(1025), 1);
    }

    #[test]
    fn set_and_get() {
        let mut blk = MetaDataBlock::new(descr(), 0);
        blk.set_value(5, 0, &ScalarValue::UInt(42)).unwrap();
        blk.set_value(5, 1, &ScalarValue::Float(1.5)).unwrap();
        assert_eq!(blk.get_value(5, 0).unwrap(), ScalarValue::UInt(42));
        assert_eq!(blk.get_value(5, 1).unwrap(), ScalarValue::Float(1.5));
        // untouched rows read as zero
        assert_eq!(blk.get_value(6, 0).unwrap(), ScalarValue::UInt(0));
        assert!(blk.get_value(5, 9).is_err());
    }

    #[test]
    fn serialization_and_clear() {
        let mut blk = MetaDataBlock::new(descr(), 3);
        blk.set_value(0, 0, &ScalarValue::UInt(7)).unwrap();
        let bytes = blk.to_bytes();
        let mut back = MetaDataBlock::from_bytes(descr(), 3, &bytes).unwrap();
        assert_eq!(back.get_value(0, 0).unwrap(), ScalarValue::UInt(7));
        assert!(!back.is_all_zero());
        back.clear_row(0);
        assert!(back.is_all_zero());
    }

    #[test]
    fn wrong_size_rejected() {
        assert!(MetaDataBlock::from_bytes(descr(), 0, &[0u8; 10]).is_err());
    }
}
