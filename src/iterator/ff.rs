//! Ff posting iterator: docno and ff without positions
//!
//! Serves first-pass scoring where positions are not needed; reads the
//! compacted ff blocks, so reported frequencies may round up for large
//! values.

use super::posinfo::read_document_frequency;
use crate::blocks::{BlockCursor, FfBlock};
use crate::database::{Database, KeyFamily};
use crate::error::Result;
use crate::types::{GlobalCounter, Index};
use std::sync::Arc;

pub struct FfPostingIterator {
    db: Arc<dyn Database>,
    cursor: BlockCursor<FfBlock>,
    typeno: Index,
    termno: Index,
    docno: Index,
    df: Option<GlobalCounter>,
}

impl FfPostingIterator {
    pub fn new(db: Arc<dyn Database>, typeno: Index, termno: Index) -> Self {
        let cursor = BlockCursor::new(Arc::clone(&db), KeyFamily::FfBlock, &[typeno, termno]);
        Self {
            db,
            cursor,
            typeno,
            termno,
            docno: 0,
            df: None,
        }
    }

    pub fn docno(&self) -> Index {
        self.docno
    }

    pub fn skip_doc(&mut self, docno: Index) -> Result<Index> {
        if self.docno != 0 && self.docno == docno {
            return Ok(self.docno);
        }
        self.docno = self.cursor.skip_doc(docno)?;
        Ok(self.docno)
    }

    pub fn frequency(&self) -> u32 {
        if self.docno == 0 {
            return 0;
        }
        match self.cursor.current_block() {
            Some(blk) => blk.ff_at(self.cursor.current_block_cursor()),
            None => 0,
        }
    }

    pub fn document_frequency(&mut self) -> Result<GlobalCounter> {
        if let Some(df) = self.df {
            return Ok(df);
        }
        let df = read_document_frequency(self.db.as_ref(), self.typeno, self.termno)?;
        self.df = Some(df);
        Ok(df)
    }
}
