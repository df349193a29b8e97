//! Posinfo iterator: docno and position traversal over posinfo blocks

use crate::blocks::{BlockCursor, PosinfoBlock};
use crate::codec;
use crate::database::{Database, DatabaseKey, KeyFamily};
use crate::error::{Result, StorageError};
use crate::types::{GlobalCounter, Index, Position};
use std::sync::Arc;

pub struct PosinfoIterator {
    db: Arc<dyn Database>,
    cursor: BlockCursor<PosinfoBlock>,
    typeno: Index,
    termno: Index,
    docno: Index,
    scan_itr: usize,
    scan_active: bool,
    df: Option<GlobalCounter>,
}

impl PosinfoIterator {
    pub fn new(db: Arc<dyn Database>, typeno: Index, termno: Index) -> Self {
        let cursor = BlockCursor::new(Arc::clone(&db), KeyFamily::PosInfoBlock, &[typeno, termno]);
        Self {
            db,
            cursor,
            typeno,
            termno,
            docno: 0,
            scan_itr: 0,
            scan_active: false,
            df: None,
        }
    }

    pub fn docno(&self) -> Index {
        self.docno
    }

    /// Whether the target docno lies inside the loaded block.
    pub fn is_close_candidate(&self, docno: Index) -> bool {
        self.cursor.is_close_candidate(docno)
    }

    /// Smallest docno `>= docno` carrying postings of the term, or 0.
    pub fn skip_doc(&mut self, docno: Index) -> Result<Index> {
        if self.docno != 0 && self.docno == docno {
            return Ok(self.docno);
        }
        self.scan_active = false;
        self.scan_itr = 0;
        self.docno = self.cursor.skip_doc(docno)?;
        Ok(self.docno)
    }

    /// Smallest position `>= firstpos` of the current document, or 0.
    /// `fails with CorruptData` when the block yields a smaller position.
    pub fn skip_pos(&mut self, firstpos: Position) -> Result<Position> {
        if self.docno == 0 {
            return Ok(0);
        }
        let Some(blk) = self.cursor.current_block() else {
            return Ok(0);
        };
        let mut scanner = blk.position_scanner_at(*self.cursor.current_block_cursor());
        if self.scan_active {
            scanner.set_itr(self.scan_itr);
        }
        let rt = scanner.skip(firstpos);
        self.scan_itr = scanner.itr();
        self.scan_active = true;
        if rt != 0 && rt < firstpos {
            return Err(StorageError::CorruptData(
                "posinfo block yielded a position below the skip target".into(),
            ));
        }
        Ok(rt)
    }

    /// Number of positions of the current document.
    pub fn frequency(&self) -> u32 {
        if self.docno == 0 {
            return 0;
        }
        match self.cursor.current_block() {
            Some(blk) => blk.frequency_at(*self.cursor.current_block_cursor()),
            None => 0,
        }
    }

    /// Positions of the current document.
    pub fn positions(&self) -> Vec<Position> {
        if self.docno == 0 {
            return Vec::new();
        }
        match self.cursor.current_block() {
            Some(blk) => blk.positions_at(*self.cursor.current_block_cursor()),
            None => Vec::new(),
        }
    }

    /// Document frequency from the persisted record, cached after the first
    /// read.
    pub fn document_frequency(&mut self) -> Result<GlobalCounter> {
        if let Some(df) = self.df {
            return Ok(df);
        }
        let df = read_document_frequency(self.db.as_ref(), self.typeno, self.termno)?;
        self.df = Some(df);
        Ok(df)
    }
}

/// Read the persisted df of a term; 0 when absent.
pub fn read_document_frequency(
    db: &dyn Database,
    typeno: Index,
    termno: Index,
) -> Result<GlobalCounter> {
    let key = DatabaseKey::with_elems(KeyFamily::DocFrequency, &[typeno, termno]);
    match db.get(key.as_bytes())? {
        Some(value) => {
            let (df, _) = codec::unpack_global_counter(&value)?;
            Ok(df)
        }
        None => Ok(0),
    }
}
