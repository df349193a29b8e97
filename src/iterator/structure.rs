//! Structure iterator: source→sink range traversal per document
//!
//! Changing the document clears source and sink; changing the source clears
//! the sink.

use crate::blocks::structure::{MemberScanner, StructureScanner};
use crate::blocks::{BlockCursor, StructureBlock};
use crate::database::{Database, KeyFamily};
use crate::error::Result;
use crate::types::{Index, IndexRange, Position};
use std::sync::Arc;

pub struct StructIterator {
    cursor: BlockCursor<StructureBlock>,
    docno: Index,
    source: IndexRange,
    sink: IndexRange,
    source_itr: Option<usize>,
}

impl StructIterator {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            cursor: BlockCursor::new(db, KeyFamily::StructBlock, &[]),
            docno: 0,
            source: IndexRange::default(),
            sink: IndexRange::default(),
            source_itr: None,
        }
    }

    pub fn docno(&self) -> Index {
        self.docno
    }

    /// Smallest docno `>= docno` carrying structures, or 0.
    pub fn skip_doc(&mut self, docno: Index) -> Result<Index> {
        if self.docno != 0 && self.docno == docno {
            return Ok(self.docno);
        }
        self.source = IndexRange::default();
        self.sink = IndexRange::default();
        self.source_itr = None;
        self.docno = self.cursor.skip_doc(docno)?;
        Ok(self.docno)
    }

    /// First source range with end past `firstpos` in the current doc.
    pub fn skip_pos_source(&mut self, firstpos: Position) -> IndexRange {
        self.sink = IndexRange::default();
        self.source = IndexRange::default();
        self.source_itr = None;
        if self.docno == 0 {
            return self.source;
        }
        let Some(blk) = self.cursor.current_block() else {
            return self.source;
        };
        let defs = blk.defs_at(self.cursor.current_block_cursor());
        let mut scanner = StructureScanner::new(defs);
        self.source = scanner.skip(firstpos);
        if self.source.defined() {
            self.source_itr = Some(scanner.index());
        }
        self.source
    }

    /// First sink range of the current source with end past `firstpos`.
    pub fn skip_pos_sink(&mut self, firstpos: Position) -> IndexRange {
        self.sink = IndexRange::default();
        let Some(def_idx) = self.source_itr else {
            return self.sink;
        };
        let Some(blk) = self.cursor.current_block() else {
            return self.sink;
        };
        let defs = blk.defs_at(self.cursor.current_block_cursor());
        let members = blk.members_of(&defs[def_idx]);
        let mut scanner = MemberScanner::new(members);
        self.sink = scanner.skip(firstpos);
        self.sink
    }

    /// Last range returned by [`skip_pos_source`](Self::skip_pos_source).
    pub fn source(&self) -> IndexRange {
        self.source
    }

    /// Last range returned by [`skip_pos_sink`](Self::skip_pos_sink).
    pub fn sink(&self) -> IndexRange {
        self.sink
    }
}
