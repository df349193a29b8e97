//! Forward-index iterator: original token strings of one term type
//!
//! Blocks are keyed `(typeno, docno, position_hi)`; within a document the
//! iterator walks position-keyed blocks with upper-bound seeks.

use crate::blocks::ForwardIndexBlock;
use crate::codec;
use crate::database::{Database, DatabaseCursor, DatabaseKey, KeyFamily};
use crate::error::Result;
use crate::types::{Index, Position};
use std::sync::Arc;

pub struct ForwardIndexIterator {
    db: Arc<dyn Database>,
    typeno: Index,
    docno: Index,
    block: Option<ForwardIndexBlock>,
    item_offset: Option<usize>,
    cursor: Option<Box<dyn DatabaseCursor>>,
}

impl ForwardIndexIterator {
    pub fn new(db: Arc<dyn Database>, typeno: Index) -> Self {
        Self {
            db,
            typeno,
            docno: 0,
            block: None,
            item_offset: None,
            cursor: None,
        }
    }

    /// Select the document to scan; resets the position state.
    pub fn skip_doc(&mut self, docno: Index) {
        if docno != self.docno {
            self.docno = docno;
            self.block = None;
            self.item_offset = None;
            self.cursor = None;
        }
    }

    fn doc_prefix(&self) -> Vec<u8> {
        DatabaseKey::with_elems(KeyFamily::ForwardIndex, &[self.typeno, self.docno]).into_bytes()
    }

    fn load_upper_bound(&mut self, pos: Position) -> Result<bool> {
        let prefix = self.doc_prefix();
        let mut key = prefix.clone();
        codec::pack_index(&mut key, pos);
        let db = &self.db;
        let cursor = self.cursor.get_or_insert_with(|| db.cursor());
        match cursor.seek_upper_bound(&key) {
            Some((k, v)) if k.starts_with(&prefix) && k.len() > prefix.len() => {
                let (id, _) = codec::unpack_index(&k[prefix.len()..])?;
                self.block = Some(ForwardIndexBlock::from_bytes(id, &v));
                Ok(true)
            }
            _ => {
                self.block = None;
                Ok(false)
            }
        }
    }

    /// Smallest stored position `>= firstpos` of the current document, or 0.
    pub fn skip_pos(&mut self, firstpos: Position) -> Result<Position> {
        if self.docno == 0 || self.typeno == 0 {
            return Ok(0);
        }
        let firstpos = firstpos.max(1);
        let mut target = firstpos;
        loop {
            let need_load = match &self.block {
                Some(blk) => blk.id() < target,
                None => true,
            };
            if need_load && !self.load_upper_bound(target)? {
                self.item_offset = None;
                return Ok(0);
            }
            let blk = self.block.as_ref().expect("block loaded");
            if let Some(at) = blk.upper_bound(firstpos, 0) {
                self.item_offset = Some(at);
                return blk.position_at(at);
            }
            // every record of this block is below the target; step on
            target = blk.id() + 1;
            self.block = None;
        }
    }

    /// Token string at the current position.
    pub fn fetch(&self) -> Result<String> {
        match (&self.block, self.item_offset) {
            (Some(blk), Some(at)) => blk.value_at(at),
            _ => Ok(String::new()),
        }
    }
}
