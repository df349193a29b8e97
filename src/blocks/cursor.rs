//! Block cursor: ordered traversal of one block family
//!
//! All families keyed by "largest docno in block" share the same skip
//! discipline: stay inside the loaded block when the target is covered,
//! step to the follow block when the target is near (sequential reads stay
//! cheap), fall back to a full upper-bound seek for far jumps.

use super::{BooleanBlock, FfBlock, PosinfoBlock, StructureBlock};
use crate::blocks::boolean::NodeCursor;
use crate::blocks::ff::FfCursor;
use crate::blocks::structure::StructureCursor;
use crate::codec;
use crate::database::{Database, DatabaseCursor, DatabaseKey, KeyFamily};
use crate::error::Result;
use crate::stats::{self, StatKind};
use crate::types::Index;
use std::sync::Arc;

/// Interface a block type offers the generic cursor.
pub trait DocBlock: Sized {
    type Cursor: Default + Clone;

    fn from_bytes(id: Index, bytes: &[u8]) -> Result<Self>;
    fn id(&self) -> Index;
    fn first_doc(&self, cursor: &mut Self::Cursor) -> Index;
    fn skip_doc_in_block(&self, docno: Index, cursor: &mut Self::Cursor) -> Index;
    fn is_follow_block_address(&self, docno: Index) -> bool;
}

impl DocBlock for PosinfoBlock {
    type Cursor = u32;

    fn from_bytes(id: Index, bytes: &[u8]) -> Result<Self> {
        PosinfoBlock::from_bytes(id, bytes)
    }

    fn id(&self) -> Index {
        PosinfoBlock::id(self)
    }

    fn first_doc(&self, cursor: &mut u32) -> Index {
        PosinfoBlock::first_doc(self, cursor)
    }

    fn skip_doc_in_block(&self, docno: Index, cursor: &mut u32) -> Index {
        PosinfoBlock::skip_doc(self, docno, cursor)
    }

    fn is_follow_block_address(&self, docno: Index) -> bool {
        PosinfoBlock::is_follow_block_address(self, docno)
    }
}

impl DocBlock for BooleanBlock {
    type Cursor = NodeCursor;

    fn from_bytes(id: Index, bytes: &[u8]) -> Result<Self> {
        BooleanBlock::from_bytes(id, bytes)
    }

    fn id(&self) -> Index {
        BooleanBlock::id(self)
    }

    fn first_doc(&self, cursor: &mut NodeCursor) -> Index {
        self.get_first(cursor)
    }

    fn skip_doc_in_block(&self, docno: Index, cursor: &mut NodeCursor) -> Index {
        self.skip(docno, cursor)
    }

    fn is_follow_block_address(&self, docno: Index) -> bool {
        BooleanBlock::is_follow_block_address(self, docno)
    }
}

impl DocBlock for FfBlock {
    type Cursor = FfCursor;

    fn from_bytes(id: Index, bytes: &[u8]) -> Result<Self> {
        FfBlock::from_bytes(id, bytes)
    }

    fn id(&self) -> Index {
        FfBlock::id(self)
    }

    fn first_doc(&self, cursor: &mut FfCursor) -> Index {
        FfBlock::first_doc(self, cursor)
    }

    fn skip_doc_in_block(&self, docno: Index, cursor: &mut FfCursor) -> Index {
        FfBlock::skip_doc(self, docno, cursor)
    }

    fn is_follow_block_address(&self, docno: Index) -> bool {
        FfBlock::is_follow_block_address(self, docno)
    }
}

impl DocBlock for StructureBlock {
    type Cursor = StructureCursor;

    fn from_bytes(id: Index, bytes: &[u8]) -> Result<Self> {
        StructureBlock::from_bytes(id, bytes)
    }

    fn id(&self) -> Index {
        StructureBlock::id(self)
    }

    fn first_doc(&self, cursor: &mut StructureCursor) -> Index {
        StructureBlock::first_doc(self, cursor)
    }

    fn skip_doc_in_block(&self, docno: Index, cursor: &mut StructureCursor) -> Index {
        StructureBlock::skip_doc(self, docno, cursor)
    }

    fn is_follow_block_address(&self, docno: Index) -> bool {
        StructureBlock::is_follow_block_address(self, docno)
    }
}

/// Store access for one block family: a fixed key prefix (family byte plus
/// the packed fixed elements such as typeno and termno) and a lazily opened
/// database cursor.
pub struct BlockAdapter {
    db: Arc<dyn Database>,
    key_prefix: Vec<u8>,
    db_cursor: Option<Box<dyn DatabaseCursor>>,
}

impl BlockAdapter {
    pub fn new(db: Arc<dyn Database>, family: KeyFamily, elems: &[Index]) -> Self {
        let key_prefix = DatabaseKey::with_elems(family, elems).into_bytes();
        Self {
            db,
            key_prefix,
            db_cursor: None,
        }
    }

    fn decode_entry<B: DocBlock>(&self, key: &[u8], value: &[u8]) -> Result<Option<B>> {
        if !key.starts_with(&self.key_prefix) || key.len() == self.key_prefix.len() {
            return Ok(None);
        }
        let (id, _) = codec::unpack_index(&key[self.key_prefix.len()..])?;
        B::from_bytes(id, value).map(Some)
    }

    /// Load the block responsible for `docno` (first block id `>= docno`).
    pub fn load_upper_bound<B: DocBlock>(&mut self, docno: Index) -> Result<Option<B>> {
        let mut key = self.key_prefix.clone();
        codec::pack_index(&mut key, docno);
        let db = &self.db;
        let cursor = self.db_cursor.get_or_insert_with(|| db.cursor());
        match cursor.seek_upper_bound(&key) {
            Some((k, v)) => self.decode_entry(&k, &v),
            None => Ok(None),
        }
    }

    /// Load the first block of the family.
    pub fn load_first<B: DocBlock>(&mut self) -> Result<Option<B>> {
        self.load_upper_bound(0)
    }

    /// Load the block following the last loaded one.
    pub fn load_next<B: DocBlock>(&mut self) -> Result<Option<B>> {
        let Some(cursor) = self.db_cursor.as_mut() else {
            return self.load_first();
        };
        match cursor.next() {
            Some((k, v)) => self.decode_entry(&k, &v),
            None => Ok(None),
        }
    }
}

/// Generic cursor over one block family.
pub struct BlockCursor<B: DocBlock> {
    adapter: BlockAdapter,
    stat: StatKind,
    /// false when a fixed key element is the reserved zero id; the family
    /// cannot exist then and every skip yields the end sentinel
    defined: bool,
    blk: Option<B>,
    blk_cursor: B::Cursor,
    docno: Index,
    docno_start: Index,
    docno_end: Index,
}

impl<B: DocBlock> BlockCursor<B> {
    pub fn new(db: Arc<dyn Database>, family: KeyFamily, elems: &[Index]) -> Self {
        Self {
            adapter: BlockAdapter::new(db, family, elems),
            stat: StatKind::of_family(family),
            defined: elems.iter().all(|&e| e != 0),
            blk: None,
            blk_cursor: B::Cursor::default(),
            docno: 0,
            docno_start: 0,
            docno_end: 0,
        }
    }

    pub fn docno(&self) -> Index {
        self.docno
    }

    /// Whether the target lies inside the loaded block.
    pub fn is_close_candidate(&self, docno: Index) -> bool {
        self.docno_start <= docno && docno <= self.docno_end
    }

    pub fn current_block(&self) -> Option<&B> {
        self.blk.as_ref()
    }

    pub fn current_block_cursor(&self) -> &B::Cursor {
        &self.blk_cursor
    }

    pub fn current_block_cursor_mut(&mut self) -> &mut B::Cursor {
        &mut self.blk_cursor
    }

    fn enter_block(&mut self, blk: B, docno: Index) -> Index {
        self.docno_start = blk.first_doc(&mut self.blk_cursor);
        self.docno_end = blk.id();
        self.docno = blk.skip_doc_in_block(docno, &mut self.blk_cursor);
        self.blk = Some(blk);
        self.docno
    }

    fn at_end(&mut self) -> Index {
        self.blk_cursor = B::Cursor::default();
        self.docno = 0;
        self.docno_start = 0;
        self.docno_end = 0;
        0
    }

    fn seek(&mut self, docno: Index) -> Result<Index> {
        stats::increment(self.stat, stats::Access::Random);
        match self.adapter.load_upper_bound::<B>(docno)? {
            Some(blk) => Ok(self.enter_block(blk, docno)),
            None => Ok(self.at_end()),
        }
    }

    /// Smallest stored docno `>= docno`, or 0 at the end of the family.
    pub fn skip_doc(&mut self, docno: Index) -> Result<Index> {
        if !self.defined {
            return Ok(0);
        }
        let Some(blk) = self.blk.as_ref() else {
            return self.seek(docno);
        };
        if self.docno_start <= docno && docno <= self.docno_end {
            // same block as the last query
            self.docno = blk.skip_doc_in_block(docno, &mut self.blk_cursor);
            return Ok(self.docno);
        }
        if docno > self.docno_end && blk.is_follow_block_address(docno) {
            // walk follow blocks while they stay cheaper than a reseek
            loop {
                stats::increment(self.stat, stats::Access::Follow);
                match self.adapter.load_next::<B>()? {
                    Some(next) => {
                        if docno <= next.id() {
                            return Ok(self.enter_block(next, docno));
                        }
                        if !next.is_follow_block_address(docno) {
                            return self.seek(docno);
                        }
                        self.blk = Some(next);
                    }
                    None => return Ok(self.at_end()),
                }
            }
        }
        self.seek(docno)
    }

    /// Step to the first docno of the next block; used by full scans.
    pub fn load_next_block(&mut self) -> Result<Index> {
        if !self.defined {
            return Ok(0);
        }
        match self.adapter.load_next::<B>()? {
            Some(blk) => {
                self.docno_start = blk.first_doc(&mut self.blk_cursor);
                self.docno_end = blk.id();
                self.docno = self.docno_start;
                self.blk = Some(blk);
                Ok(self.docno)
            }
            None => Ok(self.at_end()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::PosinfoBlockBuilder;
    use crate::database::{MemDatabase, WriteBatch};

    fn store_block(db: &MemDatabase, typeno: Index, termno: Index, docs: &[Index]) {
        let mut builder = PosinfoBlockBuilder::new();
        for &d in docs {
            builder.append(d, &[1]).unwrap();
        }
        let blk = builder.build().unwrap();
        let key = DatabaseKey::with_elems(KeyFamily::PosInfoBlock, &[typeno, termno, blk.id()]);
        let mut batch = WriteBatch::new();
        batch.put(key.into_bytes(), blk.to_bytes());
        db.write(batch, false).unwrap();
    }

    #[test]
    fn skip_across_blocks() {
        let db = Arc::new(MemDatabase::ephemeral());
        store_block(&db, 1, 5, &[1, 2, 3]);
        store_block(&db, 1, 5, &[10, 11, 12]);
        store_block(&db, 1, 5, &[100, 200]);
        // foreign families must not leak into the scan
        store_block(&db, 1, 6, &[4, 5]);

        let mut cursor: BlockCursor<PosinfoBlock> =
            BlockCursor::new(db, KeyFamily::PosInfoBlock, &[1, 5]);
        assert_eq!(cursor.skip_doc(1).unwrap(), 1);
        assert_eq!(cursor.skip_doc(2).unwrap(), 2);
        // near target: follow block walk
        assert_eq!(cursor.skip_doc(4).unwrap(), 10);
        assert_eq!(cursor.skip_doc(12).unwrap(), 12);
        // far target: upper bound seek
        assert_eq!(cursor.skip_doc(150).unwrap(), 200);
        assert_eq!(cursor.skip_doc(201).unwrap(), 0);
        // restart after end
        assert_eq!(cursor.skip_doc(1).unwrap(), 1);
    }

    #[test]
    fn monotone_contract() {
        let db = Arc::new(MemDatabase::ephemeral());
        let docs: Vec<Index> = (1..=60).map(|i| i * 7).collect();
        for chunk in docs.chunks(8) {
            store_block(&db, 2, 2, chunk);
        }
        let mut cursor: BlockCursor<PosinfoBlock> =
            BlockCursor::new(db, KeyFamily::PosInfoBlock, &[2, 2]);
        for t in 1..=420u32 {
            let want = docs.iter().copied().find(|&d| d >= t).unwrap_or(0);
            let got = cursor.skip_doc(t).unwrap();
            assert_eq!(got, want, "target {}", t);
            if got != 0 {
                // a repeated skip below the found docno keeps the answer
                assert_eq!(cursor.skip_doc(t).unwrap(), got);
            }
        }
    }

    #[test]
    fn empty_family_yields_nothing() {
        let db = Arc::new(MemDatabase::ephemeral());
        let mut cursor: BlockCursor<PosinfoBlock> =
            BlockCursor::new(db, KeyFamily::PosInfoBlock, &[9, 9]);
        assert_eq!(cursor.skip_doc(1).unwrap(), 0);
    }
}
