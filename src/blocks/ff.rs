//! Ff blocks: compacted feature frequencies without positions
//!
//! A cheap acceleration structure for first-pass scoring: per document only
//! the ff is stored, compacted to one byte through a 256-entry table that is
//! exact for small values and grows roughly logarithmically above. Each
//! [`FfIndexNode`] carries two documents as `(base, offset, ff[2])`.
//!
//! Storage form: eight bytes per node, little endian `base` u32, `ofs` u16,
//! two compacted ff bytes.

use crate::error::{Result, StorageError};
use crate::types::Index;

const NODE_BYTES: usize = 8;

/// Table mapping a compaction byte to the represented ff value.
/// `ar[0] = 0; ar[i] = ar[i-1] + (1 + i/10)`.
fn compaction_table() -> &'static [u32; 256] {
    use std::sync::OnceLock;
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut ar = [0u32; 256];
        for ii in 1..256 {
            ar[ii] = ar[ii - 1] + (1 + ii as u32 / 10);
        }
        ar
    })
}

/// Value represented by a compaction byte.
pub fn uint_from_compaction(byte: u8) -> u32 {
    compaction_table()[byte as usize]
}

/// Smallest compaction byte whose value is `>= value` (saturating at 255).
pub fn compact_uint(value: u32) -> u8 {
    let ar = compaction_table();
    let mut lo = 0usize;
    let mut hi = 255usize;
    // values are more likely to be small
    let mut mid = 3usize;
    while lo + 3 < hi {
        if value <= ar[mid] {
            hi = mid;
        } else {
            lo = mid;
        }
        mid = (lo + hi) >> 1;
    }
    for ii in lo..=hi {
        if ar[ii] >= value {
            return ii as u8;
        }
    }
    hi as u8
}

/// One node: up to two documents with their compacted ff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FfIndexNode {
    base: Index,
    ofs: u16,
    ff: [u8; 2],
}

impl FfIndexNode {
    /// Register `(docno, ff)`; fails when the node is full or the offset
    /// does not fit.
    fn set_document_ff(&mut self, docno: Index, ff: u32) -> bool {
        if self.ofs != 0 {
            if self.base + self.ofs as Index == docno {
                self.ff[1] = compact_uint(ff);
                return true;
            }
            false
        } else if docno < self.base {
            false
        } else if self.base != 0 && self.base != docno {
            if docno - self.base > u16::MAX as Index {
                return false;
            }
            self.ofs = (docno - self.base) as u16;
            self.ff[1] = compact_uint(ff);
            true
        } else {
            self.base = docno;
            self.ff[0] = compact_uint(ff);
            true
        }
    }

    /// Smallest docno `>= docno` in the node with its ff, or `None`.
    fn skip_doc(&self, docno: Index) -> Option<(Index, u32)> {
        if docno <= self.base {
            return Some((self.base, uint_from_compaction(self.ff[0])));
        }
        if docno > self.base + self.ofs as Index {
            return None;
        }
        Some((
            self.base + self.ofs as Index,
            uint_from_compaction(self.ff[1]),
        ))
    }

    fn first_doc(&self) -> Index {
        self.base
    }

    fn last_doc(&self) -> Index {
        self.base + self.ofs as Index
    }

    fn has_second(&self) -> bool {
        self.ofs != 0
    }

    fn docno_at(&self, elemidx: usize) -> Index {
        if elemidx == 0 {
            self.base
        } else {
            self.base + self.ofs as Index
        }
    }

    fn ff_at(&self, elemidx: usize) -> u32 {
        uint_from_compaction(self.ff[elemidx.min(1)])
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.base.to_le_bytes());
        out.extend_from_slice(&self.ofs.to_le_bytes());
        out.push(self.ff[0]);
        out.push(self.ff[1]);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NODE_BYTES {
            return Err(StorageError::CorruptData("ff node truncated".into()));
        }
        Ok(Self {
            base: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            ofs: u16::from_le_bytes(bytes[4..6].try_into().unwrap()),
            ff: [bytes[6], bytes[7]],
        })
    }
}

/// Cursor over the documents of an [`FfBlock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FfCursor {
    nodeidx: usize,
    elemidx: usize,
}

impl FfCursor {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Loaded ff block.
#[derive(Debug, Clone, Default)]
pub struct FfBlock {
    id: Index,
    nodes: Vec<FfIndexNode>,
}

impl FfBlock {
    pub fn from_bytes(id: Index, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % NODE_BYTES != 0 {
            return Err(StorageError::CorruptData(
                "ff block size not a node multiple".into(),
            ));
        }
        let mut nodes = Vec::with_capacity(bytes.len() / NODE_BYTES);
        for chunk in bytes.chunks_exact(NODE_BYTES) {
            nodes.push(FfIndexNode::decode(chunk)?);
        }
        if let Some(last) = nodes.last() {
            if last.last_doc() > id {
                return Err(StorageError::CorruptData(
                    "ff block id less than a contained docno".into(),
                ));
            }
        }
        Ok(Self { id, nodes })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.nodes.len() * NODE_BYTES);
        for nd in &self.nodes {
            nd.encode(&mut out);
        }
        out
    }

    pub fn id(&self) -> Index {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn docno_at(&self, cursor: &FfCursor) -> Index {
        if cursor.nodeidx >= self.nodes.len() {
            0
        } else {
            self.nodes[cursor.nodeidx].docno_at(cursor.elemidx)
        }
    }

    pub fn ff_at(&self, cursor: &FfCursor) -> u32 {
        if cursor.nodeidx >= self.nodes.len() {
            0
        } else {
            self.nodes[cursor.nodeidx].ff_at(cursor.elemidx)
        }
    }

    pub fn first_doc(&self, cursor: &mut FfCursor) -> Index {
        cursor.reset();
        self.docno_at(cursor)
    }

    pub fn next_doc(&self, cursor: &mut FfCursor) -> Index {
        if cursor.nodeidx >= self.nodes.len() {
            return 0;
        }
        if cursor.elemidx == 0 && self.nodes[cursor.nodeidx].has_second() {
            cursor.elemidx = 1;
            return self.nodes[cursor.nodeidx].docno_at(1);
        }
        cursor.nodeidx += 1;
        cursor.elemidx = 0;
        if cursor.nodeidx >= self.nodes.len() {
            0
        } else {
            self.nodes[cursor.nodeidx].first_doc()
        }
    }

    /// Smallest docno `>= docno` in the block, or 0.
    pub fn skip_doc(&self, docno: Index, cursor: &mut FfCursor) -> Index {
        if self.nodes.is_empty() {
            return 0;
        }
        if cursor.nodeidx >= self.nodes.len() || self.nodes[cursor.nodeidx].first_doc() > docno {
            cursor.reset();
        } else if self.nodes[cursor.nodeidx].last_doc() >= docno {
            return self.select_cursor_docno(docno, cursor);
        }
        let found = self.fib_search_node(docno, cursor.nodeidx);
        if found == self.nodes.len() {
            cursor.nodeidx = found;
            cursor.elemidx = 0;
            return 0;
        }
        cursor.nodeidx = found;
        self.select_cursor_docno(docno, cursor)
    }

    fn select_cursor_docno(&self, docno: Index, cursor: &mut FfCursor) -> Index {
        let nd = &self.nodes[cursor.nodeidx];
        match nd.skip_doc(docno) {
            Some((found, _ff)) => {
                cursor.elemidx = if found == nd.first_doc() { 0 } else { 1 };
                found
            }
            None => {
                cursor.nodeidx += 1;
                cursor.elemidx = 0;
                if cursor.nodeidx < self.nodes.len() {
                    self.nodes[cursor.nodeidx].first_doc()
                } else {
                    0
                }
            }
        }
    }

    /// First node whose last docno reaches `docno`, probing Fibonacci steps.
    fn fib_search_node(&self, docno: Index, start: usize) -> usize {
        let nn = self.nodes.len();
        let (mut fib1, mut fib2) = (1usize, 1usize);
        let mut prev = start;
        let mut ii = start;
        while ii < nn && self.nodes[ii].last_doc() < docno {
            prev = ii;
            let fibres = fib1 + fib2;
            ii += fibres;
            fib1 = fib2;
            fib2 = fibres;
        }
        let mut ii = if self.nodes[prev].last_doc() < docno {
            prev + 1
        } else {
            prev
        };
        while ii < nn && self.nodes[ii].last_doc() < docno {
            ii += 1;
        }
        ii
    }

    pub fn is_this_block_address(&self, docno: Index) -> bool {
        docno <= self.id
            && !self.nodes.is_empty()
            && docno >= self.nodes[0].first_doc()
    }

    pub fn is_follow_block_address(&self, docno: Index) -> bool {
        let first = self.nodes.first().map(|nd| nd.first_doc()).unwrap_or(1);
        let diff = self.id.saturating_sub(first);
        docno > self.id && docno < self.id + diff - (diff >> 4)
    }
}

/// Builder for ff blocks.
#[derive(Debug, Clone, Default)]
pub struct FfBlockBuilder {
    nodes: Vec<FfIndexNode>,
    last_doc: Index,
    id: Index,
}

impl FfBlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_block(blk: &FfBlock) -> Self {
        Self {
            nodes: blk.nodes.clone(),
            last_doc: blk.nodes.last().map(|nd| nd.last_doc()).unwrap_or(0),
            id: blk.id(),
        }
    }

    pub fn id(&self) -> Index {
        self.id
    }

    pub fn set_id(&mut self, id: Index) -> Result<()> {
        if id != 0 && id < self.last_doc {
            return Err(StorageError::CorruptData(
                "assigned illegal id to ff block".into(),
            ));
        }
        self.id = id;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn last_doc(&self) -> Index {
        self.last_doc
    }

    pub fn byte_size(&self) -> usize {
        self.nodes.len() * NODE_BYTES
    }

    pub fn append(&mut self, docno: Index, ff: u32) -> Result<()> {
        if docno < self.last_doc {
            return Err(StorageError::CorruptData(
                "document numbers not added in ascending order".into(),
            ));
        }
        if self.id != 0 && self.id < docno {
            return Err(StorageError::CorruptData(
                "assigned illegal id to ff block".into(),
            ));
        }
        let appended = match self.nodes.last_mut() {
            Some(nd) => nd.set_document_ff(docno, ff),
            None => false,
        };
        if !appended {
            let mut nd = FfIndexNode::default();
            if !nd.set_document_ff(docno, ff) {
                return Err(StorageError::CorruptData(
                    "corrupt structure in ff block builder".into(),
                ));
            }
            self.nodes.push(nd);
        }
        self.last_doc = docno;
        Ok(())
    }

    /// Interleave two builders; equal docnos keep the larger ff.
    pub fn merge(blk1: &FfBlockBuilder, blk2: &FfBlockBuilder) -> Result<FfBlockBuilder> {
        if blk1.nodes.is_empty() {
            return Ok(blk2.clone());
        }
        if blk2.nodes.is_empty() {
            return Ok(blk1.clone());
        }
        let mut out = FfBlockBuilder::new();
        let mut s1 = FfStream::new(&blk1.nodes);
        let mut s2 = FfStream::new(&blk2.nodes);
        let mut e1 = s1.next();
        let mut e2 = s2.next();
        while let (Some((d1, f1)), Some((d2, f2))) = (e1, e2) {
            if d1 < d2 {
                out.append(d1, f1)?;
                e1 = s1.next();
            } else if d1 > d2 {
                out.append(d2, f2)?;
                e2 = s2.next();
            } else {
                out.append(d1, f1.max(f2))?;
                e1 = s1.next();
                e2 = s2.next();
            }
        }
        while let Some((d, f)) = e1 {
            out.append(d, f)?;
            e1 = s1.next();
        }
        while let Some((d, f)) = e2 {
            out.append(d, f)?;
            e2 = s2.next();
        }
        Ok(out)
    }

    pub fn build(self) -> Result<FfBlock> {
        if self.nodes.is_empty() {
            return Err(StorageError::CorruptData(
                "tried to create empty ff block".into(),
            ));
        }
        let id = if self.id != 0 { self.id } else { self.last_doc };
        Ok(FfBlock {
            id,
            nodes: self.nodes,
        })
    }
}

struct FfStream<'a> {
    nodes: &'a [FfIndexNode],
    nodeidx: usize,
    elemidx: usize,
}

impl<'a> FfStream<'a> {
    fn new(nodes: &'a [FfIndexNode]) -> Self {
        Self {
            nodes,
            nodeidx: 0,
            elemidx: 0,
        }
    }

    fn next(&mut self) -> Option<(Index, u32)> {
        while self.nodeidx < self.nodes.len() {
            let nd = &self.nodes[self.nodeidx];
            if self.elemidx == 0 {
                self.elemidx = if nd.has_second() { 1 } else { 2 };
                if self.elemidx == 2 {
                    self.nodeidx += 1;
                    self.elemidx = 0;
                }
                if nd.first_doc() != 0 {
                    return Some((nd.first_doc(), nd.ff_at(0)));
                }
            } else if self.elemidx == 1 {
                self.nodeidx += 1;
                self.elemidx = 0;
                return Some((nd.last_doc(), nd.ff_at(1)));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compaction_exact_for_small_values() {
        for v in 0..=9u32 {
            assert_eq!(uint_from_compaction(compact_uint(v)), v, "value {}", v);
        }
    }

    #[test]
    fn compaction_rounds_up() {
        for v in [10u32, 34, 100, 1000, 3000] {
            let round = uint_from_compaction(compact_uint(v));
            assert!(round >= v, "{} rounded down to {}", v, round);
        }
        // table maximum
        let top = uint_from_compaction(255);
        assert_eq!(compact_uint(top), 255);
        assert_eq!(compact_uint(u32::MAX), 255);
    }

    #[test]
    fn compaction_is_monotone() {
        let mut prev = 0;
        for b in 0..=255u32 {
            let v = uint_from_compaction(b as u8);
            assert!(b == 0 || v > prev);
            prev = v;
        }
    }

    fn sample_block() -> FfBlock {
        let mut b = FfBlockBuilder::new();
        b.append(2, 3).unwrap();
        b.append(5, 1).unwrap();
        b.append(9, 10).unwrap();
        b.append(80000, 2).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn iterate_all() {
        let blk = sample_block();
        let mut cursor = FfCursor::default();
        let mut got = Vec::new();
        let mut d = blk.first_doc(&mut cursor);
        while d != 0 {
            got.push((d, blk.ff_at(&cursor)));
            d = blk.next_doc(&mut cursor);
        }
        assert_eq!(got, vec![(2, 3), (5, 1), (9, 10), (80000, 2)]);
    }

    #[test]
    fn skip_doc_upper_bound() {
        let blk = sample_block();
        let mut cursor = FfCursor::default();
        assert_eq!(blk.skip_doc(1, &mut cursor), 2);
        assert_eq!(blk.skip_doc(5, &mut cursor), 5);
        assert_eq!(blk.ff_at(&cursor), 1);
        assert_eq!(blk.skip_doc(6, &mut cursor), 9);
        assert_eq!(blk.skip_doc(10, &mut cursor), 80000);
        assert_eq!(blk.skip_doc(80001, &mut cursor), 0);
        assert_eq!(blk.skip_doc(3, &mut cursor), 5);
    }

    #[test]
    fn merge_keeps_larger_ff() {
        let mut b1 = FfBlockBuilder::new();
        b1.append(1, 2).unwrap();
        b1.append(5, 7).unwrap();
        let mut b2 = FfBlockBuilder::new();
        b2.append(3, 1).unwrap();
        b2.append(5, 3).unwrap();
        let merged = FfBlockBuilder::merge(&b1, &b2).unwrap();
        let blk = merged.build().unwrap();
        let mut cursor = FfCursor::default();
        let mut got = Vec::new();
        let mut d = blk.first_doc(&mut cursor);
        while d != 0 {
            got.push((d, blk.ff_at(&cursor)));
            d = blk.next_doc(&mut cursor);
        }
        assert_eq!(got, vec![(1, 2), (3, 1), (5, 7)]);
    }

    #[test]
    fn serialization_round_trip() {
        let blk = sample_block();
        let back = FfBlock::from_bytes(blk.id(), &blk.to_bytes()).unwrap();
        assert_eq!(back.nodes, blk.nodes);
    }
}
