//! Structure blocks: source→sink position ranges per document
//!
//! A block carries three tables: the document index (the same 16-doc node
//! grouping the posinfo blocks use, referencing a slice of structure
//! definitions per document), the structure-def table
//! `(header_start, header_end, members_idx, members_size)` ordered by
//! `header_end` within each document, and the member table `(start, end)`
//! ordered by `end` within each definition's slice.
//!
//! Storage form (little endian): `u32` doc node count, doc nodes
//! (base `u32`, 15 × offset `u16`, 16 × def-start `u16`), `u32` def count,
//! defs (4 × `u16`), `u32` member count, members (2 × `u16`).

use crate::error::{Result, StorageError};
use crate::types::{BlockPos, Index, IndexRange};

const NODE_SIZE: usize = 16;
const NODE_BYTES: usize = 4 + 2 * (NODE_SIZE - 1) + 2 * NODE_SIZE;
const DEF_BYTES: usize = 8;
const MEMBER_BYTES: usize = 4;

/// One source range with the member slice it points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructureDef {
    pub header_start: BlockPos,
    pub header_end: BlockPos,
    pub members_idx: u16,
    pub members_size: u16,
}

/// One sink range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructureMember {
    pub start: BlockPos,
    pub end: BlockPos,
}

/// Document index node referencing the defs slice of each document.
#[derive(Debug, Clone, Copy)]
struct DocIndexNode {
    base: Index,
    ofs: [u16; NODE_SIZE - 1],
    defref: [u16; NODE_SIZE],
}

impl Default for DocIndexNode {
    fn default() -> Self {
        Self {
            base: 0,
            ofs: [0; NODE_SIZE - 1],
            defref: [0; NODE_SIZE],
        }
    }
}

impl DocIndexNode {
    fn nof_elements(&self) -> usize {
        if self.base == 0 {
            return 0;
        }
        let mut ii = 0;
        while ii < NODE_SIZE - 1 && self.ofs[ii] != 0 {
            ii += 1;
        }
        ii + 1
    }

    fn docno_at(&self, slot: usize) -> Index {
        if slot == 0 {
            self.base
        } else {
            self.base + self.ofs[slot - 1] as Index
        }
    }

    fn last_doc(&self) -> Index {
        let n = self.nof_elements();
        if n <= 1 {
            self.base
        } else {
            self.base + self.ofs[n - 2] as Index
        }
    }

    fn add_document(&mut self, docno: Index, defref: u16) -> Result<bool> {
        if self.base == 0 {
            self.base = docno;
            self.defref[0] = defref;
            return Ok(true);
        }
        if self.base >= docno {
            return Err(StorageError::CorruptData(
                "documents not added in ascending order into structure block".into(),
            ));
        }
        if self.base + u16::MAX as Index <= docno {
            return Ok(false);
        }
        let mut ii = 0;
        while ii < NODE_SIZE - 1 && self.ofs[ii] != 0 {
            ii += 1;
        }
        if ii == NODE_SIZE - 1 {
            return Ok(false);
        }
        self.ofs[ii] = (docno - self.base) as u16;
        self.defref[ii + 1] = defref;
        Ok(true)
    }

    fn skip_doc(&self, docno: Index) -> Option<(Index, usize)> {
        if docno <= self.base {
            if docno == self.base {
                return Some((self.base, 0));
            }
            return None;
        }
        if docno - self.base > u16::MAX as Index {
            return None;
        }
        let want = (docno - self.base) as u16;
        let mut ii = 0;
        while ii < NODE_SIZE - 1 && (self.ofs[ii] != 0 && want > self.ofs[ii]) {
            ii += 1;
        }
        if ii == NODE_SIZE - 1 || self.ofs[ii] == 0 {
            None
        } else {
            Some((self.base + self.ofs[ii] as Index, ii + 1))
        }
    }
}

/// Cursor into a structure block.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructureCursor {
    node: usize,
    slot: usize,
}

/// Loaded structure block.
#[derive(Debug, Clone, Default)]
pub struct StructureBlock {
    id: Index,
    nodes: Vec<DocIndexNode>,
    defs: Vec<StructureDef>,
    members: Vec<StructureMember>,
}

impl StructureBlock {
    pub fn from_bytes(id: Index, bytes: &[u8]) -> Result<Self> {
        let corrupt = || StorageError::CorruptData("structure block truncated".into());
        if bytes.len() < 4 {
            return Err(corrupt());
        }
        let nof_nodes = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let mut at = 4;
        let mut nodes = Vec::with_capacity(nof_nodes);
        for _ in 0..nof_nodes {
            if bytes.len() < at + NODE_BYTES {
                return Err(corrupt());
            }
            let mut nd = DocIndexNode {
                base: u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()),
                ..Default::default()
            };
            let mut p = at + 4;
            for ii in 0..NODE_SIZE - 1 {
                nd.ofs[ii] = u16::from_le_bytes(bytes[p..p + 2].try_into().unwrap());
                p += 2;
            }
            for ii in 0..NODE_SIZE {
                nd.defref[ii] = u16::from_le_bytes(bytes[p..p + 2].try_into().unwrap());
                p += 2;
            }
            nodes.push(nd);
            at += NODE_BYTES;
        }
        if bytes.len() < at + 4 {
            return Err(corrupt());
        }
        let nof_defs = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
        at += 4;
        let mut defs = Vec::with_capacity(nof_defs);
        for _ in 0..nof_defs {
            if bytes.len() < at + DEF_BYTES {
                return Err(corrupt());
            }
            defs.push(StructureDef {
                header_start: u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap()),
                header_end: u16::from_le_bytes(bytes[at + 2..at + 4].try_into().unwrap()),
                members_idx: u16::from_le_bytes(bytes[at + 4..at + 6].try_into().unwrap()),
                members_size: u16::from_le_bytes(bytes[at + 6..at + 8].try_into().unwrap()),
            });
            at += DEF_BYTES;
        }
        if bytes.len() < at + 4 {
            return Err(corrupt());
        }
        let nof_members = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
        at += 4;
        let mut members = Vec::with_capacity(nof_members);
        for _ in 0..nof_members {
            if bytes.len() < at + MEMBER_BYTES {
                return Err(corrupt());
            }
            members.push(StructureMember {
                start: u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap()),
                end: u16::from_le_bytes(bytes[at + 2..at + 4].try_into().unwrap()),
            });
            at += MEMBER_BYTES;
        }
        for def in &defs {
            if def.members_idx as usize + def.members_size as usize > members.len() {
                return Err(StorageError::CorruptData(
                    "structure member slice out of bounds".into(),
                ));
            }
        }
        Ok(Self {
            id,
            nodes,
            defs,
            members,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            12 + self.nodes.len() * NODE_BYTES
                + self.defs.len() * DEF_BYTES
                + self.members.len() * MEMBER_BYTES,
        );
        out.extend_from_slice(&(self.nodes.len() as u32).to_le_bytes());
        for nd in &self.nodes {
            out.extend_from_slice(&nd.base.to_le_bytes());
            for v in nd.ofs {
                out.extend_from_slice(&v.to_le_bytes());
            }
            for v in nd.defref {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out.extend_from_slice(&(self.defs.len() as u32).to_le_bytes());
        for d in &self.defs {
            out.extend_from_slice(&d.header_start.to_le_bytes());
            out.extend_from_slice(&d.header_end.to_le_bytes());
            out.extend_from_slice(&d.members_idx.to_le_bytes());
            out.extend_from_slice(&d.members_size.to_le_bytes());
        }
        out.extend_from_slice(&(self.members.len() as u32).to_le_bytes());
        for m in &self.members {
            out.extend_from_slice(&m.start.to_le_bytes());
            out.extend_from_slice(&m.end.to_le_bytes());
        }
        out
    }

    pub fn id(&self) -> Index {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn docno_at(&self, cursor: &StructureCursor) -> Index {
        if cursor.node >= self.nodes.len() {
            0
        } else {
            self.nodes[cursor.node].docno_at(cursor.slot)
        }
    }

    pub fn first_doc(&self, cursor: &mut StructureCursor) -> Index {
        *cursor = StructureCursor::default();
        self.nodes.first().map(|nd| nd.base).unwrap_or(0)
    }

    pub fn next_doc(&self, cursor: &mut StructureCursor) -> Index {
        if cursor.node >= self.nodes.len() {
            return 0;
        }
        let nd = &self.nodes[cursor.node];
        if cursor.slot + 1 < nd.nof_elements() {
            cursor.slot += 1;
            return nd.docno_at(cursor.slot);
        }
        cursor.node += 1;
        cursor.slot = 0;
        self.nodes.get(cursor.node).map(|nd| nd.base).unwrap_or(0)
    }

    /// Smallest docno `>= docno` in the block, or 0.
    pub fn skip_doc(&self, docno: Index, cursor: &mut StructureCursor) -> Index {
        if self.nodes.is_empty() {
            return 0;
        }
        let mut node = cursor.node;
        if node >= self.nodes.len() || self.nodes[node].base > docno {
            node = 0;
        }
        if self.nodes[node].base >= docno {
            cursor.node = node;
            cursor.slot = 0;
            return self.nodes[node].base;
        }
        let (mut fib1, mut fib2) = (1usize, 1usize);
        let mut prev = node;
        let mut ii = node + 1;
        while ii < self.nodes.len() && self.nodes[ii].base < docno {
            prev = ii;
            let fibres = fib1 + fib2;
            ii += fibres;
            fib1 = fib2;
            fib2 = fibres;
        }
        let mut ii = prev + 1;
        while ii < self.nodes.len() && self.nodes[ii].base < docno {
            ii += 1;
        }
        ii -= 1;
        match self.nodes[ii].skip_doc(docno) {
            Some((found, slot)) => {
                cursor.node = ii;
                cursor.slot = slot;
                found
            }
            None => {
                if ii + 1 < self.nodes.len() {
                    cursor.node = ii + 1;
                    cursor.slot = 0;
                    self.nodes[ii + 1].base
                } else {
                    0
                }
            }
        }
    }

    /// Structure-defs slice of the document under the cursor.
    pub fn defs_at(&self, cursor: &StructureCursor) -> &[StructureDef] {
        let Some(nd) = self.nodes.get(cursor.node) else {
            return &[];
        };
        let start = nd.defref[cursor.slot] as usize;
        let end = self.next_defref(cursor);
        &self.defs[start.min(self.defs.len())..end.min(self.defs.len())]
    }

    fn next_defref(&self, cursor: &StructureCursor) -> usize {
        let nd = &self.nodes[cursor.node];
        if cursor.slot + 1 < nd.nof_elements() {
            nd.defref[cursor.slot + 1] as usize
        } else if cursor.node + 1 < self.nodes.len() {
            self.nodes[cursor.node + 1].defref[0] as usize
        } else {
            self.defs.len()
        }
    }

    pub fn members_of(&self, def: &StructureDef) -> &[StructureMember] {
        let start = def.members_idx as usize;
        &self.members[start..start + def.members_size as usize]
    }

    pub fn is_this_block_address(&self, docno: Index) -> bool {
        docno <= self.id
            && !self.nodes.is_empty()
            && docno >= self.nodes[0].base
    }

    pub fn is_follow_block_address(&self, docno: Index) -> bool {
        let first = self.nodes.first().map(|nd| nd.base).unwrap_or(1);
        let diff = self.id.saturating_sub(first);
        docno > self.id && docno < self.id + diff - (diff >> 4)
    }
}

/// Scans the structure-defs of one document in `header_end` order.
#[derive(Debug, Clone, Default)]
pub struct StructureScanner<'a> {
    defs: &'a [StructureDef],
    itr: usize,
}

impl<'a> StructureScanner<'a> {
    pub fn new(defs: &'a [StructureDef]) -> Self {
        Self { defs, itr: 0 }
    }

    pub fn initialized(&self) -> bool {
        !self.defs.is_empty()
    }

    pub fn current(&self) -> Option<&StructureDef> {
        self.defs.get(self.itr)
    }

    /// Index of the def found by the last [`skip`](Self::skip).
    pub fn index(&self) -> usize {
        self.itr
    }

    /// First def with `header_end > first_pos`; the table is ordered by
    /// `header_end`, so a binary partition finds the start point.
    pub fn skip(&mut self, first_pos: Index) -> IndexRange {
        if first_pos > u16::MAX as Index {
            return IndexRange::default();
        }
        let p = first_pos as BlockPos;
        self.itr = self.defs.partition_point(|d| d.header_end <= p);
        match self.defs.get(self.itr) {
            Some(d) => IndexRange::new(d.header_start as Index, d.header_end as Index),
            None => IndexRange::default(),
        }
    }
}

/// Scans the member slice of one structure-def in `end` order.
#[derive(Debug, Clone, Default)]
pub struct MemberScanner<'a> {
    members: &'a [StructureMember],
    itr: usize,
}

impl<'a> MemberScanner<'a> {
    pub fn new(members: &'a [StructureMember]) -> Self {
        Self { members, itr: 0 }
    }

    pub fn initialized(&self) -> bool {
        !self.members.is_empty()
    }

    /// First member with `end > first_pos`.
    pub fn skip(&mut self, first_pos: Index) -> IndexRange {
        if first_pos > u16::MAX as Index {
            return IndexRange::default();
        }
        let p = first_pos as BlockPos;
        self.itr = self.members.partition_point(|m| m.end <= p);
        match self.members.get(self.itr) {
            Some(m) => IndexRange::new(m.start as Index, m.end as Index),
            None => IndexRange::default(),
        }
    }
}

/// Builder for structure blocks; documents and their structures must be
/// appended in ascending order.
#[derive(Debug, Clone, Default)]
pub struct StructureBlockBuilder {
    nodes: Vec<DocIndexNode>,
    defs: Vec<StructureDef>,
    members: Vec<StructureMember>,
    last_doc: Index,
    id: Index,
}

impl StructureBlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_block(blk: &StructureBlock) -> Result<Self> {
        let mut builder = Self::new();
        let mut cursor = StructureCursor::default();
        let mut docno = blk.first_doc(&mut cursor);
        while docno != 0 {
            let defs = blk.defs_at(&cursor);
            let structures: Vec<(IndexRange, Vec<IndexRange>)> = defs
                .iter()
                .map(|d| {
                    let sinks = blk
                        .members_of(d)
                        .iter()
                        .map(|m| IndexRange::new(m.start as Index, m.end as Index))
                        .collect();
                    (
                        IndexRange::new(d.header_start as Index, d.header_end as Index),
                        sinks,
                    )
                })
                .collect();
            builder.append(docno, &structures)?;
            docno = blk.next_doc(&mut cursor);
        }
        builder.id = blk.id();
        Ok(builder)
    }

    pub fn id(&self) -> Index {
        self.id
    }

    pub fn set_id(&mut self, id: Index) -> Result<()> {
        if id != 0 && id < self.last_doc {
            return Err(StorageError::CorruptData(
                "assigned illegal id to structure block".into(),
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
        12 + self.nodes.len() * NODE_BYTES
            + self.defs.len() * DEF_BYTES
            + self.members.len() * MEMBER_BYTES
    }

    /// Append all structures of one document: `(source, sinks)` pairs. The
    /// sources must be ordered by their end position, each sink list by its
    /// end positions.
    pub fn append(
        &mut self,
        docno: Index,
        structures: &[(IndexRange, Vec<IndexRange>)],
    ) -> Result<()> {
        if docno <= self.last_doc {
            return Err(StorageError::CorruptData(
                "documents not added in ascending order into structure block".into(),
            ));
        }
        let defref = self.defs.len() as u16;
        let mut prev_end = 0;
        for (source, sinks) in structures {
            if source.start == 0 || source.end > u16::MAX as Index {
                return Err(StorageError::InvalidArgument(
                    "structure source range out of bounds".into(),
                ));
            }
            if (source.end as BlockPos) < prev_end {
                return Err(StorageError::InvalidArgument(
                    "structure sources not ordered by end position".into(),
                ));
            }
            prev_end = source.end as BlockPos;
            let members_idx = self.members.len() as u16;
            let mut prev_member_end = 0;
            for sink in sinks {
                if sink.start == 0 || sink.end > u16::MAX as Index {
                    return Err(StorageError::InvalidArgument(
                        "structure sink range out of bounds".into(),
                    ));
                }
                if (sink.end as BlockPos) < prev_member_end {
                    return Err(StorageError::InvalidArgument(
                        "structure sinks not ordered by end position".into(),
                    ));
                }
                prev_member_end = sink.end as BlockPos;
                self.members.push(StructureMember {
                    start: sink.start as BlockPos,
                    end: sink.end as BlockPos,
                });
            }
            self.defs.push(StructureDef {
                header_start: source.start as BlockPos,
                header_end: source.end as BlockPos,
                members_idx,
                members_size: sinks.len() as u16,
            });
        }
        let appended = match self.nodes.last_mut() {
            Some(nd) => nd.add_document(docno, defref)?,
            None => false,
        };
        if !appended {
            let mut nd = DocIndexNode::default();
            if !nd.add_document(docno, defref)? {
                return Err(StorageError::CorruptData(
                    "corrupt structure in structure block builder".into(),
                ));
            }
            self.nodes.push(nd);
        }
        self.last_doc = docno;
        Ok(())
    }

    pub fn build(self) -> Result<StructureBlock> {
        if self.nodes.is_empty() {
            return Err(StorageError::CorruptData(
                "tried to create empty structure block".into(),
            ));
        }
        let id = if self.id != 0 { self.id } else { self.last_doc };
        Ok(StructureBlock {
            id,
            nodes: self.nodes,
            defs: self.defs,
            members: self.members,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> StructureBlock {
        let mut b = StructureBlockBuilder::new();
        b.append(
            2,
            &[
                (
                    IndexRange::new(1, 3),
                    vec![IndexRange::new(4, 6), IndexRange::new(8, 10)],
                ),
                (IndexRange::new(5, 9), vec![IndexRange::new(12, 14)]),
            ],
        )
        .unwrap();
        b.append(7, &[(IndexRange::new(2, 4), vec![IndexRange::new(5, 5)])])
            .unwrap();
        b.build().unwrap()
    }

    #[test]
    fn doc_traversal() {
        let blk = sample_block();
        assert_eq!(blk.id(), 7);
        let mut cursor = StructureCursor::default();
        assert_eq!(blk.first_doc(&mut cursor), 2);
        assert_eq!(blk.defs_at(&cursor).len(), 2);
        assert_eq!(blk.next_doc(&mut cursor), 7);
        assert_eq!(blk.defs_at(&cursor).len(), 1);
        assert_eq!(blk.next_doc(&mut cursor), 0);
    }

    #[test]
    fn skip_doc_upper_bound() {
        let blk = sample_block();
        let mut cursor = StructureCursor::default();
        assert_eq!(blk.skip_doc(1, &mut cursor), 2);
        assert_eq!(blk.skip_doc(3, &mut cursor), 7);
        assert_eq!(blk.skip_doc(7, &mut cursor), 7);
        assert_eq!(blk.skip_doc(8, &mut cursor), 0);
    }

    #[test]
    fn source_scan_orders_by_header_end() {
        let blk = sample_block();
        let mut cursor = StructureCursor::default();
        blk.skip_doc(2, &mut cursor);
        let mut scanner = StructureScanner::new(blk.defs_at(&cursor));
        assert_eq!(scanner.skip(0), IndexRange::new(1, 3));
        assert_eq!(scanner.skip(3), IndexRange::new(5, 9));
        assert_eq!(scanner.skip(9), IndexRange::default());
    }

    #[test]
    fn member_scan_within_source() {
        let blk = sample_block();
        let mut cursor = StructureCursor::default();
        blk.skip_doc(2, &mut cursor);
        let defs = blk.defs_at(&cursor);
        let mut members = MemberScanner::new(blk.members_of(&defs[0]));
        assert_eq!(members.skip(0), IndexRange::new(4, 6));
        assert_eq!(members.skip(6), IndexRange::new(8, 10));
        assert_eq!(members.skip(10), IndexRange::default());
    }

    #[test]
    fn serialization_round_trip() {
        let blk = sample_block();
        let back = StructureBlock::from_bytes(blk.id(), &blk.to_bytes()).unwrap();
        assert_eq!(back.defs, blk.defs);
        assert_eq!(back.members, blk.members);
        let mut cursor = StructureCursor::default();
        assert_eq!(back.first_doc(&mut cursor), 2);
    }

    #[test]
    fn rebuild_from_block() {
        let blk = sample_block();
        let again = StructureBlockBuilder::from_block(&blk)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(again.to_bytes(), blk.to_bytes());
    }

    #[test]
    fn out_of_bounds_rejected() {
        let mut b = StructureBlockBuilder::new();
        assert!(b
            .append(1, &[(IndexRange::new(0, 3), vec![])])
            .is_err());
        let mut b = StructureBlockBuilder::new();
        assert!(b
            .append(1, &[(IndexRange::new(1, 70000), vec![])])
            .is_err());
    }
}
