//! Boolean blocks: run-length encoded document sets
//!
//! A block is a sequence of nodes ordered by their last element. A *diff
//! node* stores `(last, run)` meaning the range `[last - run, last]`; a
//! *pair node* stores up to two single elements. Ranges in a block are
//! strictly ascending, non-overlapping and never adjacent (adjacent ranges
//! are normalized into one diff node).
//!
//! Storage form: two little-endian u32 words per node, `elemno` and `alt`;
//! the top bit of `alt` set marks a diff node. Element numbers are 31-bit,
//! so the tag bit is free.

use crate::error::{Result, StorageError};
use crate::types::Index;

const DIFF_TAG: u32 = 1 << 31;
const NODE_BYTES: usize = 8;

/// One node of a boolean block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    /// `[last - run, last]`
    Diff { last: Index, run: Index },
    /// one or two single elements; `second == 0` means only `first` is set,
    /// and `second`, when set, is smaller than `first`
    Pair { first: Index, second: Index },
}

impl Node {
    fn new_range(from: Index, to: Index) -> Self {
        if from == to {
            Node::Pair {
                first: from,
                second: 0,
            }
        } else {
            Node::Diff {
                last: to,
                run: to - from,
            }
        }
    }

    fn normalize(self) -> Self {
        match self {
            Node::Diff { last, run } if run == 0 => Node::Pair {
                first: last,
                second: 0,
            },
            Node::Pair { first, second } if second != 0 && second + 1 == first => Node::Diff {
                last: first,
                run: 1,
            },
            other => other,
        }
    }

    fn last_elem(&self) -> Index {
        match *self {
            Node::Diff { last, .. } => last,
            Node::Pair { first, .. } => first,
        }
    }

    fn first_elem(&self) -> Index {
        match *self {
            Node::Diff { last, run } => last - run,
            Node::Pair { first, second } => {
                if second != 0 {
                    second
                } else {
                    first
                }
            }
        }
    }

    fn matches(&self, elemno: Index) -> bool {
        match *self {
            Node::Diff { last, run } => elemno <= last && elemno >= last - run,
            Node::Pair { first, second } => elemno == first || (second != 0 && elemno == second),
        }
    }

    /// Smallest contained element `>= elemno`, or 0.
    fn upper_bound(&self, elemno: Index) -> Index {
        match *self {
            Node::Diff { last, run } => {
                if elemno <= last {
                    elemno.max(last - run)
                } else {
                    0
                }
            }
            Node::Pair { first, second } => {
                if elemno <= first {
                    if second != 0 && elemno <= second {
                        second
                    } else {
                        first
                    }
                } else {
                    0
                }
            }
        }
    }

    /// Grow the node so it ends at `to`; fails on a full pair node.
    fn try_expand_range(&mut self, to: Index) -> bool {
        match *self {
            Node::Diff { last, run } => {
                debug_assert!(to > last);
                *self = Node::Diff {
                    last: to,
                    run: run + (to - last),
                };
                true
            }
            Node::Pair { first, second } => {
                if second != 0 {
                    false
                } else {
                    *self = Node::new_range(first, to);
                    true
                }
            }
        }
    }

    fn try_add_elem(&mut self, elemno: Index) -> bool {
        match *self {
            Node::Diff { last, run } => {
                if elemno <= last + 1 && elemno + 1 >= last - run {
                    if elemno == last + 1 {
                        *self = Node::Diff {
                            last: elemno,
                            run: run + 1,
                        };
                    } else if elemno + 1 == last - run {
                        *self = Node::Diff {
                            last,
                            run: run + 1,
                        };
                    }
                    true
                } else {
                    false
                }
            }
            Node::Pair { first, second } => {
                if second != 0 {
                    elemno == first || elemno == second
                } else if elemno == first {
                    true
                } else {
                    *self = if elemno < first {
                        Node::Pair {
                            first,
                            second: elemno,
                        }
                    } else {
                        Node::Pair {
                            first: elemno,
                            second: first,
                        }
                    }
                    .normalize();
                    true
                }
            }
        }
    }

    /// The trailing contiguous range of the node.
    fn last_range(&self) -> (Index, Index) {
        match *self {
            Node::Diff { last, run } => (last - run, last),
            Node::Pair { first, second } => {
                if second != 0 && first == second + 1 {
                    (second, first)
                } else {
                    (first, first)
                }
            }
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let (w0, w1) = match *self {
            Node::Diff { last, run } => (last, run | DIFF_TAG),
            Node::Pair { first, second } => (first, second),
        };
        out.extend_from_slice(&w0.to_le_bytes());
        out.extend_from_slice(&w1.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NODE_BYTES {
            return Err(StorageError::CorruptData(
                "boolean block node truncated".into(),
            ));
        }
        let w0 = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let w1 = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if w1 & DIFF_TAG != 0 {
            let run = w1 & !DIFF_TAG;
            if run >= w0 {
                return Err(StorageError::CorruptData(
                    "boolean block diff node with run past zero".into(),
                ));
            }
            Ok(Node::Diff { last: w0, run })
        } else {
            Ok(Node::Pair {
                first: w0,
                second: w1,
            })
        }
    }
}

/// Cursor state for traversing a block's elements or ranges.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeCursor {
    pub idx: usize,
    pub elemno: Index,
}

impl NodeCursor {
    pub fn reset(&mut self) {
        self.idx = 0;
        self.elemno = 0;
    }
}

/// Loaded boolean block: typed node view over the raw bytes.
#[derive(Debug, Clone, Default)]
pub struct BooleanBlock {
    id: Index,
    nodes: Vec<Node>,
}

impl BooleanBlock {
    pub fn from_bytes(id: Index, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % NODE_BYTES != 0 {
            return Err(StorageError::CorruptData(
                "boolean block size not a node multiple".into(),
            ));
        }
        let mut nodes = Vec::with_capacity(bytes.len() / NODE_BYTES);
        for chunk in bytes.chunks_exact(NODE_BYTES) {
            nodes.push(Node::decode(chunk)?);
        }
        if let Some(last) = nodes.last() {
            if last.last_elem() > id {
                return Err(StorageError::CorruptData(
                    "boolean block id less than a contained element".into(),
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

    pub fn set_id(&mut self, id: Index) {
        self.id = id;
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nof_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn byte_size(&self) -> usize {
        self.nodes.len() * NODE_BYTES
    }

    pub fn first_elem(&self) -> Index {
        self.nodes.first().map(|n| n.first_elem()).unwrap_or(0)
    }

    pub fn last_elem(&self) -> Index {
        self.nodes.last().map(|n| n.last_elem()).unwrap_or(0)
    }

    pub fn get_first(&self, cursor: &mut NodeCursor) -> Index {
        cursor.reset();
        let Some(nd) = self.nodes.first() else {
            return 0;
        };
        cursor.elemno = nd.first_elem();
        cursor.elemno
    }

    pub fn get_next(&self, cursor: &mut NodeCursor) -> Index {
        if cursor.idx >= self.nodes.len() {
            cursor.elemno = 0;
            return 0;
        }
        let nd = &self.nodes[cursor.idx];
        let next = match *nd {
            Node::Diff { last, .. } => {
                if cursor.elemno < last {
                    cursor.elemno + 1
                } else {
                    0
                }
            }
            Node::Pair { first, second } => {
                if second != 0 && cursor.elemno == second {
                    first
                } else {
                    0
                }
            }
        };
        if next != 0 {
            cursor.elemno = next;
            return next;
        }
        cursor.idx += 1;
        if cursor.idx >= self.nodes.len() {
            cursor.elemno = 0;
            return 0;
        }
        cursor.elemno = self.nodes[cursor.idx].first_elem();
        cursor.elemno
    }

    /// First range at or after the cursor; advances the cursor.
    pub fn get_next_range(&self, cursor: &mut NodeCursor) -> Option<(Index, Index)> {
        if cursor.idx >= self.nodes.len() {
            return None;
        }
        let nd = &self.nodes[cursor.idx];
        match *nd {
            Node::Diff { last, run } => {
                cursor.elemno = 0;
                cursor.idx += 1;
                Some((last - run, last))
            }
            Node::Pair { first, second } => {
                if cursor.elemno == 0 && second != 0 {
                    cursor.elemno = second;
                    Some((second, second))
                } else {
                    cursor.elemno = 0;
                    cursor.idx += 1;
                    Some((first, first))
                }
            }
        }
    }

    pub fn get_first_range(&self, cursor: &mut NodeCursor) -> Option<(Index, Index)> {
        cursor.reset();
        self.get_next_range(cursor)
    }

    /// Smallest contained element `>= elemno`, or 0. Forward steps use a
    /// Fibonacci probe over the node array, backward jumps halve the index.
    pub fn skip(&self, elemno: Index, cursor: &mut NodeCursor) -> Index {
        let nn = self.nodes.len();
        if nn == 0 {
            return 0;
        }
        if cursor.idx >= nn {
            cursor.idx = 0;
            if self.nodes[0].last_elem() >= elemno {
                let rt = self.nodes[0].upper_bound(elemno);
                if rt != 0 {
                    cursor.elemno = rt;
                }
                return rt;
            }
        } else {
            let nd = &self.nodes[cursor.idx];
            if nd.last_elem() >= elemno {
                if nd.matches(elemno) {
                    cursor.elemno = elemno;
                    return elemno;
                }
                while cursor.idx > 0 && self.nodes[cursor.idx].last_elem() > elemno {
                    cursor.idx >>= 1;
                }
                if self.nodes[cursor.idx].last_elem() >= elemno {
                    let rt = self.nodes[cursor.idx].upper_bound(elemno);
                    if rt != 0 {
                        cursor.elemno = rt;
                        return rt;
                    }
                }
            }
        }
        let (mut fib1, mut fib2) = (1usize, 1usize);
        let mut fibres = 0usize;
        let mut ii = cursor.idx + 1;
        while ii < nn && self.nodes[ii].last_elem() < elemno {
            fibres = fib1 + fib2;
            ii += fibres;
            fib1 = fib2;
            fib2 = fibres;
        }
        ii -= fibres;
        while ii < nn && self.nodes[ii].last_elem() < elemno {
            ii += 1;
        }
        if ii >= nn {
            return 0;
        }
        let rt = self.nodes[ii].upper_bound(elemno);
        if rt != 0 {
            cursor.idx = ii;
            cursor.elemno = rt;
            rt
        } else {
            0
        }
    }

    /// Add the range `[elemno, elemno + rangesize]`. Ranges must arrive in
    /// ascending order of their start; overlapping or adjacent ranges are
    /// coalesced into the trailing node.
    pub fn define_range(&mut self, elemno: Index, rangesize: Index) -> Result<()> {
        debug_assert!(elemno > 0);
        let Some(nd) = self.nodes.last_mut() else {
            self.nodes.push(Node::new_range(elemno, elemno + rangesize));
            return Ok(());
        };
        let (from, to) = nd.last_range();
        if elemno < from {
            return Err(StorageError::CorruptData(
                "ranges not appended in order in boolean block".into(),
            ));
        }
        if elemno <= to {
            // overlapping the trailing range
            if to < elemno + rangesize {
                if !nd.try_expand_range(elemno + rangesize) {
                    self.nodes.push(Node::new_range(elemno, elemno + rangesize));
                }
            }
            // else: fully inside the trailing range
        } else if rangesize == 0 && nd.try_add_elem(elemno) {
            // absorbed into the trailing pair/diff node
        } else if to + 1 == elemno {
            // adjacent: extend instead of starting a new node
            if !nd.try_expand_range(elemno + rangesize) {
                self.nodes.push(Node::new_range(elemno, elemno + rangesize));
            }
        } else {
            self.nodes.push(Node::new_range(elemno, elemno + rangesize));
        }
        Ok(())
    }

    pub fn define_element(&mut self, elemno: Index) -> Result<()> {
        self.define_range(elemno, 0)
    }

    pub fn is_this_block_address(&self, elemno: Index) -> bool {
        elemno <= self.id && !self.nodes.is_empty() && elemno >= self.first_elem()
    }

    /// Whether `elemno` most likely lives in the block following this one.
    pub fn is_follow_block_address(&self, elemno: Index) -> bool {
        let first = if self.nodes.is_empty() { 1 } else { self.first_elem() };
        let diff = self.id - first.min(self.id);
        elemno > self.id && elemno < self.id + diff - (diff >> 4)
    }

    /// Verify the block invariants: strictly ascending, non-overlapping,
    /// non-adjacent ranges, all within the block id.
    pub fn check(&self) -> Result<()> {
        let mut cursor = NodeCursor::default();
        let mut prevmax = 0;
        while let Some((from, to)) = self.get_next_range(&mut cursor) {
            if from == 0 || to == 0 || from > to || to > self.id || (prevmax != 0 && from <= prevmax + 1)
            {
                return Err(StorageError::CorruptData(
                    "illegal boolean block".into(),
                ));
            }
            prevmax = to;
        }
        Ok(())
    }
}

/// Try to join `[from, to]` with `[from2, to2]`; on success the first range
/// is widened to cover both.
pub fn join_range(from: &mut Index, to: &mut Index, from2: Index, to2: Index) -> bool {
    if *from <= from2 {
        if *to + 1 >= from2 {
            if *to < to2 {
                *to = to2;
            }
            true
        } else {
            false
        }
    } else if to2 + 1 >= *from {
        *from = from2;
        if *to < to2 {
            *to = to2;
        }
        true
    } else {
        false
    }
}

/// A staged membership change: add (`is_member`) or remove the doc range
/// `[from, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeRange {
    pub from: Index,
    pub to: Index,
    pub is_member: bool,
}

impl MergeRange {
    pub fn new(from: Index, to: Index, is_member: bool) -> Self {
        Self { from, to, is_member }
    }
}

/// Builder used by the transaction to stage and merge boolean blocks.
#[derive(Debug, Clone, Default)]
pub struct BooleanBlockBuilder {
    block: BooleanBlock,
}

impl BooleanBlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self) -> &BooleanBlock {
        &self.block
    }

    pub fn into_block(mut self) -> BooleanBlock {
        if self.block.id == 0 {
            self.block.id = self.block.last_elem();
        }
        self.block
    }

    pub fn define_range(&mut self, elemno: Index, rangesize: Index) -> Result<()> {
        self.block.define_range(elemno, rangesize)?;
        if self.block.id != 0 && self.block.last_elem() > self.block.id {
            self.block.id = self.block.last_elem();
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.block.byte_size()
    }
}

/// Merge two committed blocks into one; overlapping and adjacent ranges
/// coalesce.
pub fn merge_blocks(blk1: &BooleanBlock, blk2: &BooleanBlock) -> Result<BooleanBlock> {
    let mut out = BooleanBlock::default();
    out.set_id(blk1.id().max(blk2.id()));

    let mut c1 = NodeCursor::default();
    let mut c2 = NodeCursor::default();
    let mut r1 = blk1.get_first_range(&mut c1);
    let mut r2 = blk2.get_first_range(&mut c2);

    while let (Some((from1, to1)), Some((from2, to2))) = (r1, r2) {
        if from1 <= from2 {
            if to1 >= from2 {
                out.define_range(from1, to1.max(to2) - from1)?;
                r1 = blk1.get_next_range(&mut c1);
                r2 = blk2.get_next_range(&mut c2);
            } else {
                out.define_range(from1, to1 - from1)?;
                r1 = blk1.get_next_range(&mut c1);
            }
        } else if from1 > to2 {
            out.define_range(from2, to2 - from2)?;
            r2 = blk2.get_next_range(&mut c2);
        } else {
            out.define_range(from2, to1.max(to2) - from2)?;
            r1 = blk1.get_next_range(&mut c1);
            r2 = blk2.get_next_range(&mut c2);
        }
    }
    while let Some((from, to)) = r1 {
        out.define_range(from, to - from)?;
        r1 = blk1.get_next_range(&mut c1);
    }
    while let Some((from, to)) = r2 {
        out.define_range(from, to - from)?;
        r2 = blk2.get_next_range(&mut c2);
    }
    Ok(out)
}

/// Merge a sorted stream of membership changes into `oldblk`: member ranges
/// are added, non-member ranges punch holes (splitting covered ranges).
pub fn merge_ranges(
    elements: &[MergeRange],
    oldblk: &BooleanBlock,
    newblk: &mut BooleanBlock,
) -> Result<()> {
    *newblk = BooleanBlock::default();
    newblk.set_id(oldblk.id());

    let mut cursor = NodeCursor::default();
    let mut old = oldblk.get_first_range(&mut cursor);
    let mut ei = elements.iter().peekable();

    while let (Some(e), Some((mut old_from, old_to))) = (ei.peek().copied(), old) {
        if e.is_member {
            let (mut jf, mut jt) = (old_from, old_to);
            if join_range(&mut jf, &mut jt, e.from, e.to) {
                // absorb the element; keep scanning against the widened range
                old = Some((jf, jt));
                ei.next();
            } else if e.from < old_from {
                newblk.define_range(e.from, e.to - e.from)?;
                ei.next();
            } else {
                newblk.define_range(old_from, old_to - old_from)?;
                old = oldblk.get_next_range(&mut cursor);
            }
        } else if old_from <= e.from {
            if old_to >= e.from {
                // delete range starts inside the current one
                if old_from < e.from {
                    newblk.define_range(old_from, e.from - old_from - 1)?;
                }
                if old_to > e.to {
                    old = Some((e.to + 1, old_to));
                    ei.next();
                } else {
                    old = oldblk.get_next_range(&mut cursor);
                    ei.next();
                }
            } else {
                newblk.define_range(old_from, old_to - old_from)?;
                old = oldblk.get_next_range(&mut cursor);
            }
        } else if e.to >= old_from {
            if e.to >= old_to {
                // deletion covers the whole current range
                old = oldblk.get_next_range(&mut cursor);
            } else {
                old_from = e.to + 1;
                old = Some((old_from, old_to));
                ei.next();
            }
        } else {
            // deleting elements that are not present
            ei.next();
        }
    }
    for e in ei {
        if e.is_member {
            newblk.define_range(e.from, e.to - e.from)?;
        }
    }
    while let Some((from, to)) = old {
        newblk.define_range(from, to - from)?;
        old = oldblk.get_next_range(&mut cursor);
    }
    if newblk.last_elem() > newblk.id() {
        let last = newblk.last_elem();
        newblk.set_id(last);
    }
    Ok(())
}
