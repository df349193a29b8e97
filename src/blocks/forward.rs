//! Forward-index blocks: original token strings by position
//!
//! Records are `packed(relative_position) ∥ token-bytes`, separated by the
//! 0xFE marker (which never occurs inside a packed integer and never starts
//! a valid UTF-8 token byte sequence the codec accepts). The relative
//! position is `block.id - position`, so records run descending in byte
//! order and the upper-bound search uses the descending comparator.

use super::DataBlock;
use crate::codec;
use crate::error::{Result, StorageError};
use crate::types::{Index, Position};

const END_ITEM_MARKER: u8 = 0xFE;

/// Loaded forward-index block. The id is the largest position addressed.
#[derive(Debug, Clone, Default)]
pub struct ForwardIndexBlock {
    block: DataBlock,
}

impl ForwardIndexBlock {
    pub fn from_bytes(id: Index, bytes: &[u8]) -> Self {
        Self {
            block: DataBlock::new(id, bytes.to_vec()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.block.bytes().to_vec()
    }

    pub fn id(&self) -> Index {
        self.block.id()
    }

    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.block.len()
    }

    fn data(&self) -> &[u8] {
        self.block.bytes()
    }

    fn rel_from_position(&self, pos: Position) -> Index {
        debug_assert!(pos <= self.id());
        self.id() - pos
    }

    fn position_from_rel(&self, rel: Index) -> Position {
        self.id() - rel
    }

    /// Position of the record starting at byte offset `at`, or 0 at the end.
    pub fn position_at(&self, at: usize) -> Result<Position> {
        if at >= self.data().len() {
            return Ok(0);
        }
        let (rel, _) = codec::unpack_index(&self.data()[at..])?;
        if rel > self.id() {
            return Err(StorageError::CorruptData(
                "forward index relative position out of range".into(),
            ));
        }
        Ok(self.position_from_rel(rel))
    }

    /// Token bytes of the record starting at byte offset `at`.
    pub fn value_at(&self, at: usize) -> Result<String> {
        if at >= self.data().len() {
            return Ok(String::new());
        }
        let skip = codec::skip_index(&self.data()[at..])?;
        let start = at + skip;
        let end = self.data()[start..]
            .iter()
            .position(|&b| b == END_ITEM_MARKER)
            .map(|p| start + p)
            .unwrap_or(self.data().len());
        String::from_utf8(self.data()[start..end].to_vec())
            .map_err(|_| StorageError::CorruptData("forward index token not utf-8".into()))
    }

    /// Byte offset of the record after the one at `at`, or `None`.
    pub fn next_item(&self, at: usize) -> Option<usize> {
        if at >= self.data().len() {
            return None;
        }
        match self.data()[at..].iter().position(|&b| b == END_ITEM_MARKER) {
            Some(p) => {
                let next = at + p + 1;
                if next < self.data().len() {
                    Some(next)
                } else {
                    None
                }
            }
            None => None,
        }
    }

    /// Byte offset of the record before the one at `at`, or `None`.
    pub fn prev_item(&self, at: usize) -> Option<usize> {
        if at == 0 || self.block.is_empty() {
            return None;
        }
        let scan_end = at.min(self.data().len()).saturating_sub(1);
        match self.data()[..scan_end]
            .iter()
            .rposition(|&b| b == END_ITEM_MARKER)
        {
            Some(p) => Some(p + 1),
            None => Some(0),
        }
    }

    /// Offset of the last record of the block, or `None` when empty.
    pub fn last_item(&self) -> Option<usize> {
        if self.block.is_empty() {
            None
        } else {
            self.prev_item(self.data().len())
        }
    }

    /// Byte offset of the first record with position `>= pos`, scanning from
    /// `lowerbound`.
    pub fn upper_bound(&self, pos: Position, lowerbound: usize) -> Option<usize> {
        if lowerbound >= self.data().len() || pos > self.id() {
            return None;
        }
        let rel = self.rel_from_position(pos);
        codec::find_struct_upper_bound_desc(&self.data()[lowerbound..], rel)
            .map(|off| lowerbound + off)
    }

    /// Byte offset of the record at exactly `pos`, if present.
    pub fn find(&self, pos: Position, lowerbound: usize) -> Result<Option<usize>> {
        if let Some(at) = self.upper_bound(pos, lowerbound) {
            if self.position_at(at)? == pos {
                return Ok(Some(at));
            }
        }
        Ok(None)
    }

    /// Append a record; positions must arrive strictly ascending and the
    /// block id must already cover `pos`.
    pub fn append(&mut self, pos: Position, item: &str) -> Result<()> {
        if let Some(last) = self.last_item() {
            if self.position_at(last)? >= pos {
                return Err(StorageError::InvalidArgument(
                    "forward index items not added in ascending position order".into(),
                ));
            }
        }
        if self.id() < pos {
            return Err(StorageError::InvalidArgument(
                "upper bound of position in forward index block not set".into(),
            ));
        }
        let mut record = Vec::with_capacity(item.len() + 7);
        if !self.block.is_empty() {
            record.push(END_ITEM_MARKER);
        }
        codec::pack_index(&mut record, self.rel_from_position(pos));
        record.extend_from_slice(item.as_bytes());
        self.block.append(&record);
        Ok(())
    }

    /// Change the block id, rewriting the stored relative positions.
    pub fn set_id(&mut self, id: Index) -> Result<()> {
        if self.id() == id {
            return Ok(());
        }
        if self.block.is_empty() {
            self.block.set_id(id);
            return Ok(());
        }
        let last = self.last_item().unwrap();
        let max_pos = self.position_at(last)?;
        if max_pos > id {
            return Err(StorageError::InvalidArgument(
                "cannot set forward index block id below the highest stored position".into(),
            ));
        }
        let diff = id - self.id();
        let mut content = Vec::with_capacity(self.data().len());
        let mut at = Some(0usize);
        while let Some(start) = at {
            let (rel, used) = codec::unpack_index(&self.data()[start..])?;
            let next = self.next_item(start);
            let end = next.map(|n| n - 1).unwrap_or(self.data().len());
            if !content.is_empty() {
                content.push(END_ITEM_MARKER);
            }
            codec::pack_index(&mut content, rel + diff);
            content.extend_from_slice(&self.data()[start + used..end]);
            at = next;
        }
        self.block = DataBlock::new(id, content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> ForwardIndexBlock {
        let mut blk = ForwardIndexBlock::from_bytes(100, &[]);
        blk.append(3, "alpha").unwrap();
        blk.append(7, "beta").unwrap();
        blk.append(40, "gamma").unwrap();
        blk.append(100, "delta").unwrap();
        blk
    }

    #[test]
    fn iterate_records() {
        let blk = sample_block();
        let mut at = Some(0usize);
        let mut got = Vec::new();
        while let Some(a) = at {
            got.push((blk.position_at(a).unwrap(), blk.value_at(a).unwrap()));
            at = blk.next_item(a);
        }
        assert_eq!(
            got,
            vec![
                (3, "alpha".to_string()),
                (7, "beta".to_string()),
                (40, "gamma".to_string()),
                (100, "delta".to_string())
            ]
        );
    }

    #[test]
    fn upper_bound_by_position() {
        let blk = sample_block();
        let at = blk.upper_bound(4, 0).unwrap();
        assert_eq!(blk.position_at(at).unwrap(), 7);
        let at = blk.upper_bound(40, 0).unwrap();
        assert_eq!(blk.position_at(at).unwrap(), 40);
        let at = blk.upper_bound(41, 0).unwrap();
        assert_eq!(blk.position_at(at).unwrap(), 100);
        assert!(blk.upper_bound(101, 0).is_none());
    }

    #[test]
    fn find_exact() {
        let blk = sample_block();
        assert!(blk.find(7, 0).unwrap().is_some());
        assert!(blk.find(8, 0).unwrap().is_none());
    }

    #[test]
    fn append_disorder_rejected() {
        let mut blk = sample_block();
        assert!(blk.append(40, "late").is_err());
        assert!(blk.append(101, "past-id").is_err());
    }

    #[test]
    fn set_id_rewrites_relative_positions() {
        let mut blk = sample_block();
        blk.set_id(500).unwrap();
        assert_eq!(blk.id(), 500);
        let mut at = Some(0usize);
        let mut got = Vec::new();
        while let Some(a) = at {
            got.push(blk.position_at(a).unwrap());
            at = blk.next_item(a);
        }
        assert_eq!(got, vec![3, 7, 40, 100]);
        let at = blk.upper_bound(40, 0).unwrap();
        assert_eq!(blk.value_at(at).unwrap(), "gamma");
    }

    #[test]
    fn prev_item_walks_backwards() {
        let blk = sample_block();
        let last = blk.last_item().unwrap();
        assert_eq!(blk.position_at(last).unwrap(), 100);
        let prev = blk.prev_item(last).unwrap();
        assert_eq!(blk.position_at(prev).unwrap(), 40);
    }
}
