//! Inverse-term blocks: per-document list of occurring terms
//!
//! One block per document, keyed by the docno, holding packed
//! `(typeno, termno, ff, firstpos)` tuples. The transaction reads this
//! block to undo an insert when the document is deleted or replaced.

use super::DataBlock;
use crate::codec;
use crate::error::Result;
use crate::types::{Index, Position};

/// One entry of an inverse-term block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvTerm {
    pub typeno: Index,
    pub termno: Index,
    pub ff: Index,
    pub firstpos: Position,
}

/// Loaded inverse-term block.
#[derive(Debug, Clone, Default)]
pub struct InvTermBlock {
    block: DataBlock,
}

impl InvTermBlock {
    pub fn from_bytes(docno: Index, bytes: &[u8]) -> Self {
        Self {
            block: DataBlock::new(docno, bytes.to_vec()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.block.bytes().to_vec()
    }

    pub fn docno(&self) -> Index {
        self.block.id()
    }

    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }

    pub fn append(&mut self, entry: &InvTerm) {
        let mut record = Vec::with_capacity(16);
        codec::pack_index(&mut record, entry.typeno);
        codec::pack_index(&mut record, entry.termno);
        codec::pack_index(&mut record, entry.ff);
        codec::pack_index(&mut record, entry.firstpos);
        self.block.append(&record);
    }

    /// Decode all entries of the block.
    pub fn entries(&self) -> Result<Vec<InvTerm>> {
        let data = self.block.bytes();
        let mut out = Vec::new();
        let mut at = 0;
        while at < data.len() {
            let (typeno, n) = codec::unpack_index(&data[at..])?;
            at += n;
            let (termno, n) = codec::unpack_index(&data[at..])?;
            at += n;
            let (ff, n) = codec::unpack_index(&data[at..])?;
            at += n;
            let (firstpos, n) = codec::unpack_index(&data[at..])?;
            at += n;
            out.push(InvTerm {
                typeno,
                termno,
                ff,
                firstpos,
            });
        }
        Ok(out)
    }
}
