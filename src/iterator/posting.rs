//! Term posting iterator
//!
//! Combines the cheap docno-only boolean doc-list cursor with the posinfo
//! cursor. Doc skips prefer whichever cursor already covers the target;
//! positions and frequency pull the posinfo cursor onto the current doc on
//! demand.

use super::docset::IndexSetIterator;
use super::posinfo::PosinfoIterator;
use crate::database::{Database, KeyFamily};
use crate::error::Result;
use crate::types::{GlobalCounter, Index, Position};
use std::sync::Arc;

pub struct PostingIterator {
    docno_iterator: IndexSetIterator,
    posinfo_iterator: PosinfoIterator,
    docno: Index,
}

impl PostingIterator {
    pub fn new(db: Arc<dyn Database>, typeno: Index, termno: Index) -> Self {
        Self {
            docno_iterator: IndexSetIterator::new(
                Arc::clone(&db),
                KeyFamily::DocListBlock,
                &[typeno, termno],
            ),
            posinfo_iterator: PosinfoIterator::new(db, typeno, termno),
            docno: 0,
        }
    }

    pub fn docno(&self) -> Index {
        self.docno
    }

    /// Smallest docno `>= docno` containing the term, or 0.
    pub fn skip_doc(&mut self, docno: Index) -> Result<Index> {
        if self.docno != 0 && self.docno == docno {
            return Ok(self.docno);
        }
        self.docno = if self.posinfo_iterator.is_close_candidate(docno) {
            self.posinfo_iterator.skip_doc(docno)?
        } else {
            self.docno_iterator.skip(docno)?
        };
        Ok(self.docno)
    }

    /// Smallest position `>= firstpos` of the term in the current doc, or 0.
    pub fn skip_pos(&mut self, firstpos: Position) -> Result<Position> {
        if self.docno == 0 {
            return Ok(0);
        }
        if self.posinfo_iterator.skip_doc(self.docno)? != self.docno {
            return Ok(0);
        }
        self.posinfo_iterator.skip_pos(firstpos)
    }

    /// ff of the term in the current doc.
    pub fn frequency(&mut self) -> Result<u32> {
        if self.docno == 0 {
            return Ok(0);
        }
        if self.posinfo_iterator.skip_doc(self.docno)? != self.docno {
            return Ok(0);
        }
        Ok(self.posinfo_iterator.frequency())
    }

    /// Positions of the term in the current doc.
    pub fn positions(&mut self) -> Result<Vec<Position>> {
        if self.docno == 0 {
            return Ok(Vec::new());
        }
        if self.posinfo_iterator.skip_doc(self.docno)? != self.docno {
            return Ok(Vec::new());
        }
        Ok(self.posinfo_iterator.positions())
    }

    pub fn document_frequency(&mut self) -> Result<GlobalCounter> {
        self.posinfo_iterator.document_frequency()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{BooleanBlockBuilder, PosinfoBlockBuilder};
    use crate::codec;
    use crate::database::{DatabaseKey, MemDatabase, WriteBatch};

    /// Write the doclist, posinfo and df records of one term.
    fn store_term(db: &MemDatabase, typeno: Index, termno: Index, postings: &[(Index, &[Index])]) {
        let mut batch = WriteBatch::new();
        let mut doclist = BooleanBlockBuilder::new();
        let mut posinfo = PosinfoBlockBuilder::new();
        for &(docno, positions) in postings {
            doclist.define_range(docno, 0).unwrap();
            posinfo.append(docno, positions).unwrap();
        }
        let blk = doclist.into_block();
        batch.put(
            DatabaseKey::with_elems(KeyFamily::DocListBlock, &[typeno, termno, blk.id()])
                .into_bytes(),
            blk.to_bytes(),
        );
        let blk = posinfo.build().unwrap();
        batch.put(
            DatabaseKey::with_elems(KeyFamily::PosInfoBlock, &[typeno, termno, blk.id()])
                .into_bytes(),
            blk.to_bytes(),
        );
        let mut dfval = Vec::new();
        codec::pack_global_counter(&mut dfval, postings.len() as u64).unwrap();
        batch.put(
            DatabaseKey::with_elems(KeyFamily::DocFrequency, &[typeno, termno]).into_bytes(),
            dfval,
        );
        db.write(batch, false).unwrap();
    }

    #[test]
    fn iterates_docs_and_positions() {
        let db = Arc::new(MemDatabase::ephemeral());
        store_term(&db, 1, 1, &[(1, &[1, 2]), (2, &[1]), (4, &[1, 2, 3])]);
        let mut itr = PostingIterator::new(db, 1, 1);
        assert_eq!(itr.skip_doc(1).unwrap(), 1);
        assert_eq!(itr.frequency().unwrap(), 2);
        assert_eq!(itr.skip_doc(3).unwrap(), 4);
        assert_eq!(itr.skip_pos(2).unwrap(), 2);
        assert_eq!(itr.skip_pos(4).unwrap(), 0);
        assert_eq!(itr.skip_doc(5).unwrap(), 0);
        assert_eq!(itr.document_frequency().unwrap(), 3);
    }

    #[test]
    fn df_matches_iterated_count() {
        let db = Arc::new(MemDatabase::ephemeral());
        let postings: Vec<(Index, Vec<Index>)> =
            (1..=20).map(|d| (d * 2, vec![1, d + 1])).collect();
        let borrowed: Vec<(Index, &[Index])> =
            postings.iter().map(|(d, p)| (*d, p.as_slice())).collect();
        store_term(&db, 2, 9, &borrowed);

        let mut itr = PostingIterator::new(db, 2, 9);
        let mut count = 0u64;
        let mut d = itr.skip_doc(1).unwrap();
        while d != 0 {
            count += 1;
            assert_eq!(itr.frequency().unwrap() as usize, 2);
            d = itr.skip_doc(d + 1).unwrap();
        }
        assert_eq!(count, itr.document_frequency().unwrap());
    }
}
