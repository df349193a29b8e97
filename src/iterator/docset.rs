//! Boolean set iterators: doc lists and access control lists

use crate::blocks::{BlockCursor, BooleanBlock};
use crate::database::{Database, KeyFamily};
use crate::error::Result;
use crate::types::Index;
use std::sync::Arc;

/// Iterator over one boolean block family (doc list of a term, docs of a
/// user, users of a doc).
pub struct IndexSetIterator {
    cursor: BlockCursor<BooleanBlock>,
    elemno: Index,
}

impl IndexSetIterator {
    pub fn new(db: Arc<dyn Database>, family: KeyFamily, elems: &[Index]) -> Self {
        Self {
            cursor: BlockCursor::new(db, family, elems),
            elemno: 0,
        }
    }

    pub fn elemno(&self) -> Index {
        self.elemno
    }

    pub fn is_close_candidate(&self, elemno: Index) -> bool {
        self.cursor.is_close_candidate(elemno)
    }

    /// Smallest member `>= elemno`, or 0.
    pub fn skip(&mut self, elemno: Index) -> Result<Index> {
        self.elemno = self.cursor.skip_doc(elemno)?;
        Ok(self.elemno)
    }

    /// Collect all members; used by tooling and tests.
    pub fn all(&mut self) -> Result<Vec<Index>> {
        let mut out = Vec::new();
        let mut e = self.skip(1)?;
        while e != 0 {
            out.push(e);
            if e == Index::MAX {
                break;
            }
            e = self.skip(e + 1)?;
        }
        Ok(out)
    }
}

/// Iterator over the users permitted to see a document (`A` family).
pub struct InvAclIterator {
    inner: IndexSetIterator,
}

impl InvAclIterator {
    pub fn new(db: Arc<dyn Database>, docno: Index) -> Self {
        Self {
            inner: IndexSetIterator::new(db, KeyFamily::Acl, &[docno]),
        }
    }

    /// Smallest userno `>= userno` with access, or 0.
    pub fn skip_user(&mut self, userno: Index) -> Result<Index> {
        self.inner.skip(userno)
    }

    pub fn all_users(&mut self) -> Result<Vec<Index>> {
        self.inner.all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::BooleanBlockBuilder;
    use crate::database::{DatabaseKey, MemDatabase, WriteBatch};

    fn store_doclist(db: &MemDatabase, typeno: Index, termno: Index, docs: &[(Index, Index)]) {
        let mut builder = BooleanBlockBuilder::new();
        for &(from, to) in docs {
            builder.define_range(from, to - from).unwrap();
        }
        let blk = builder.into_block();
        let mut batch = WriteBatch::new();
        batch.put(
            DatabaseKey::with_elems(KeyFamily::DocListBlock, &[typeno, termno, blk.id()])
                .into_bytes(),
            blk.to_bytes(),
        );
        db.write(batch, false).unwrap();
    }

    #[test]
    fn skips_over_ranges() {
        let db = Arc::new(MemDatabase::ephemeral());
        store_doclist(&db, 1, 1, &[(2, 4), (9, 9)]);
        let mut itr = IndexSetIterator::new(db, KeyFamily::DocListBlock, &[1, 1]);
        assert_eq!(itr.skip(1).unwrap(), 2);
        assert_eq!(itr.skip(3).unwrap(), 3);
        assert_eq!(itr.skip(5).unwrap(), 9);
        assert_eq!(itr.skip(10).unwrap(), 0);
        assert_eq!(itr.all().unwrap(), vec![2, 3, 4, 9]);
    }

    #[test]
    fn acl_inverse_lookup() {
        let db = Arc::new(MemDatabase::ephemeral());
        // users 3 and 5 may see doc 7
        let mut builder = BooleanBlockBuilder::new();
        builder.define_range(3, 0).unwrap();
        builder.define_range(5, 0).unwrap();
        let blk = builder.into_block();
        let mut batch = WriteBatch::new();
        batch.put(
            DatabaseKey::with_elems(KeyFamily::Acl, &[7, blk.id()]).into_bytes(),
            blk.to_bytes(),
        );
        db.write(batch, false).unwrap();

        let mut itr = InvAclIterator::new(db, 7);
        assert_eq!(itr.all_users().unwrap(), vec![3, 5]);
    }
}
