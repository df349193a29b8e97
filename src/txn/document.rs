//! Document builder: collects the content of one insert
//!
//! Terms, tokens, metadata, attributes, access rights and structures are
//! collected per document and staged into the transaction maps when the
//! builder is closed with [`done`](StorageDocument::done).

use super::StorageTransaction;
use crate::blocks::InvTerm;
use crate::error::{Result, StorageError};
use crate::types::{Index, IndexRange, Position, ScalarValue};
use std::collections::{BTreeMap, BTreeSet};

/// Upper bound for token positions in the index blocks.
const MAX_POSITION: Position = 65535;

pub struct StorageDocument<'a> {
    txn: &'a mut StorageTransaction,
    docno: Index,
    is_new: bool,
    terms: BTreeMap<(Index, Index), BTreeSet<Position>>,
    forward: Vec<(Index, Position, String)>,
    metadata: Vec<(Index, ScalarValue)>,
    attributes: Vec<(Index, String)>,
    access: Vec<Index>,
    structures: Vec<(IndexRange, Vec<IndexRange>)>,
}

impl<'a> StorageDocument<'a> {
    pub(crate) fn new(txn: &'a mut StorageTransaction, docno: Index, is_new: bool) -> Self {
        Self {
            txn,
            docno,
            is_new,
            terms: BTreeMap::new(),
            forward: Vec::new(),
            metadata: Vec::new(),
            attributes: Vec::new(),
            access: Vec::new(),
            structures: Vec::new(),
        }
    }

    pub fn docno(&self) -> Index {
        self.docno
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    fn check_position(pos: Position) -> Result<()> {
        if pos == 0 {
            return Err(StorageError::InvalidArgument(
                "term position must be positive".into(),
            ));
        }
        if pos > MAX_POSITION {
            return Err(StorageError::InvalidArgument(
                "term position out of range (max 65535)".into(),
            ));
        }
        Ok(())
    }

    /// Add one occurrence of a search index term. Duplicate positions fold.
    pub fn add_search_index_term(
        &mut self,
        termtype: &str,
        termvalue: &str,
        pos: Position,
    ) -> Result<()> {
        Self::check_position(pos)?;
        let typeno = self.txn.get_or_create_term_type(termtype)?;
        let termno = self.txn.get_or_create_term_value(termvalue)?;
        self.terms.entry((typeno, termno)).or_default().insert(pos);
        Ok(())
    }

    /// Add one token of the forward index (the original string at `pos`).
    pub fn add_forward_index_term(
        &mut self,
        termtype: &str,
        tokenvalue: &str,
        pos: Position,
    ) -> Result<()> {
        Self::check_position(pos)?;
        let typeno = self.txn.get_or_create_term_type(termtype)?;
        self.forward.push((typeno, pos, tokenvalue.to_string()));
        Ok(())
    }

    pub fn set_metadata(&mut self, name: &str, value: ScalarValue) -> Result<()> {
        let handle = self.txn.shared().descr.element_handle(name)?;
        self.metadata.push((handle, value));
        Ok(())
    }

    pub fn set_attribute(&mut self, name: &str, value: &str) -> Result<()> {
        let attrno = self.txn.get_or_create_attribute_name(name)?;
        self.attributes.push((attrno, value.to_string()));
        Ok(())
    }

    pub fn set_user_access_right(&mut self, username: &str) -> Result<()> {
        if !self.txn.shared().acl_enabled {
            return Err(StorageError::InvalidArgument(
                "storage was created without access control lists".into(),
            ));
        }
        let userno = self.txn.get_or_create_userno(username)?;
        self.access.push(userno);
        Ok(())
    }

    /// Add a source range with its sink ranges. Sources must be added in
    /// ascending order of their end position.
    pub fn add_structure(&mut self, source: IndexRange, sinks: Vec<IndexRange>) -> Result<()> {
        for r in std::iter::once(&source).chain(sinks.iter()) {
            Self::check_position(r.start)?;
            Self::check_position(r.end)?;
            if r.start > r.end {
                return Err(StorageError::InvalidArgument(
                    "structure range end before start".into(),
                ));
            }
        }
        self.structures.push((source, sinks));
        Ok(())
    }

    /// Close the document and stage its content into the transaction.
    pub fn done(self) -> Result<()> {
        let docno = self.docno;
        let mut invterms = Vec::with_capacity(self.terms.len());
        for ((typeno, termno), positions) in self.terms {
            let positions: Vec<Position> = positions.into_iter().collect();
            invterms.push(InvTerm {
                typeno,
                termno,
                ff: positions.len() as Index,
                firstpos: positions[0],
            });
            self.txn.stage_posting(typeno, termno, docno, positions);
        }
        if !invterms.is_empty() {
            self.txn.stage_invterms(docno, invterms);
        }
        for (typeno, pos, value) in self.forward {
            self.txn.stage_forward_term(typeno, docno, pos, &value);
        }
        for (handle, value) in self.metadata {
            self.txn.stage_metadata(docno, handle, value);
        }
        for (attrno, value) in self.attributes {
            self.txn.stage_attribute(docno, attrno, &value);
        }
        for userno in self.access {
            self.txn.stage_acl(userno, docno);
        }
        if !self.structures.is_empty() {
            self.txn.stage_structures(docno, self.structures);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::Storage;

    fn storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StorageConfig::parse(&format!(
            "path={};metadata=doclen:uint16",
            dir.path().join("st").display()
        ))
        .unwrap();
        let st = Storage::create(&cfg).unwrap();
        (dir, st)
    }

    #[test]
    fn position_zero_rejected() {
        let (_dir, st) = storage();
        let mut txn = st.transaction();
        let mut doc = txn.create_document("d1").unwrap();
        assert!(matches!(
            doc.add_search_index_term("word", "x", 0),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            doc.add_forward_index_term("word", "x", 0),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(doc.add_search_index_term("word", "x", 70000).is_err());
    }

    #[test]
    fn duplicate_positions_fold() {
        let (_dir, st) = storage();
        let mut txn = st.transaction();
        let mut doc = txn.create_document("d1").unwrap();
        doc.add_search_index_term("word", "a", 3).unwrap();
        doc.add_search_index_term("word", "a", 3).unwrap();
        doc.add_search_index_term("word", "a", 1).unwrap();
        doc.done().unwrap();
        txn.commit().unwrap();

        let mut itr = st.posting_iterator("word", "a").unwrap();
        let d = itr.skip_doc(1).unwrap();
        assert_ne!(d, 0);
        assert_eq!(itr.frequency().unwrap(), 2);
        assert_eq!(itr.positions().unwrap(), vec![1, 3]);
    }

    #[test]
    fn unknown_metadata_name_rejected() {
        let (_dir, st) = storage();
        let mut txn = st.transaction();
        let mut doc = txn.create_document("d1").unwrap();
        assert!(doc.set_metadata("nope", ScalarValue::UInt(1)).is_err());
    }

    #[test]
    fn acl_requires_configuration() {
        let (_dir, st) = storage();
        let mut txn = st.transaction();
        let mut doc = txn.create_document("d1").unwrap();
        assert!(matches!(
            doc.set_user_access_right("alice"),
            Err(StorageError::InvalidArgument(_))
        ));
    }
}
