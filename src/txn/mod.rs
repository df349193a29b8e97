//! Transactions: staged updates with one batched commit
//!
//! A transaction stages every mutation in private maps, one per record
//! family. Names referenced before they exist receive transaction-local
//! handles; at commit the handles are resolved to stable ids, every staged
//! record is renamed, the affected blocks are merged and a single batched
//! write is emitted. Only the commit body takes the process-wide
//! transaction lock.

mod attribute_map;
mod boolean_map;
mod df_map;
mod document;
mod ff_map;
mod forward_map;
mod invterm_map;
mod metadata_map;
mod posinfo_map;
mod struct_map;

pub use document::StorageDocument;

use crate::blocks::BooleanBlock;
use crate::blocks::boolean::NodeCursor;
use crate::codec;
use crate::database::{Database, DatabaseKey, KeyFamily, WriteBatch};
use crate::error::{Result, StorageError};
use crate::keymap::{KeyAllocator, KeyMap};
use crate::storage::{variables_write_batch, StorageShared};
use crate::types::{Index, ScalarValue};
use ahash::AHashMap;
use attribute_map::AttributeMap;
use boolean_map::BooleanBlockMap;
use df_map::DocFrequencyMap;
use ff_map::FfBlockMap;
use forward_map::ForwardIndexMap;
use invterm_map::InvTermMap;
use metadata_map::MetaDataMap;
use posinfo_map::PosinfoBlockMap;
use std::sync::Arc;
use struct_map::StructureMap;

/// Scan all blocks of one family prefix with id `>= from`. Returns
/// `(id, value)` pairs in key order.
pub(crate) fn scan_block_tail(
    db: &dyn Database,
    prefix: &[u8],
    from: Index,
) -> Result<Vec<(Index, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut seek = prefix.to_vec();
    codec::pack_index(&mut seek, from);
    let mut cursor = db.cursor();
    let mut entry = cursor.seek_upper_bound(&seek);
    while let Some((key, value)) = entry {
        if !key.starts_with(prefix) || key.len() == prefix.len() {
            break;
        }
        let (id, _) = codec::unpack_index(&key[prefix.len()..])?;
        out.push((id, value));
        entry = cursor.next();
    }
    Ok(out)
}

/// Blocks a staged update starting at `from` must merge with: the tail of
/// the family from the covering block on. When every staged docno lies past
/// the last block, that last block is the seed so appends grow it instead
/// of opening a new undersized block.
pub(crate) fn scan_affected_blocks(
    db: &dyn Database,
    prefix: &[u8],
    from: Index,
) -> Result<Vec<(Index, Vec<u8>)>> {
    let tail = scan_block_tail(db, prefix, from)?;
    if !tail.is_empty() {
        return Ok(tail);
    }
    let all = scan_block_tail(db, prefix, 0)?;
    Ok(all.into_iter().last().into_iter().collect())
}

/// All keys of one family prefix.
pub(crate) fn scan_family_keys(db: &dyn Database, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    let mut cursor = db.cursor();
    let mut entry = cursor.seek_upper_bound(prefix);
    while let Some((key, _)) = entry {
        if !key.starts_with(prefix) {
            break;
        }
        out.push(key);
        entry = cursor.next();
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Open,
    Committed,
    RolledBack,
    Poisoned,
}

/// Staged ACL changes in both directions.
struct AclMap {
    /// `U` family: docnos per user
    user_map: BooleanBlockMap,
    /// `A` family: usernos per doc
    doc_map: BooleanBlockMap,
    doc_deletes: Vec<Index>,
    user_deletes: Vec<Index>,
}

impl AclMap {
    fn new() -> Self {
        Self {
            user_map: BooleanBlockMap::new(KeyFamily::UserAcl),
            doc_map: BooleanBlockMap::new(KeyFamily::Acl),
            doc_deletes: Vec::new(),
            user_deletes: Vec::new(),
        }
    }

    fn define_access(&mut self, userno: Index, docno: Index) {
        self.user_map.define_element((userno, 0), docno);
        self.doc_map.define_element((docno, 0), userno);
    }

    fn delete_access(&mut self, userno: Index, docno: Index) {
        self.user_map.delete_element((userno, 0), docno);
        self.doc_map.delete_element((docno, 0), userno);
    }

    fn delete_document_access(&mut self, docno: Index) {
        self.doc_deletes.push(docno);
    }

    fn delete_user_access(&mut self, userno: Index) {
        self.user_deletes.push(userno);
    }

    fn rename_docnos(&mut self, rename: &AHashMap<Index, Index>) {
        self.user_map.rename_elements(rename);
        self.doc_map.rename_first_key(rename);
    }

    fn rename_usernos(&mut self, rename: &AHashMap<Index, Index>) {
        self.user_map.rename_first_key(rename);
        self.doc_map.rename_elements(rename);
    }

    fn get_write_batch(&mut self, db: &dyn Database, batch: &mut WriteBatch) -> Result<()> {
        // resolve whole-document erasures against the stored inverse sets;
        // weak deletes keep additions staged by a replacing insert
        for docno in std::mem::take(&mut self.doc_deletes) {
            let prefix = DatabaseKey::with_elem(KeyFamily::Acl, docno).into_bytes();
            for (id, bytes) in scan_block_tail(db, &prefix, 0)? {
                let blk = BooleanBlock::from_bytes(id, &bytes)?;
                let mut cursor = NodeCursor::default();
                let mut userno = blk.get_first(&mut cursor);
                while userno != 0 {
                    self.user_map.delete_element_weak((userno, 0), docno);
                    self.doc_map.delete_element_weak((docno, 0), userno);
                    userno = blk.get_next(&mut cursor);
                }
            }
        }
        // symmetric for whole-user erasures
        for userno in std::mem::take(&mut self.user_deletes) {
            let prefix = DatabaseKey::with_elem(KeyFamily::UserAcl, userno).into_bytes();
            for (id, bytes) in scan_block_tail(db, &prefix, 0)? {
                let blk = BooleanBlock::from_bytes(id, &bytes)?;
                let mut cursor = NodeCursor::default();
                let mut docno = blk.get_first(&mut cursor);
                while docno != 0 {
                    self.user_map.delete_element_weak((userno, 0), docno);
                    self.doc_map.delete_element_weak((docno, 0), userno);
                    docno = blk.get_next(&mut cursor);
                }
            }
        }
        self.user_map.get_write_batch(db, batch)?;
        self.doc_map.get_write_batch(db, batch)?;
        Ok(())
    }
}

/// One open transaction.
pub struct StorageTransaction {
    shared: Arc<StorageShared>,
    term_type_map: KeyMap,
    term_value_map: KeyMap,
    docid_map: KeyMap,
    user_id_map: KeyMap,
    attr_name_map: KeyMap,
    posinfo_map: PosinfoBlockMap,
    doclist_map: BooleanBlockMap,
    ff_map: FfBlockMap,
    forward_map: ForwardIndexMap,
    invterm_map: InvTermMap,
    meta_map: MetaDataMap,
    attr_map: AttributeMap,
    acl_map: AclMap,
    df_map: DocFrequencyMap,
    struct_map: StructureMap,
    nof_documents_delta: i64,
    state: TxnState,
}

impl StorageTransaction {
    pub(crate) fn new(shared: Arc<StorageShared>) -> Self {
        let db = Arc::clone(&shared.db);
        let term_type_map = KeyMap::new(
            Arc::clone(&db),
            KeyFamily::TermType,
            KeyAllocator::immediate(
                Arc::clone(&shared.next_typeno),
                Arc::clone(&shared.typeno_shared),
            ),
        );
        let attr_name_map = KeyMap::new(
            Arc::clone(&db),
            KeyFamily::AttributeName,
            KeyAllocator::immediate(
                Arc::clone(&shared.next_attribno),
                Arc::clone(&shared.attribno_shared),
            ),
        );
        // the deferred maps collect an inverse map, so the ids a transaction
        // handed out resolve back to their strings until commit
        let mut term_value_map = KeyMap::new(
            Arc::clone(&db),
            KeyFamily::TermValue,
            KeyAllocator::deferred(Arc::clone(&shared.next_termno)),
        );
        term_value_map.define_inv();
        let mut docid_map = KeyMap::new(
            Arc::clone(&db),
            KeyFamily::DocId,
            KeyAllocator::deferred(Arc::clone(&shared.next_docno)),
        );
        docid_map.define_inv();
        let mut user_id_map = KeyMap::new(
            Arc::clone(&db),
            KeyFamily::UserName,
            KeyAllocator::deferred(Arc::clone(&shared.next_userno)),
        );
        user_id_map.define_inv();
        Self {
            shared,
            term_type_map,
            term_value_map,
            docid_map,
            user_id_map,
            attr_name_map,
            posinfo_map: PosinfoBlockMap::new(),
            doclist_map: BooleanBlockMap::new(KeyFamily::DocListBlock),
            ff_map: FfBlockMap::new(),
            forward_map: ForwardIndexMap::new(),
            invterm_map: InvTermMap::new(),
            meta_map: MetaDataMap::new(),
            attr_map: AttributeMap::new(),
            acl_map: AclMap::new(),
            df_map: DocFrequencyMap::new(),
            struct_map: StructureMap::new(),
            nof_documents_delta: 0,
            state: TxnState::Open,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<StorageShared> {
        &self.shared
    }

    pub fn get_or_create_term_type(&mut self, name: &str) -> Result<Index> {
        Ok(self.term_type_map.get_or_create(name)?.0)
    }

    pub fn get_or_create_term_value(&mut self, name: &str) -> Result<Index> {
        Ok(self.term_value_map.get_or_create(name)?.0)
    }

    pub fn get_or_create_docno(&mut self, docid: &str) -> Result<(Index, bool)> {
        self.docid_map.get_or_create(docid)
    }

    pub fn get_or_create_userno(&mut self, username: &str) -> Result<Index> {
        Ok(self.user_id_map.get_or_create(username)?.0)
    }

    pub fn get_or_create_attribute_name(&mut self, name: &str) -> Result<Index> {
        Ok(self.attr_name_map.get_or_create(name)?.0)
    }

    pub fn lookup_term_value(&self, name: &str) -> Result<Index> {
        self.term_value_map.lookup(name)
    }

    /// Term value string of an id handed out by this transaction; also
    /// resolves local handles before they are renamed at commit.
    pub fn term_value_name(&self, termno: Index) -> Option<&str> {
        self.term_value_map.name_of(termno)
    }

    /// Document id string of a docno handed out by this transaction.
    pub fn docid_name(&self, docno: Index) -> Option<&str> {
        self.docid_map.name_of(docno)
    }

    /// User name string of a userno handed out by this transaction.
    pub fn user_name(&self, userno: Index) -> Option<&str> {
        self.user_id_map.name_of(userno)
    }

    /// Open a document builder. Inserting an id that already exists replaces
    /// the stored document.
    pub fn create_document(&mut self, docid: &str) -> Result<StorageDocument<'_>> {
        if self.state != TxnState::Open {
            return Err(StorageError::Conflict(
                "transaction is no longer open".into(),
            ));
        }
        let (docno, is_new) = self.get_or_create_docno(docid)?;
        if !is_new {
            self.stage_delete_content(docno)?;
        } else {
            self.nof_documents_delta += 1;
        }
        Ok(StorageDocument::new(self, docno, is_new))
    }

    /// Delete a document by id; unknown ids are ignored.
    pub fn delete_document(&mut self, docid: &str) -> Result<()> {
        if self.state != TxnState::Open {
            return Err(StorageError::Conflict(
                "transaction is no longer open".into(),
            ));
        }
        let docno = self.docid_map.lookup(docid)?;
        if docno == 0 {
            return Ok(());
        }
        self.stage_delete_content(docno)?;
        self.nof_documents_delta -= 1;
        Ok(())
    }

    /// Revoke all access rights of a user.
    pub fn delete_user_access_rights(&mut self, username: &str) -> Result<()> {
        let userno = self.user_id_map.lookup(username)?;
        if userno != 0 {
            self.acl_map.delete_user_access(userno);
        }
        Ok(())
    }

    /// Stage removal of everything stored under a document: postings found
    /// through the inverse-term block, metadata, attributes, forward index,
    /// ACL entries and structures.
    fn stage_delete_content(&mut self, docno: Index) -> Result<()> {
        let key = DatabaseKey::with_elem(KeyFamily::InvTerm, docno);
        if let Some(bytes) = self.shared.db.get(key.as_bytes())? {
            let blk = crate::blocks::InvTermBlock::from_bytes(docno, &bytes);
            for entry in blk.entries()? {
                self.doclist_map
                    .delete_element((entry.typeno, entry.termno), docno);
                self.posinfo_map
                    .delete_posting(entry.typeno, entry.termno, docno);
                self.ff_map.delete_ff(entry.typeno, entry.termno, docno);
                self.df_map.decrement(entry.typeno, entry.termno);
            }
        }
        self.invterm_map.delete_block(docno);
        self.meta_map.delete_document(docno, &self.shared.descr);
        self.attr_map.delete_document(docno);
        self.forward_map.delete_document(docno);
        self.struct_map.delete_document(docno);
        if self.shared.acl_enabled {
            self.acl_map.delete_document_access(docno);
        }
        Ok(())
    }

    pub(crate) fn stage_posting(
        &mut self,
        typeno: Index,
        termno: Index,
        docno: Index,
        positions: Vec<Index>,
    ) {
        self.doclist_map.define_element((typeno, termno), docno);
        self.ff_map
            .define_ff(typeno, termno, docno, positions.len() as u32);
        self.posinfo_map
            .define_posting(typeno, termno, docno, positions);
        self.df_map.increment(typeno, termno);
    }

    pub(crate) fn stage_invterms(&mut self, docno: Index, entries: Vec<crate::blocks::InvTerm>) {
        self.invterm_map.define_block(docno, entries);
    }

    pub(crate) fn stage_forward_term(
        &mut self,
        typeno: Index,
        docno: Index,
        pos: Index,
        value: &str,
    ) {
        self.forward_map.define_term(typeno, docno, pos, value);
    }

    pub(crate) fn stage_metadata(&mut self, docno: Index, handle: Index, value: ScalarValue) {
        self.meta_map.define(docno, handle, value);
    }

    /// Stage a metadata assignment addressed by element name.
    pub fn define_metadata(&mut self, docno: Index, name: &str, value: ScalarValue) -> Result<()> {
        let handle = self.shared.descr.element_handle(name)?;
        self.meta_map.define(docno, handle, value);
        Ok(())
    }

    pub fn define_attribute(&mut self, docno: Index, name: &str, value: &str) -> Result<()> {
        let attrno = self.get_or_create_attribute_name(name)?;
        self.attr_map.define(docno, attrno, value);
        Ok(())
    }

    pub fn delete_attribute(&mut self, docno: Index, name: &str) -> Result<()> {
        let attrno = self.get_or_create_attribute_name(name)?;
        self.attr_map.delete(docno, attrno);
        Ok(())
    }

    pub(crate) fn stage_attribute(&mut self, docno: Index, attrno: Index, value: &str) {
        self.attr_map.define(docno, attrno, value);
    }

    pub(crate) fn stage_acl(&mut self, userno: Index, docno: Index) {
        self.acl_map.define_access(userno, docno);
    }

    pub fn delete_acl(&mut self, userno: Index, docno: Index) {
        self.acl_map.delete_access(userno, docno);
    }

    pub(crate) fn stage_structures(
        &mut self,
        docno: Index,
        structures: Vec<(crate::types::IndexRange, Vec<crate::types::IndexRange>)>,
    ) {
        self.struct_map.define_document(docno, structures);
    }

    /// Commit: resolve ids, merge blocks, emit one batched write, update the
    /// global counters and publish the metadata refresh list.
    pub fn commit(&mut self) -> Result<()> {
        match self.state {
            TxnState::Open => {}
            TxnState::Committed => {
                return Err(StorageError::Conflict("transaction commit called twice".into()))
            }
            TxnState::RolledBack => {
                return Err(StorageError::Conflict(
                    "transaction commit called after rollback".into(),
                ))
            }
            TxnState::Poisoned => {
                return Err(StorageError::Conflict(
                    "transaction failed in a previous commit".into(),
                ))
            }
        }
        let shared = Arc::clone(&self.shared);
        let _guard = shared.transaction_lock.lock();
        let refresh = match self.commit_locked(&shared) {
            Ok(refresh) => refresh,
            Err(err) => {
                self.state = TxnState::Poisoned;
                return Err(err);
            }
        };
        shared.nof_documents.add(self.nof_documents_delta);
        shared.metadata_cache.refresh(&refresh);
        self.nof_documents_delta = 0;
        self.state = TxnState::Committed;
        Ok(())
    }

    fn commit_locked(&mut self, shared: &StorageShared) -> Result<Vec<Index>> {
        let db = Arc::clone(&shared.db);
        let mut batch = WriteBatch::new();

        // [a] resolve term value handles and rename staged postings
        let mut term_rename = AHashMap::new();
        self.term_value_map
            .get_write_batch(&mut term_rename, &mut batch)?;
        self.posinfo_map.rename_new_termnos(&term_rename);
        self.ff_map.rename_new_termnos(&term_rename);
        self.doclist_map.rename_second_key(&term_rename);
        self.df_map.rename_new_termnos(&term_rename)?;
        self.invterm_map.rename_new_termnos(&term_rename);

        // [b] resolve docno handles
        let mut doc_rename = AHashMap::new();
        self.docid_map.get_write_batch(&mut doc_rename, &mut batch)?;
        self.posinfo_map.rename_new_docnos(&doc_rename);
        self.ff_map.rename_new_docnos(&doc_rename);
        self.doclist_map.rename_elements(&doc_rename);
        self.invterm_map.rename_new_docnos(&doc_rename);
        self.meta_map.rename_new_docnos(&doc_rename);
        self.attr_map.rename_new_docnos(&doc_rename);
        self.forward_map.rename_new_docnos(&doc_rename);
        self.struct_map.rename_new_docnos(&doc_rename);
        self.acl_map.rename_docnos(&doc_rename);

        // [c] resolve userno handles
        let mut user_rename = AHashMap::new();
        self.user_id_map
            .get_write_batch(&mut user_rename, &mut batch)?;
        self.acl_map.rename_usernos(&user_rename);

        // [d] flush immediately allocated names
        let mut ignore = AHashMap::new();
        self.term_type_map.get_write_batch(&mut ignore, &mut batch)?;
        self.attr_name_map.get_write_batch(&mut ignore, &mut batch)?;

        // [e] merge the staged block families
        self.attr_map.get_write_batch(db.as_ref(), &mut batch)?;
        let mut refresh = Vec::new();
        self.meta_map
            .get_write_batch(db.as_ref(), &shared.descr, &mut batch, &mut refresh)?;
        self.doclist_map.get_write_batch(db.as_ref(), &mut batch)?;
        self.posinfo_map.get_write_batch(db.as_ref(), &mut batch)?;
        self.ff_map.get_write_batch(db.as_ref(), &mut batch)?;
        let max_typeno = shared.next_typeno.value().saturating_sub(1);
        self.forward_map
            .get_write_batch(db.as_ref(), max_typeno, &mut batch)?;
        self.invterm_map.get_write_batch(&mut batch)?;
        self.struct_map.get_write_batch(db.as_ref(), &mut batch)?;
        self.acl_map.get_write_batch(db.as_ref(), &mut batch)?;
        self.df_map.get_write_batch(db.as_ref(), &mut batch)?;

        // [f] variables reflect the counters after all allocations
        variables_write_batch(shared, &mut batch, self.nof_documents_delta)?;

        // [g] one atomic durable write
        db.write(batch, true)?;
        Ok(refresh)
    }

    /// Discard all staged state. Ids already allocated through immediate
    /// allocators stay allocated; they are harmless and idempotent.
    pub fn rollback(&mut self) -> Result<()> {
        match self.state {
            TxnState::Open => {
                self.state = TxnState::RolledBack;
                Ok(())
            }
            TxnState::RolledBack => Err(StorageError::Conflict(
                "transaction rollback called twice".into(),
            )),
            TxnState::Committed => Err(StorageError::Conflict(
                "transaction rollback called after commit".into(),
            )),
            TxnState::Poisoned => Err(StorageError::Conflict(
                "transaction failed in a previous commit".into(),
            )),
        }
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
            "path={};metadata=doclen:uint16;acl=yes",
            dir.path().join("st").display()
        ))
        .unwrap();
        let st = Storage::create(&cfg).unwrap();
        (dir, st)
    }

    #[test]
    fn commit_twice_conflicts() {
        let (_dir, st) = storage();
        let mut txn = st.transaction();
        txn.commit().unwrap();
        assert!(matches!(txn.commit(), Err(StorageError::Conflict(_))));
        assert!(matches!(txn.rollback(), Err(StorageError::Conflict(_))));
    }

    #[test]
    fn rollback_then_commit_conflicts() {
        let (_dir, st) = storage();
        let mut txn = st.transaction();
        txn.rollback().unwrap();
        assert!(matches!(txn.commit(), Err(StorageError::Conflict(_))));
        assert!(matches!(txn.rollback(), Err(StorageError::Conflict(_))));
    }

    #[test]
    fn rollback_discards_staged_documents() {
        let (_dir, st) = storage();
        let mut txn = st.transaction();
        {
            let mut doc = txn.create_document("d1").unwrap();
            doc.add_search_index_term("word", "hello", 1).unwrap();
            doc.done().unwrap();
        }
        txn.rollback().unwrap();
        assert_eq!(st.nof_documents(), 0);
        let mut itr = st.posting_iterator("word", "hello").unwrap();
        assert_eq!(itr.skip_doc(1).unwrap(), 0);
    }

    #[test]
    fn transaction_resolves_ids_back_to_names() {
        use crate::keymap::is_unknown;
        let (_dir, st) = storage();
        let mut txn = st.transaction();
        let (docno, _) = txn.get_or_create_docno("d1").unwrap();
        let termno = txn.get_or_create_term_value("hello").unwrap();
        let userno = txn.get_or_create_userno("alice").unwrap();
        // before commit these are local handles, still resolvable
        assert!(is_unknown(docno));
        assert_eq!(txn.docid_name(docno), Some("d1"));
        assert_eq!(txn.term_value_name(termno), Some("hello"));
        assert_eq!(txn.user_name(userno), Some("alice"));
        assert_eq!(txn.docid_name(docno + 1), None);
    }
}
