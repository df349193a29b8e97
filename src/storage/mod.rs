//! Storage client: the entry point of the engine
//!
//! Owns the ordered store handle, the interning counters, the metadata
//! block cache and the process-wide transaction lock. Readers and iterators
//! borrow an immutable shared handle; transactions stage privately and
//! serialize their commit through the lock.

use crate::config::StorageConfig;
use crate::database::{Database, DatabaseKey, KeyFamily, MemDatabase, WriteBatch};
use crate::error::{Result, StorageError};
use crate::iterator::{
    FfPostingIterator, ForwardIndexIterator, IndexSetIterator, InvAclIterator, PosinfoIterator,
    PostingIterator, StructIterator,
};
use crate::metadata::{MetaDataBlockCache, MetaDataDescription, MetaDataReader};
use crate::stats::{AtomicCounter, AtomicSize, DocumentFrequencyCache};
use crate::txn::StorageTransaction;
use crate::types::{GlobalCounter, Index};
use crate::codec;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// Names of the persisted `v`-family variable records.
const VAR_TYPENO: &str = "TypeNo";
const VAR_TERMNO: &str = "TermNo";
const VAR_DOCNO: &str = "DocNo";
const VAR_USERNO: &str = "UserNo";
const VAR_ATTRIBNO: &str = "AttribNo";
const VAR_NOF_DOCS: &str = "NofDocs";

/// State shared between the client, its transactions and its readers.
pub(crate) struct StorageShared {
    pub db: Arc<dyn Database>,
    pub descr: Arc<MetaDataDescription>,
    pub metadata_cache: Arc<MetaDataBlockCache>,
    pub df_cache: DocumentFrequencyCache,
    pub transaction_lock: Mutex<()>,
    pub next_typeno: Arc<AtomicCounter>,
    pub next_termno: Arc<AtomicCounter>,
    pub next_docno: Arc<AtomicCounter>,
    pub next_userno: Arc<AtomicCounter>,
    pub next_attribno: Arc<AtomicCounter>,
    pub nof_documents: AtomicSize,
    /// peer-contributed collection size delta
    pub peer_nof_documents: AtomicSize,
    pub typeno_shared: Arc<Mutex<AHashMap<String, Index>>>,
    pub attribno_shared: Arc<Mutex<AHashMap<String, Index>>>,
    pub term_cache: AHashMap<String, Index>,
    pub acl_enabled: bool,
}

/// The storage client.
pub struct Storage {
    shared: Arc<StorageShared>,
}

impl Storage {
    /// Create a fresh storage under `config.path` with the bundled store.
    pub fn create(config: &StorageConfig) -> Result<Self> {
        let db = MemDatabase::create(Path::new(&config.path), config.compression)?;
        Self::create_on(Arc::new(db), config)
    }

    /// Open an existing storage under `config.path` with the bundled store.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let db = MemDatabase::open(Path::new(&config.path), config.compression)?;
        Self::open_on(Arc::new(db), config)
    }

    /// Create the storage records on a caller-provided store.
    pub fn create_on(db: Arc<dyn Database>, config: &StorageConfig) -> Result<Self> {
        let descr = Arc::new(MetaDataDescription::parse(&config.metadata)?);
        let mut batch = WriteBatch::new();
        batch.put(
            DatabaseKey::new(KeyFamily::MetaDataDescr).into_bytes(),
            descr.serialize()?,
        );
        write_variable(&mut batch, VAR_TYPENO, 1)?;
        write_variable(&mut batch, VAR_TERMNO, 1)?;
        write_variable(&mut batch, VAR_DOCNO, 1)?;
        write_variable(&mut batch, VAR_USERNO, 1)?;
        write_variable(&mut batch, VAR_ATTRIBNO, 1)?;
        write_variable(&mut batch, VAR_NOF_DOCS, 0)?;
        db.write(batch, true)?;
        Self::open_on(db, config)
    }

    /// Open the storage records on a caller-provided store.
    pub fn open_on(db: Arc<dyn Database>, config: &StorageConfig) -> Result<Self> {
        let descr_key = DatabaseKey::new(KeyFamily::MetaDataDescr);
        let descr = match db.get(descr_key.as_bytes())? {
            Some(bytes) => Arc::new(MetaDataDescription::deserialize(&bytes)?),
            None => {
                return Err(StorageError::NotFound(
                    "no storage found (metadata descriptor missing)".into(),
                ))
            }
        };
        let metadata_cache = Arc::new(MetaDataBlockCache::new(
            Arc::clone(&db),
            Arc::clone(&descr),
            config.cache_size,
        ));
        let term_cache = load_term_cache(db.as_ref(), &config.cachedterms)?;
        let shared = StorageShared {
            next_typeno: Arc::new(AtomicCounter::new(
                read_variable(db.as_ref(), VAR_TYPENO)?.unwrap_or(1) as Index,
            )),
            next_termno: Arc::new(AtomicCounter::new(
                read_variable(db.as_ref(), VAR_TERMNO)?.unwrap_or(1) as Index,
            )),
            next_docno: Arc::new(AtomicCounter::new(
                read_variable(db.as_ref(), VAR_DOCNO)?.unwrap_or(1) as Index,
            )),
            next_userno: Arc::new(AtomicCounter::new(
                read_variable(db.as_ref(), VAR_USERNO)?.unwrap_or(1) as Index,
            )),
            next_attribno: Arc::new(AtomicCounter::new(
                read_variable(db.as_ref(), VAR_ATTRIBNO)?.unwrap_or(1) as Index,
            )),
            nof_documents: AtomicSize::new(
                read_variable(db.as_ref(), VAR_NOF_DOCS)?.unwrap_or(0) as i64,
            ),
            peer_nof_documents: AtomicSize::new(0),
            typeno_shared: Arc::new(Mutex::new(AHashMap::new())),
            attribno_shared: Arc::new(Mutex::new(AHashMap::new())),
            term_cache,
            acl_enabled: config.acl,
            df_cache: DocumentFrequencyCache::new(),
            transaction_lock: Mutex::new(()),
            metadata_cache,
            descr,
            db,
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn acl_enabled(&self) -> bool {
        self.shared.acl_enabled
    }

    /// Number of documents inserted locally.
    pub fn nof_documents(&self) -> i64 {
        self.shared.nof_documents.value()
    }

    /// Collection size including peer contributions.
    pub fn global_nof_documents(&self) -> i64 {
        self.shared.nof_documents.value() + self.shared.peer_nof_documents.value()
    }

    /// Largest document number handed out so far.
    pub fn max_docno(&self) -> Index {
        self.shared.next_docno.value().saturating_sub(1)
    }

    fn lookup_name(&self, family: KeyFamily, name: &str) -> Result<Index> {
        if family == KeyFamily::TermValue {
            if let Some(&id) = self.shared.term_cache.get(name) {
                return Ok(id);
            }
        }
        let mut key = vec![family as u8];
        key.extend_from_slice(name.as_bytes());
        match self.shared.db.get(&key)? {
            Some(value) => {
                let (id, _) = codec::unpack_index(&value)?;
                Ok(id)
            }
            None => Ok(0),
        }
    }

    /// Persisted typeno of a term type name, 0 when unknown.
    pub fn typeno(&self, name: &str) -> Result<Index> {
        self.lookup_name(KeyFamily::TermType, name)
    }

    pub fn termno(&self, name: &str) -> Result<Index> {
        self.lookup_name(KeyFamily::TermValue, name)
    }

    pub fn docno(&self, docid: &str) -> Result<Index> {
        self.lookup_name(KeyFamily::DocId, docid)
    }

    pub fn userno(&self, username: &str) -> Result<Index> {
        self.lookup_name(KeyFamily::UserName, username)
    }

    pub fn attribno(&self, name: &str) -> Result<Index> {
        self.lookup_name(KeyFamily::AttributeName, name)
    }

    /// Local document frequency of a term.
    pub fn document_frequency(&self, typename: &str, value: &str) -> Result<GlobalCounter> {
        let typeno = self.typeno(typename)?;
        let termno = self.termno(value)?;
        if typeno == 0 || termno == 0 {
            return Ok(0);
        }
        crate::iterator::read_document_frequency(self.shared.db.as_ref(), typeno, termno)
    }

    /// Document frequency aggregated with peer deltas.
    pub fn global_document_frequency(
        &self,
        typename: &str,
        value: &str,
    ) -> Result<GlobalCounter> {
        let typeno = self.typeno(typename)?;
        let termno = self.termno(value)?;
        if typeno == 0 || termno == 0 {
            return Ok(0);
        }
        let local = crate::iterator::read_document_frequency(
            self.shared.db.as_ref(),
            typeno,
            termno,
        )?;
        Ok(self.shared.df_cache.global_df(typeno, termno, local))
    }

    /// Posting iterator of a term `(type, value)`. Unknown names yield the
    /// empty iterator.
    pub fn posting_iterator(&self, typename: &str, value: &str) -> Result<PostingIterator> {
        let typeno = self.typeno(typename)?;
        let termno = self.termno(value)?;
        Ok(PostingIterator::new(
            Arc::clone(&self.shared.db),
            typeno,
            termno,
        ))
    }

    pub fn posinfo_iterator(&self, typename: &str, value: &str) -> Result<PosinfoIterator> {
        let typeno = self.typeno(typename)?;
        let termno = self.termno(value)?;
        Ok(PosinfoIterator::new(
            Arc::clone(&self.shared.db),
            typeno,
            termno,
        ))
    }

    pub fn ff_iterator(&self, typename: &str, value: &str) -> Result<FfPostingIterator> {
        let typeno = self.typeno(typename)?;
        let termno = self.termno(value)?;
        Ok(FfPostingIterator::new(
            Arc::clone(&self.shared.db),
            typeno,
            termno,
        ))
    }

    /// Iterator over the docnos a user may see.
    pub fn user_acl_iterator(&self, username: &str) -> Result<IndexSetIterator> {
        let userno = self.userno(username)?;
        Ok(IndexSetIterator::new(
            Arc::clone(&self.shared.db),
            KeyFamily::UserAcl,
            &[userno],
        ))
    }

    /// Iterator over the users of one document.
    pub fn inv_acl_iterator(&self, docno: Index) -> InvAclIterator {
        InvAclIterator::new(Arc::clone(&self.shared.db), docno)
    }

    pub fn forward_iterator(&self, typename: &str) -> Result<ForwardIndexIterator> {
        let typeno = self.typeno(typename)?;
        Ok(ForwardIndexIterator::new(
            Arc::clone(&self.shared.db),
            typeno,
        ))
    }

    pub fn struct_iterator(&self) -> StructIterator {
        StructIterator::new(Arc::clone(&self.shared.db))
    }

    pub fn metadata_reader(&self) -> MetaDataReader {
        MetaDataReader::new(Arc::clone(&self.shared.metadata_cache))
    }

    pub fn metadata_description(&self) -> &Arc<MetaDataDescription> {
        &self.shared.descr
    }

    /// Document attribute string, `None` when absent.
    pub fn attribute(&self, docno: Index, name: &str) -> Result<Option<String>> {
        let attrno = self.attribno(name)?;
        if attrno == 0 || docno == 0 {
            return Ok(None);
        }
        let key = DatabaseKey::with_elems(KeyFamily::DocAttribute, &[docno, attrno]);
        match self.shared.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes).map_err(|_| {
                StorageError::CorruptData("attribute value not utf-8".into())
            })?)),
            None => Ok(None),
        }
    }

    /// Open a transaction. Any number may be open; only commits serialize.
    pub fn transaction(&self) -> StorageTransaction {
        StorageTransaction::new(Arc::clone(&self.shared))
    }

    /// Allocate a contiguous docno range; returns the first docno.
    pub fn alloc_docno_range(&self, nof_documents: Index) -> Index {
        self.shared.next_docno.alloc(nof_documents)
    }

    /// Best-effort give-back of a docno range.
    pub fn dealloc_docno_range(&self, first: Index, nof_documents: Index) -> bool {
        self.shared.next_docno.dealloc(first, nof_documents)
    }

    /// Apply a peer statistics message: a collection size delta and per-term
    /// df deltas. Serialized with commits through the transaction lock.
    pub fn apply_peer_delta(
        &self,
        nof_documents_delta: i64,
        df_deltas: &[(Index, Index, i64)],
    ) {
        let _guard = self.shared.transaction_lock.lock();
        self.shared.peer_nof_documents.add(nof_documents_delta);
        for &(typeno, termno, delta) in df_deltas {
            self.shared.df_cache.apply_peer_delta(typeno, termno, delta);
        }
    }

}

fn write_variable(batch: &mut WriteBatch, name: &str, value: GlobalCounter) -> Result<()> {
    let key = DatabaseKey::for_variable(name)?;
    let mut val = Vec::new();
    codec::pack_global_counter(&mut val, value)?;
    batch.put(key.into_bytes(), val);
    Ok(())
}

fn read_variable(db: &dyn Database, name: &str) -> Result<Option<GlobalCounter>> {
    let key = DatabaseKey::for_variable(name)?;
    match db.get(key.as_bytes())? {
        Some(bytes) => {
            let (v, _) = codec::unpack_global_counter(&bytes)?;
            Ok(Some(v))
        }
        None => Ok(None),
    }
}

/// Emit the variable records reflecting the current counters; called inside
/// the commit critical section.
pub(crate) fn variables_write_batch(
    shared: &StorageShared,
    batch: &mut WriteBatch,
    nof_documents_incr: i64,
) -> Result<()> {
    write_variable(batch, VAR_TYPENO, shared.next_typeno.value() as GlobalCounter)?;
    write_variable(batch, VAR_TERMNO, shared.next_termno.value() as GlobalCounter)?;
    write_variable(batch, VAR_DOCNO, shared.next_docno.value() as GlobalCounter)?;
    write_variable(batch, VAR_USERNO, shared.next_userno.value() as GlobalCounter)?;
    write_variable(
        batch,
        VAR_ATTRIBNO,
        shared.next_attribno.value() as GlobalCounter,
    )?;
    let total = shared.nof_documents.value() + nof_documents_incr;
    write_variable(batch, VAR_NOF_DOCS, total.max(0) as GlobalCounter)?;
    Ok(())
}

/// Preload the term lookup cache from a newline-separated term list file.
fn load_term_cache(db: &dyn Database, path: &str) -> Result<AHashMap<String, Index>> {
    let mut cache = AHashMap::new();
    if path.is_empty() {
        return Ok(cache);
    }
    let content = std::fs::read_to_string(path)?;
    for line in content.lines() {
        let term = line.trim();
        if term.is_empty() {
            continue;
        }
        let mut key = vec![KeyFamily::TermValue as u8];
        key.extend_from_slice(term.as_bytes());
        if let Some(value) = db.get(&key)? {
            let (id, _) = codec::unpack_index(&value)?;
            cache.insert(term.to_string(), id);
        }
    }
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{CompareOperator, MetaDataRestriction};
    use crate::types::ScalarValue;
    use crate::weighting::{FormulaContext, FormulaInterpreter, FunctionMap, IteratorSpec};

    fn new_storage(extra: &str) -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StorageConfig::parse(&format!(
            "path={};metadata=doclen:uint16{}",
            dir.path().join("st").display(),
            extra
        ))
        .unwrap();
        let st = Storage::create(&cfg).unwrap();
        (dir, st)
    }

    /// Insert the four documents of the smoke collection:
    /// d1 "a a b", d2 "a b c", d3 "b c d", d4 "a a a b".
    fn insert_smoke_docs(st: &Storage) {
        let docs: [(&str, &[&str]); 4] = [
            ("d1", &["a", "a", "b"]),
            ("d2", &["a", "b", "c"]),
            ("d3", &["b", "c", "d"]),
            ("d4", &["a", "a", "a", "b"]),
        ];
        let mut txn = st.transaction();
        for (docid, words) in docs {
            let mut doc = txn.create_document(docid).unwrap();
            for (ii, word) in words.iter().enumerate() {
                let pos = ii as u32 + 1;
                doc.add_search_index_term("word", word, pos).unwrap();
                doc.add_forward_index_term("word", word, pos).unwrap();
            }
            doc.set_metadata("doclen", ScalarValue::UInt(words.len() as u64))
                .unwrap();
            doc.done().unwrap();
        }
        txn.commit().unwrap();
    }

    fn docs_of_term(st: &Storage, value: &str) -> Vec<String> {
        let mut itr = st.posting_iterator("word", value).unwrap();
        let mut out = Vec::new();
        let mut d = itr.skip_doc(1).unwrap();
        while d != 0 {
            out.push(d);
            d = itr.skip_doc(d + 1).unwrap();
        }
        // map docnos back to ids through the posting order of insertion
        let mut ids = Vec::new();
        for docid in ["d1", "d2", "d3", "d4"] {
            let docno = st.docno(docid).unwrap();
            if out.contains(&docno) {
                ids.push(docid.to_string());
            }
        }
        ids
    }

    #[test]
    fn smoke_ff_and_df() {
        let (_dir, st) = new_storage("");
        insert_smoke_docs(&st);
        assert_eq!(st.nof_documents(), 4);

        assert_eq!(docs_of_term(&st, "a"), vec!["d1", "d2", "d4"]);
        assert_eq!(st.document_frequency("word", "a").unwrap(), 3);

        let mut itr = st.posting_iterator("word", "a").unwrap();
        let mut ffs = Vec::new();
        let mut d = itr.skip_doc(1).unwrap();
        while d != 0 {
            ffs.push(itr.frequency().unwrap());
            d = itr.skip_doc(d + 1).unwrap();
        }
        assert_eq!(ffs, vec![2, 1, 3]);

        // the ff acceleration blocks agree
        let mut ff_itr = st.ff_iterator("word", "a").unwrap();
        let mut ffs = Vec::new();
        let mut d = ff_itr.skip_doc(1).unwrap();
        while d != 0 {
            ffs.push(ff_itr.frequency());
            d = ff_itr.skip_doc(d + 1).unwrap();
        }
        assert_eq!(ffs, vec![2, 1, 3]);
    }

    #[test]
    fn intersection() {
        let (_dir, st) = new_storage("");
        insert_smoke_docs(&st);
        let mut a = st.posting_iterator("word", "a").unwrap();
        let mut b = st.posting_iterator("word", "b").unwrap();
        let mut both = Vec::new();
        let mut d = a.skip_doc(1).unwrap();
        while d != 0 {
            if b.skip_doc(d).unwrap() == d {
                both.push(d);
            }
            d = a.skip_doc(d + 1).unwrap();
        }
        let expect: Vec<Index> = ["d1", "d2", "d4"]
            .iter()
            .map(|id| st.docno(id).unwrap())
            .collect();
        assert_eq!(both, expect);

        let mut b = st.posting_iterator("word", "b").unwrap();
        let mut c = st.posting_iterator("word", "c").unwrap();
        let mut both = Vec::new();
        let mut d = b.skip_doc(1).unwrap();
        while d != 0 {
            if c.skip_doc(d).unwrap() == d {
                both.push(d);
            }
            d = b.skip_doc(d + 1).unwrap();
        }
        let expect: Vec<Index> = ["d2", "d3"]
            .iter()
            .map(|id| st.docno(id).unwrap())
            .collect();
        assert_eq!(both, expect);
    }

    #[test]
    fn positions_in_d4() {
        let (_dir, st) = new_storage("");
        insert_smoke_docs(&st);
        let d4 = st.docno("d4").unwrap();

        let mut a = st.posting_iterator("word", "a").unwrap();
        assert_eq!(a.skip_doc(d4).unwrap(), d4);
        assert_eq!(a.positions().unwrap(), vec![1, 2, 3]);
        assert_eq!(a.skip_pos(2).unwrap(), 2);
        assert_eq!(a.skip_pos(4).unwrap(), 0);

        let mut b = st.posting_iterator("word", "b").unwrap();
        assert_eq!(b.skip_doc(d4).unwrap(), d4);
        assert_eq!(b.positions().unwrap(), vec![4]);

        // the forward index returns the original tokens
        let mut fwd = st.forward_iterator("word").unwrap();
        fwd.skip_doc(d4);
        let mut tokens = Vec::new();
        let mut pos = fwd.skip_pos(1).unwrap();
        while pos != 0 {
            tokens.push(fwd.fetch().unwrap());
            pos = fwd.skip_pos(pos + 1).unwrap();
        }
        assert_eq!(tokens, vec!["a", "a", "a", "b"]);
    }

    #[test]
    fn delete_document_updates_postings() {
        let (_dir, st) = new_storage("");
        insert_smoke_docs(&st);
        let mut txn = st.transaction();
        txn.delete_document("d2").unwrap();
        txn.commit().unwrap();

        assert_eq!(st.nof_documents(), 3);
        assert_eq!(docs_of_term(&st, "a"), vec!["d1", "d4"]);
        assert_eq!(st.document_frequency("word", "a").unwrap(), 2);
        assert_eq!(docs_of_term(&st, "c"), vec!["d3"]);
        assert_eq!(st.document_frequency("word", "c").unwrap(), 1);
    }

    #[test]
    fn metadata_restriction_doclen() {
        let (_dir, st) = new_storage("");
        insert_smoke_docs(&st);
        let mut reader = st.metadata_reader();
        let mut restriction = MetaDataRestriction::new();
        restriction
            .add_condition(
                &reader,
                CompareOperator::Less,
                "doclen",
                ScalarValue::UInt(4),
                true,
            )
            .unwrap();
        let mut matched = Vec::new();
        for docid in ["d1", "d2", "d3", "d4"] {
            let docno = st.docno(docid).unwrap();
            reader.skip_doc(docno).unwrap();
            if restriction.matches(&reader).unwrap() {
                matched.push(docid);
            }
        }
        assert_eq!(matched, vec!["d1", "d2", "d3"]);
    }

    struct ScoreCtx {
        ff: f64,
        df: f64,
        n: f64,
    }

    impl FormulaContext for ScoreCtx {
        fn iterator_spec(&self, _type_name: &str) -> Option<IteratorSpec> {
            None
        }
    }

    #[test]
    fn formula_on_storage_statistics() {
        let (_dir, st) = new_storage("");
        insert_smoke_docs(&st);
        let d1 = st.docno("d1").unwrap();
        let mut itr = st.posting_iterator("word", "a").unwrap();
        assert_eq!(itr.skip_doc(d1).unwrap(), d1);
        let ctx = ScoreCtx {
            ff: itr.frequency().unwrap() as f64,
            df: itr.document_frequency().unwrap() as f64,
            n: st.nof_documents() as f64,
        };
        let mut map: FunctionMap<ScoreCtx> = FunctionMap::new();
        map.define_variable("ff", |c: &ScoreCtx, _, _| c.ff);
        map.define_variable("df", |c: &ScoreCtx, _, _| c.df);
        map.define_variable("n", |c: &ScoreCtx, _, _| c.n);
        let interp = FormulaInterpreter::compile(
            &map,
            "log10( (n - (df - 0.5)) / (df + 0.5) ) * ff",
        )
        .unwrap();
        let got = interp.run(&ctx).unwrap();
        let want = ((4.0f64 - 3.0 + 0.5) / (3.0 + 0.5)).log10() * 2.0;
        assert!((got - want).abs() < 1e-9);
    }

    #[test]
    fn insert_delete_round_trip_is_clean() {
        let (_dir, st) = new_storage("");
        insert_smoke_docs(&st);
        let before = dump_payload_records(&st);

        // insert a new doc reusing known terms, then delete it again
        let mut txn = st.transaction();
        let mut doc = txn.create_document("d5").unwrap();
        doc.add_search_index_term("word", "a", 1).unwrap();
        doc.add_search_index_term("word", "d", 2).unwrap();
        doc.add_forward_index_term("word", "a", 1).unwrap();
        doc.set_metadata("doclen", ScalarValue::UInt(2)).unwrap();
        doc.set_attribute("title", "temporary").unwrap();
        doc.done().unwrap();
        txn.commit().unwrap();
        assert_eq!(docs_of_term(&st, "a").len(), 4);

        let mut txn = st.transaction();
        txn.delete_document("d5").unwrap();
        txn.commit().unwrap();

        let after = dump_payload_records(&st);
        assert_eq!(before, after);
        assert_eq!(st.nof_documents(), 4);
    }

    /// All records except the name tables and counter variables, which only
    /// grow and are excluded from the round-trip comparison.
    fn dump_payload_records(st: &Storage) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        let mut cursor = st.shared.db.cursor();
        let mut entry = cursor.seek_upper_bound(&[]);
        while let Some((key, value)) = entry {
            let family = key[0];
            if !matches!(family, b'v' | b'd' | b'i' | b't' | b'a' | b'u') {
                out.push((key, value));
            }
            entry = cursor.next();
        }
        out
    }

    #[test]
    fn acl_round_trip() {
        let (_dir, st) = new_storage(";acl=yes");
        let mut txn = st.transaction();
        for (docid, users) in [("d1", vec!["alice", "bob"]), ("d2", vec!["bob"])] {
            let mut doc = txn.create_document(docid).unwrap();
            doc.add_search_index_term("word", "x", 1).unwrap();
            for user in users {
                doc.set_user_access_right(user).unwrap();
            }
            doc.done().unwrap();
        }
        txn.commit().unwrap();

        let d1 = st.docno("d1").unwrap();
        let d2 = st.docno("d2").unwrap();
        let mut alice = st.user_acl_iterator("alice").unwrap();
        assert_eq!(alice.all().unwrap(), vec![d1]);
        let mut bob = st.user_acl_iterator("bob").unwrap();
        assert_eq!(bob.all().unwrap(), vec![d1, d2]);

        let alice_no = st.userno("alice").unwrap();
        let bob_no = st.userno("bob").unwrap();
        let mut inv = st.inv_acl_iterator(d1);
        assert_eq!(inv.all_users().unwrap(), vec![alice_no, bob_no]);

        // deleting d1 revokes it everywhere
        let mut txn = st.transaction();
        txn.delete_document("d1").unwrap();
        txn.commit().unwrap();
        let mut bob = st.user_acl_iterator("bob").unwrap();
        assert_eq!(bob.all().unwrap(), vec![d2]);
        let mut inv = st.inv_acl_iterator(d1);
        assert_eq!(inv.all_users().unwrap(), Vec::<Index>::new());
    }

    #[test]
    fn structures_round_trip() {
        use crate::types::IndexRange;
        let (_dir, st) = new_storage("");
        let mut txn = st.transaction();
        let mut doc = txn.create_document("d1").unwrap();
        doc.add_search_index_term("word", "x", 1).unwrap();
        doc.add_structure(IndexRange::new(1, 2), vec![IndexRange::new(3, 5)])
            .unwrap();
        doc.done().unwrap();
        doc = txn.create_document("d2").unwrap();
        doc.add_search_index_term("word", "x", 1).unwrap();
        doc.done().unwrap();
        txn.commit().unwrap();

        let d1 = st.docno("d1").unwrap();
        let mut itr = st.struct_iterator();
        assert_eq!(itr.skip_doc(1).unwrap(), d1);
        assert_eq!(itr.skip_pos_source(0), IndexRange::new(1, 2));
        assert_eq!(itr.skip_pos_sink(0), IndexRange::new(3, 5));
        assert_eq!(itr.skip_doc(d1 + 1).unwrap(), 0);
    }

    #[test]
    fn attributes_round_trip() {
        let (_dir, st) = new_storage("");
        let mut txn = st.transaction();
        let mut doc = txn.create_document("d1").unwrap();
        doc.add_search_index_term("word", "x", 1).unwrap();
        doc.set_attribute("title", "a tale of blocks").unwrap();
        doc.done().unwrap();
        txn.commit().unwrap();
        let d1 = st.docno("d1").unwrap();
        assert_eq!(
            st.attribute(d1, "title").unwrap().as_deref(),
            Some("a tale of blocks")
        );
        assert_eq!(st.attribute(d1, "missing").unwrap(), None);
    }

    #[test]
    fn reopen_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StorageConfig::parse(&format!(
            "path={};metadata=doclen:uint16",
            dir.path().join("st").display()
        ))
        .unwrap();
        {
            let st = Storage::create(&cfg).unwrap();
            insert_smoke_docs(&st);
        }
        let st = Storage::open(&cfg).unwrap();
        assert_eq!(st.nof_documents(), 4);
        assert_eq!(st.document_frequency("word", "a").unwrap(), 3);
        assert_eq!(docs_of_term(&st, "a"), vec!["d1", "d2", "d4"]);
        // counters resume above the persisted ids
        let mut txn = st.transaction();
        let mut doc = txn.create_document("d9").unwrap();
        doc.add_search_index_term("word", "zz", 1).unwrap();
        doc.done().unwrap();
        txn.commit().unwrap();
        assert!(st.docno("d9").unwrap() > st.docno("d4").unwrap());
    }

    #[test]
    fn replace_document_overwrites_postings() {
        let (_dir, st) = new_storage("");
        insert_smoke_docs(&st);
        let mut txn = st.transaction();
        let mut doc = txn.create_document("d2").unwrap();
        doc.add_search_index_term("word", "d", 1).unwrap();
        doc.done().unwrap();
        txn.commit().unwrap();

        assert_eq!(st.nof_documents(), 4);
        assert_eq!(docs_of_term(&st, "a"), vec!["d1", "d4"]);
        assert_eq!(st.document_frequency("word", "a").unwrap(), 2);
        assert_eq!(docs_of_term(&st, "d"), vec!["d2", "d3"]);
        assert_eq!(st.document_frequency("word", "d").unwrap(), 2);
    }

    #[test]
    fn docno_range_allocation_is_best_effort() {
        let (_dir, st) = new_storage("");
        let first = st.alloc_docno_range(100);
        assert!(first >= 1);
        assert_eq!(st.max_docno(), first + 99);
        // give-back succeeds while the range is still on top
        assert!(st.dealloc_docno_range(first, 100));
        let again = st.alloc_docno_range(10);
        assert_eq!(again, first);
        // once another range was handed out the old one stays consumed
        let other = st.alloc_docno_range(10);
        assert!(!st.dealloc_docno_range(again, 10));
        assert!(st.dealloc_docno_range(other, 10));
    }

    #[test]
    fn peer_deltas_change_global_statistics() {
        let (_dir, st) = new_storage("");
        insert_smoke_docs(&st);
        let typeno = st.typeno("word").unwrap();
        let termno = st.termno("a").unwrap();
        st.apply_peer_delta(10, &[(typeno, termno, 7)]);
        assert_eq!(st.nof_documents(), 4);
        assert_eq!(st.global_nof_documents(), 14);
        assert_eq!(st.document_frequency("word", "a").unwrap(), 3);
        assert_eq!(st.global_document_frequency("word", "a").unwrap(), 10);
    }

    #[test]
    fn random_collection_round_trip() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        use std::collections::{BTreeMap, BTreeSet};

        let (_dir, st) = new_storage("");
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let vocabulary: Vec<String> = (0..30).map(|i| format!("term{:02}", i)).collect();

        // model: docid -> term -> positions
        let mut model: BTreeMap<String, BTreeMap<String, BTreeSet<u32>>> = BTreeMap::new();
        let mut txn = st.transaction();
        for di in 0..40 {
            let docid = format!("doc{:03}", di);
            let mut doc = txn.create_document(&docid).unwrap();
            let doclen = rng.gen_range(3..30);
            let mut terms: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
            for pos in 1..=doclen {
                let word = &vocabulary[rng.gen_range(0..vocabulary.len())];
                doc.add_search_index_term("word", word, pos).unwrap();
                terms.entry(word.clone()).or_default().insert(pos);
            }
            doc.set_metadata("doclen", ScalarValue::UInt(doclen as u64))
                .unwrap();
            doc.done().unwrap();
            model.insert(docid, terms);
        }
        txn.commit().unwrap();

        let verify = |model: &BTreeMap<String, BTreeMap<String, BTreeSet<u32>>>| {
            for word in &vocabulary {
                let mut expect_docs: Vec<(Index, Vec<u32>)> = model
                    .iter()
                    .filter_map(|(docid, terms)| {
                        terms.get(word).map(|positions| {
                            (
                                st.docno(docid).unwrap(),
                                positions.iter().copied().collect::<Vec<u32>>(),
                            )
                        })
                    })
                    .collect();
                expect_docs.sort();
                let mut itr = st.posting_iterator("word", word).unwrap();
                let mut got = Vec::new();
                let mut d = itr.skip_doc(1).unwrap();
                while d != 0 {
                    got.push((d, itr.positions().unwrap()));
                    d = itr.skip_doc(d + 1).unwrap();
                }
                assert_eq!(got, expect_docs, "term {}", word);
                assert_eq!(
                    itr.document_frequency().unwrap() as usize,
                    expect_docs.len(),
                    "df of {}",
                    word
                );
            }
        };
        verify(&model);

        // delete a random half and verify again
        let docids: Vec<String> = model.keys().cloned().collect();
        let mut txn = st.transaction();
        for docid in docids {
            if rng.gen_bool(0.5) {
                txn.delete_document(&docid).unwrap();
                model.remove(&docid);
            }
        }
        txn.commit().unwrap();
        verify(&model);
        assert_eq!(st.nof_documents() as usize, model.len());
    }
}
