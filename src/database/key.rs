//! Database key construction
//!
//! Every record family is selected by one leading byte; the key tail is a
//! sequence of packed integers, except for the `Variable` family whose tail
//! is the plain variable name.

use crate::codec;
use crate::error::{Result, StorageError};
use crate::types::Index;

/// Hard limit on the byte length of a database key.
pub const MAX_KEY_SIZE: usize = 128;

/// Record families and their prefix bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyFamily {
    /// [typeno] -> type name
    TermType = b't',
    /// [termno] -> term value string
    TermValue = b'i',
    /// [docno] -> document id string
    DocId = b'd',
    /// [userno] -> user name string
    UserName = b'u',
    /// [attrno] -> attribute name string
    AttributeName = b'a',
    /// ascii name -> packed integer
    Variable = b'v',
    /// [typeno, termno, docno_hi] -> posinfo block
    PosInfoBlock = b'p',
    /// [typeno, termno, docno_hi] -> boolean doc-list block
    DocListBlock = b'b',
    /// [typeno, termno, docno_hi] -> ff block
    FfBlock = b'f',
    /// [typeno, docno, position_hi] -> forward index block
    ForwardIndex = b'F',
    /// [docno] -> inverse term block
    InvTerm = b'r',
    /// [blockno] -> metadata rows
    MetaData = b'm',
    /// [docno, attrno] -> attribute string
    DocAttribute = b'x',
    /// [typeno, termno] -> packed document frequency
    DocFrequency = b'D',
    /// [userno, docno_hi] -> boolean block of docnos
    UserAcl = b'U',
    /// [docno, userno_hi] -> boolean block of usernos
    Acl = b'A',
    /// metadata schema descriptor
    MetaDataDescr = b'M',
    /// [docno_hi] -> structure block
    StructBlock = b'S',
}

/// Key under construction: prefix byte plus packed elements.
#[derive(Debug, Clone)]
pub struct DatabaseKey {
    buf: Vec<u8>,
}

impl DatabaseKey {
    pub fn new(family: KeyFamily) -> Self {
        let mut buf = Vec::with_capacity(16);
        buf.push(family as u8);
        Self { buf }
    }

    pub fn with_elem(family: KeyFamily, elem: Index) -> Self {
        let mut key = Self::new(family);
        key.add_elem(elem);
        key
    }

    pub fn with_elems(family: KeyFamily, elems: &[Index]) -> Self {
        let mut key = Self::new(family);
        for &e in elems {
            if e != 0 {
                key.add_elem(e);
            }
        }
        key
    }

    /// Key of a variable record; the name is stored verbatim after the prefix.
    pub fn for_variable(name: &str) -> Result<Self> {
        if name.len() >= MAX_KEY_SIZE - 1 {
            return Err(StorageError::InvalidArgument(format!(
                "database variable key out of range '{}'",
                name
            )));
        }
        let mut key = Self::new(KeyFamily::Variable);
        key.buf.extend_from_slice(name.as_bytes());
        Ok(key)
    }

    pub fn add_elem(&mut self, elem: Index) {
        codec::pack_index(&mut self.buf, elem);
        debug_assert!(self.buf.len() <= MAX_KEY_SIZE);
    }

    pub fn family_byte(&self) -> u8 {
        self.buf[0]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Shrink back to `n` bytes; used when one prefix is extended per element.
    pub fn resize(&mut self, n: usize) {
        debug_assert!(n <= self.buf.len() && n >= 1);
        self.buf.truncate(n);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
}

/// Decode the packed elements of a key tail (everything after the prefix).
pub fn unpack_key_elems(tail: &[u8]) -> Result<Vec<Index>> {
    let mut elems = Vec::with_capacity(3);
    let mut at = 0;
    while at < tail.len() {
        let (v, n) = codec::unpack_index(&tail[at..])?;
        elems.push(v);
        at += n;
    }
    Ok(elems)
}
