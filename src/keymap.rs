//! String interning: name ↔ id maps with deferred allocation
//!
//! Each of the five name tables (term types, term values, doc ids, user
//! names, attribute names) maps `prefix ∥ name-bytes` to a packed id.
//! *Immediate* allocators (term types, attribute names) hand out stable ids
//! at staging time through a map shared between transactions. *Deferred*
//! allocators hand out transaction-local handles above
//! [`UNKNOWN_HANDLE_START`]; at commit the handles are resolved to stable
//! ids and a rename map is produced for all staged records that used them.

use crate::database::{Database, KeyFamily, WriteBatch};
use crate::error::{Result, StorageError};
use crate::stats::AtomicCounter;
use crate::types::Index;
use crate::codec;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// First transaction-local handle value. Stable ids stay below this.
pub const UNKNOWN_HANDLE_START: Index = 1 << 30;

/// Whether an id is a transaction-local handle.
pub fn is_unknown(value: Index) -> bool {
    value > UNKNOWN_HANDLE_START
}

/// Id source of a key map.
///
/// With a `shared` map the allocator is immediate: names receive stable ids
/// when first staged, deduplicated across open transactions.
#[derive(Clone)]
pub struct KeyAllocator {
    counter: Arc<AtomicCounter>,
    shared: Option<Arc<Mutex<AHashMap<String, Index>>>>,
}

impl KeyAllocator {
    pub fn deferred(counter: Arc<AtomicCounter>) -> Self {
        Self {
            counter,
            shared: None,
        }
    }

    pub fn immediate(
        counter: Arc<AtomicCounter>,
        shared: Arc<Mutex<AHashMap<String, Index>>>,
    ) -> Self {
        Self {
            counter,
            shared: Some(shared),
        }
    }

    pub fn is_immediate(&self) -> bool {
        self.shared.is_some()
    }

    /// Allocate one stable id (deferred path, called at commit).
    pub fn alloc(&self) -> Index {
        self.counter.alloc(1)
    }

    /// Immediate path: stable id for `name`, allocating when absent.
    fn get_or_create_immediate(&self, name: &str) -> (Index, bool) {
        let shared = self.shared.as_ref().expect("immediate allocator");
        let mut map = shared.lock();
        if let Some(&id) = map.get(name) {
            return (id, false);
        }
        let id = self.counter.alloc(1);
        map.insert(name.to_string(), id);
        (id, true)
    }
}

/// One interning table, staged per transaction.
pub struct KeyMap {
    db: Arc<dyn Database>,
    family: KeyFamily,
    allocator: KeyAllocator,
    map: AHashMap<String, Index>,
    inv: Option<AHashMap<Index, String>>,
    new_immediate: Vec<String>,
    deleted: Vec<String>,
    unknown_count: Index,
}

impl KeyMap {
    pub fn new(db: Arc<dyn Database>, family: KeyFamily, allocator: KeyAllocator) -> Self {
        Self {
            db,
            family,
            allocator,
            map: AHashMap::new(),
            inv: None,
            new_immediate: Vec::new(),
            deleted: Vec::new(),
            unknown_count: 0,
        }
    }

    /// Collect an inverse id → name map alongside.
    pub fn define_inv(&mut self) {
        self.inv = Some(AHashMap::new());
    }

    pub fn name_of(&self, id: Index) -> Option<&str> {
        self.inv.as_ref()?.get(&id).map(|s| s.as_str())
    }

    fn key_of(&self, name: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(name.len() + 1);
        key.push(self.family as u8);
        key.extend_from_slice(name.as_bytes());
        key
    }

    /// Read the persisted id of `name`, 0 when absent.
    pub fn lookup(&self, name: &str) -> Result<Index> {
        match self.db.get(&self.key_of(name))? {
            Some(value) => {
                let (id, _) = codec::unpack_index(&value)?;
                Ok(id)
            }
            None => Ok(0),
        }
    }

    /// Id of `name`, creating it when absent. Returns `(id, is_new)`; the id
    /// is a local handle when the allocator is deferred.
    pub fn get_or_create(&mut self, name: &str) -> Result<(Index, bool)> {
        if let Some(&id) = self.map.get(name) {
            return Ok((id, false));
        }
        let persisted = self.lookup(name)?;
        if persisted != 0 {
            self.remember(name, persisted);
            return Ok((persisted, false));
        }
        if self.allocator.is_immediate() {
            let (id, is_new) = self.allocator.get_or_create_immediate(name);
            if is_new {
                self.new_immediate.push(name.to_string());
            }
            self.remember(name, id);
            return Ok((id, is_new));
        }
        self.unknown_count += 1;
        if self.unknown_count >= UNKNOWN_HANDLE_START {
            return Err(StorageError::ResourceExhausted(
                "too many elements in keymap".into(),
            ));
        }
        let handle = UNKNOWN_HANDLE_START + self.unknown_count;
        self.remember(name, handle);
        Ok((handle, true))
    }

    fn remember(&mut self, name: &str, id: Index) {
        self.map.insert(name.to_string(), id);
        if let Some(inv) = self.inv.as_mut() {
            inv.insert(id, name.to_string());
        }
    }

    pub fn delete_key(&mut self, name: &str) {
        if let Some(id) = self.map.remove(name) {
            if let Some(inv) = self.inv.as_mut() {
                inv.remove(&id);
            }
        }
        self.deleted.push(name.to_string());
    }

    /// Resolve local handles to stable ids, emit the new records into
    /// `batch` and fill `rename` with `{handle → stable}`. Clears the
    /// staged state.
    pub fn get_write_batch(
        &mut self,
        rename: &mut AHashMap<Index, Index>,
        batch: &mut WriteBatch,
    ) -> Result<()> {
        for name in self.deleted.drain(..) {
            let mut key = Vec::with_capacity(name.len() + 1);
            key.push(self.family as u8);
            key.extend_from_slice(name.as_bytes());
            batch.delete(key);
        }
        for name in std::mem::take(&mut self.new_immediate) {
            let id = self.map.get(&name).copied().unwrap_or(0);
            if id != 0 {
                batch.put(self.key_of(&name), codec::packed_index(id));
            }
        }
        let mut staged: Vec<(String, Index)> = self
            .map
            .iter()
            .filter(|(_, &id)| is_unknown(id))
            .map(|(n, &id)| (n.clone(), id))
            .collect();
        staged.sort();
        for (name, handle) in staged {
            let persisted = self.lookup(&name)?;
            let stable = if persisted != 0 {
                persisted
            } else {
                let id = self.allocator.alloc();
                batch.put(self.key_of(&name), codec::packed_index(id));
                id
            };
            rename.insert(handle, stable);
            if let Some(inv) = self.inv.as_mut() {
                inv.remove(&handle);
                inv.insert(stable, name.clone());
            }
            self.map.insert(name, stable);
        }
        self.clear_staged();
        Ok(())
    }

    fn clear_staged(&mut self) {
        self.map.clear();
        self.unknown_count = 0;
        if let Some(inv) = self.inv.as_mut() {
            inv.clear();
        }
        self.deleted.clear();
        self.new_immediate.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemDatabase;

    fn deferred_map(db: Arc<dyn Database>, counter: Arc<AtomicCounter>) -> KeyMap {
        KeyMap::new(db, KeyFamily::TermValue, KeyAllocator::deferred(counter))
    }

    #[test]
    fn deferred_allocation_renames_at_commit() {
        let db: Arc<dyn Database> = Arc::new(MemDatabase::ephemeral());
        let counter = Arc::new(AtomicCounter::new(1));
        let mut map = deferred_map(Arc::clone(&db), Arc::clone(&counter));

        let (h1, new1) = map.get_or_create("hello").unwrap();
        let (h2, _) = map.get_or_create("world").unwrap();
        let (h1b, new1b) = map.get_or_create("hello").unwrap();
        assert!(new1 && !new1b);
        assert_eq!(h1, h1b);
        assert!(is_unknown(h1) && is_unknown(h2));

        let mut rename = AHashMap::new();
        let mut batch = WriteBatch::new();
        map.get_write_batch(&mut rename, &mut batch).unwrap();
        db.write(batch, false).unwrap();

        let s1 = rename[&h1];
        let s2 = rename[&h2];
        assert!(!is_unknown(s1) && !is_unknown(s2));
        assert_ne!(s1, s2);
        assert_eq!(map.lookup("hello").unwrap(), s1);
        assert_eq!(map.lookup("world").unwrap(), s2);

        // a later transaction sees the persisted ids without renaming
        let mut map2 = deferred_map(Arc::clone(&db), counter);
        let (id, is_new) = map2.get_or_create("hello").unwrap();
        assert_eq!(id, s1);
        assert!(!is_new);
    }

    #[test]
    fn immediate_allocation_is_shared() {
        let db: Arc<dyn Database> = Arc::new(MemDatabase::ephemeral());
        let counter = Arc::new(AtomicCounter::new(1));
        let shared = Arc::new(Mutex::new(AHashMap::new()));
        let mut m1 = KeyMap::new(
            Arc::clone(&db),
            KeyFamily::TermType,
            KeyAllocator::immediate(Arc::clone(&counter), Arc::clone(&shared)),
        );
        let mut m2 = KeyMap::new(
            Arc::clone(&db),
            KeyFamily::TermType,
            KeyAllocator::immediate(counter, shared),
        );
        let (id1, new1) = m1.get_or_create("word").unwrap();
        let (id2, new2) = m2.get_or_create("word").unwrap();
        assert_eq!(id1, id2);
        assert!(!is_unknown(id1));
        // the first transaction allocates, the second finds the shared id
        assert!(new1);
        assert!(!new2);

        let mut rename = AHashMap::new();
        let mut batch = WriteBatch::new();
        m1.get_write_batch(&mut rename, &mut batch).unwrap();
        assert!(rename.is_empty());
        db.write(batch, false).unwrap();
        assert_eq!(m2.lookup("word").unwrap(), id1);
    }

    #[test]
    fn inverse_map_follows_renames() {
        let db: Arc<dyn Database> = Arc::new(MemDatabase::ephemeral());
        let counter = Arc::new(AtomicCounter::new(1));
        let mut map = deferred_map(Arc::clone(&db), counter);
        map.define_inv();
        let (handle, _) = map.get_or_create("alpha").unwrap();
        assert_eq!(map.name_of(handle), Some("alpha"));

        let mut rename = AHashMap::new();
        let mut batch = WriteBatch::new();
        map.get_write_batch(&mut rename, &mut batch).unwrap();
        db.write(batch, false).unwrap();
        let stable = rename[&handle];
        // staged state is cleared after the batch; the inverse map follows
        assert_eq!(map.name_of(stable), None);
        let (id, is_new) = map.get_or_create("alpha").unwrap();
        assert_eq!(id, stable);
        assert!(!is_new);
        assert_eq!(map.name_of(stable), Some("alpha"));
    }

    #[test]
    fn delete_key_emits_delete() {
        let db: Arc<dyn Database> = Arc::new(MemDatabase::ephemeral());
        let counter = Arc::new(AtomicCounter::new(1));
        let mut map = deferred_map(Arc::clone(&db), Arc::clone(&counter));
        map.get_or_create("gone").unwrap();
        let mut rename = AHashMap::new();
        let mut batch = WriteBatch::new();
        map.get_write_batch(&mut rename, &mut batch).unwrap();
        db.write(batch, false).unwrap();
        assert_ne!(map.lookup("gone").unwrap(), 0);

        map.delete_key("gone");
        let mut batch = WriteBatch::new();
        map.get_write_batch(&mut rename, &mut batch).unwrap();
        db.write(batch, false).unwrap();
        assert_eq!(map.lookup("gone").unwrap(), 0);
    }

}
