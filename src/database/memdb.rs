//! Bundled ordered store: in-memory map with snapshot persistence
//!
//! ## File format
//! ```text
//! [bincode(BTreeMap<Vec<u8>, Vec<u8>>)] [crc32 of the body, 4 bytes LE]
//! ```
//!
//! The whole map is rewritten on every durable write; the engine batches all
//! mutations of a commit into one write, so the snapshot is taken at most
//! once per transaction. Values longer than [`COMPRESS_THRESHOLD`] are
//! Snappy-compressed when the store was created with compression enabled.

use super::{BatchOp, Database, DatabaseCursor, WriteBatch};
use crate::error::{Result, StorageError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Snapshot file inside the storage directory.
const SNAPSHOT_FILE: &str = "store.bin";

/// Values shorter than this are stored raw even with compression on.
const COMPRESS_THRESHOLD: usize = 64;

/// Marker bytes prepended to stored values when compression is enabled.
const TAG_RAW: u8 = 0;
const TAG_SNAPPY: u8 = 1;

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

pub struct MemDatabase {
    map: Arc<RwLock<Map>>,
    path: Option<PathBuf>,
    compression: bool,
}

impl MemDatabase {
    /// Volatile store without a backing file; used by tests.
    pub fn ephemeral() -> Self {
        Self {
            map: Arc::new(RwLock::new(Map::new())),
            path: None,
            compression: false,
        }
    }

    /// Create a fresh store rooted at `dir`. Fails when a snapshot exists.
    pub fn create(dir: &Path, compression: bool) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let file = dir.join(SNAPSHOT_FILE);
        if file.exists() {
            return Err(StorageError::Conflict(format!(
                "storage already exists at '{}'",
                dir.display()
            )));
        }
        let db = Self {
            map: Arc::new(RwLock::new(Map::new())),
            path: Some(file),
            compression,
        };
        db.persist()?;
        Ok(db)
    }

    /// Open an existing store rooted at `dir`, verifying the snapshot crc.
    pub fn open(dir: &Path, compression: bool) -> Result<Self> {
        let file = dir.join(SNAPSHOT_FILE);
        let raw = fs::read(&file).map_err(|_| {
            StorageError::NotFound(format!("no storage found at '{}'", dir.display()))
        })?;
        if raw.len() < 4 {
            return Err(StorageError::CorruptData("snapshot file truncated".into()));
        }
        let (body, crc_bytes) = raw.split_at(raw.len() - 4);
        let want = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        let got = crc32fast::hash(body);
        if want != got {
            return Err(StorageError::CorruptData(format!(
                "snapshot checksum mismatch ({:08x} != {:08x})",
                got, want
            )));
        }
        let map: Map = bincode::deserialize(body)?;
        Ok(Self {
            map: Arc::new(RwLock::new(map)),
            path: Some(file),
            compression,
        })
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let body = {
            let map = self.map.read();
            bincode::serialize(&*map)?
        };
        let crc = crc32fast::hash(&body);
        let tmp = path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&body)?;
            f.write_all(&crc.to_le_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn encode_value(&self, value: &[u8]) -> Vec<u8> {
        if !self.compression {
            return value.to_vec();
        }
        if value.len() >= COMPRESS_THRESHOLD {
            let mut enc = snap::raw::Encoder::new();
            if let Ok(packed) = enc.compress_vec(value) {
                if packed.len() < value.len() {
                    let mut out = Vec::with_capacity(packed.len() + 1);
                    out.push(TAG_SNAPPY);
                    out.extend_from_slice(&packed);
                    return out;
                }
            }
        }
        let mut out = Vec::with_capacity(value.len() + 1);
        out.push(TAG_RAW);
        out.extend_from_slice(value);
        out
    }

    fn decode_value(&self, stored: &[u8]) -> Result<Vec<u8>> {
        if !self.compression {
            return Ok(stored.to_vec());
        }
        match stored.split_first() {
            Some((&TAG_RAW, rest)) => Ok(rest.to_vec()),
            Some((&TAG_SNAPPY, rest)) => {
                let mut dec = snap::raw::Decoder::new();
                dec.decompress_vec(rest)
                    .map_err(|e| StorageError::CorruptData(format!("snappy: {}", e)))
            }
            _ => Err(StorageError::CorruptData("empty stored value".into())),
        }
    }
}

impl Database for MemDatabase {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let map = self.map.read();
        match map.get(key) {
            Some(v) => Ok(Some(self.decode_value(v)?)),
            None => Ok(None),
        }
    }

    fn write(&self, batch: WriteBatch, sync: bool) -> Result<()> {
        {
            let mut map = self.map.write();
            for op in batch.into_ops() {
                match op {
                    BatchOp::Put { key, value } => {
                        let stored = self.encode_value(&value);
                        map.insert(key, stored);
                    }
                    BatchOp::Delete { key } => {
                        map.remove(&key);
                    }
                }
            }
        }
        if sync {
            self.persist()?;
        }
        Ok(())
    }

    fn cursor(&self) -> Box<dyn DatabaseCursor> {
        Box::new(MemCursor {
            map: Arc::clone(&self.map),
            compression: self.compression,
            current: None,
        })
    }
}

impl Drop for MemDatabase {
    fn drop(&mut self) {
        let _ = self.persist();
    }
}

struct MemCursor {
    map: Arc<RwLock<Map>>,
    compression: bool,
    current: Option<Vec<u8>>,
}

impl MemCursor {
    fn decode(&self, stored: &[u8]) -> Option<Vec<u8>> {
        if !self.compression {
            return Some(stored.to_vec());
        }
        match stored.split_first() {
            Some((&TAG_RAW, rest)) => Some(rest.to_vec()),
            Some((&TAG_SNAPPY, rest)) => {
                snap::raw::Decoder::new().decompress_vec(rest).ok()
            }
            _ => None,
        }
    }
}

impl DatabaseCursor for MemCursor {
    fn seek_upper_bound(&mut self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let map = self.map.read();
        let (k, v) = map.range::<[u8], _>((Bound::Included(key), Bound::Unbounded)).next()?;
        let value = self.decode(v)?;
        self.current = Some(k.clone());
        Some((k.clone(), value))
    }

    fn next(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        let cur = self.current.clone()?;
        let map = self.map.read();
        let (k, v) = map
            .range::<Vec<u8>, _>((Bound::Excluded(&cur), Bound::Unbounded))
            .next()?;
        let value = self.decode(v)?;
        self.current = Some(k.clone());
        Some((k.clone(), value))
    }
}
