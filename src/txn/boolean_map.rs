//! Staged boolean-block updates (doc lists and ACL sets)
//!
//! One map instance serves one block family: term doc lists keyed
//! `(typeno, termno)`, user ACLs keyed `(userno, 0)`, inverse ACLs keyed
//! `(docno, 0)`. Membership changes stage as per-element booleans; at
//! commit the affected tail of each family is rebuilt by merging the staged
//! ranges with the stored ranges.

use super::scan_affected_blocks;
use crate::blocks::boolean::{merge_ranges, BooleanBlock, MergeRange, NodeCursor};
use crate::blocks::BLOCK_SOFT_SIZE;
use crate::codec;
use crate::database::{Database, DatabaseKey, KeyFamily, WriteBatch};
use crate::error::Result;
use crate::keymap::is_unknown;
use crate::types::Index;
use ahash::AHashMap;
use std::collections::BTreeMap;

/// Fixed key elements of one block family instance; the second element is 0
/// for single-element families.
pub type BlockKeyPair = (Index, Index);

pub struct BooleanBlockMap {
    family: KeyFamily,
    map: AHashMap<BlockKeyPair, BTreeMap<Index, bool>>,
}

impl BooleanBlockMap {
    pub fn new(family: KeyFamily) -> Self {
        Self {
            family,
            map: AHashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn define_element(&mut self, key: BlockKeyPair, elemno: Index) {
        self.map.entry(key).or_default().insert(elemno, true);
    }

    pub fn delete_element(&mut self, key: BlockKeyPair, elemno: Index) {
        self.map.entry(key).or_default().insert(elemno, false);
    }

    /// Stage a removal unless the element is already staged; bulk erasures
    /// resolved at commit must not override additions staged before.
    pub fn delete_element_weak(&mut self, key: BlockKeyPair, elemno: Index) {
        self.map
            .entry(key)
            .or_default()
            .entry(elemno)
            .or_insert(false);
    }

    /// Rewrite the second key element (e.g. termnos) through a rename map.
    pub fn rename_second_key(&mut self, rename: &AHashMap<Index, Index>) {
        let renamed: Vec<(BlockKeyPair, BTreeMap<Index, bool>)> = self
            .map
            .drain()
            .map(|((k1, k2), v)| {
                let k2 = if is_unknown(k2) {
                    *rename.get(&k2).unwrap_or(&k2)
                } else {
                    k2
                };
                ((k1, k2), v)
            })
            .collect();
        self.map.extend(renamed);
    }

    /// Rewrite the first key element (e.g. usernos or docnos).
    pub fn rename_first_key(&mut self, rename: &AHashMap<Index, Index>) {
        let renamed: Vec<(BlockKeyPair, BTreeMap<Index, bool>)> = self
            .map
            .drain()
            .map(|((k1, k2), v)| {
                let k1 = if is_unknown(k1) {
                    *rename.get(&k1).unwrap_or(&k1)
                } else {
                    k1
                };
                ((k1, k2), v)
            })
            .collect();
        self.map.extend(renamed);
    }

    /// Rewrite the staged element numbers through a rename map.
    pub fn rename_elements(&mut self, rename: &AHashMap<Index, Index>) {
        for elems in self.map.values_mut() {
            let moved: Vec<(Index, bool)> = elems
                .iter()
                .filter(|(e, _)| is_unknown(**e))
                .map(|(e, m)| (*e, *m))
                .collect();
            for (e, m) in moved {
                elems.remove(&e);
                let stable = *rename.get(&e).unwrap_or(&e);
                elems.insert(stable, m);
            }
        }
    }

    /// Merge the staged changes of every key into the store.
    pub fn get_write_batch(&mut self, db: &dyn Database, batch: &mut WriteBatch) -> Result<()> {
        for ((k1, k2), elems) in std::mem::take(&mut self.map) {
            if elems.is_empty() {
                continue;
            }
            let staged = coalesce(&elems);
            let first_affected = staged[0].from;
            let prefix = DatabaseKey::with_elems(self.family, &[k1, k2]).into_bytes();
            let tail = scan_affected_blocks(db, &prefix, first_affected)?;

            // collect the stored tail into one range stream
            let mut old = BooleanBlock::default();
            for (id, bytes) in &tail {
                let blk = BooleanBlock::from_bytes(*id, bytes)?;
                let mut cursor = NodeCursor::default();
                old.set_id(*id);
                while let Some((from, to)) = blk.get_next_range(&mut cursor) {
                    old.define_range(from, to - from)?;
                }
                let mut key = prefix.clone();
                codec::pack_index(&mut key, *id);
                batch.delete(key);
            }

            let mut merged = BooleanBlock::default();
            merge_ranges(&staged, &old, &mut merged)?;

            // cut the merged stream into blocks at the soft size limit
            let mut cursor = NodeCursor::default();
            let mut builder = BooleanBlock::default();
            let mut range = merged.get_next_range(&mut cursor);
            while let Some((from, to)) = range {
                builder.define_range(from, to - from)?;
                range = merged.get_next_range(&mut cursor);
                if builder.byte_size() >= BLOCK_SOFT_SIZE || range.is_none() {
                    let id = builder.last_elem();
                    builder.set_id(id);
                    let mut key = prefix.clone();
                    codec::pack_index(&mut key, id);
                    batch.put(key, builder.to_bytes());
                    builder = BooleanBlock::default();
                }
            }
        }
        Ok(())
    }
}

/// Turn per-element staged booleans into sorted merge ranges.
fn coalesce(elems: &BTreeMap<Index, bool>) -> Vec<MergeRange> {
    let mut out: Vec<MergeRange> = Vec::new();
    for (&e, &member) in elems {
        match out.last_mut() {
            Some(last) if last.is_member == member && last.to + 1 == e => {
                last.to = e;
            }
            _ => out.push(MergeRange::new(e, e, member)),
        }
    }
    out
}
