//! Process-wide counters and the document frequency cache

use crate::database::KeyFamily;
use crate::types::{GlobalCounter, Index};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Typed wrapper around an atomic id counter with acquire/release semantics.
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU32);

impl AtomicCounter {
    pub fn new(value: Index) -> Self {
        Self(AtomicU32::new(value))
    }

    pub fn value(&self) -> Index {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: Index) {
        self.0.store(value, Ordering::Release);
    }

    /// Return the current value and advance by `n`.
    pub fn alloc(&self, n: Index) -> Index {
        self.0.fetch_add(n, Ordering::AcqRel)
    }

    /// Give back a range if it is still on top of the counter. Best effort:
    /// a failure means the ids stay consumed.
    pub fn dealloc(&self, first: Index, n: Index) -> bool {
        self.0
            .compare_exchange(first + n, first, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Signed atomic counter for collection sizes.
#[derive(Debug, Default)]
pub struct AtomicSize(AtomicI64);

impl AtomicSize {
    pub fn new(value: i64) -> Self {
        Self(AtomicI64::new(value))
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Release);
    }

    pub fn add(&self, incr: i64) -> i64 {
        self.0.fetch_add(incr, Ordering::AcqRel) + incr
    }
}

/// Block read statistics, classified by family and access pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    PosinfoBlockRead,
    DocListBlockRead,
    FfBlockRead,
    StructureBlockRead,
    AclBlockRead,
    ForwardBlockRead,
}

impl StatKind {
    pub fn of_family(family: KeyFamily) -> Self {
        match family {
            KeyFamily::PosInfoBlock => StatKind::PosinfoBlockRead,
            KeyFamily::DocListBlock => StatKind::DocListBlockRead,
            KeyFamily::FfBlock => StatKind::FfBlockRead,
            KeyFamily::ForwardIndex => StatKind::ForwardBlockRead,
            KeyFamily::UserAcl | KeyFamily::Acl => StatKind::AclBlockRead,
            _ => StatKind::StructureBlockRead,
        }
    }
}

/// How a block read came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// follow-block step of a cursor
    Follow,
    /// full upper-bound seek
    Random,
}

const NOF_STATS: usize = 12;

static COUNTERS: [AtomicU64; NOF_STATS] = [
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
];

fn slot(kind: StatKind, access: Access) -> usize {
    let base = match kind {
        StatKind::PosinfoBlockRead => 0,
        StatKind::DocListBlockRead => 2,
        StatKind::FfBlockRead => 4,
        StatKind::StructureBlockRead => 6,
        StatKind::AclBlockRead => 8,
        StatKind::ForwardBlockRead => 10,
    };
    base + match access {
        Access::Follow => 0,
        Access::Random => 1,
    }
}

pub fn increment(kind: StatKind, access: Access) {
    COUNTERS[slot(kind, access)].fetch_add(1, Ordering::Relaxed);
}

pub fn counter(kind: StatKind, access: Access) -> u64 {
    COUNTERS[slot(kind, access)].load(Ordering::Relaxed)
}

/// Cache of per-term document frequencies with peer-aggregated deltas.
///
/// The local df comes from the persisted `D` records; peers of a distributed
/// collection contribute signed deltas. Readers see `local + peer` without
/// taking a lock.
#[derive(Debug, Default)]
pub struct DocumentFrequencyCache {
    peer: DashMap<(Index, Index), i64, ahash::RandomState>,
}

impl DocumentFrequencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer_delta(&self, typeno: Index, termno: Index) -> i64 {
        self.peer
            .get(&(typeno, termno))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Apply one peer message delta. Callers serialize this under the
    /// transaction lock.
    pub fn apply_peer_delta(&self, typeno: Index, termno: Index, delta: i64) {
        *self.peer.entry((typeno, termno)).or_insert(0) += delta;
    }

    /// Aggregated df from the local count and the peer delta, clamped at 0.
    pub fn global_df(&self, typeno: Index, termno: Index, local: GlobalCounter) -> GlobalCounter {
        let total = local as i64 + self.peer_delta(typeno, termno);
        total.max(0) as GlobalCounter
    }
}
