// The typed entry store.
//
// One store per result type, holding entries keyed by semantic id and a
// per-id monotonically increasing entry id. A single reader/writer lock
// guards the maps; access stamps are atomics so shared-mode reads never
// need a lock upgrade. The store accounts bytes against its budget but
// never evicts on its own — eviction is caller-driven through the
// replacement policy.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::artifact::{Artifact, ResultType};
use crate::error::{CacheError, CacheResult};
use crate::extent::{CacheCube, QueryRectangle};
use crate::matcher::{self, Candidate};
use crate::profiler::ProfilingData;

/// Bookkeeping overhead charged per entry on top of the artifact payload.
pub const ENTRY_OVERHEAD: u64 = 256;

/// A put may transiently exceed the budget by this factor; eviction
/// restores the hard budget afterwards.
pub const SOFT_MARGIN: f64 = 1.1;

/// Wall-clock milliseconds, the unit of `last_access`.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Key of an entry within one typed store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryKey {
    pub semantic_id: String,
    pub entry_id: u64,
}

impl EntryKey {
    pub fn new(semantic_id: impl Into<String>, entry_id: u64) -> Self {
        EntryKey {
            semantic_id: semantic_id.into(),
            entry_id,
        }
    }
}

impl std::fmt::Display for EntryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.semantic_id, self.entry_id)
    }
}

/// One cached artifact with its metadata. Owned by exactly one node's
/// store; readers share it through `Arc`.
#[derive(Debug)]
pub struct StoreEntry {
    pub entry_id: u64,
    pub cube: CacheCube,
    pub size: u64,
    pub profile: ProfilingData,
    pub data: Artifact,
    last_access: AtomicU64,
    access_count: AtomicU64,
}

impl StoreEntry {
    pub fn touch(&self) {
        self.last_access.store(now_millis(), Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }
}

/// Entry metadata as shipped to the index: everything but the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeEntry {
    pub entry_id: u64,
    pub cube: CacheCube,
    pub size: u64,
    pub profile: ProfilingData,
    pub last_access: u64,
    pub access_count: u64,
}

impl From<&StoreEntry> for HandshakeEntry {
    fn from(e: &StoreEntry) -> Self {
        HandshakeEntry {
            entry_id: e.entry_id,
            cube: e.cube.clone(),
            size: e.size,
            profile: e.profile,
            last_access: e.last_access(),
            access_count: e.access_count(),
        }
    }
}

/// Metadata of a freshly inserted entry, sent to the index as NEW_ENTRY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub node_id: u32,
    pub result_type: ResultType,
    pub semantic_id: String,
    pub entry: HandshakeEntry,
}

/// Per-type snapshot of all entry metadata, used at node registration and
/// by the stats/reorg rounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheHandshake {
    pub result_type: ResultType,
    pub items: Vec<(String, Vec<HandshakeEntry>)>,
}

/// Cache-level counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub result_type: Option<ResultType>,
    pub max_size: u64,
    pub used_size: u64,
    pub entry_count: u64,
    pub puts: u64,
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub removals: u64,
}

/// Result of a local store query.
#[derive(Debug)]
pub struct StoreQueryResult {
    pub entries: Vec<Arc<StoreEntry>>,
    pub remainder: Vec<QueryRectangle>,
    pub hit_ratio: f64,
}

impl StoreQueryResult {
    pub fn has_hit(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn has_remainder(&self) -> bool {
        !self.remainder.is_empty()
    }
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<String, BTreeMap<u64, Arc<StoreEntry>>>,
    used: u64,
    entry_count: u64,
}

pub struct EntryStore {
    result_type: ResultType,
    max_size: u64,
    next_entry_id: AtomicU64,
    inner: RwLock<StoreInner>,
    puts: AtomicU64,
    gets: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    removals: AtomicU64,
}

impl EntryStore {
    pub fn new(result_type: ResultType, max_size: u64) -> Self {
        EntryStore {
            result_type,
            max_size,
            next_entry_id: AtomicU64::new(1),
            inner: RwLock::new(StoreInner::default()),
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            removals: AtomicU64::new(0),
        }
    }

    pub fn result_type(&self) -> ResultType {
        self.result_type
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn used_size(&self) -> u64 {
        self.inner.read().expect("store lock poisoned").used
    }

    /// Inserts an artifact under a fresh entry id. Does not evict; fails
    /// with `BudgetExceeded` only when even the soft margin would
    /// overflow.
    pub fn put(
        &self,
        semantic_id: &str,
        mut data: Artifact,
        cube: CacheCube,
        profile: ProfilingData,
    ) -> CacheResult<HandshakeEntry> {
        data.expect_type(self.result_type)?;
        let size = data.byte_size() + ENTRY_OVERHEAD;

        let mut inner = self.inner.write().expect("store lock poisoned");
        let margin = (self.max_size as f64 * SOFT_MARGIN) as u64;
        if inner.used + size > margin {
            let available = margin.saturating_sub(inner.used);
            metrics::counter!("cache.store.put_rejected_total", "type" => self.result_type.as_str())
                .increment(1);
            return Err(CacheError::BudgetExceeded {
                needed: size,
                available,
            });
        }

        let entry_id = self.next_entry_id.fetch_add(1, Ordering::Relaxed);
        match &mut data {
            Artifact::Points(c) | Artifact::Lines(c) | Artifact::Polygons(c) => {
                c.stamp_provenance(entry_id);
            }
            _ => {}
        }

        let entry = Arc::new(StoreEntry {
            entry_id,
            cube,
            size,
            profile,
            data,
            last_access: AtomicU64::new(now_millis()),
            access_count: AtomicU64::new(0),
        });
        let meta = HandshakeEntry::from(entry.as_ref());

        inner
            .entries
            .entry(semantic_id.to_string())
            .or_default()
            .insert(entry_id, entry);
        inner.used += size;
        inner.entry_count += 1;

        self.puts.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("cache.store.used_bytes", "type" => self.result_type.as_str())
            .set(inner.used as f64);
        trace!(
            semantic_id,
            entry_id,
            size,
            "type" = %self.result_type,
            "inserted cache entry"
        );
        Ok(meta)
    }

    /// Returns a shared read-only handle, stamping the access time and
    /// count.
    pub fn get(&self, key: &EntryKey) -> CacheResult<Arc<StoreEntry>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.read().expect("store lock poisoned");
        match inner
            .entries
            .get(&key.semantic_id)
            .and_then(|m| m.get(&key.entry_id))
        {
            Some(entry) => {
                entry.touch();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(entry.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::NotFound(key.to_string()))
            }
        }
    }

    /// Idempotent removal.
    pub fn remove(&self, key: &EntryKey) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let removed = inner
            .entries
            .get_mut(&key.semantic_id)
            .and_then(|m| m.remove(&key.entry_id));
        if let Some(entry) = removed {
            inner.used = inner.used.saturating_sub(entry.size);
            inner.entry_count -= 1;
            if inner.entries.get(&key.semantic_id).is_some_and(BTreeMap::is_empty) {
                inner.entries.remove(&key.semantic_id);
            }
            self.removals.fetch_add(1, Ordering::Relaxed);
            metrics::gauge!("cache.store.used_bytes", "type" => self.result_type.as_str())
                .set(inner.used as f64);
            trace!(key = %key, "removed cache entry");
        }
    }

    /// Matches the query against the entries stored under `semantic_id`,
    /// stamping access on every selected entry.
    pub fn query(&self, semantic_id: &str, query: &QueryRectangle) -> StoreQueryResult {
        let inner = self.inner.read().expect("store lock poisoned");
        let Some(entries) = inner.entries.get(semantic_id) else {
            return StoreQueryResult {
                entries: Vec::new(),
                remainder: Vec::new(),
                hit_ratio: 0.0,
            };
        };
        let handles: Vec<&Arc<StoreEntry>> = entries.values().collect();
        let candidates: Vec<Candidate> = handles
            .iter()
            .map(|e| Candidate {
                cube: e.cube.clone(),
                entry_id: e.entry_id,
                access_count: e.access_count(),
            })
            .collect();
        let matched = matcher::match_query(query, &candidates);
        let selected: Vec<Arc<StoreEntry>> = matched
            .items
            .iter()
            .map(|&i| {
                handles[i].touch();
                Arc::clone(handles[i])
            })
            .collect();
        StoreQueryResult {
            entries: selected,
            remainder: matched.remainder,
            hit_ratio: matched.hit_ratio,
        }
    }

    /// Snapshot of all entry metadata.
    pub fn get_all(&self) -> CacheHandshake {
        let inner = self.inner.read().expect("store lock poisoned");
        let items = inner
            .entries
            .iter()
            .map(|(id, entries)| {
                (
                    id.clone(),
                    entries.values().map(|e| HandshakeEntry::from(e.as_ref())).collect(),
                )
            })
            .collect();
        CacheHandshake {
            result_type: self.result_type,
            items,
        }
    }

    pub fn get_stats(&self) -> StoreStats {
        let inner = self.inner.read().expect("store lock poisoned");
        StoreStats {
            result_type: Some(self.result_type),
            max_size: self.max_size,
            used_size: inner.used,
            entry_count: inner.entry_count,
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
        }
    }
}
