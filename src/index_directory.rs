// The cluster-wide entry directory.
//
// The index keeps, per result type, a map from semantic id to the entries
// known across all nodes, built from REGISTER handshakes and NEW_ENTRY
// notifications and refreshed by the stats rounds. Queries run the same
// matcher as the node-local store. Entries handed out in responses carry a
// short lease; reorg defers victims whose lease is still active.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::artifact::ResultType;
use crate::entry_store::{CacheHandshake, MetaEntry};
use crate::extent::{CacheCube, QueryRectangle};
use crate::matcher::{self, Candidate};
use crate::profiler::ProfilingData;
use crate::wire::{AccessUpdate, CacheRef, PuzzlePart, PuzzleRequest};

/// Leases protect handed-out refs from reorg for roughly the delivery TTL.
pub const REF_LEASE: Duration = Duration::from_secs(30);

/// One entry as the index sees it.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub node_id: u32,
    pub entry_id: u64,
    pub cube: CacheCube,
    pub size: u64,
    pub profile: ProfilingData,
    pub last_access: u64,
    pub access_count: u64,
    pub lease_until: Option<Instant>,
}

impl IndexEntry {
    pub fn leased(&self, now: Instant) -> bool {
        self.lease_until.is_some_and(|until| until > now)
    }
}

/// The index's answer to a lookup, before refs are resolved against the
/// node table.
#[derive(Debug)]
pub enum IndexVerdict {
    /// A single entry fully covers the query.
    Hit { node_id: u32, entry_id: u64 },
    Miss,
    /// Partial coverage: parts to fetch plus remainders to recompute.
    Partial {
        parts: Vec<(u32, PuzzlePart)>,
        remainder: Vec<QueryRectangle>,
    },
}

fn type_index(rt: ResultType) -> usize {
    ResultType::ALL.iter().position(|t| *t == rt).expect("closed set")
}

#[derive(Default)]
pub struct IndexDirectory {
    types: [RwLock<HashMap<String, Vec<IndexEntry>>>; 5],
}

impl IndexDirectory {
    pub fn new() -> Self {
        IndexDirectory::default()
    }

    fn map(&self, rt: ResultType) -> &RwLock<HashMap<String, Vec<IndexEntry>>> {
        &self.types[type_index(rt)]
    }

    /// Seeds the directory from a registration handshake.
    pub fn seed(&self, node_id: u32, caches: &[CacheHandshake]) {
        for cache in caches {
            let mut map = self.map(cache.result_type).write().expect("directory lock");
            for (semantic_id, entries) in &cache.items {
                let bucket = map.entry(semantic_id.clone()).or_default();
                for e in entries {
                    bucket.push(IndexEntry {
                        node_id,
                        entry_id: e.entry_id,
                        cube: e.cube.clone(),
                        size: e.size,
                        profile: e.profile,
                        last_access: e.last_access,
                        access_count: e.access_count,
                        lease_until: None,
                    });
                }
            }
        }
        debug!(node_id, "seeded directory from handshake");
    }

    pub fn add_entry(&self, meta: &MetaEntry) {
        let mut map = self.map(meta.result_type).write().expect("directory lock");
        map.entry(meta.semantic_id.clone())
            .or_default()
            .push(IndexEntry {
                node_id: meta.node_id,
                entry_id: meta.entry.entry_id,
                cube: meta.entry.cube.clone(),
                size: meta.entry.size,
                profile: meta.entry.profile,
                last_access: meta.entry.last_access,
                access_count: meta.entry.access_count,
                lease_until: None,
            });
        trace!(
            node_id = meta.node_id,
            semantic_id = %meta.semantic_id,
            entry_id = meta.entry.entry_id,
            "directory learned new entry"
        );
    }

    pub fn remove_entry(&self, rt: ResultType, semantic_id: &str, node_id: u32, entry_id: u64) {
        let mut map = self.map(rt).write().expect("directory lock");
        if let Some(bucket) = map.get_mut(semantic_id) {
            bucket.retain(|e| !(e.node_id == node_id && e.entry_id == entry_id));
            if bucket.is_empty() {
                map.remove(semantic_id);
            }
        }
    }

    /// Drops everything a node owned, e.g. when its control connection
    /// goes away.
    pub fn drop_node(&self, node_id: u32) {
        for rt in ResultType::ALL {
            let mut map = self.map(rt).write().expect("directory lock");
            for bucket in map.values_mut() {
                bucket.retain(|e| e.node_id != node_id);
            }
            map.retain(|_, bucket| !bucket.is_empty());
        }
        debug!(node_id, "dropped node from directory");
    }

    /// Refreshes access stamps from a stats round.
    pub fn update_access(&self, node_id: u32, updates: &[AccessUpdate]) {
        for update in updates {
            let mut map = self.map(update.result_type).write().expect("directory lock");
            if let Some(bucket) = map.get_mut(&update.semantic_id) {
                for e in bucket.iter_mut() {
                    if e.node_id == node_id && e.entry_id == update.entry_id {
                        e.last_access = update.last_access;
                        e.access_count = update.access_count;
                    }
                }
            }
        }
    }

    /// Cluster-wide match. Selected entries get their lease refreshed so
    /// reorg cannot invalidate refs that are about to be fetched.
    pub fn query(
        &self,
        rt: ResultType,
        semantic_id: &str,
        query: &QueryRectangle,
        resolve: impl Fn(u32) -> Option<(String, u16)>,
    ) -> IndexVerdict {
        let mut map = self.map(rt).write().expect("directory lock");
        let Some(bucket) = map.get_mut(semantic_id) else {
            return IndexVerdict::Miss;
        };

        let candidates: Vec<Candidate> = bucket
            .iter()
            .map(|e| Candidate {
                cube: e.cube.clone(),
                entry_id: e.entry_id,
                access_count: e.access_count,
            })
            .collect();
        let matched = matcher::match_query(query, &candidates);
        if !matched.has_hit() {
            return IndexVerdict::Miss;
        }

        let lease = Instant::now() + REF_LEASE;
        for &i in &matched.items {
            bucket[i].lease_until = Some(lease);
        }

        if !matched.has_remainder() && matched.items.len() == 1 {
            let e = &bucket[matched.items[0]];
            return IndexVerdict::Hit {
                node_id: e.node_id,
                entry_id: e.entry_id,
            };
        }

        let mut parts = Vec::with_capacity(matched.items.len());
        for &i in &matched.items {
            let selected = &bucket[i];
            let Some((host, port)) = resolve(selected.node_id) else {
                continue;
            };
            // Alternates: entries on other nodes whose cube covers the
            // selected cube, usable when the primary ref goes stale.
            let alternates = bucket
                .iter()
                .enumerate()
                .filter(|(j, other)| {
                    *j != i
                        && !matched.items.contains(j)
                        && other.node_id != selected.node_id
                        && other.cube.bbox().contains(&selected.cube.bbox())
                })
                .filter_map(|(_, other)| {
                    resolve(other.node_id).map(|(h, p)| CacheRef {
                        host: h,
                        port: p,
                        entry_id: other.entry_id,
                    })
                })
                .take(2)
                .collect();
            parts.push((
                selected.node_id,
                PuzzlePart {
                    primary: CacheRef {
                        host,
                        port,
                        entry_id: selected.entry_id,
                    },
                    alternates,
                },
            ));
        }

        if parts.is_empty() {
            return IndexVerdict::Miss;
        }
        IndexVerdict::Partial {
            parts,
            remainder: matched.remainder,
        }
    }

    /// Builds the wire puzzle request from a partial verdict.
    pub fn puzzle_request(
        rt: ResultType,
        semantic_id: &str,
        query: &QueryRectangle,
        parts: Vec<(u32, PuzzlePart)>,
        remainder: Vec<QueryRectangle>,
    ) -> PuzzleRequest {
        PuzzleRequest {
            result_type: rt,
            semantic_id: semantic_id.to_string(),
            query: query.clone(),
            remainder,
            parts: parts.into_iter().map(|(_, p)| p).collect(),
        }
    }

    /// Snapshot of every entry of one type, for reorg planning.
    pub fn snapshot(&self, rt: ResultType) -> Vec<(String, Vec<IndexEntry>)> {
        let map = self.map(rt).read().expect("directory lock");
        map.iter()
            .map(|(id, entries)| (id.clone(), entries.clone()))
            .collect()
    }

    /// Bytes the directory attributes to each node for one type.
    pub fn bytes_per_node(&self, rt: ResultType) -> HashMap<u32, u64> {
        let map = self.map(rt).read().expect("directory lock");
        let mut out = HashMap::new();
        for bucket in map.values() {
            for e in bucket {
                *out.entry(e.node_id).or_insert(0) += e.size;
            }
        }
        out
    }

    pub fn entry_count(&self) -> usize {
        ResultType::ALL
            .iter()
            .map(|rt| {
                self.map(*rt)
                    .read()
                    .expect("directory lock")
                    .values()
                    .map(Vec::len)
                    .sum::<usize>()
            })
            .sum()
    }
}
