// The node cache manager.
//
// Binds one typed store per result type together with the admission
// strategy, the replacement policy and the puzzler, and exposes the two
// operations workers use: `query` and `put`. The decision tree on a query
// follows the hit classes: full single local hit, local multi-entry
// puzzle, then the index roundtrip for remote hits, mixed puzzles, or a
// genuine miss that the operator runner resolves by recomputing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::artifact::{Artifact, ResultType};
use crate::entry_store::{EntryKey, EntryStore, MetaEntry, StoreStats};
use crate::error::{CacheError, CacheResult};
use crate::extent::QueryRectangle;
use crate::operators::Operator;
use crate::profiler::{ProfilingData, QueryProfiler};
use crate::replacement::{self, RelevanceFunction};
use crate::retriever;
use crate::strategy::CachingStrategy;
use crate::wire::{
    self, AccessUpdate, BaseRequest, CacheRef, MAGIC_WORKER, NodeHandshake, NodeStats,
    PuzzlePart, PuzzleRequest, RegisterResponse, cmd,
};

/// Per-class query counters, deltas shipped to the index with each stats
/// round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    pub single_local_hits: u64,
    pub multi_local_hits: u64,
    pub multi_local_partials: u64,
    pub single_remote_hits: u64,
    pub multi_remote_hits: u64,
    pub multi_remote_partials: u64,
    pub misses: u64,
    pub queries: u64,
    pub hit_ratio_sum: f64,
    pub result_bytes: u64,
}

impl std::ops::AddAssign<&QueryStats> for QueryStats {
    fn add_assign(&mut self, rhs: &QueryStats) {
        self.single_local_hits += rhs.single_local_hits;
        self.multi_local_hits += rhs.multi_local_hits;
        self.multi_local_partials += rhs.multi_local_partials;
        self.single_remote_hits += rhs.single_remote_hits;
        self.multi_remote_hits += rhs.multi_remote_hits;
        self.multi_remote_partials += rhs.multi_remote_partials;
        self.misses += rhs.misses;
        self.queries += rhs.queries;
        self.hit_ratio_sum += rhs.hit_ratio_sum;
        self.result_bytes += rhs.result_bytes;
    }
}

/// Mutex-guarded accumulator for [`QueryStats`].
#[derive(Debug, Default)]
pub struct ActiveQueryStats {
    inner: Mutex<QueryStats>,
}

impl ActiveQueryStats {
    fn update(&self, f: impl FnOnce(&mut QueryStats)) {
        f(&mut self.inner.lock().expect("stats lock poisoned"));
    }

    pub fn add_query(&self, hit_ratio: f64) {
        self.update(|s| {
            s.queries += 1;
            s.hit_ratio_sum += hit_ratio;
        });
    }

    pub fn add_result_bytes(&self, bytes: u64) {
        self.update(|s| s.result_bytes += bytes);
    }

    pub fn get(&self) -> QueryStats {
        *self.inner.lock().expect("stats lock poisoned")
    }

    pub fn get_and_reset(&self) -> QueryStats {
        let mut guard = self.inner.lock().expect("stats lock poisoned");
        std::mem::take(&mut guard)
    }
}

/// The worker's persistent connection to the index, speaking the worker
/// protocol (QUERY and NEW_ENTRY).
pub struct IndexConnection {
    stream: TcpStream,
}

/// Outcome of an index lookup.
#[derive(Debug)]
pub enum IndexQueryResponse {
    Hit(CacheRef),
    Miss,
    Partial(PuzzleRequest),
}

impl IndexConnection {
    pub async fn connect(host: &str, port: u16) -> CacheResult<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        debug!(host, port, "connected worker channel to index");
        Ok(IndexConnection { stream })
    }

    pub async fn query(&mut self, request: &BaseRequest) -> CacheResult<IndexQueryResponse> {
        wire::write_frame(&mut self.stream, MAGIC_WORKER, cmd::QUERY, request).await?;
        let frame = wire::expect_frame(&mut self.stream, MAGIC_WORKER).await?;
        match frame.cmd {
            cmd::RESP_HIT => Ok(IndexQueryResponse::Hit(frame.decode()?)),
            cmd::RESP_MISS => Ok(IndexQueryResponse::Miss),
            cmd::RESP_PARTIAL => Ok(IndexQueryResponse::Partial(frame.decode()?)),
            other => Err(CacheError::ProtocolState(format!(
                "unexpected index query reply {other:#04x}"
            ))),
        }
    }

    pub async fn new_entry(&mut self, meta: &MetaEntry) -> CacheResult<()> {
        wire::write_frame(&mut self.stream, MAGIC_WORKER, cmd::NEW_ENTRY, meta).await
    }
}

/// Per-worker state, passed explicitly into every query and put. Holds the
/// puzzling flag and the worker's index connection; standalone nodes run
/// with no connection at all.
pub struct WorkerContext {
    pub puzzling: bool,
    pub index: Option<IndexConnection>,
    pub node_id: u32,
}

impl WorkerContext {
    pub fn standalone() -> Self {
        WorkerContext {
            puzzling: false,
            index: None,
            node_id: 0,
        }
    }

    pub fn with_index(index: IndexConnection, node_id: u32) -> Self {
        WorkerContext {
            puzzling: false,
            index: Some(index),
            node_id,
        }
    }
}

/// Byte budgets per result type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSizes {
    pub raster: u64,
    pub point: u64,
    pub line: u64,
    pub polygon: u64,
    pub plot: u64,
}

impl CacheSizes {
    pub fn uniform(size: u64) -> Self {
        CacheSizes {
            raster: size,
            point: size,
            line: size,
            polygon: size,
            plot: size,
        }
    }

    fn get(&self, rt: ResultType) -> u64 {
        match rt {
            ResultType::Raster => self.raster,
            ResultType::Point => self.point,
            ResultType::Line => self.line,
            ResultType::Polygon => self.polygon,
            ResultType::Plot => self.plot,
        }
    }
}

fn type_index(rt: ResultType) -> usize {
    match rt {
        ResultType::Raster => 0,
        ResultType::Point => 1,
        ResultType::Line => 2,
        ResultType::Polygon => 3,
        ResultType::Plot => 4,
    }
}

pub struct NodeCacheManager {
    stores: [EntryStore; 5],
    stats: [ActiveQueryStats; 5],
    strategy: CachingStrategy,
    replacement: RelevanceFunction,
    // Advertised delivery address, set once the delivery listener is bound.
    self_addr: OnceLock<(String, u16)>,
    node_id: AtomicU32,
    cumulated: ActiveQueryStats,
}

impl NodeCacheManager {
    pub fn new(
        strategy: CachingStrategy,
        replacement: RelevanceFunction,
        sizes: CacheSizes,
    ) -> Self {
        let stores = ResultType::ALL.map(|rt| EntryStore::new(rt, sizes.get(rt)));
        NodeCacheManager {
            stores,
            stats: Default::default(),
            strategy,
            replacement,
            self_addr: OnceLock::new(),
            node_id: AtomicU32::new(0),
            cumulated: ActiveQueryStats::default(),
        }
    }

    pub fn store(&self, rt: ResultType) -> &EntryStore {
        &self.stores[type_index(rt)]
    }

    pub fn wrapper(&self, rt: ResultType) -> CacheWrapper<'_> {
        CacheWrapper {
            mgr: self,
            store: self.store(rt),
            stats: &self.stats[type_index(rt)],
        }
    }

    pub fn set_self_addr(&self, host: String, port: u16) {
        let _ = self.self_addr.set((host, port));
    }

    pub fn self_addr(&self) -> Option<&(String, u16)> {
        self.self_addr.get()
    }

    pub fn set_node_id(&self, id: u32) {
        self.node_id.store(id, Ordering::Relaxed);
    }

    pub fn node_id(&self) -> u32 {
        self.node_id.load(Ordering::Relaxed)
    }

    pub fn create_local_ref(&self, entry_id: u64) -> CacheResult<CacheRef> {
        let (host, port) = self.self_addr().ok_or_else(|| {
            CacheError::MustNotHappen("local ref requested before delivery bind".into())
        })?;
        Ok(CacheRef {
            host: host.clone(),
            port: *port,
            entry_id,
        })
    }

    pub fn is_local_ref(&self, cache_ref: &CacheRef) -> bool {
        self.self_addr()
            .is_some_and(|(host, port)| cache_ref.host == *host && cache_ref.port == *port)
    }

    /// The per-node dump of entry metadata sent at registration.
    pub fn create_handshake(&self) -> CacheResult<NodeHandshake> {
        let (_, port) = self.self_addr().ok_or_else(|| {
            CacheError::MustNotHappen("handshake requested before delivery bind".into())
        })?;
        Ok(NodeHandshake {
            delivery_port: *port,
            caches: self.stores.iter().map(EntryStore::get_all).collect(),
        })
    }

    /// Stats delta for the index: per-class query counters since the last
    /// round, store counters, and fresh access stamps for every entry.
    pub fn get_stats_delta(&self) -> NodeStats {
        let mut query_stats = QueryStats::default();
        for s in &self.stats {
            let delta = s.get_and_reset();
            query_stats += &delta;
        }
        self.cumulated.update(|c| *c += &query_stats);

        let mut access_info = Vec::new();
        for store in &self.stores {
            let hs = store.get_all();
            for (semantic_id, entries) in hs.items {
                for e in entries {
                    access_info.push(AccessUpdate {
                        result_type: hs.result_type,
                        semantic_id: semantic_id.clone(),
                        entry_id: e.entry_id,
                        last_access: e.last_access,
                        access_count: e.access_count,
                    });
                }
            }
        }

        NodeStats {
            query_stats,
            stores: self.stores.iter().map(EntryStore::get_stats).collect(),
            access_info,
        }
    }

    pub fn get_cumulated_query_stats(&self) -> QueryStats {
        self.cumulated.get()
    }

    pub fn store_stats(&self) -> Vec<StoreStats> {
        self.stores.iter().map(EntryStore::get_stats).collect()
    }
}

/// Per-type facade over the store: admission, eviction, the query decision
/// tree and puzzle orchestration.
pub struct CacheWrapper<'a> {
    mgr: &'a NodeCacheManager,
    store: &'a EntryStore,
    stats: &'a ActiveQueryStats,
}

impl<'a> CacheWrapper<'a> {
    /// Caches a computed artifact. Returns whether the artifact was
    /// stored. Never fails the surrounding query: budget overflow logs and
    /// returns `false`.
    pub async fn put(
        &self,
        semantic_id: &str,
        artifact: &Artifact,
        query: &QueryRectangle,
        profile: &ProfilingData,
        ctx: &mut WorkerContext,
    ) -> CacheResult<bool> {
        // Puzzle sub-results are not independently cacheable.
        if ctx.puzzling {
            return Ok(false);
        }
        artifact.expect_type(self.store.result_type())?;

        let size = artifact.byte_size();
        self.stats.add_result_bytes(size);

        if !self.mgr.strategy.do_cache(profile, size) {
            trace!(semantic_id, size, "admission rejected artifact");
            return Ok(false);
        }

        // The cube carries the saturation-widened scale interval for
        // rasters; queries without pixel resolution never saturate.
        debug_assert!(
            query.resolution.is_pixels() || !matches!(artifact, Artifact::Raster(_)),
            "raster artifact for a query without resolution"
        );
        let cube = artifact.cube()?;

        let meta = match self.store.put(semantic_id, artifact.clone(), cube.clone(), *profile) {
            Ok(meta) => meta,
            Err(CacheError::BudgetExceeded { needed, .. }) => {
                let victims = replacement::get_removals(self.mgr.replacement, self.store, needed);
                debug!(
                    semantic_id,
                    victims = victims.len(),
                    "evicting to make room for put"
                );
                for key in &victims {
                    self.store.remove(key);
                    metrics::counter!("cache.store.evictions_total", "type" => self.store.result_type().as_str())
                        .increment(1);
                }
                match self.store.put(semantic_id, artifact.clone(), cube, *profile) {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!(semantic_id, error = %e, "put rejected even after eviction");
                        return Ok(false);
                    }
                }
            }
            Err(e) => return Err(e),
        };

        // The index learns about the entry only after the local insert
        // completed, so it never advertises an entry the owner lacks.
        if let Some(conn) = ctx.index.as_mut() {
            let notify = MetaEntry {
                node_id: ctx.node_id,
                result_type: self.store.result_type(),
                semantic_id: semantic_id.to_string(),
                entry: meta,
            };
            if let Err(e) = conn.new_entry(&notify).await {
                warn!(error = %e, "failed to notify index of new entry, dropping connection");
                ctx.index = None;
            }
        }
        Ok(true)
    }

    /// Serves a query from the cache. `Err(Miss)` tells the operator
    /// runner to recompute (and `put`) the result.
    pub async fn query(
        &self,
        op: &Arc<dyn Operator>,
        semantic_id: &str,
        query: &QueryRectangle,
        profiler: &mut QueryProfiler,
        ctx: &mut WorkerContext,
    ) -> CacheResult<Artifact> {
        query.validate()?;
        // Leaves are cheaper to recompute than to round-trip the index.
        if op.depth() == 0 {
            trace!(semantic_id, "graph depth 0, bypassing cache");
            return Err(CacheError::Miss);
        }

        let qres = self.store.query(semantic_id, query);
        self.stats.add_query(qres.hit_ratio);
        for entry in &qres.entries {
            profiler.add_total(&entry.profile);
        }

        if !qres.has_remainder() && qres.entries.len() == 1 {
            self.stats.update(|s| s.single_local_hits += 1);
            trace!(semantic_id, "full single local hit");
            return qres.entries[0].data.cut(query);
        }

        if !qres.has_remainder() && qres.entries.len() > 1 {
            self.stats.update(|s| s.multi_local_hits += 1);
            trace!(semantic_id, parts = qres.entries.len(), "full local hit, puzzling");
            let request = self.local_puzzle_request(semantic_id, query, &qres)?;
            return self.process_puzzle(op, &request, profiler, ctx).await;
        }

        if ctx.index.is_none() {
            // Standalone node: a partial hit still puzzles locally; a miss
            // stays a miss.
            if qres.has_hit() {
                self.stats.update(|s| s.multi_local_partials += 1);
                let request = self.local_puzzle_request(semantic_id, query, &qres)?;
                return self.process_puzzle(op, &request, profiler, ctx).await;
            }
            self.stats.update(|s| s.misses += 1);
            return Err(CacheError::Miss);
        }

        // Local partial or miss: the index sees the whole cluster.
        debug!(semantic_id, hit_ratio = qres.hit_ratio, "local miss, querying index");
        let request = BaseRequest {
            result_type: self.store.result_type(),
            semantic_id: semantic_id.to_string(),
            query: query.clone(),
        };
        let Some(conn) = ctx.index.as_mut() else {
            return Err(CacheError::MustNotHappen(
                "index connection vanished mid-query".into(),
            ));
        };
        let response = match conn.query(&request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "index query failed, dropping connection");
                ctx.index = None;
                return Err(e);
            }
        };

        match response {
            IndexQueryResponse::Hit(cache_ref) => {
                self.stats.update(|s| s.single_remote_hits += 1);
                trace!(semantic_id, %cache_ref, "full single remote hit");
                self.fetch_remote_hit(semantic_id, &cache_ref, query, profiler, ctx)
                    .await
            }
            IndexQueryResponse::Miss => {
                self.stats.update(|s| s.misses += 1);
                trace!(semantic_id, "full remote miss");
                Err(CacheError::Miss)
            }
            IndexQueryResponse::Partial(request) => {
                let local_only = request
                    .parts
                    .iter()
                    .all(|p| self.mgr.is_local_ref(&p.primary));
                self.stats.update(|s| {
                    if local_only {
                        s.multi_local_partials += 1;
                    } else if request.remainder.is_empty() {
                        s.multi_remote_hits += 1;
                    } else {
                        s.multi_remote_partials += 1;
                    }
                });
                trace!(
                    semantic_id,
                    parts = request.parts.len(),
                    remainders = request.remainder.len(),
                    "partial remote hit, puzzling"
                );
                self.process_puzzle(op, &request, profiler, ctx).await
            }
        }
    }

    fn local_puzzle_request(
        &self,
        semantic_id: &str,
        query: &QueryRectangle,
        qres: &crate::entry_store::StoreQueryResult,
    ) -> CacheResult<PuzzleRequest> {
        let parts = qres
            .entries
            .iter()
            .map(|e| {
                self.mgr.create_local_ref(e.entry_id).map(|r| PuzzlePart {
                    primary: r,
                    alternates: Vec::new(),
                })
            })
            .collect::<CacheResult<Vec<_>>>()?;
        Ok(PuzzleRequest {
            result_type: self.store.result_type(),
            semantic_id: semantic_id.to_string(),
            query: query.clone(),
            remainder: qres.remainder.clone(),
            parts,
        })
    }

    /// Fetches a full remote hit, optionally adopting it into the local
    /// store under the admission strategy, and returns it restricted to
    /// the query.
    async fn fetch_remote_hit(
        &self,
        semantic_id: &str,
        cache_ref: &CacheRef,
        query: &QueryRectangle,
        profiler: &mut QueryProfiler,
        ctx: &mut WorkerContext,
    ) -> CacheResult<Artifact> {
        let part = PuzzlePart {
            primary: cache_ref.clone(),
            alternates: Vec::new(),
        };
        let (artifact, profile) =
            retriever::load_part(self.store.result_type(), semantic_id, &part, profiler).await?;
        profiler.add_total(&profile);

        if self.mgr.strategy.do_cache(&profile, artifact.byte_size()) {
            // Adoption is best-effort; a full cache just skips it.
            let _ = self.put(semantic_id, &artifact, query, &profile, ctx).await?;
        }
        artifact.cut(query)
    }

    /// Assembles a puzzle: recomputes remainders (in parallel, under the
    /// puzzling flag so nothing transitively caches), collects parts, and
    /// merges. The assembled result is cached unless this puzzle is nested
    /// inside another.
    async fn process_puzzle(
        &self,
        op: &Arc<dyn Operator>,
        request: &PuzzleRequest,
        profiler: &mut QueryProfiler,
        ctx: &mut WorkerContext,
    ) -> CacheResult<Artifact> {
        let mut child = QueryProfiler::new();
        profiler.stop();
        let was_puzzling = ctx.puzzling;
        ctx.puzzling = true;

        let assembled = self.assemble(op, request, &mut child).await;

        ctx.puzzling = was_puzzling;
        profiler.resume();

        let artifact = match assembled {
            Ok(a) => a,
            Err(e) => {
                profiler.add_child(&child.data);
                return Err(e);
            }
        };
        profiler.add_child(&child.data);

        if !was_puzzling
            && self
                .put(&request.semantic_id, &artifact, &request.query, &child.data, ctx)
                .await?
        {
            profiler.cached(&child.data);
        }
        Ok(artifact)
    }

    async fn assemble(
        &self,
        op: &Arc<dyn Operator>,
        request: &PuzzleRequest,
        profiler: &mut QueryProfiler,
    ) -> CacheResult<Artifact> {
        let mut inputs = Vec::with_capacity(request.parts.len() + request.remainder.len());

        for part in &request.parts {
            if self.mgr.is_local_ref(&part.primary) {
                let key = EntryKey::new(request.semantic_id.clone(), part.primary.entry_id);
                let entry = self.store.get(&key)?;
                profiler.add_total(&entry.profile);
                inputs.push(entry.data.clone());
            } else {
                let (artifact, profile) = retriever::load_part(
                    request.result_type,
                    &request.semantic_id,
                    part,
                    profiler,
                )
                .await?;
                profiler.add_total(&profile);
                inputs.push(artifact);
            }
        }

        // Remainders recompute in parallel, each with its own profiler.
        let recomputed = try_join_all(request.remainder.iter().map(|remainder| {
            let op = Arc::clone(op);
            let remainder = remainder.clone();
            async move {
                let mut p = QueryProfiler::new();
                let artifact = op.compute(&remainder, &mut p).await?;
                Ok::<_, CacheError>((artifact, p.data))
            }
        }))
        .await?;
        for (artifact, data) in recomputed {
            profiler.add_child(&data);
            inputs.push(artifact);
        }

        crate::puzzle::merge_artifacts(request.result_type, &request.query, inputs)
    }
}

/// Registers the node with the index over a fresh control stream and
/// returns the assigned node id.
pub async fn register_node(
    stream: &mut TcpStream,
    handshake: &NodeHandshake,
) -> CacheResult<u32> {
    wire::write_frame(stream, wire::MAGIC_CONTROL, cmd::REGISTER, handshake).await?;
    let frame = wire::expect_frame(stream, wire::MAGIC_CONTROL).await?;
    match frame.cmd {
        cmd::RESP_OK => {
            let resp: RegisterResponse = frame.decode()?;
            Ok(resp.node_id)
        }
        other => Err(CacheError::ProtocolState(format!(
            "unexpected register reply {other:#04x}"
        ))),
    }
}

/// Runs one cached query end to end: cache lookup, then recompute-and-put
/// on a miss. This is the entry point workers and embedders use.
pub async fn run_cached(
    mgr: &NodeCacheManager,
    registry: &crate::operators::OperatorRegistry,
    result_type: ResultType,
    semantic_id: &str,
    query: &QueryRectangle,
    profiler: &mut QueryProfiler,
    ctx: &mut WorkerContext,
) -> CacheResult<Artifact> {
    let op = registry.get(semantic_id)?;
    if op.result_type() != result_type {
        return Err(CacheError::Argument(format!(
            "operator {semantic_id} produces {}, not {result_type}",
            op.result_type()
        )));
    }
    let wrapper = mgr.wrapper(result_type);
    match wrapper.query(&op, semantic_id, query, profiler, ctx).await {
        Ok(artifact) => Ok(artifact),
        // A stale ref (entry evicted between index answer and fetch)
        // upgrades to a plain miss.
        Err(CacheError::Miss | CacheError::NotFound(_)) => {
            debug!(semantic_id, "cache miss, recomputing");
            metrics::counter!("cache.recomputes_total").increment(1);
            let mut compute_profiler = QueryProfiler::new();
            let artifact = op.compute(query, &mut compute_profiler).await?;
            profiler.add_child(&compute_profiler.data);
            if wrapper
                .put(semantic_id, &artifact, query, &compute_profiler.data, ctx)
                .await?
            {
                profiler.cached(&compute_profiler.data);
            }
            Ok(artifact)
        }
        Err(e) => Err(e),
    }
}
