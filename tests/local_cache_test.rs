//! Node-local cache behavior: full hits, puzzles, miss-recompute-admit,
//! and eviction under pressure. Everything runs against a standalone
//! manager, no sockets involved.

mod common;

use std::sync::Arc;

use common::{GradientOp, expect_raster, gradient_raster, must, raster_query};
use tessera::artifact::{Artifact, Plot, ResultType};
use tessera::entry_store::EntryKey;
use tessera::error::CacheError;
use tessera::extent::{CrsId, QueryRectangle, QueryResolution, SpatioTemporalExtent};
use tessera::node_cache::{CacheSizes, NodeCacheManager, WorkerContext, run_cached};
use tessera::operators::OperatorRegistry;
use tessera::profiler::{ProfilingData, QueryProfiler};
use tessera::replacement::RelevanceFunction;
use tessera::strategy::CachingStrategy;

fn standalone_manager(strategy: CachingStrategy) -> NodeCacheManager {
    let mgr = NodeCacheManager::new(
        strategy,
        RelevanceFunction::Lru,
        CacheSizes::uniform(1 << 20),
    );
    mgr.set_self_addr("127.0.0.1".to_string(), 1);
    mgr
}

#[tokio::test]
async fn test_full_local_hit_returns_window() {
    let mgr = standalone_manager(CachingStrategy::CacheAll);
    let registry = OperatorRegistry::new();
    let op = GradientOp::new(10.0);
    registry.register("op1", op.clone());
    let mut ctx = WorkerContext::standalone();

    // Prime the cache with an entry covering [0,100]^2.
    let prime = raster_query(0.0, 0.0, 100.0, 100.0, 100, 100);
    let mut profiler = QueryProfiler::new();
    must(
        run_cached(&mgr, &registry, ResultType::Raster, "op1", &prime, &mut profiler, &mut ctx)
            .await,
        "prime",
    );
    assert_eq!(op.compute_count(), 1);

    // A contained query at the same scale is a single-entry hit whose
    // bytes equal the window of the cached entry.
    let window_query = raster_query(10.0, 10.0, 20.0, 20.0, 10, 10);
    let mut profiler = QueryProfiler::new();
    let hit = must(
        run_cached(
            &mgr,
            &registry,
            ResultType::Raster,
            "op1",
            &window_query,
            &mut profiler,
            &mut ctx,
        )
        .await,
        "window query",
    );
    assert_eq!(op.compute_count(), 1, "hit must not recompute");
    assert_eq!(
        expect_raster(&hit).data,
        gradient_raster(&window_query).data
    );
    // The stored profile was attributed to the querying profiler.
    assert!(profiler.data.all_cpu >= 10.0);

    let stats = mgr.get_stats_delta();
    assert_eq!(stats.query_stats.single_local_hits, 1);
    assert_eq!(stats.query_stats.misses, 1);
}

#[tokio::test]
async fn test_two_halves_puzzle_into_full_result() {
    let mgr = standalone_manager(CachingStrategy::CacheAll);
    let registry = OperatorRegistry::new();
    let op = GradientOp::new(10.0);
    registry.register("op1", op.clone());
    let mut ctx = WorkerContext::standalone();

    for half in [
        raster_query(0.0, 0.0, 50.0, 100.0, 50, 100),
        raster_query(50.0, 0.0, 100.0, 100.0, 50, 100),
    ] {
        let mut profiler = QueryProfiler::new();
        must(
            run_cached(&mgr, &registry, ResultType::Raster, "op1", &half, &mut profiler, &mut ctx)
                .await,
            "prime half",
        );
    }
    assert_eq!(op.compute_count(), 2);

    let full = raster_query(0.0, 0.0, 100.0, 100.0, 100, 100);
    let mut profiler = QueryProfiler::new();
    let assembled = must(
        run_cached(&mgr, &registry, ResultType::Raster, "op1", &full, &mut profiler, &mut ctx)
            .await,
        "full query",
    );
    // Both halves were in cache; no remainder, no recompute.
    assert_eq!(op.compute_count(), 2);
    assert_eq!(expect_raster(&assembled).data, gradient_raster(&full).data);

    let stats = mgr.get_stats_delta();
    assert_eq!(stats.query_stats.multi_local_hits, 1);
}

#[tokio::test]
async fn test_partial_hit_recomputes_remainder_only() {
    let mgr = standalone_manager(CachingStrategy::CacheAll);
    let registry = OperatorRegistry::new();
    let op = GradientOp::new(10.0);
    registry.register("op1", op.clone());
    let mut ctx = WorkerContext::standalone();

    let left = raster_query(0.0, 0.0, 50.0, 100.0, 50, 100);
    let mut profiler = QueryProfiler::new();
    must(
        run_cached(&mgr, &registry, ResultType::Raster, "op1", &left, &mut profiler, &mut ctx)
            .await,
        "prime left",
    );

    let full = raster_query(0.0, 0.0, 100.0, 100.0, 100, 100);
    let mut profiler = QueryProfiler::new();
    let assembled = must(
        run_cached(&mgr, &registry, ResultType::Raster, "op1", &full, &mut profiler, &mut ctx)
            .await,
        "full query",
    );
    // One prime plus one remainder recompute for the right half.
    assert_eq!(op.compute_count(), 2);
    assert_eq!(expect_raster(&assembled).data, gradient_raster(&full).data);

    let stats = mgr.get_stats_delta();
    assert_eq!(stats.query_stats.multi_local_partials, 1);
}

#[tokio::test]
async fn test_miss_then_recompute_then_admit() {
    let mgr = standalone_manager(CachingStrategy::by_name("cost:0").unwrap());
    let registry = OperatorRegistry::new();
    let op = GradientOp::new(100.0);
    registry.register("op1", op.clone());
    let mut ctx = WorkerContext::standalone();

    let query = raster_query(0.0, 0.0, 32.0, 32.0, 32, 32);
    let mut profiler = QueryProfiler::new();
    let first = must(
        run_cached(&mgr, &registry, ResultType::Raster, "op1", &query, &mut profiler, &mut ctx)
            .await,
        "first query",
    );
    assert_eq!(op.compute_count(), 1);
    // The successful write re-attributed the paid cost.
    assert_eq!(profiler.data.cached_cpu, 100.0);
    assert_eq!(profiler.data.uncached_cpu, 0.0);

    let mut profiler = QueryProfiler::new();
    let second = must(
        run_cached(&mgr, &registry, ResultType::Raster, "op1", &query, &mut profiler, &mut ctx)
            .await,
        "second query",
    );
    assert_eq!(op.compute_count(), 1, "second query must hit");
    assert_eq!(expect_raster(&second).data, expect_raster(&first).data);
}

#[tokio::test]
async fn test_never_strategy_caches_nothing() {
    let mgr = standalone_manager(CachingStrategy::Never);
    let registry = OperatorRegistry::new();
    let op = GradientOp::new(100.0);
    registry.register("op1", op.clone());
    let mut ctx = WorkerContext::standalone();

    let query = raster_query(0.0, 0.0, 16.0, 16.0, 16, 16);
    for _ in 0..2 {
        let mut profiler = QueryProfiler::new();
        must(
            run_cached(&mgr, &registry, ResultType::Raster, "op1", &query, &mut profiler, &mut ctx)
                .await,
            "query",
        );
    }
    assert_eq!(op.compute_count(), 2, "nothing may be cached");
    assert_eq!(mgr.store(ResultType::Raster).used_size(), 0);
}

fn plot_artifact(bytes: usize) -> Artifact {
    let extent = SpatioTemporalExtent::new(CrsId::LatLon, 0.0, 0.0, 100.0, 100.0, 0.0, 1.0);
    Artifact::Plot(Plot::new(extent, "x".repeat(bytes)))
}

fn plot_query() -> QueryRectangle {
    QueryRectangle::new(
        CrsId::LatLon,
        0.0,
        0.0,
        100.0,
        100.0,
        0.0,
        1.0,
        QueryResolution::None,
    )
    .unwrap()
}

#[tokio::test]
async fn test_lru_eviction_under_pressure() {
    // Measure the effective entry size first, then build a store that
    // fits exactly three entries.
    let probe = NodeCacheManager::new(
        CachingStrategy::CacheAll,
        RelevanceFunction::Lru,
        CacheSizes::uniform(1 << 20),
    );
    let meta = probe
        .store(ResultType::Plot)
        .put(
            "probe",
            plot_artifact(1000),
            plot_artifact(1000).cube().unwrap(),
            ProfilingData::default(),
        )
        .unwrap();
    let entry_size = meta.size;

    let mgr = NodeCacheManager::new(
        CachingStrategy::CacheAll,
        RelevanceFunction::Lru,
        CacheSizes {
            plot: 3 * entry_size,
            ..CacheSizes::uniform(1 << 20)
        },
    );
    mgr.set_self_addr("127.0.0.1".to_string(), 1);
    let mut ctx = WorkerContext::standalone();
    let query = plot_query();

    for semantic_id in ["e1", "e2", "e3"] {
        let wrapper = mgr.wrapper(ResultType::Plot);
        let stored = wrapper
            .put(
                semantic_id,
                &plot_artifact(1000),
                &query,
                &ProfilingData::default(),
                &mut ctx,
            )
            .await
            .unwrap();
        assert!(stored);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    // Touch e1 so e2 becomes the LRU victim.
    assert!(mgr.store(ResultType::Plot).query("e1", &query).has_hit());
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let wrapper = mgr.wrapper(ResultType::Plot);
    let stored = wrapper
        .put(
            "e4",
            &plot_artifact(1000),
            &query,
            &ProfilingData::default(),
            &mut ctx,
        )
        .await
        .unwrap();
    assert!(stored);

    let store = mgr.store(ResultType::Plot);
    assert!(store.used_size() <= 3 * entry_size);
    let remaining: Vec<String> = store
        .get_all()
        .items
        .iter()
        .map(|(id, _)| id.clone())
        .collect();
    assert!(remaining.contains(&"e1".to_string()));
    assert!(!remaining.contains(&"e2".to_string()), "e2 must be evicted");
    assert!(remaining.contains(&"e3".to_string()));
    assert!(remaining.contains(&"e4".to_string()));
}

#[tokio::test]
async fn test_depth_zero_bypasses_cache() {
    let mgr = standalone_manager(CachingStrategy::CacheAll);
    let op = GradientOp::new(1.0);

    struct Leaf(Arc<GradientOp>);

    #[async_trait::async_trait]
    impl tessera::operators::Operator for Leaf {
        fn result_type(&self) -> ResultType {
            ResultType::Raster
        }
        fn depth(&self) -> u32 {
            0
        }
        async fn compute(
            &self,
            query: &QueryRectangle,
            profiler: &mut QueryProfiler,
        ) -> tessera::error::CacheResult<Artifact> {
            self.0.compute(query, profiler).await
        }
    }

    let registry = OperatorRegistry::new();
    registry.register("leaf", Arc::new(Leaf(op.clone())));
    let mut ctx = WorkerContext::standalone();
    let query = raster_query(0.0, 0.0, 8.0, 8.0, 8, 8);
    for _ in 0..2 {
        let mut profiler = QueryProfiler::new();
        must(
            run_cached(&mgr, &registry, ResultType::Raster, "leaf", &query, &mut profiler, &mut ctx)
                .await,
            "leaf query",
        );
    }
    // Depth-0 graphs skip the lookup entirely, so every query recomputes.
    assert_eq!(op.compute_count(), 2);
}

#[tokio::test]
async fn test_budget_overflow_does_not_fail_query() {
    let mgr = NodeCacheManager::new(
        CachingStrategy::CacheAll,
        RelevanceFunction::Lru,
        CacheSizes::uniform(64),
    );
    mgr.set_self_addr("127.0.0.1".to_string(), 1);
    let mut ctx = WorkerContext::standalone();
    let wrapper = mgr.wrapper(ResultType::Plot);

    // Far beyond the soft margin even after eviction: put reports false.
    let stored = wrapper
        .put(
            "huge",
            &plot_artifact(100_000),
            &plot_query(),
            &ProfilingData::default(),
            &mut ctx,
        )
        .await
        .unwrap();
    assert!(!stored);
    assert_eq!(mgr.store(ResultType::Plot).used_size(), 0);
}

#[tokio::test]
async fn test_standalone_miss_is_miss() {
    let mgr = standalone_manager(CachingStrategy::CacheAll);
    let registry = OperatorRegistry::new();
    registry.register("op1", GradientOp::new(1.0));
    let op = registry.get("op1").unwrap();
    let mut ctx = WorkerContext::standalone();
    let mut profiler = QueryProfiler::new();
    let wrapper = mgr.wrapper(ResultType::Raster);
    let result = wrapper
        .query(
            &op,
            "op1",
            &raster_query(0.0, 0.0, 8.0, 8.0, 8, 8),
            &mut profiler,
            &mut ctx,
        )
        .await;
    assert!(matches!(result, Err(CacheError::Miss)));
}

#[tokio::test]
async fn test_put_rejects_type_mismatch() {
    let mgr = standalone_manager(CachingStrategy::CacheAll);
    let mut ctx = WorkerContext::standalone();
    let wrapper = mgr.wrapper(ResultType::Raster);
    let result = wrapper
        .put(
            "op",
            &plot_artifact(10),
            &plot_query(),
            &ProfilingData::default(),
            &mut ctx,
        )
        .await;
    assert!(matches!(result, Err(CacheError::Argument(_))));
}

#[tokio::test]
async fn test_distinct_entry_ids_per_semantic_id() {
    let mgr = standalone_manager(CachingStrategy::CacheAll);
    let store = mgr.store(ResultType::Plot);
    let mut seen = std::collections::HashSet::new();
    for _ in 0..10 {
        let artifact = plot_artifact(10);
        let cube = artifact.cube().unwrap();
        let meta = store
            .put("op", artifact, cube, ProfilingData::default())
            .unwrap();
        assert!(seen.insert(meta.entry_id), "entry ids must be unique");
    }
    // Retrieval touches access stamps.
    let key = EntryKey::new("op", *seen.iter().next().unwrap());
    let entry = store.get(&key).unwrap();
    assert!(entry.access_count() >= 1);
}
