//! Shared helpers for the integration tests: deterministic test
//! operators and in-process cluster setup on loopback sockets.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use tessera::artifact::{Artifact, Raster, ResultType};
use tessera::error::{CacheError, CacheResult};
use tessera::extent::{CrsId, QueryRectangle, QueryResolution, SpatioTemporalExtent};
use tessera::index_server::{IndexServer, IndexServerConfig, IndexState};
use tessera::node_cache::{CacheSizes, NodeCacheManager};
use tessera::node_server::{NodeServer, NodeServerConfig};
use tessera::operators::{Operator, OperatorRegistry};
use tessera::profiler::QueryProfiler;
use tessera::replacement::RelevanceFunction;
use tessera::strategy::CachingStrategy;

/// Value of a gradient pixel, tied to the integer world cell so that any
/// two computations of overlapping regions agree bit-exactly.
pub fn gradient_value(x: f64, y: f64) -> u8 {
    ((x.floor() as i64 + y.floor() as i64).rem_euclid(251)) as u8
}

/// Builds the gradient raster an operator would produce for a query.
pub fn gradient_raster(query: &QueryRectangle) -> Raster {
    let QueryResolution::Pixels { xres, yres } = query.resolution else {
        panic!("gradient raster needs pixel resolution");
    };
    let x_scale = (query.x2 - query.x1) / xres as f64;
    let y_scale = (query.y2 - query.y1) / yres as f64;
    let mut data = Vec::with_capacity((xres * yres) as usize);
    for row in 0..yres {
        let y = query.y2 - (row as f64 + 0.5) * y_scale;
        for col in 0..xres {
            let x = query.x1 + (col as f64 + 0.5) * x_scale;
            data.push(gradient_value(x, y));
        }
    }
    Raster::new(
        SpatioTemporalExtent::from(query),
        xres,
        yres,
        1,
        None,
        data,
    )
    .unwrap()
}

/// A raster operator producing the deterministic gradient, counting its
/// invocations.
pub struct GradientOp {
    pub computes: AtomicU32,
    pub cost: f64,
}

impl GradientOp {
    pub fn new(cost: f64) -> Arc<Self> {
        Arc::new(GradientOp {
            computes: AtomicU32::new(0),
            cost,
        })
    }

    pub fn compute_count(&self) -> u32 {
        self.computes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Operator for GradientOp {
    fn result_type(&self) -> ResultType {
        ResultType::Raster
    }

    fn depth(&self) -> u32 {
        2
    }

    async fn compute(
        &self,
        query: &QueryRectangle,
        profiler: &mut QueryProfiler,
    ) -> CacheResult<Artifact> {
        self.computes.fetch_add(1, Ordering::SeqCst);
        profiler.add_cpu(self.cost);
        Ok(Artifact::Raster(gradient_raster(query)))
    }
}

pub fn raster_query(x1: f64, y1: f64, x2: f64, y2: f64, xres: u32, yres: u32) -> QueryRectangle {
    QueryRectangle::new(
        CrsId::LatLon,
        x1,
        y1,
        x2,
        y2,
        0.0,
        1.0,
        QueryResolution::pixels(xres, yres),
    )
    .unwrap()
}

pub fn expect_raster(artifact: &Artifact) -> &Raster {
    match artifact {
        Artifact::Raster(r) => r,
        other => panic!("expected raster, got {:?}", other.result_type()),
    }
}

pub struct TestIndex {
    pub state: Arc<IndexState>,
    pub port: u16,
    pub cancel: CancellationToken,
}

/// Starts an index server on an ephemeral loopback port.
pub async fn start_index(mut config: IndexServerConfig) -> TestIndex {
    config.port = 0;
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = IndexServer::new(config);
    let state = server.state();
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = server.run_on(listener, run_cancel).await;
    });
    TestIndex {
        state,
        port,
        cancel,
    }
}

pub struct TestNode {
    pub mgr: Arc<NodeCacheManager>,
    pub registry: Arc<OperatorRegistry>,
    pub cancel: CancellationToken,
}

/// Starts a node with the given registry, waits until it is registered
/// with the index and its delivery listener is bound.
pub async fn start_node(
    index_port: u16,
    registry: Arc<OperatorRegistry>,
    strategy: CachingStrategy,
    sizes: CacheSizes,
) -> TestNode {
    let mgr = Arc::new(NodeCacheManager::new(
        strategy,
        RelevanceFunction::Lru,
        sizes,
    ));
    start_node_with_mgr(index_port, mgr, registry).await
}

/// Starts a node around an existing manager. Entries already in the
/// manager's stores reach the index through the registration handshake.
pub async fn start_node_with_mgr(
    index_port: u16,
    mgr: Arc<NodeCacheManager>,
    registry: Arc<OperatorRegistry>,
) -> TestNode {
    let server = NodeServer::new(
        Arc::clone(&mgr),
        Arc::clone(&registry),
        NodeServerConfig {
            advertised_host: "127.0.0.1".to_string(),
            delivery_port: 0,
            index_host: "127.0.0.1".to_string(),
            index_port,
            workers: 2,
            standalone: false,
        },
    );
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = server.run(run_cancel).await;
    });

    // Wait for delivery bind + index registration.
    for _ in 0..200 {
        if mgr.self_addr().is_some() && mgr.node_id() != 0 {
            return TestNode {
                mgr,
                registry,
                cancel,
            };
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("node failed to register with the index");
}

/// Computes and caches a query on a manager before its node starts, using
/// a standalone context. The entry reaches the index later through the
/// registration handshake.
pub async fn prime_standalone(
    mgr: &NodeCacheManager,
    registry: &OperatorRegistry,
    semantic_id: &str,
    query: &QueryRectangle,
) {
    use tessera::node_cache::{WorkerContext, run_cached};
    let mut ctx = WorkerContext::standalone();
    let mut profiler = QueryProfiler::new();
    must(
        run_cached(
            mgr,
            registry,
            ResultType::Raster,
            semantic_id,
            query,
            &mut profiler,
            &mut ctx,
        )
        .await,
        "prime",
    );
}

/// Polls until the index directory holds `count` entries.
pub async fn wait_for_entries(state: &Arc<IndexState>, count: usize) {
    for _ in 0..200 {
        if state.directory.entry_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "index never learned {count} entries (has {})",
        state.directory.entry_count()
    );
}

/// Maps recoverable setup errors into panics with context.
pub fn must<T>(result: CacheResult<T>, what: &str) -> T {
    match result {
        Ok(v) => v,
        Err(e @ CacheError::Miss) => panic!("{what}: unexpected miss: {e}"),
        Err(e) => panic!("{what}: {e}"),
    }
}
