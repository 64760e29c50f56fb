// The node process.
//
// A node runs a fixed-size worker pool over a job channel, a delivery
// server for peers and clients, and one control connection to the index.
// The control loop answers index-initiated commands (GET_STATS, REORG,
// COMPUTE, ADD_CONSUMERS); workers keep their own index connections for
// QUERY and NEW_ENTRY. When the control connection drops, the node
// re-registers with exponential backoff capped at ten seconds.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::delivery::DeliveryPool;
use crate::entry_store::{EntryKey, MetaEntry};
use crate::error::CacheResult;
use crate::node_cache::{
    IndexConnection, NodeCacheManager, WorkerContext, register_node, run_cached,
};
use crate::operators::OperatorRegistry;
use crate::profiler::QueryProfiler;
use crate::retriever;
use crate::wire::{
    self, ArtifactEnvelope, BaseRequest, CacheRef, ComputeDone, ComputeRequest, MAGIC_CONTROL,
    ReorgDescription, cmd,
};

/// Jobs queued for the worker pool.
const JOB_QUEUE_SIZE: usize = 64;

/// Reconnect backoff cap.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// A computation dispatched by the index on behalf of clients.
struct ComputeJob {
    request: BaseRequest,
    consumers: u32,
    respond: oneshot::Sender<CacheResult<u64>>,
}

#[derive(Debug, Clone)]
pub struct NodeServerConfig {
    /// Host under which peers and clients reach this node's delivery port.
    pub advertised_host: String,
    /// Delivery port to bind; 0 picks an ephemeral port.
    pub delivery_port: u16,
    pub index_host: String,
    pub index_port: u16,
    pub workers: usize,
    /// Standalone nodes serve purely from the local store and never talk
    /// to an index.
    pub standalone: bool,
}

pub struct NodeServer {
    mgr: Arc<NodeCacheManager>,
    registry: Arc<OperatorRegistry>,
    pool: Arc<DeliveryPool>,
    config: NodeServerConfig,
}

impl NodeServer {
    pub fn new(
        mgr: Arc<NodeCacheManager>,
        registry: Arc<OperatorRegistry>,
        config: NodeServerConfig,
    ) -> Self {
        NodeServer {
            mgr,
            registry,
            pool: Arc::new(DeliveryPool::default()),
            config,
        }
    }

    pub fn manager(&self) -> Arc<NodeCacheManager> {
        Arc::clone(&self.mgr)
    }

    /// Binds the delivery listener, spawns workers and runs the control
    /// loop until cancelled. Returns the bound delivery port via the
    /// manager's self address.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.delivery_port))
            .await
            .with_context(|| format!("failed to bind delivery port {}", self.config.delivery_port))?;
        let delivery_port = listener.local_addr()?.port();
        self.mgr
            .set_self_addr(self.config.advertised_host.clone(), delivery_port);
        info!(
            host = %self.config.advertised_host,
            port = delivery_port,
            workers = self.config.workers,
            "node starting"
        );

        tokio::spawn(crate::delivery::serve(
            listener,
            Arc::clone(&self.mgr),
            Arc::clone(&self.pool),
            cancel.clone(),
        ));

        let (job_tx, job_rx) = flume::bounded::<ComputeJob>(JOB_QUEUE_SIZE);
        for worker_id in 0..self.config.workers.max(1) {
            tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&self.mgr),
                Arc::clone(&self.registry),
                Arc::clone(&self.pool),
                job_rx.clone(),
                self.config.clone(),
                cancel.clone(),
            ));
        }

        if self.config.standalone {
            info!("standalone node, not registering with an index");
            cancel.cancelled().await;
            return Ok(());
        }

        // Control loop with reconnect. Registration repeats after every
        // connection loss so a restarted index relearns our entries.
        let mut backoff = Duration::from_secs(1);
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.run_control_session(&job_tx, &cancel).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "control connection lost, reconnecting in {:?}", backoff);
                    metrics::counter!("node.control.reconnects_total").increment(1);
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// One control session: register, then serve index commands until the
    /// connection drops or the server is cancelled.
    async fn run_control_session(
        &self,
        job_tx: &flume::Sender<ComputeJob>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut stream =
            TcpStream::connect((self.config.index_host.as_str(), self.config.index_port))
                .await
                .context("failed to connect to index")?;

        let handshake = self.mgr.create_handshake()?;
        let node_id = register_node(&mut stream, &handshake).await?;
        self.mgr.set_node_id(node_id);
        info!(node_id, "registered with index");
        metrics::gauge!("node.control.connected").set(1.0);

        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::channel::<(u8, Vec<u8>)>(64);
        let writer = tokio::spawn(control_writer(write_half, out_rx));

        let result = self
            .control_read_loop(read_half, &out_tx, job_tx, cancel)
            .await;
        metrics::gauge!("node.control.connected").set(0.0);
        drop(out_tx);
        writer.abort();
        result
    }

    async fn control_read_loop(
        &self,
        mut reader: OwnedReadHalf,
        out_tx: &mpsc::Sender<(u8, Vec<u8>)>,
        job_tx: &flume::Sender<ComputeJob>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = wire::read_frame(&mut reader, MAGIC_CONTROL) => frame?,
            };
            let Some(frame) = frame else {
                anyhow::bail!("index closed the control connection");
            };
            match frame.cmd {
                cmd::GET_STATS => {
                    let stats = self.mgr.get_stats_delta();
                    out_tx
                        .send((cmd::RESP_STATS, wire::encode(&stats)?))
                        .await
                        .ok();
                    debug!("sent stats to index");
                }
                cmd::REORG => {
                    let desc: ReorgDescription = frame.decode()?;
                    self.apply_reorg(&desc, out_tx).await;
                    out_tx.send((cmd::RESP_OK, Vec::new())).await.ok();
                }
                cmd::ADD_CONSUMERS => {
                    let req: wire::AddConsumers = frame.decode()?;
                    self.pool.add_consumers(req.delivery_id, req.extra);
                    out_tx.send((cmd::RESP_OK, Vec::new())).await.ok();
                }
                cmd::COMPUTE => {
                    let req: ComputeRequest = frame.decode()?;
                    let (respond, done) = oneshot::channel();
                    let job = ComputeJob {
                        request: req.request,
                        consumers: req.consumers,
                        respond,
                    };
                    if job_tx.send_async(job).await.is_err() {
                        anyhow::bail!("worker pool gone");
                    }
                    let out_tx = out_tx.clone();
                    let job_id = req.job_id;
                    tokio::spawn(async move {
                        let outcome = match done.await {
                            Ok(Ok(delivery_id)) => ComputeDone {
                                job_id,
                                delivery_id: Some(delivery_id),
                                error: None,
                            },
                            Ok(Err(e)) => ComputeDone {
                                job_id,
                                delivery_id: None,
                                error: Some(e.to_string()),
                            },
                            Err(_) => ComputeDone {
                                job_id,
                                delivery_id: None,
                                error: Some("worker dropped the job".into()),
                            },
                        };
                        if let Ok(payload) = wire::encode(&outcome) {
                            out_tx.send((cmd::COMPUTE_DONE, payload)).await.ok();
                        }
                    });
                }
                other => {
                    anyhow::bail!("unexpected control command {other:#04x}");
                }
            }
        }
    }

    /// Applies a reorg description: pull moved entries from their source
    /// nodes (announcing each as a NEW_ENTRY), then drop removal victims.
    /// Removals happen locally before the RESP_OK that lets the index drop
    /// them from its view.
    async fn apply_reorg(&self, desc: &ReorgDescription, out_tx: &mpsc::Sender<(u8, Vec<u8>)>) {
        info!(
            moves = desc.moves.len(),
            removals = desc.removals.len(),
            "applying reorg"
        );
        for mv in &desc.moves {
            let cache_ref = CacheRef {
                host: mv.from_host.clone(),
                port: mv.from_port,
                entry_id: mv.entry_id,
            };
            let mut profiler = QueryProfiler::new();
            match retriever::fetch_ref(mv.result_type, &mv.semantic_id, &cache_ref, &mut profiler)
                .await
            {
                Ok((artifact, profile)) => {
                    let cube = match artifact.cube() {
                        Ok(c) => c,
                        Err(e) => {
                            warn!(error = %e, "moved artifact has no cube, skipping");
                            continue;
                        }
                    };
                    match self
                        .mgr
                        .store(mv.result_type)
                        .put(&mv.semantic_id, artifact, cube, profile)
                    {
                        Ok(meta) => {
                            metrics::counter!("node.reorg.moves_applied_total").increment(1);
                            let notify = MetaEntry {
                                node_id: self.mgr.node_id(),
                                result_type: mv.result_type,
                                semantic_id: mv.semantic_id.clone(),
                                entry: meta,
                            };
                            if let Ok(payload) = wire::encode(&notify) {
                                out_tx.send((cmd::NEW_ENTRY, payload)).await.ok();
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, semantic_id = %mv.semantic_id, "reorg move put failed");
                        }
                    }
                }
                Err(e) => {
                    // Best-effort: a stale move is skipped, not fatal.
                    warn!(error = %e, semantic_id = %mv.semantic_id, "reorg move fetch failed");
                    metrics::counter!("node.reorg.move_failures_total").increment(1);
                }
            }
        }
        for rm in &desc.removals {
            let key = EntryKey::new(rm.semantic_id.clone(), rm.entry_id);
            self.mgr.store(rm.result_type).remove(&key);
            metrics::counter!("node.reorg.removals_applied_total").increment(1);
        }
    }
}

async fn control_writer(
    mut writer: OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<(u8, Vec<u8>)>,
) {
    while let Some((command, payload)) = out_rx.recv().await {
        if let Err(e) = wire::write_frame_raw(&mut writer, MAGIC_CONTROL, command, &payload).await {
            error!(error = %e, "control write failed");
            return;
        }
    }
}

/// One worker: owns its context (index connection, puzzling flag) and
/// drains the job channel.
async fn run_worker(
    worker_id: usize,
    mgr: Arc<NodeCacheManager>,
    registry: Arc<OperatorRegistry>,
    pool: Arc<DeliveryPool>,
    jobs: flume::Receiver<ComputeJob>,
    config: NodeServerConfig,
    cancel: CancellationToken,
) {
    let mut ctx = WorkerContext::standalone();
    debug!(worker_id, "worker started");

    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(worker_id, "worker shutting down");
                return;
            }
            job = jobs.recv_async() => match job {
                Ok(job) => job,
                Err(_) => return,
            },
        };

        ensure_index_connection(&mut ctx, &mgr, &config).await;
        let result = execute_job(&mgr, &registry, &pool, &job, &mut ctx).await;
        if let Err(e) = &result {
            warn!(worker_id, error = %e, "compute job failed");
            metrics::counter!("node.jobs.failed_total").increment(1);
        } else {
            metrics::counter!("node.jobs.completed_total").increment(1);
        }
        let _ = job.respond.send(result);
    }
}

async fn ensure_index_connection(
    ctx: &mut WorkerContext,
    mgr: &NodeCacheManager,
    config: &NodeServerConfig,
) {
    if config.standalone {
        return;
    }
    if ctx.index.is_some() {
        // Re-registration after a control reconnect may have changed the
        // node id; keep the context in sync.
        ctx.node_id = mgr.node_id();
        return;
    }
    match IndexConnection::connect(&config.index_host, config.index_port).await {
        Ok(conn) => {
            *ctx = WorkerContext::with_index(conn, mgr.node_id());
        }
        Err(e) => {
            // The job still runs; the query degrades to local-only.
            warn!(error = %e, "worker could not reach index");
        }
    }
}

async fn execute_job(
    mgr: &NodeCacheManager,
    registry: &OperatorRegistry,
    pool: &DeliveryPool,
    job: &ComputeJob,
    ctx: &mut WorkerContext,
) -> CacheResult<u64> {
    let mut profiler = QueryProfiler::new();
    let artifact = run_cached(
        mgr,
        registry,
        job.request.result_type,
        &job.request.semantic_id,
        &job.request.query,
        &mut profiler,
        ctx,
    )
    .await?;
    let restricted = artifact.cut(&job.request.query)?;
    let envelope = ArtifactEnvelope::pack(&restricted, profiler.data)?;
    pool.insert(&envelope, job.consumers)
}
