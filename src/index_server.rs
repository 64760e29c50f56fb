// The index coordinator process.
//
// One listener serves two stream classes: control connections (a node
// registers and then answers GET_STATS/REORG/COMPUTE/ADD_CONSUMERS) and
// worker connections (node workers issue QUERY and NEW_ENTRY; clients
// issue GET). Identical in-flight GETs are batched so a thundering herd
// triggers exactly one recompute. A timer task drives the stats/reorg
// rounds.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifact::ResultType;
use crate::entry_store::MetaEntry;
use crate::error::{CacheError, CacheResult};
use crate::extent::{CrsId, QueryRectangle, QueryResolution, TimeType};
use crate::index_directory::{IndexDirectory, IndexVerdict};
use crate::node_cache::QueryStats;
use crate::reorg::{self, ReorgStrategy};
use crate::replacement::RelevanceFunction;
use crate::wire::{
    self, AddConsumers, BaseRequest, CacheRef, ComputeDone, ComputeRequest, DeliveryResponse,
    ErrorResponse, MAGIC_CONTROL, MAGIC_WORKER, NodeHandshake, NodeStats, RegisterResponse,
    ReorgDescription, cmd,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPolicy {
    /// Run the recompute on the node that would also supply most parts.
    Locality,
    RoundRobin,
}

impl SchedulerPolicy {
    pub fn by_name(name: &str) -> CacheResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "locality" => Ok(SchedulerPolicy::Locality),
            "roundrobin" | "round_robin" | "rr" => Ok(SchedulerPolicy::RoundRobin),
            other => Err(CacheError::Argument(format!("unknown scheduler: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexServerConfig {
    pub port: u16,
    pub scheduler: SchedulerPolicy,
    pub batching_enabled: bool,
    pub reorg_strategy: ReorgStrategy,
    pub relevance: RelevanceFunction,
    pub reorg_interval: Duration,
    /// Deadline for one scheduled computation, batching included.
    pub request_deadline: Duration,
}

impl Default for IndexServerConfig {
    fn default() -> Self {
        IndexServerConfig {
            port: 0,
            scheduler: SchedulerPolicy::Locality,
            batching_enabled: true,
            reorg_strategy: ReorgStrategy::Capacity,
            relevance: RelevanceFunction::Lru,
            reorg_interval: Duration::from_secs(60),
            request_deadline: Duration::from_secs(120),
        }
    }
}

/// Commands the index issues over a node's control connection.
enum ControlCommand {
    GetStats(oneshot::Sender<CacheResult<NodeStats>>),
    Reorg(ReorgDescription, oneshot::Sender<CacheResult<()>>),
    AddConsumers(AddConsumers, oneshot::Sender<CacheResult<()>>),
    Compute(BaseRequest, u32, oneshot::Sender<CacheResult<u64>>),
}

/// Handle to a registered node.
pub struct NodeHandle {
    pub node_id: u32,
    pub host: String,
    pub delivery_port: u16,
    commands: mpsc::Sender<ControlCommand>,
}

impl NodeHandle {
    async fn send(&self, command: ControlCommand) -> CacheResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CacheError::Network(format!("node {} control gone", self.node_id)))
    }

    pub async fn get_stats(&self) -> CacheResult<NodeStats> {
        let (tx, rx) = oneshot::channel();
        self.send(ControlCommand::GetStats(tx)).await?;
        rx.await
            .map_err(|_| CacheError::Network("stats reply dropped".into()))?
    }

    pub async fn reorg(&self, desc: ReorgDescription) -> CacheResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ControlCommand::Reorg(desc, tx)).await?;
        rx.await
            .map_err(|_| CacheError::Network("reorg reply dropped".into()))?
    }

    pub async fn add_consumers(&self, delivery_id: u64, extra: u32) -> CacheResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ControlCommand::AddConsumers(
            AddConsumers { delivery_id, extra },
            tx,
        ))
        .await?;
        rx.await
            .map_err(|_| CacheError::Network("add-consumers reply dropped".into()))?
    }

    pub async fn compute(&self, request: BaseRequest, consumers: u32) -> CacheResult<u64> {
        let (tx, rx) = oneshot::channel();
        self.send(ControlCommand::Compute(request, consumers, tx))
            .await?;
        rx.await
            .map_err(|_| CacheError::Network("compute reply dropped".into()))?
    }
}

/// Bit-exact batch key for identical concurrent queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BatchKey {
    result_type: ResultType,
    semantic_id: String,
    crs: CrsId,
    time_type: TimeType,
    bounds: [u64; 6],
    resolution: (u32, u32),
}

impl BatchKey {
    fn new(request: &BaseRequest) -> Self {
        let q: &QueryRectangle = &request.query;
        let resolution = match q.resolution {
            QueryResolution::Pixels { xres, yres } => (xres, yres),
            QueryResolution::None => (0, 0),
        };
        BatchKey {
            result_type: request.result_type,
            semantic_id: request.semantic_id.clone(),
            crs: q.crs,
            time_type: q.time_type,
            bounds: [
                q.x1.to_bits(),
                q.y1.to_bits(),
                q.x2.to_bits(),
                q.y2.to_bits(),
                q.t1.to_bits(),
                q.t2.to_bits(),
            ],
            resolution,
        }
    }
}

type GetOutcome = Result<DeliveryResponse, String>;
type Waiter = oneshot::Sender<GetOutcome>;

pub struct IndexState {
    pub directory: IndexDirectory,
    nodes: RwLock<HashMap<u32, Arc<NodeHandle>>>,
    next_node_id: AtomicU32,
    next_job_id: AtomicU64,
    batches: Mutex<HashMap<BatchKey, Vec<Waiter>>>,
    rr: AtomicUsize,
    cluster_stats: std::sync::Mutex<QueryStats>,
    config: IndexServerConfig,
}

impl IndexState {
    pub fn new(config: IndexServerConfig) -> Self {
        IndexState {
            directory: IndexDirectory::new(),
            nodes: RwLock::new(HashMap::new()),
            next_node_id: AtomicU32::new(1),
            next_job_id: AtomicU64::new(1),
            batches: Mutex::new(HashMap::new()),
            rr: AtomicUsize::new(0),
            cluster_stats: std::sync::Mutex::new(QueryStats::default()),
            config,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().expect("nodes lock").len()
    }

    pub fn cluster_query_stats(&self) -> QueryStats {
        *self.cluster_stats.lock().expect("stats lock")
    }

    fn node(&self, node_id: u32) -> Option<Arc<NodeHandle>> {
        self.nodes.read().expect("nodes lock").get(&node_id).cloned()
    }

    fn node_handles(&self) -> Vec<Arc<NodeHandle>> {
        self.nodes.read().expect("nodes lock").values().cloned().collect()
    }

    fn resolve(&self, node_id: u32) -> Option<(String, u16)> {
        self.node(node_id).map(|n| (n.host.clone(), n.delivery_port))
    }

    /// Cluster-wide lookup with refs resolved against the node table.
    fn lookup(&self, request: &BaseRequest) -> IndexVerdict {
        self.directory.query(
            request.result_type,
            &request.semantic_id,
            &request.query,
            |node_id| self.resolve(node_id),
        )
    }

    /// Picks the node to service a recompute.
    fn schedule(&self, verdict: &IndexVerdict) -> Option<Arc<NodeHandle>> {
        match verdict {
            IndexVerdict::Hit { node_id, .. } => self.node(*node_id),
            IndexVerdict::Partial { parts, .. }
                if self.config.scheduler == SchedulerPolicy::Locality =>
            {
                let mut count: HashMap<u32, usize> = HashMap::new();
                for (node_id, _) in parts {
                    *count.entry(*node_id).or_insert(0) += 1;
                }
                count
                    .into_iter()
                    .max_by_key(|(node_id, n)| (*n, u32::MAX - *node_id))
                    .and_then(|(node_id, _)| self.node(node_id))
                    .or_else(|| self.round_robin())
            }
            _ => self.round_robin(),
        }
    }

    fn round_robin(&self) -> Option<Arc<NodeHandle>> {
        let handles = self.node_handles();
        if handles.is_empty() {
            return None;
        }
        let i = self.rr.fetch_add(1, Ordering::Relaxed) % handles.len();
        Some(Arc::clone(&handles[i]))
    }

    /// Client GET: resolve, schedule, compute, answer with a delivery.
    /// Identical in-flight requests coalesce onto the leader's compute.
    async fn handle_get(&self, request: BaseRequest) -> GetOutcome {
        if !self.config.batching_enabled {
            return self.execute_get(&request).await;
        }

        let key = BatchKey::new(&request);
        let waiter_rx = {
            let mut batches = self.batches.lock().await;
            match batches.get_mut(&key) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    metrics::counter!("index.batching.attached_total").increment(1);
                    Some(rx)
                }
                None => {
                    batches.insert(key.clone(), Vec::new());
                    None
                }
            }
        };
        if let Some(rx) = waiter_rx {
            return match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err("batch leader vanished".into()),
            };
        }

        let outcome = self.execute_get(&request).await;

        // Close the batch: raise the delivery's consumer count before any
        // waiter (or the leader) learns the delivery id.
        let waiters = self.batches.lock().await.remove(&key).unwrap_or_default();
        if !waiters.is_empty() {
            if let Ok(response) = &outcome {
                let owner = self
                    .node_handles()
                    .into_iter()
                    .find(|n| n.host == response.host && n.delivery_port == response.port);
                if let Some(owner) = owner
                    && let Err(e) = owner
                        .add_consumers(response.delivery_id, waiters.len() as u32)
                        .await
                {
                    warn!(error = %e, "failed to raise delivery consumer count");
                }
            }
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
        outcome
    }

    async fn execute_get(&self, request: &BaseRequest) -> GetOutcome {
        let verdict = self.lookup(request);
        let node = self
            .schedule(&verdict)
            .ok_or_else(|| "no nodes registered".to_string())?;
        debug!(
            semantic_id = %request.semantic_id,
            node_id = node.node_id,
            "scheduling client query"
        );
        metrics::counter!("index.gets_total").increment(1);

        let compute = node.compute(request.clone(), 1);
        let delivery_id = tokio::time::timeout(self.config.request_deadline, compute)
            .await
            .map_err(|_| "compute deadline exceeded".to_string())?
            .map_err(|e| e.to_string())?;
        Ok(DeliveryResponse {
            host: node.host.clone(),
            port: node.delivery_port,
            delivery_id,
        })
    }
}

pub struct IndexServer {
    state: Arc<IndexState>,
}

impl IndexServer {
    pub fn new(config: IndexServerConfig) -> Self {
        IndexServer {
            state: Arc::new(IndexState::new(config)),
        }
    }

    pub fn state(&self) -> Arc<IndexState> {
        Arc::clone(&self.state)
    }

    /// Binds the listener and serves until cancelled. The bound port is
    /// logged; tests bind port 0 and read it from `local_addr`.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.state.config.port))
            .await
            .with_context(|| format!("failed to bind index port {}", self.state.config.port))?;
        self.run_on(listener, cancel).await
    }

    pub async fn run_on(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "index server listening");
        tokio::spawn(reorg_timer(Arc::clone(&self.state), cancel.clone()));

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("index server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!(?addr, "accepted index connection");
                    metrics::counter!("index.connections.accepted_total").increment(1);
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(state, stream).await {
                            warn!(?addr, error = %e, "index connection error");
                            metrics::counter!("index.connection_errors_total").increment(1);
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "index accept error");
                }
            }
        }
    }
}

/// Dispatches a fresh connection by its first frame: control streams open
/// with REGISTER, worker streams carry QUERY/NEW_ENTRY/GET.
async fn handle_connection(state: Arc<IndexState>, stream: TcpStream) -> CacheResult<()> {
    let peer = stream.peer_addr().map_err(CacheError::from)?;
    let (mut reader, writer) = stream.into_split();

    let Some((magic, first)) = wire::read_frame_any(&mut reader, &[MAGIC_CONTROL, MAGIC_WORKER])
        .await?
    else {
        return Ok(());
    };

    match (magic, first.cmd) {
        (MAGIC_CONTROL, cmd::REGISTER) => {
            let handshake: NodeHandshake = first.decode()?;
            control_session(state, reader, writer, peer.ip().to_string(), handshake).await
        }
        (MAGIC_WORKER, _) => worker_session(state, reader, writer, first).await,
        (_, other) => Err(CacheError::ProtocolState(format!(
            "unexpected opening command {other:#04x}"
        ))),
    }
}

/// Serialized replies the control session is waiting for, in request
/// order. The node answers control commands in order, so a FIFO is
/// enough; computes are correlated by job id instead.
enum PendingReply {
    Stats(oneshot::Sender<CacheResult<NodeStats>>),
    Ack(oneshot::Sender<CacheResult<()>>),
}

async fn control_session(
    state: Arc<IndexState>,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    host: String,
    handshake: NodeHandshake,
) -> CacheResult<()> {
    let node_id = state.next_node_id.fetch_add(1, Ordering::Relaxed);
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ControlCommand>(64);
    let handle = Arc::new(NodeHandle {
        node_id,
        host: host.clone(),
        delivery_port: handshake.delivery_port,
        commands: cmd_tx,
    });

    state.directory.seed(node_id, &handshake.caches);
    state
        .nodes
        .write()
        .expect("nodes lock")
        .insert(node_id, Arc::clone(&handle));
    metrics::gauge!("index.nodes.registered").set(state.node_count() as f64);
    info!(node_id, host, delivery_port = handshake.delivery_port, "node registered");

    wire::write_frame(
        &mut writer,
        MAGIC_CONTROL,
        cmd::RESP_OK,
        &RegisterResponse { node_id },
    )
    .await?;

    let mut pending: VecDeque<PendingReply> = VecDeque::new();
    let mut jobs: HashMap<u64, oneshot::Sender<CacheResult<u64>>> = HashMap::new();

    // Frames are read by a dedicated task: `read_frame` spans several
    // awaits and must not race command sends inside a select.
    let (frame_tx, mut frame_rx) = mpsc::channel::<CacheResult<wire::Frame>>(64);
    let reader_task = tokio::spawn(async move {
        loop {
            match wire::read_frame(&mut reader, MAGIC_CONTROL).await {
                Ok(Some(frame)) => {
                    if frame_tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    let _ = frame_tx.send(Err(e)).await;
                    return;
                }
            }
        }
    });

    let result = loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                let Some(command) = command else { break Ok(()) };
                if let Err(e) = send_control_command(
                    &state, &mut writer, command, &mut pending, &mut jobs,
                ).await {
                    break Err(e);
                }
            }
            frame = frame_rx.recv() => {
                match frame {
                    Some(Ok(frame)) => {
                        if let Err(e) = handle_control_frame(
                            &state, frame, &mut pending, &mut jobs,
                        ) {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                }
            }
        }
    };
    reader_task.abort();

    // Tear down: fail whatever is still in flight, forget the node.
    for reply in pending {
        match reply {
            PendingReply::Stats(tx) => {
                let _ = tx.send(Err(CacheError::Network("control connection lost".into())));
            }
            PendingReply::Ack(tx) => {
                let _ = tx.send(Err(CacheError::Network("control connection lost".into())));
            }
        }
    }
    for (_, tx) in jobs {
        let _ = tx.send(Err(CacheError::Network("control connection lost".into())));
    }
    state.nodes.write().expect("nodes lock").remove(&node_id);
    state.directory.drop_node(node_id);
    metrics::gauge!("index.nodes.registered").set(state.node_count() as f64);
    info!(node_id, "node unregistered");
    result
}

async fn send_control_command(
    state: &IndexState,
    writer: &mut OwnedWriteHalf,
    command: ControlCommand,
    pending: &mut VecDeque<PendingReply>,
    jobs: &mut HashMap<u64, oneshot::Sender<CacheResult<u64>>>,
) -> CacheResult<()> {
    match command {
        ControlCommand::GetStats(reply) => {
            wire::write_frame_empty(writer, MAGIC_CONTROL, cmd::GET_STATS).await?;
            pending.push_back(PendingReply::Stats(reply));
        }
        ControlCommand::Reorg(desc, reply) => {
            wire::write_frame(writer, MAGIC_CONTROL, cmd::REORG, &desc).await?;
            pending.push_back(PendingReply::Ack(reply));
        }
        ControlCommand::AddConsumers(req, reply) => {
            wire::write_frame(writer, MAGIC_CONTROL, cmd::ADD_CONSUMERS, &req).await?;
            pending.push_back(PendingReply::Ack(reply));
        }
        ControlCommand::Compute(request, consumers, reply) => {
            let job_id = state.next_job_id.fetch_add(1, Ordering::Relaxed);
            let msg = ComputeRequest {
                job_id,
                request,
                consumers,
            };
            wire::write_frame(writer, MAGIC_CONTROL, cmd::COMPUTE, &msg).await?;
            jobs.insert(job_id, reply);
        }
    }
    Ok(())
}

fn handle_control_frame(
    state: &IndexState,
    frame: wire::Frame,
    pending: &mut VecDeque<PendingReply>,
    jobs: &mut HashMap<u64, oneshot::Sender<CacheResult<u64>>>,
) -> CacheResult<()> {
    match frame.cmd {
        cmd::NEW_ENTRY => {
            let meta: MetaEntry = frame.decode()?;
            state.directory.add_entry(&meta);
        }
        cmd::STATS => {
            let stats: NodeStats = frame.decode()?;
            let mut cluster = state.cluster_stats.lock().expect("stats lock");
            *cluster += &stats.query_stats;
        }
        cmd::COMPUTE_DONE => {
            let done: ComputeDone = frame.decode()?;
            if let Some(reply) = jobs.remove(&done.job_id) {
                let result = match (done.delivery_id, done.error) {
                    (Some(id), _) => Ok(id),
                    (None, Some(message)) => Err(to_cache_error(message)),
                    (None, None) => Err(CacheError::ProtocolState(
                        "compute done without id or error".into(),
                    )),
                };
                let _ = reply.send(result);
            }
        }
        cmd::RESP_STATS => match pending.pop_front() {
            Some(PendingReply::Stats(reply)) => {
                let _ = reply.send(frame.decode());
            }
            _ => {
                return Err(CacheError::ProtocolState(
                    "unexpected stats reply".into(),
                ));
            }
        },
        cmd::RESP_OK => match pending.pop_front() {
            Some(PendingReply::Ack(reply)) => {
                let _ = reply.send(Ok(()));
            }
            _ => {
                return Err(CacheError::ProtocolState("unexpected ack".into()));
            }
        },
        cmd::RESP_ERROR => {
            let err: ErrorResponse = frame.decode()?;
            match pending.pop_front() {
                Some(PendingReply::Stats(reply)) => {
                    let _ = reply.send(Err(CacheError::Network(err.message)));
                }
                Some(PendingReply::Ack(reply)) => {
                    let _ = reply.send(Err(CacheError::Network(err.message)));
                }
                None => {
                    return Err(CacheError::ProtocolState(
                        "error reply with nothing pending".into(),
                    ));
                }
            }
        }
        other => {
            return Err(CacheError::ProtocolState(format!(
                "unexpected control frame {other:#04x}"
            )));
        }
    }
    Ok(())
}

/// A miss reported by a compute stays a miss for the client.
fn to_cache_error(message: String) -> CacheError {
    if message.contains("cache miss") {
        CacheError::Miss
    } else {
        CacheError::Network(message)
    }
}

async fn worker_session(
    state: Arc<IndexState>,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    first: wire::Frame,
) -> CacheResult<()> {
    let mut frame = Some(first);
    loop {
        let current = match frame.take() {
            Some(f) => f,
            None => match wire::read_frame(&mut reader, MAGIC_WORKER).await? {
                Some(f) => f,
                None => return Ok(()),
            },
        };
        match current.cmd {
            cmd::QUERY => {
                let request: BaseRequest = current.decode()?;
                metrics::counter!("index.queries_total").increment(1);
                match state.lookup(&request) {
                    IndexVerdict::Hit { node_id, entry_id } => {
                        let Some((host, port)) = state.resolve(node_id) else {
                            wire::write_frame_empty(&mut writer, MAGIC_WORKER, cmd::RESP_MISS)
                                .await?;
                            continue;
                        };
                        let r = CacheRef {
                            host,
                            port,
                            entry_id,
                        };
                        wire::write_frame(&mut writer, MAGIC_WORKER, cmd::RESP_HIT, &r).await?;
                    }
                    IndexVerdict::Miss => {
                        wire::write_frame_empty(&mut writer, MAGIC_WORKER, cmd::RESP_MISS).await?;
                    }
                    IndexVerdict::Partial { parts, remainder } => {
                        let pr = IndexDirectory::puzzle_request(
                            request.result_type,
                            &request.semantic_id,
                            &request.query,
                            parts,
                            remainder,
                        );
                        wire::write_frame(&mut writer, MAGIC_WORKER, cmd::RESP_PARTIAL, &pr)
                            .await?;
                    }
                }
            }
            cmd::NEW_ENTRY => {
                let meta: MetaEntry = current.decode()?;
                state.directory.add_entry(&meta);
            }
            cmd::GET => {
                let request: BaseRequest = current.decode()?;
                match state.handle_get(request).await {
                    Ok(response) => {
                        wire::write_frame(&mut writer, MAGIC_WORKER, cmd::RESP_DELIVERY, &response)
                            .await?;
                    }
                    Err(message) => {
                        wire::write_frame(
                            &mut writer,
                            MAGIC_WORKER,
                            cmd::RESP_ERROR,
                            &ErrorResponse { message },
                        )
                        .await?;
                    }
                }
            }
            other => {
                return Err(CacheError::ProtocolState(format!(
                    "unexpected worker command {other:#04x}"
                )));
            }
        }
    }
}

/// Periodic stats collection and reorganization.
async fn reorg_timer(state: Arc<IndexState>, cancel: CancellationToken) {
    let interval = state.config.reorg_interval;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        run_reorg_round(&state).await;
    }
}

/// One stats + reorg round. Public so tests can force a round without
/// waiting for the timer.
pub async fn run_reorg_round(state: &Arc<IndexState>) {
    let handles = state.node_handles();
    if handles.is_empty() {
        return;
    }

    let mut collected = Vec::new();
    for handle in &handles {
        match handle.get_stats().await {
            Ok(stats) => {
                state.directory.update_access(handle.node_id, &stats.access_info);
                {
                    let mut cluster = state.cluster_stats.lock().expect("stats lock");
                    *cluster += &stats.query_stats;
                }
                for store in &stats.stores {
                    debug!(
                        node_id = handle.node_id,
                        "type" = %store.result_type.map(|t| t.as_str()).unwrap_or("?"),
                        used = store.used_size,
                        max = store.max_size,
                        "node capacity"
                    );
                }
                collected.push((handle.node_id, stats.stores));
            }
            Err(e) => {
                warn!(node_id = handle.node_id, error = %e, "stats collection failed");
            }
        }
    }

    let usage = reorg::usage_from_stats(&collected);
    let plan = reorg::plan_reorg(
        state.config.reorg_strategy,
        state.config.relevance,
        &state.directory,
        &usage,
        |node_id| state.resolve(node_id),
    );
    if plan.is_empty() {
        return;
    }
    metrics::counter!("index.reorg.rounds_total").increment(1);

    // Phase 1: destinations pull their moves and announce the copies.
    for (dest, moves) in plan.moves {
        let Some(handle) = state.node(dest) else { continue };
        let desc = ReorgDescription {
            moves,
            removals: Vec::new(),
        };
        if let Err(e) = handle.reorg(desc).await {
            warn!(node_id = dest, error = %e, "reorg move phase failed");
        }
    }

    // Phase 2: removals, applied on the node before the directory forgets
    // the entry, so the index never advertises what the owner dropped.
    for (owner, removals) in plan.removals {
        let Some(handle) = state.node(owner) else { continue };
        let desc = ReorgDescription {
            moves: Vec::new(),
            removals: removals.clone(),
        };
        match handle.reorg(desc).await {
            Ok(()) => {
                for rm in removals {
                    state
                        .directory
                        .remove_entry(rm.result_type, &rm.semantic_id, owner, rm.entry_id);
                }
            }
            Err(e) => {
                warn!(node_id = owner, error = %e, "reorg removal phase failed");
            }
        }
    }
}
