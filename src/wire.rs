// Wire protocol.
//
// Every message travels as `u32 magic | u8 cmd | u32 payload_len | payload`
// with all integers little-endian. Payloads are serde structs in bincode's
// legacy encoding (fixed-width little-endian integers, u64-length-prefixed
// strings and vectors, u8 bools, u8-tagged options), so field order in the
// struct definitions below is the wire format; any change is a breaking
// protocol change.
//
// Three magic numbers distinguish the stream classes: control
// (index <-> node), worker (node worker / client -> index) and delivery
// (peer/client -> node). Receivers reject frames with the wrong magic.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::artifact::{Artifact, ResultType};
use crate::entry_store::{CacheHandshake, StoreStats};
use crate::error::{CacheError, CacheResult};
use crate::extent::QueryRectangle;
use crate::node_cache::QueryStats;
use crate::profiler::ProfilingData;

pub const MAGIC_CONTROL: u32 = u32::from_le_bytes(*b"TSC1");
pub const MAGIC_WORKER: u32 = u32::from_le_bytes(*b"TSW1");
pub const MAGIC_DELIVERY: u32 = u32::from_le_bytes(*b"TSD1");

/// Maximum payload size (64 MiB). Artifacts beyond this are not
/// deliverable.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Command bytes. Requests below 0x80, replies at or above.
pub mod cmd {
    pub const REGISTER: u8 = 1;
    pub const NEW_ENTRY: u8 = 2;
    pub const STATS: u8 = 3;
    pub const QUERY: u8 = 4;
    pub const GET: u8 = 5;
    pub const DELIVER: u8 = 6;
    pub const PICKUP: u8 = 7;
    pub const GET_STATS: u8 = 16;
    pub const REORG: u8 = 17;
    pub const COMPUTE: u8 = 18;
    pub const ADD_CONSUMERS: u8 = 19;
    pub const COMPUTE_DONE: u8 = 20;

    pub const RESP_OK: u8 = 0x80;
    pub const RESP_ERROR: u8 = 0x81;
    pub const RESP_HIT: u8 = 0x82;
    pub const RESP_MISS: u8 = 0x83;
    pub const RESP_PARTIAL: u8 = 0x84;
    pub const RESP_DELIVERY: u8 = 0x85;
    pub const RESP_NOT_FOUND: u8 = 0x86;
    pub const RESP_STATS: u8 = 0x87;
}

/// A decoded frame: the command byte and its raw payload.
#[derive(Debug)]
pub struct Frame {
    pub cmd: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn decode<T: DeserializeOwned>(&self) -> CacheResult<T> {
        decode(&self.payload)
    }
}

pub fn encode<T: Serialize>(msg: &T) -> CacheResult<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> CacheResult<T> {
    Ok(bincode::deserialize(payload)?)
}

pub async fn write_frame<W, T>(writer: &mut W, magic: u32, command: u8, msg: &T) -> CacheResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    write_frame_raw(writer, magic, command, &encode(msg)?).await
}

/// Writes a frame with an empty payload.
pub async fn write_frame_empty<W>(writer: &mut W, magic: u32, command: u8) -> CacheResult<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame_raw(writer, magic, command, &[]).await
}

pub async fn write_frame_raw<W>(
    writer: &mut W,
    magic: u32,
    command: u8,
    payload: &[u8],
) -> CacheResult<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_PAYLOAD {
        return Err(CacheError::Network(format!(
            "payload too large: {} bytes (max: {})",
            payload.len(),
            MAX_PAYLOAD
        )));
    }
    writer.write_u32_le(magic).await?;
    writer.write_u8(command).await?;
    writer.write_u32_le(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    metrics::counter!("wire.frames.sent_total").increment(1);
    metrics::histogram!("wire.frame_size_bytes").record(payload.len() as f64);
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` on a clean EOF at a frame boundary;
/// a magic mismatch or truncated frame is a `Network` error.
pub async fn read_frame<R>(reader: &mut R, expected_magic: u32) -> CacheResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let magic = match reader.read_u32_le().await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if magic != expected_magic {
        metrics::counter!("wire.errors.magic_mismatch_total").increment(1);
        return Err(CacheError::Network(format!(
            "magic mismatch: got {magic:#010x}, expected {expected_magic:#010x}"
        )));
    }
    let command = reader.read_u8().await?;
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_PAYLOAD {
        metrics::counter!("wire.errors.frame_too_large_total").increment(1);
        return Err(CacheError::Network(format!(
            "frame too large: {len} bytes (max: {MAX_PAYLOAD})"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    metrics::counter!("wire.frames.received_total").increment(1);
    Ok(Some(Frame {
        cmd: command,
        payload,
    }))
}

/// Reads one frame accepting any of the given magics, returning which one
/// arrived. Used by the index accept loop, where control and worker
/// streams share one listening port.
pub async fn read_frame_any<R>(
    reader: &mut R,
    accepted: &[u32],
) -> CacheResult<Option<(u32, Frame)>>
where
    R: AsyncRead + Unpin,
{
    let magic = match reader.read_u32_le().await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !accepted.contains(&magic) {
        metrics::counter!("wire.errors.magic_mismatch_total").increment(1);
        return Err(CacheError::Network(format!(
            "magic mismatch: got {magic:#010x}"
        )));
    }
    let command = reader.read_u8().await?;
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_PAYLOAD {
        return Err(CacheError::Network(format!(
            "frame too large: {len} bytes (max: {MAX_PAYLOAD})"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some((
        magic,
        Frame {
            cmd: command,
            payload,
        },
    )))
}

/// Reads a frame, treating EOF as a network error. For request/response
/// exchanges where the peer must answer.
pub async fn expect_frame<R>(reader: &mut R, expected_magic: u32) -> CacheResult<Frame>
where
    R: AsyncRead + Unpin,
{
    read_frame(reader, expected_magic)
        .await?
        .ok_or_else(|| CacheError::Network("connection closed mid-exchange".into()))
}

// ---------------------------------------------------------------------
// Messages. Field order is wire format.
// ---------------------------------------------------------------------

/// A cache lookup request: type, operator fingerprint and query rectangle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseRequest {
    pub result_type: ResultType,
    pub semantic_id: String,
    pub query: QueryRectangle,
}

/// Network-shareable locator of an entry. The semantic id travels in the
/// surrounding request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheRef {
    pub host: String,
    pub port: u16,
    pub entry_id: u64,
}

impl std::fmt::Display for CacheRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}#{}", self.host, self.port, self.entry_id)
    }
}

/// One puzzle input: the ref to fetch plus alternates to fall back to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PuzzlePart {
    pub primary: CacheRef,
    pub alternates: Vec<CacheRef>,
}

impl PuzzlePart {
    pub fn local(host: &str, port: u16, entry_id: u64) -> Self {
        PuzzlePart {
            primary: CacheRef {
                host: host.to_string(),
                port,
                entry_id,
            },
            alternates: Vec::new(),
        }
    }
}

/// Instructions to assemble a query result from cached parts plus
/// recomputed remainders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PuzzleRequest {
    pub result_type: ResultType,
    pub semantic_id: String,
    pub query: QueryRectangle,
    pub remainder: Vec<QueryRectangle>,
    pub parts: Vec<PuzzlePart>,
}

/// Node registration: the delivery port plus a per-type dump of current
/// entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHandshake {
    pub delivery_port: u16,
    pub caches: Vec<CacheHandshake>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub node_id: u32,
}

/// Access-stamp refresh for one entry, carried in NodeStats so the index
/// can recompute relevance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessUpdate {
    pub result_type: ResultType,
    pub semantic_id: String,
    pub entry_id: u64,
    pub last_access: u64,
    pub access_count: u64,
}

/// Per-node statistics delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub query_stats: QueryStats,
    pub stores: Vec<StoreStats>,
    pub access_info: Vec<AccessUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryResponse {
    pub host: String,
    pub port: u16,
    pub delivery_id: u64,
}

/// Peer-to-peer fetch of a cached entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub result_type: ResultType,
    pub semantic_id: String,
    pub entry_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PickupRequest {
    pub delivery_id: u64,
}

/// Raises the consumer count of a pending delivery; used by the index when
/// batched clients attach to an in-flight compute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AddConsumers {
    pub delivery_id: u64,
    pub extra: u32,
}

/// Index-scheduled computation of a query on a node. The node runs the
/// full cached-query flow and prepares a delivery for `consumers` clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeRequest {
    pub job_id: u64,
    pub request: BaseRequest,
    pub consumers: u32,
}

/// Completion notice for a scheduled computation. Jobs are correlated by
/// id so several may be in flight on one control connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeDone {
    pub job_id: u64,
    pub delivery_id: Option<u64>,
    pub error: Option<String>,
}

/// An artifact with its stored profile, checksummed for transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEnvelope {
    pub profile: ProfilingData,
    pub checksum: u32,
    pub body: Vec<u8>,
}

impl ArtifactEnvelope {
    pub fn pack(artifact: &Artifact, profile: ProfilingData) -> CacheResult<Self> {
        let body = encode(artifact)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        Ok(ArtifactEnvelope {
            profile,
            checksum: hasher.finalize(),
            body,
        })
    }

    pub fn unpack(&self) -> CacheResult<Artifact> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.body);
        if hasher.finalize() != self.checksum {
            return Err(CacheError::Network("artifact checksum mismatch".into()));
        }
        decode(&self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorgMove {
    pub result_type: ResultType,
    pub semantic_id: String,
    pub entry_id: u64,
    pub from_host: String,
    pub from_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorgRemove {
    pub result_type: ResultType,
    pub semantic_id: String,
    pub entry_id: u64,
}

/// Index-issued reorganization: entries to pull from peers and entries to
/// drop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReorgDescription {
    pub moves: Vec<ReorgMove>,
    pub removals: Vec<ReorgRemove>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}
