// Remote retrieval of cached entries from peer nodes.
//
// Opens a delivery connection to the owning node, sends DELIVER and
// deserializes the artifact envelope. A failed ref is retried against the
// alternates the index supplied; exhaustion surfaces as NotFound, which
// the puzzler upgrades to a full miss.

use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::artifact::{Artifact, ResultType};
use crate::error::{CacheError, CacheResult};
use crate::profiler::{ProfilingData, QueryProfiler};
use crate::wire::{
    self, ArtifactEnvelope, CacheRef, DeliveryRequest, ErrorResponse, MAGIC_DELIVERY, PuzzlePart,
    cmd,
};

/// IO cost attributed per transferred byte.
pub const IO_COST_PER_BYTE: f64 = 1.0 / 1024.0;

/// Fetch attempts per part: the primary ref plus up to two alternates.
pub const MAX_FETCH_ATTEMPTS: usize = 3;

/// Loads the entry behind a single ref.
pub async fn fetch_ref(
    result_type: ResultType,
    semantic_id: &str,
    cache_ref: &CacheRef,
    profiler: &mut QueryProfiler,
) -> CacheResult<(Artifact, ProfilingData)> {
    let mut stream = TcpStream::connect((cache_ref.host.as_str(), cache_ref.port)).await?;
    let request = DeliveryRequest {
        result_type,
        semantic_id: semantic_id.to_string(),
        entry_id: cache_ref.entry_id,
    };
    wire::write_frame(&mut stream, MAGIC_DELIVERY, cmd::DELIVER, &request).await?;
    let frame = wire::expect_frame(&mut stream, MAGIC_DELIVERY).await?;
    match frame.cmd {
        cmd::RESP_OK => {
            let envelope: ArtifactEnvelope = frame.decode()?;
            profiler.add_io(envelope.body.len() as f64 * IO_COST_PER_BYTE);
            metrics::counter!("cache.remote.fetches_total").increment(1);
            metrics::histogram!("cache.remote.fetch_bytes").record(envelope.body.len() as f64);
            let artifact = envelope.unpack()?;
            artifact.expect_type(result_type)?;
            Ok((artifact, envelope.profile))
        }
        cmd::RESP_NOT_FOUND => Err(CacheError::NotFound(format!(
            "{semantic_id} via {cache_ref}"
        ))),
        cmd::RESP_ERROR => {
            let err: ErrorResponse = frame.decode()?;
            Err(CacheError::Network(err.message))
        }
        other => Err(CacheError::ProtocolState(format!(
            "unexpected delivery reply {other:#04x}"
        ))),
    }
}

/// Loads one puzzle part, falling back to alternates when the primary ref
/// is stale or unreachable.
pub async fn load_part(
    result_type: ResultType,
    semantic_id: &str,
    part: &PuzzlePart,
    profiler: &mut QueryProfiler,
) -> CacheResult<(Artifact, ProfilingData)> {
    let mut last_err = None;
    for cache_ref in std::iter::once(&part.primary)
        .chain(part.alternates.iter())
        .take(MAX_FETCH_ATTEMPTS)
    {
        match fetch_ref(result_type, semantic_id, cache_ref, profiler).await {
            Ok(loaded) => {
                debug!(%cache_ref, semantic_id, "fetched puzzle part");
                return Ok(loaded);
            }
            Err(e @ (CacheError::NotFound(_) | CacheError::Network(_))) => {
                warn!(%cache_ref, error = %e, "puzzle part fetch failed, trying alternate");
                metrics::counter!("cache.remote.fetch_failures_total").increment(1);
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(CacheError::NotFound(format!(
        "part unavailable after {} attempts: {} ({})",
        MAX_FETCH_ATTEMPTS,
        part.primary,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}
