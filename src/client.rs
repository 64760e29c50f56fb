// Client-side cache access.
//
// A client resolves a query through the index (GET), then picks the
// artifact up from the node that prepared the delivery. A stale delivery
// (expired or already consumed) is retried once through a fresh GET; by
// then the result is cached and cheap.

use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::artifact::{Artifact, ResultType};
use crate::error::{CacheError, CacheResult};
use crate::extent::QueryRectangle;
use crate::wire::{
    self, ArtifactEnvelope, BaseRequest, DeliveryResponse, ErrorResponse, MAGIC_DELIVERY,
    MAGIC_WORKER, PickupRequest, cmd,
};

pub struct CacheClient {
    index_host: String,
    index_port: u16,
}

impl CacheClient {
    pub fn new(index_host: impl Into<String>, index_port: u16) -> Self {
        CacheClient {
            index_host: index_host.into(),
            index_port,
        }
    }

    /// Resolves a query to an artifact through the cluster.
    pub async fn query(
        &self,
        result_type: ResultType,
        semantic_id: &str,
        query: &QueryRectangle,
    ) -> CacheResult<Artifact> {
        let request = BaseRequest {
            result_type,
            semantic_id: semantic_id.to_string(),
            query: query.clone(),
        };

        let mut last_err = None;
        for attempt in 0..2 {
            let delivery = self.get(&request).await?;
            match self.pickup(&delivery).await {
                Ok(envelope) => {
                    let artifact = envelope.unpack()?;
                    artifact.expect_type(result_type)?;
                    return Ok(artifact);
                }
                Err(e @ CacheError::NotFound(_)) => {
                    // Delivery raced its TTL or consumer count; a repeat
                    // GET resolves against the now-cached entry.
                    warn!(attempt, error = %e, "delivery pickup failed, retrying");
                    metrics::counter!("client.pickup_retries_total").increment(1);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| CacheError::NotFound("delivery".into())))
    }

    async fn get(&self, request: &BaseRequest) -> CacheResult<DeliveryResponse> {
        let mut stream =
            TcpStream::connect((self.index_host.as_str(), self.index_port)).await?;
        wire::write_frame(&mut stream, MAGIC_WORKER, cmd::GET, request).await?;
        let frame = wire::expect_frame(&mut stream, MAGIC_WORKER).await?;
        match frame.cmd {
            cmd::RESP_DELIVERY => {
                let response: DeliveryResponse = frame.decode()?;
                debug!(
                    host = %response.host,
                    port = response.port,
                    delivery_id = response.delivery_id,
                    "received delivery response"
                );
                Ok(response)
            }
            cmd::RESP_ERROR => {
                let err: ErrorResponse = frame.decode()?;
                if err.message.contains("cache miss") {
                    Err(CacheError::Miss)
                } else {
                    Err(CacheError::Network(err.message))
                }
            }
            other => Err(CacheError::ProtocolState(format!(
                "unexpected GET reply {other:#04x}"
            ))),
        }
    }

    async fn pickup(&self, delivery: &DeliveryResponse) -> CacheResult<ArtifactEnvelope> {
        let mut stream =
            TcpStream::connect((delivery.host.as_str(), delivery.port)).await?;
        let request = PickupRequest {
            delivery_id: delivery.delivery_id,
        };
        wire::write_frame(&mut stream, MAGIC_DELIVERY, cmd::PICKUP, &request).await?;
        let frame = wire::expect_frame(&mut stream, MAGIC_DELIVERY).await?;
        match frame.cmd {
            cmd::RESP_OK => frame.decode(),
            cmd::RESP_NOT_FOUND => Err(CacheError::NotFound(format!(
                "delivery {}",
                delivery.delivery_id
            ))),
            other => Err(CacheError::ProtocolState(format!(
                "unexpected pickup reply {other:#04x}"
            ))),
        }
    }
}
