// Delivery of artifacts to peers and clients.
//
// A node keeps prepared deliveries in a short-lived pool (TTL-bounded,
// consumer-counted) and serves two commands on its delivery port: DELIVER
// hands out a cached entry by key to a peer node, PICKUP hands out a
// prepared delivery by id to a client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use moka::sync::Cache;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::entry_store::EntryKey;
use crate::error::{CacheError, CacheResult};
use crate::node_cache::NodeCacheManager;
use crate::wire::{
    self, ArtifactEnvelope, DeliveryRequest, ErrorResponse, MAGIC_DELIVERY, PickupRequest, cmd,
};

/// How long a prepared delivery stays available.
pub const DELIVERY_TTL: Duration = Duration::from_secs(30);

/// A prepared delivery: the encoded artifact envelope plus the number of
/// consumers still entitled to pick it up.
pub struct Delivery {
    pub id: u64,
    payload: Bytes,
    remaining: AtomicU32,
}

/// TTL-bounded pool of pending deliveries.
pub struct DeliveryPool {
    deliveries: Cache<u64, Arc<Delivery>>,
    next_id: AtomicU64,
}

impl Default for DeliveryPool {
    fn default() -> Self {
        Self::new(DELIVERY_TTL)
    }
}

impl DeliveryPool {
    pub fn new(ttl: Duration) -> Self {
        DeliveryPool {
            deliveries: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Stores an envelope for `consumers` pickups and returns the
    /// delivery id.
    pub fn insert(&self, envelope: &ArtifactEnvelope, consumers: u32) -> CacheResult<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let delivery = Arc::new(Delivery {
            id,
            payload: Bytes::from(wire::encode(envelope)?),
            remaining: AtomicU32::new(consumers.max(1)),
        });
        self.deliveries.insert(id, delivery);
        metrics::gauge!("delivery.pool.pending").set(self.deliveries.entry_count() as f64);
        Ok(id)
    }

    /// Raises the consumer count of a pending delivery. Returns false when
    /// the delivery is gone (consumed or expired).
    pub fn add_consumers(&self, id: u64, extra: u32) -> bool {
        match self.deliveries.get(&id) {
            Some(d) => {
                d.remaining.fetch_add(extra, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Takes one pickup of a delivery, dropping it once the last consumer
    /// is served.
    pub fn take(&self, id: u64) -> Option<Bytes> {
        let delivery = self.deliveries.get(&id)?;
        let before = delivery.remaining.fetch_sub(1, Ordering::Relaxed);
        if before <= 1 {
            self.deliveries.invalidate(&id);
        }
        Some(delivery.payload.clone())
    }

    pub fn pending(&self) -> u64 {
        self.deliveries.run_pending_tasks();
        self.deliveries.entry_count()
    }
}

/// Accepts delivery connections until cancelled. Every connection gets its
/// own handler task.
pub async fn serve(
    listener: TcpListener,
    mgr: Arc<NodeCacheManager>,
    pool: Arc<DeliveryPool>,
    cancel: CancellationToken,
) {
    let mut connection_id = 0u64;
    info!(addr = ?listener.local_addr().ok(), "delivery server listening");

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                info!("delivery server shutting down");
                return;
            }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                connection_id += 1;
                let id = connection_id;
                debug!(connection_id = id, ?addr, "accepted delivery connection");
                metrics::counter!("delivery.connections.accepted_total").increment(1);

                let mgr = Arc::clone(&mgr);
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, mgr, pool).await {
                        warn!(connection_id = id, error = %e, "delivery connection error");
                        metrics::counter!("delivery.errors_total").increment(1);
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "delivery accept error");
                metrics::counter!("delivery.errors.accept_total").increment(1);
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    mgr: Arc<NodeCacheManager>,
    pool: Arc<DeliveryPool>,
) -> CacheResult<()> {
    while let Some(frame) = wire::read_frame(&mut stream, MAGIC_DELIVERY).await? {
        match frame.cmd {
            cmd::DELIVER => {
                let request: DeliveryRequest = frame.decode()?;
                let key = EntryKey::new(request.semantic_id.clone(), request.entry_id);
                match mgr.store(request.result_type).get(&key) {
                    Ok(entry) => {
                        let envelope = ArtifactEnvelope::pack(&entry.data, entry.profile)?;
                        wire::write_frame(&mut stream, MAGIC_DELIVERY, cmd::RESP_OK, &envelope)
                            .await?;
                        metrics::counter!("delivery.deliver_total").increment(1);
                    }
                    Err(CacheError::NotFound(_)) => {
                        debug!(key = %key, "deliver request for unknown entry");
                        wire::write_frame_empty(&mut stream, MAGIC_DELIVERY, cmd::RESP_NOT_FOUND)
                            .await?;
                        metrics::counter!("delivery.not_found_total").increment(1);
                    }
                    Err(e) => {
                        let resp = ErrorResponse {
                            message: e.to_string(),
                        };
                        wire::write_frame(&mut stream, MAGIC_DELIVERY, cmd::RESP_ERROR, &resp)
                            .await?;
                    }
                }
            }
            cmd::PICKUP => {
                let request: PickupRequest = frame.decode()?;
                match pool.take(request.delivery_id) {
                    Some(payload) => {
                        wire::write_frame_raw(&mut stream, MAGIC_DELIVERY, cmd::RESP_OK, &payload)
                            .await?;
                        metrics::counter!("delivery.pickup_total").increment(1);
                    }
                    None => {
                        debug!(
                            delivery_id = request.delivery_id,
                            "pickup for expired or consumed delivery"
                        );
                        wire::write_frame_empty(&mut stream, MAGIC_DELIVERY, cmd::RESP_NOT_FOUND)
                            .await?;
                        metrics::counter!("delivery.pickup_missed_total").increment(1);
                    }
                }
            }
            other => {
                return Err(CacheError::ProtocolState(format!(
                    "unexpected delivery command {other:#04x}"
                )));
            }
        }
    }
    Ok(())
}
