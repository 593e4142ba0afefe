pub mod dutycycle;
pub mod fragment;
pub mod messages;
pub mod neighbors;
pub mod radio;
pub mod regions;
pub mod reliability;
pub mod routing;

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::codec::frame::{Frame, FragmentInfo, FrameKind};
use crate::codec::Codec;
use crate::config::NodeConfig;
use crate::crypto::keys::Keypair;
use crate::error::{CoreError, Result};
use crate::events::NodeEvent;
use crate::kernel::Kernel;
use crate::metrics::Metrics;
use crate::now_ms;
use crate::storage::ChainStore;
use self::dutycycle::{DutyCycleManager, Priority, QueuedMessage, Scheduler, TickOutcome};
use self::fragment::Reassembler;
use self::messages::{Envelope, MeshPayload};
use self::neighbors::{HelloBeacon, NeighborTable};
use self::radio::{LoraParams, RxMeta, TransmissionPort};
use self::reliability::{DeliveryLevel, ReliabilityTracker};
use self::routing::{
    compare_routes_for_utxo, CapabilityRequirement, NodeType, RequestCache, RouteEntry,
    RouteErrorMsg, RouteReply, RouteRequest, RoutingTable,
};

/// Link-level sender key for reassembly buffers. The shared radio
/// channel carries no link identity, so the 64-bit random message id
/// scopes the buffer; ports that do provide identity key by it.
const ANON_SENDER: &str = "";

/// How long sent fragments are kept for retransmission requests.
const SENT_CACHE_TTL_MS: u64 = 120_000;

/// The mesh service: receive pipeline (decode → reassemble → route →
/// dispatch), outbound pipeline (compress → fragment → reliable →
/// schedule), and the periodic tasks driving both.
pub struct MeshService {
    node_key: Arc<Keypair>,
    pub node_id: String,
    node_type: NodeType,
    config: NodeConfig,
    codec: Codec,
    pub scheduler: Scheduler,
    reassembler: Reassembler,
    pub reliability: ReliabilityTracker,
    pub routes: RoutingTable,
    pub neighbors: NeighborTable,
    request_cache: RequestCache,
    /// Dedup of already-handled envelopes (flood suppression).
    envelope_cache: RequestCache,
    kernel: Kernel,
    storage: ChainStore,
    metrics: Arc<Metrics>,
    port: Arc<dyn TransmissionPort>,
    pending_discoveries: Mutex<HashMap<u64, oneshot::Sender<RouteEntry>>>,
    /// Recently sent whole-frame bytes, for fragment retransmission.
    sent_cache: Mutex<HashMap<u64, (Vec<u8>, u64)>>,
    beacon_seq: AtomicU64,
    route_seq: AtomicU64,
}

impl MeshService {
    pub fn new(
        config: NodeConfig,
        node_key: Arc<Keypair>,
        node_type: NodeType,
        kernel: Kernel,
        storage: ChainStore,
        codec: Codec,
        port: Arc<dyn TransmissionPort>,
    ) -> Result<Arc<Self>> {
        let constraint = regions::rules_for(config.region, config.max_duty_cycle_percent);
        let duty = DutyCycleManager::new(
            constraint,
            config.tracking_window_hours * 60 * 60 * 1_000,
            config.emergency_override,
        );
        // Rebuild the compliance window from persisted records.
        let window_start = now_ms().saturating_sub(config.tracking_window_hours * 60 * 60 * 1_000);
        duty.seed(storage.transmissions_since(window_start)?);

        let scheduler = Scheduler::new(
            duty,
            LoraParams::from_config(&config),
            config.frequency_mhz,
            config.tx_power_dbm,
            config.max_pending_messages,
        );

        let node_id = node_key.address();
        info!("mesh service up as {} ({:?})", node_id, node_type);

        Ok(Arc::new(Self {
            node_id,
            node_type,
            codec,
            scheduler,
            reassembler: Reassembler::new(config.fragment_ttl_ms),
            reliability: ReliabilityTracker::new(&config),
            routes: RoutingTable::new(config.route_ttl_ms),
            neighbors: NeighborTable::new(config.neighbor_timeout_ms, config.max_neighbors),
            request_cache: RequestCache::new(config.route_discovery_timeout_ms * 6),
            envelope_cache: RequestCache::new(config.message_ttl_ms),
            kernel,
            storage,
            metrics: Metrics::new(),
            port,
            pending_discoveries: Mutex::new(HashMap::new()),
            sent_cache: Mutex::new(HashMap::new()),
            beacon_seq: AtomicU64::new(0),
            route_seq: AtomicU64::new(0),
            node_key,
            config,
        }))
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn events(&self) -> &crate::events::EventBus {
        &self.kernel.events
    }

    // -----------------------------------------------------------------
    // Outbound pipeline
    // -----------------------------------------------------------------

    /// Send a payload into the mesh: sign, compress, fragment to MTU,
    /// register ack bookkeeping, enqueue under duty-cycle scheduling.
    /// Returns the message id.
    pub fn send(
        &self,
        payload: MeshPayload,
        to: Option<String>,
        level: DeliveryLevel,
    ) -> Result<u64> {
        let priority = payload.priority();
        self.send_with_priority(payload, to, level, priority)
    }

    /// Same as [`MeshService::send`] with an explicit priority override
    /// (emergency escalation).
    pub fn send_with_priority(
        &self,
        payload: MeshPayload,
        to: Option<String>,
        level: DeliveryLevel,
        priority: Priority,
    ) -> Result<u64> {
        let now = now_ms();
        let requires_ack = level != DeliveryLevel::BestEffort;
        let envelope = Envelope::new(payload, to.clone(), requires_ack, &self.node_key, now);
        let kind = envelope.payload.frame_kind();

        let message_id = rand::random::<u64>();
        let frame_bytes = self.encode_envelope(&envelope, kind, message_id)?;

        self.reliability.track(
            message_id,
            frame_bytes.clone(),
            kind,
            priority,
            level,
            to,
            now,
        );
        self.enqueue_frame_bytes(&frame_bytes, kind, priority, message_id, now);
        Ok(message_id)
    }

    /// Envelope → compressed frame bytes, with the message id stamped in
    /// the fragment header (total = 1 when nothing was split).
    fn encode_envelope(&self, envelope: &Envelope, kind: FrameKind, message_id: u64) -> Result<Vec<u8>> {
        let payload = envelope.encode()?;
        let mut frame = self.codec.encode(kind, &payload)?;
        frame.fragment = Some(FragmentInfo {
            index: 0,
            total: 1,
            message_id,
        });
        frame.signature = None;
        Ok(frame.encode())
    }

    /// Enqueue frame bytes, splitting into MTU fragments when needed.
    fn enqueue_frame_bytes(
        &self,
        frame_bytes: &[u8],
        kind: FrameKind,
        priority: Priority,
        message_id: u64,
        now: u64,
    ) {
        let mtu = self.config.radio_mtu_bytes;
        let parts: Vec<Vec<u8>> = if frame_bytes.len() <= mtu {
            vec![frame_bytes.to_vec()]
        } else {
            // Cache the whole frame so missing fragments can be re-cut.
            self.sent_cache
                .lock()
                .insert(message_id, (frame_bytes.to_vec(), now));
            fragment::split(frame_bytes, mtu, message_id)
                .into_iter()
                .map(|f| f.encode())
                .collect()
        };

        for part in parts {
            let evicted = self.scheduler.enqueue(QueuedMessage {
                message_id,
                kind,
                priority,
                frame_bytes: part,
                enqueued_at: now,
                ttl_ms: self.config.message_ttl_ms,
            });
            for dropped in evicted {
                Metrics::incr(&self.metrics.messages_dropped);
                self.events().publish(NodeEvent::MessageDropped {
                    message_id: dropped.message_id.to_string(),
                    reason: "queue overflow".into(),
                });
            }
        }
    }

    /// Cancel a queued message: removed from the queue if not admitted;
    /// if already on the air, only its ack bookkeeping is dropped.
    pub fn cancel(&self, message_id: u64) {
        self.scheduler.cancel(message_id);
        self.reliability.cancel(message_id);
    }

    pub fn broadcast_transaction(&self, transaction: crate::tx::Transaction) -> Result<u64> {
        self.send(
            MeshPayload::Transaction { transaction },
            None,
            DeliveryLevel::BestEffort,
        )
    }

    pub fn broadcast_block(&self, block: crate::blockchain::block::Block) -> Result<u64> {
        self.send(MeshPayload::Block { block }, None, DeliveryLevel::BestEffort)
    }

    pub fn send_beacon(&self) -> Result<u64> {
        let beacon = HelloBeacon {
            node_id: self.node_id.clone(),
            public_key: self.node_key.public_key_hex(),
            node_type: self.node_type,
            blockchain_height: self.kernel.chain_height(),
            utxo_completeness: match self.node_type {
                NodeType::Light => 0.0,
                _ => 1.0,
            },
            sequence: self.beacon_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.send(MeshPayload::Hello(beacon), None, DeliveryLevel::BestEffort)
    }

    // -----------------------------------------------------------------
    // Route discovery
    // -----------------------------------------------------------------

    /// Resolve a route to `destination`, flooding a discovery when none
    /// is installed. Times out with `NoRoute`.
    pub async fn discover_route(
        &self,
        destination: &str,
        requirements: CapabilityRequirement,
    ) -> Result<RouteEntry> {
        if let Some(route) = self.routes.lookup(destination, now_ms()) {
            return Ok(route);
        }

        let request_id = rand::random::<u64>();
        let (tx, rx) = oneshot::channel();
        self.pending_discoveries.lock().insert(request_id, tx);

        let request =
            RouteRequest::originate(destination, request_id, requirements, &self.node_key);
        // Mark our own sighting so the flood cannot echo back.
        self.request_cache.first_sighting(request_id, now_ms());
        self.send(
            MeshPayload::RouteRequest(request),
            None,
            DeliveryLevel::BestEffort,
        )?;

        let timeout = std::time::Duration::from_millis(self.config.route_discovery_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(route)) => Ok(route),
            _ => {
                self.pending_discoveries.lock().remove(&request_id);
                Err(CoreError::NoRoute(destination.to_string()))
            }
        }
    }

    /// Best installed route for UTXO traffic (prefers full nodes at
    /// greater height).
    pub fn best_utxo_route(&self, candidates: &[RouteEntry]) -> Option<RouteEntry> {
        candidates
            .iter()
            .min_by(|a, b| compare_routes_for_utxo(a, b))
            .cloned()
    }

    // -----------------------------------------------------------------
    // Receive pipeline
    // -----------------------------------------------------------------

    /// Drain the radio port. Called at the receive cadence.
    pub fn poll_radio(&self) -> Result<()> {
        while let Some((bytes, meta)) = self.port.receive() {
            Metrics::incr(&self.metrics.messages_received);
            if let Err(e) = self.handle_frame_bytes(&bytes, meta) {
                Metrics::incr(&self.metrics.frames_rejected);
                debug!("dropped frame: {}", e);
            }
        }
        Ok(())
    }

    fn handle_frame_bytes(&self, bytes: &[u8], meta: RxMeta) -> Result<()> {
        let frame = Frame::decode(bytes)?;

        let info = frame
            .fragment
            .ok_or_else(|| CoreError::Protocol("data frame without message id".into()))?;

        let whole = if info.total > 1 {
            match self.reassembler.accept(ANON_SENDER, &frame, now_ms())? {
                Some(whole) => whole,
                None => return Ok(()), // waiting for more fragments
            }
        } else {
            return self.handle_whole_frame(&frame, info.message_id, meta);
        };

        // Reassembled bytes are the original unfragmented frame.
        let inner = Frame::decode(&whole)?;
        let inner_info = inner
            .fragment
            .ok_or_else(|| CoreError::Protocol("reassembled frame without message id".into()))?;
        self.handle_whole_frame(&inner, inner_info.message_id, meta)
    }

    fn handle_whole_frame(&self, frame: &Frame, message_id: u64, meta: RxMeta) -> Result<()> {
        let payload = self.codec.decode(frame)?;
        let envelope = Envelope::decode(&payload)?;

        if !envelope.verify() {
            return Err(CoreError::Protocol(format!(
                "envelope signature from {} invalid",
                envelope.from
            )));
        }
        if envelope.from == self.node_id {
            return Ok(()); // own broadcast echoed back
        }

        // Flood suppression: one handling per envelope.
        let digest = envelope_digest(&envelope);
        if !self.envelope_cache.first_sighting(digest, now_ms()) {
            return Ok(());
        }

        // Not for us: forward along the installed route.
        if let Some(to) = &envelope.to {
            if to != &self.node_id {
                return self.forward(frame, &envelope, to, message_id);
            }
        }

        if envelope.requires_ack {
            let _ = self.send(
                MeshPayload::Ack { message_id },
                Some(envelope.from.clone()),
                DeliveryLevel::BestEffort,
            );
        }

        self.dispatch(envelope, meta)
    }

    fn forward(&self, frame: &Frame, envelope: &Envelope, to: &str, message_id: u64) -> Result<()> {
        match self.routes.lookup(to, now_ms()) {
            Some(_route) => {
                // Shared-channel forwarding: retransmit the frame; the
                // dedup cache stops it from circulating.
                let kind = envelope.payload.frame_kind();
                let priority = envelope.payload.priority();
                self.enqueue_frame_bytes(&frame.encode(), kind, priority, message_id, now_ms());
                Ok(())
            }
            None => {
                let error = RouteErrorMsg {
                    destination: to.to_string(),
                    failed_next_hop: self.node_id.clone(),
                    reporter: self.node_id.clone(),
                };
                let _ = self.send(
                    MeshPayload::RouteError(error),
                    Some(envelope.from.clone()),
                    DeliveryLevel::BestEffort,
                );
                Err(CoreError::NoRoute(to.to_string()))
            }
        }
    }

    fn dispatch(&self, envelope: Envelope, meta: RxMeta) -> Result<()> {
        let from = envelope.from.clone();
        match envelope.payload {
            MeshPayload::Transaction { transaction } => {
                let id = transaction.id.clone();
                match self.kernel.submit_transaction(transaction) {
                    Ok(()) => debug!("accepted mesh tx {}", id),
                    Err(CoreError::Validation(ref m)) if m.contains("duplicate") => {}
                    Err(e) => {
                        self.events().publish(NodeEvent::TransactionRejected {
                            id,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            MeshPayload::Block { block } => {
                let height = block.index();
                let tip_before = self.kernel.chain_height();
                match self.kernel.accept_block(block.clone()) {
                    // Relay only blocks that advanced the tail —
                    // re-accepted duplicates must not echo forever.
                    Ok(()) if self.kernel.chain_height() > tip_before => {
                        let _ = self.broadcast_block(block);
                    }
                    Ok(()) => {}
                    Err(e) => debug!("rejected mesh block at {}: {}", height, e),
                }
            }
            MeshPayload::BlockRequest { height } => {
                if let Ok(Some(block)) = self.kernel.query_block_by_index(height) {
                    let _ = self.send(
                        MeshPayload::Block { block },
                        Some(from),
                        DeliveryLevel::BestEffort,
                    );
                }
            }
            MeshPayload::ProofRequest { tx_id } => {
                if let Ok(Some((block_hash, proof))) = self.kernel.query_merkle_proof(&tx_id) {
                    let merkle_root = self
                        .kernel
                        .query_block_by_hash(&block_hash)
                        .ok()
                        .flatten()
                        .map(|b| b.merkle_root().to_string())
                        .unwrap_or_default();
                    let _ = self.send(
                        MeshPayload::MerkleProof {
                            tx_id,
                            block_hash,
                            merkle_root,
                            proof,
                        },
                        Some(from),
                        DeliveryLevel::Confirmed,
                    );
                }
            }
            MeshPayload::MerkleProof {
                tx_id,
                merkle_root,
                proof,
                ..
            } => {
                let valid =
                    crate::blockchain::block::Block::verify_merkle_proof(&tx_id, &proof, &merkle_root);
                debug!("merkle proof for {}: {}", tx_id, valid);
            }
            MeshPayload::RouteRequest(request) => self.handle_route_request(request)?,
            MeshPayload::RouteReply(reply) => self.handle_route_reply(reply, meta)?,
            MeshPayload::RouteError(error) => {
                let lost = self.routes.invalidate_via(&error.failed_next_hop);
                self.routes.remove(&error.destination);
                for destination in lost.into_iter().chain([error.destination.clone()]) {
                    self.events().publish(NodeEvent::RouteLost { destination });
                }
            }
            MeshPayload::Hello(beacon) => {
                if beacon.node_id != from {
                    return Err(CoreError::Protocol("hello node id mismatch".into()));
                }
                let quality = meta.link_quality();
                self.neighbors.observe_hello(&beacon, quality, now_ms());
                // A neighbor is a 1-hop route.
                self.routes.upsert(RouteEntry {
                    destination: beacon.node_id.clone(),
                    next_hop: beacon.node_id.clone(),
                    hop_count: 1,
                    sequence_number: beacon.sequence,
                    link_quality: quality,
                    node_type: beacon.node_type,
                    utxo_completeness: beacon.utxo_completeness,
                    blockchain_height: beacon.blockchain_height,
                    last_refresh: now_ms(),
                    signature: String::new(),
                });
            }
            MeshPayload::Ack { message_id: acked } => {
                if self.reliability.handle_ack(acked) {
                    self.scheduler.cancel(acked);
                    self.events().publish(NodeEvent::DeliveryConfirmed {
                        message_id: acked.to_string(),
                    });
                }
            }
            MeshPayload::FragmentRequest {
                message_id: wanted,
                indices,
            } => {
                let cached = self.sent_cache.lock().get(&wanted).map(|(b, _)| b.clone());
                if let Some(bytes) = cached {
                    let fragments = fragment::split(&bytes, self.config.radio_mtu_bytes, wanted);
                    for index in indices {
                        if let Some(frag) = fragments.get(index as usize) {
                            self.enqueue_frame_bytes(
                                &frag.encode(),
                                FrameKind::Fragment,
                                Priority::Normal,
                                wanted,
                                now_ms(),
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_route_request(&self, mut request: RouteRequest) -> Result<()> {
        routing::should_forward(
            &request,
            &self.node_id,
            &self.request_cache,
            self.config.max_route_hops,
            now_ms(),
        )?;

        // Install the reverse route toward the originator for free.
        if let Some(previous_hop) = request.path.last() {
            self.routes.upsert(RouteEntry {
                destination: request.originator.clone(),
                next_hop: previous_hop.clone(),
                hop_count: request.hop_count + 1,
                sequence_number: request.request_id,
                link_quality: 0.5,
                node_type: NodeType::Light,
                utxo_completeness: 0.0,
                blockchain_height: 0,
                last_refresh: now_ms(),
                signature: String::new(),
            });
        }

        let completeness = match self.node_type {
            NodeType::Light => 0.0,
            _ => 1.0,
        };
        let i_am_destination = request.destination == self.node_id;
        let i_qualify = request.requirements.satisfied_by(
            self.node_type,
            completeness,
            self.kernel.chain_height(),
        );

        if i_am_destination || i_qualify {
            let reply = RouteReply::answer(
                &request,
                self.node_type,
                completeness,
                self.kernel.chain_height(),
                self.route_seq.fetch_add(1, Ordering::Relaxed),
                now_ms(),
                &self.node_key,
            );
            // Unicast back along the reverse path.
            let previous = request.path.last().cloned();
            let _ = self.send(
                MeshPayload::RouteReply(reply),
                previous,
                DeliveryLevel::BestEffort,
            );
            if i_am_destination {
                return Ok(());
            }
        }

        request.append_hop(&self.node_key);
        self.send(
            MeshPayload::RouteRequest(request),
            None,
            DeliveryLevel::BestEffort,
        )?;
        Ok(())
    }

    fn handle_route_reply(&self, reply: RouteReply, meta: RxMeta) -> Result<()> {
        if !reply.verify() {
            return Err(CoreError::Protocol("route reply signature invalid".into()));
        }

        let my_index = match reply.path.iter().position(|hop| hop == &self.node_id) {
            Some(i) => i,
            None if reply.originator == self.node_id => 0,
            None => return Err(CoreError::Protocol("not on reply path".into())),
        };

        // Route to the responder: next hop is the next node toward it.
        let next_hop = reply
            .path
            .get(my_index + 1)
            .cloned()
            .unwrap_or_else(|| reply.responder.clone());
        let entry = RouteEntry {
            destination: reply.responder.clone(),
            next_hop: next_hop.clone(),
            hop_count: (reply.path.len() - 1 - my_index) as u8,
            sequence_number: reply.sequence_number,
            link_quality: meta.link_quality(),
            node_type: reply.node_type,
            utxo_completeness: reply.utxo_completeness,
            blockchain_height: reply.blockchain_height,
            last_refresh: now_ms(),
            signature: reply.signature.clone(),
        };
        self.routes.upsert(entry.clone());
        self.events().publish(NodeEvent::RouteDiscovered {
            destination: entry.destination.clone(),
            next_hop,
            hop_count: entry.hop_count,
        });

        if reply.originator == self.node_id {
            if let Some(waiter) = self.pending_discoveries.lock().remove(&reply.request_id) {
                let _ = waiter.send(entry);
            }
            return Ok(());
        }

        // Keep walking the reverse path.
        let previous = reply.path.get(my_index.wrapping_sub(1)).cloned();
        self.send(
            MeshPayload::RouteReply(reply),
            previous,
            DeliveryLevel::BestEffort,
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Periodic work
    // -----------------------------------------------------------------

    /// One scheduler cadence step: admit and transmit at most one frame.
    pub fn scheduler_tick(&self) {
        let now = now_ms();
        match self.scheduler.tick(self.port.as_ref(), now) {
            TickOutcome::Transmitted { record, .. } => {
                Metrics::incr(&self.metrics.messages_sent);
                Metrics::add(&self.metrics.airtime_ms_total, record.duration_ms);
                if let Err(e) = self.storage.record_transmission(&record) {
                    warn!("failed to persist transmission record: {}", e);
                }
            }
            TickOutcome::Deferred { wait_ms } => {
                Metrics::incr(&self.metrics.duty_cycle_denials);
                debug!("duty cycle deferral: {} ms", wait_ms);
            }
            TickOutcome::Dropped(dropped) => {
                for message in dropped {
                    Metrics::incr(&self.metrics.messages_dropped);
                    self.events().publish(NodeEvent::MessageDropped {
                        message_id: message.message_id.to_string(),
                        reason: "ttl expired".into(),
                    });
                }
            }
            TickOutcome::Idle => {}
        }
    }

    /// Slow housekeeping: retries, neighbor/route/reassembly expiry,
    /// transmission-record aging.
    pub fn maintenance_tick(&self) {
        let now = now_ms();

        // Reliable-delivery sweep: re-enqueue due retries, dead-letter
        // the exhausted.
        let sweep = self.reliability.sweep(now);
        for retry in sweep.retries {
            Metrics::incr(&self.metrics.retries);
            self.enqueue_frame_bytes(
                &retry.frame_bytes,
                retry.kind,
                retry.priority,
                retry.message_id,
                now,
            );
        }
        for failed in sweep.failed {
            Metrics::incr(&self.metrics.dead_letters);
            self.events().publish(NodeEvent::DeliveryFailed {
                message_id: failed.to_string(),
            });
        }

        // Neighbor timeouts invalidate routes through the dead hop.
        for gone in self.neighbors.evict_stale(now) {
            self.events()
                .publish(NodeEvent::NeighborEvicted { node_id: gone.clone() });
            self.routes.remove(&gone);
            for destination in self.routes.invalidate_via(&gone) {
                self.events().publish(NodeEvent::RouteLost { destination });
            }
        }

        self.routes.purge_expired(now);

        // Request retransmission of whatever is still missing, then
        // drop expired buffers.
        self.reassembler.purge_expired(now);

        self.sent_cache
            .lock()
            .retain(|_, (_, sent_at)| now.saturating_sub(*sent_at) <= SENT_CACHE_TTL_MS);

        let retention = self.config.tracking_window_hours * 60 * 60 * 1_000;
        if let Err(e) = self.storage.prune_transmissions(now.saturating_sub(retention)) {
            warn!("failed to prune transmission history: {}", e);
        }
    }

    /// Run the cooperative tasks until shutdown: scheduler cadence,
    /// radio polling, beaconing, and maintenance.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let scheduler_period =
            std::time::Duration::from_millis(self.config.scheduler_tick_ms.max(10));
        let beacon_period = std::time::Duration::from_millis(self.config.beacon_interval_ms);

        let mut scheduler_tick = tokio::time::interval(scheduler_period);
        let mut receive_tick = tokio::time::interval(std::time::Duration::from_millis(20));
        let mut beacon_tick = tokio::time::interval(beacon_period);
        let mut maintenance_tick = tokio::time::interval(std::time::Duration::from_millis(1_000));

        loop {
            tokio::select! {
                _ = scheduler_tick.tick() => self.scheduler_tick(),
                _ = receive_tick.tick() => {
                    let _ = self.poll_radio();
                }
                _ = beacon_tick.tick() => {
                    if let Err(e) = self.send_beacon() {
                        warn!("beacon failed: {}", e);
                    }
                }
                _ = maintenance_tick.tick() => self.maintenance_tick(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mesh service shutting down");
                        return;
                    }
                }
            }
        }
    }
}

/// 64-bit digest of an envelope's signature, the flood-suppression key.
fn envelope_digest(envelope: &Envelope) -> u64 {
    let digest = crate::crypto::hash::blake(envelope.signature.as_bytes());
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::genesis::testutil::test_genesis;
    use crate::codec::dictionary::DictionaryRegistry;
    use crate::events::EventBus;
    use crate::kernel::Inner;
    use crate::mesh::radio::ChannelHub;
    use crate::tx::builder;

    struct TestNode {
        mesh: Arc<MeshService>,
        kernel: Kernel,
        key: Arc<Keypair>,
        _dir: tempfile::TempDir,
    }

    fn node(hub: &Arc<ChannelHub>, genesis: crate::blockchain::genesis::GenesisConfig) -> TestNode {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChainStore::open(dir.path()).unwrap();
        let kernel = Inner::open(
            genesis,
            storage.clone(),
            EventBus::default(),
            Metrics::new(),
        )
        .unwrap();
        let config = NodeConfig {
            // Generous budget so tests are not duty-cycle bound.
            region: crate::config::Region::Au,
            scheduler_tick_ms: 10,
            ..Default::default()
        };
        let key = Arc::new(Keypair::generate());
        let codec = Codec::new(&config, DictionaryRegistry::new()).unwrap();
        let mesh = MeshService::new(
            config,
            key.clone(),
            NodeType::Full,
            kernel.clone(),
            storage,
            codec,
            Arc::new(hub.endpoint()),
        )
        .unwrap();
        TestNode {
            mesh,
            kernel,
            key,
            _dir: dir,
        }
    }

    /// Pump both ends until queues drain: transmit everything queued,
    /// deliver everything received.
    fn pump(nodes: &[&TestNode]) {
        for _ in 0..64 {
            for n in nodes {
                n.mesh.scheduler_tick();
            }
            for n in nodes {
                n.mesh.poll_radio().unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_transaction_travels_mesh_into_kernel() {
        let a_key = Keypair::generate();
        let genesis = test_genesis(&a_key.address(), 1_000);
        let hub = ChannelHub::new();
        let sender = node(&hub, genesis.clone());
        let receiver = node(&hub, genesis);

        let tx = builder::build(
            &a_key.address(),
            &Keypair::generate().address(),
            300,
            &a_key,
            &sender.kernel.query_utxos(&a_key.address()),
            now_ms(),
        )
        .unwrap();
        let tx_id = tx.id.clone();

        sender.kernel.submit_transaction(tx.clone()).unwrap();
        sender.mesh.broadcast_transaction(tx).unwrap();
        pump(&[&sender, &receiver]);

        assert!(receiver.kernel.query_tx(&tx_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_block_propagates_and_applies() {
        let a_key = Keypair::generate();
        let genesis = test_genesis(&a_key.address(), 1_000);
        let hub = ChannelHub::new();
        let miner = node(&hub, genesis.clone());
        let follower = node(&hub, genesis);

        let block = miner.kernel.mine_block(&miner.key.address()).unwrap().unwrap();
        miner.mesh.broadcast_block(block).unwrap();
        pump(&[&miner, &follower]);

        assert_eq!(follower.kernel.chain_height(), 1);
    }

    #[tokio::test]
    async fn test_hello_builds_neighbor_and_route() {
        let genesis = test_genesis(&Keypair::generate().address(), 1_000);
        let hub = ChannelHub::new();
        let a = node(&hub, genesis.clone());
        let b = node(&hub, genesis);

        a.mesh.send_beacon().unwrap();
        b.mesh.send_beacon().unwrap();
        pump(&[&a, &b]);

        assert!(a.mesh.neighbors.is_neighbor(&b.mesh.node_id));
        assert!(b.mesh.neighbors.is_neighbor(&a.mesh.node_id));
        let route = a.mesh.routes.lookup(&b.mesh.node_id, now_ms()).unwrap();
        assert_eq!(route.hop_count, 1);
        assert_eq!(route.next_hop, b.mesh.node_id);
    }

    #[tokio::test]
    async fn test_route_discovery_round_trip() {
        let genesis = test_genesis(&Keypair::generate().address(), 1_000);
        let hub = ChannelHub::new();
        let seeker = node(&hub, genesis.clone());
        let target = node(&hub, genesis);

        let target_id = target.mesh.node_id.clone();
        let discovery = {
            let mesh = seeker.mesh.clone();
            let target_id = target_id.clone();
            tokio::spawn(async move {
                mesh.discover_route(&target_id, CapabilityRequirement::any())
                    .await
            })
        };

        // Drive both nodes while the discovery waits.
        for _ in 0..50 {
            pump(&[&seeker, &target]);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if discovery.is_finished() {
                break;
            }
        }
        let route = discovery.await.unwrap().unwrap();
        assert_eq!(route.destination, target_id);
    }

    #[tokio::test]
    async fn test_discovery_times_out_without_peers() {
        let genesis = test_genesis(&Keypair::generate().address(), 1_000);
        let hub = ChannelHub::new();
        let dir = tempfile::tempdir().unwrap();
        let storage = ChainStore::open(dir.path()).unwrap();
        let kernel = Inner::open(genesis, storage.clone(), EventBus::default(), Metrics::new()).unwrap();
        let config = NodeConfig {
            region: crate::config::Region::Au,
            route_discovery_timeout_ms: 50,
            ..Default::default()
        };
        let codec = Codec::new(&config, DictionaryRegistry::new()).unwrap();
        let mesh = MeshService::new(
            config,
            Arc::new(Keypair::generate()),
            NodeType::Full,
            kernel,
            storage,
            codec,
            Arc::new(hub.endpoint()),
        )
        .unwrap();

        let err = mesh
            .discover_route("lora1nowhere", CapabilityRequirement::any())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NoRoute(_)));
    }

    #[tokio::test]
    async fn test_confirmed_send_acked_end_to_end() {
        let genesis = test_genesis(&Keypair::generate().address(), 1_000);
        let hub = ChannelHub::new();
        let a = node(&hub, genesis.clone());
        let b = node(&hub, genesis);

        let message_id = a
            .mesh
            .send(
                MeshPayload::BlockRequest { height: 0 },
                Some(b.mesh.node_id.clone()),
                DeliveryLevel::Confirmed,
            )
            .unwrap();
        assert!(a.mesh.reliability.is_pending(message_id));

        pump(&[&a, &b]);
        assert!(
            !a.mesh.reliability.is_pending(message_id),
            "ack should have resolved the pending send"
        );
    }

    #[tokio::test]
    async fn test_large_payload_fragments_and_reassembles() {
        let a_key = Keypair::generate();
        let genesis = test_genesis(&a_key.address(), 1_000);
        let hub = ChannelHub::new();
        let miner = node(&hub, genesis.clone());
        let follower = node(&hub, genesis);

        // A real transaction pushes the block past the 256-byte MTU.
        let tx = builder::build(
            &a_key.address(),
            &Keypair::generate().address(),
            100,
            &a_key,
            &miner.kernel.query_utxos(&a_key.address()),
            now_ms(),
        )
        .unwrap();
        miner.kernel.submit_transaction(tx).unwrap();
        let block = miner.kernel.mine_block(&miner.key.address()).unwrap().unwrap();
        assert!(block.size_bytes() > 256);

        miner.mesh.broadcast_block(block).unwrap();
        pump(&[&miner, &follower]);
        assert_eq!(follower.kernel.chain_height(), 1);
    }
}
