use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::crypto::keys::{self, Keypair};
use crate::error::{CoreError, Result};

/// What a peer is, capability-wise.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Full,
    Light,
    Mining,
}

/// Minimum capabilities a route discovery will accept from a responder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityRequirement {
    pub node_type: NodeType,
    pub min_utxo_completeness: f64,
    pub min_blockchain_height: u64,
}

impl CapabilityRequirement {
    pub fn any() -> Self {
        Self {
            node_type: NodeType::Light,
            min_utxo_completeness: 0.0,
            min_blockchain_height: 0,
        }
    }

    /// Does a peer advertising (node_type, completeness, height) satisfy
    /// this requirement? Full > Mining > Light for capability ordering.
    pub fn satisfied_by(
        &self,
        node_type: NodeType,
        utxo_completeness: f64,
        blockchain_height: u64,
    ) -> bool {
        let rank = |t: NodeType| match t {
            NodeType::Full => 2,
            NodeType::Mining => 1,
            NodeType::Light => 0,
        };
        rank(node_type) >= rank(self.node_type)
            && utxo_completeness >= self.min_utxo_completeness
            && blockchain_height >= self.min_blockchain_height
    }
}

/// One hop's signature over the path prefix ending at it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathSignature {
    pub node_id: String,
    pub public_key: String,
    pub signature: String,
}

fn path_signing_message(request_id: u64, originator: &str, destination: &str, path: &[String]) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&request_id.to_le_bytes());
    msg.extend_from_slice(originator.as_bytes());
    msg.push(0);
    msg.extend_from_slice(destination.as_bytes());
    msg.push(0);
    for hop in path {
        msg.extend_from_slice(hop.as_bytes());
        msg.push(0);
    }
    msg
}

/// Flooded route discovery request.
///
/// Each forwarder appends itself to `path`, increments the hop count and
/// adds its signature over the path prefix — a verifiable chain of
/// custody for the route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteRequest {
    pub originator: String,
    pub destination: String,
    pub request_id: u64,
    pub hop_count: u8,
    pub path: Vec<String>,
    pub requirements: CapabilityRequirement,
    pub signatures: Vec<PathSignature>,
}

impl RouteRequest {
    pub fn originate(
        destination: &str,
        request_id: u64,
        requirements: CapabilityRequirement,
        keypair: &Keypair,
    ) -> Self {
        let originator = keypair.address();
        let path = vec![originator.clone()];
        let signature = keypair.sign_hex(&path_signing_message(
            request_id,
            &originator,
            destination,
            &path,
        ));
        Self {
            originator: originator.clone(),
            destination: destination.to_string(),
            request_id,
            hop_count: 0,
            path,
            requirements,
            signatures: vec![PathSignature {
                node_id: originator,
                public_key: keypair.public_key_hex(),
                signature,
            }],
        }
    }

    /// Append this node to the path and re-sign before rebroadcast.
    pub fn append_hop(&mut self, keypair: &Keypair) {
        let node_id = keypair.address();
        self.path.push(node_id.clone());
        self.hop_count += 1;
        let signature = keypair.sign_hex(&path_signing_message(
            self.request_id,
            &self.originator,
            &self.destination,
            &self.path,
        ));
        self.signatures.push(PathSignature {
            node_id,
            public_key: keypair.public_key_hex(),
            signature,
        });
    }

    /// Verify the whole signature chain: one signature per hop, each
    /// over the path prefix ending at that hop, each key matching the
    /// hop's node id.
    pub fn verify_chain(&self) -> bool {
        if self.path.is_empty() || self.path.len() != self.signatures.len() {
            return false;
        }
        if self.path[0] != self.originator {
            return false;
        }
        if self.hop_count as usize != self.path.len() - 1 {
            return false;
        }
        for (i, sig) in self.signatures.iter().enumerate() {
            if sig.node_id != self.path[i] {
                return false;
            }
            match keys::address_from_public_key_hex(&sig.public_key) {
                Some(addr) if addr == sig.node_id => {}
                _ => return false,
            }
            let msg = path_signing_message(
                self.request_id,
                &self.originator,
                &self.destination,
                &self.path[..=i],
            );
            if !keys::verify_hex(&sig.public_key, &msg, &sig.signature) {
                return false;
            }
        }
        true
    }
}

/// Reply travelling the reverse path, installing routes as it goes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteReply {
    pub request_id: u64,
    pub originator: String,
    /// The destination the request asked for.
    pub destination: String,
    /// The node answering (the destination itself, or a peer meeting the
    /// capability requirements).
    pub responder: String,
    /// Forward path originator → responder.
    pub path: Vec<String>,
    pub hop_count: u8,
    pub node_type: NodeType,
    pub utxo_completeness: f64,
    pub blockchain_height: u64,
    pub sequence_number: u64,
    pub timestamp: u64,
    pub responder_public_key: String,
    pub signature: String,
}

impl RouteReply {
    fn signing_message(&self) -> Vec<u8> {
        let mut msg = path_signing_message(
            self.request_id,
            &self.originator,
            &self.destination,
            &self.path,
        );
        msg.extend_from_slice(&self.sequence_number.to_le_bytes());
        msg.extend_from_slice(&self.blockchain_height.to_le_bytes());
        msg.extend_from_slice(&self.timestamp.to_le_bytes());
        msg
    }

    pub fn answer(
        request: &RouteRequest,
        node_type: NodeType,
        utxo_completeness: f64,
        blockchain_height: u64,
        sequence_number: u64,
        timestamp: u64,
        keypair: &Keypair,
    ) -> Self {
        let responder = keypair.address();
        let mut path = request.path.clone();
        if path.last().map(|l| l != &responder).unwrap_or(true) {
            path.push(responder.clone());
        }
        let mut reply = Self {
            request_id: request.request_id,
            originator: request.originator.clone(),
            destination: request.destination.clone(),
            responder,
            hop_count: (path.len() - 1) as u8,
            path,
            node_type,
            utxo_completeness,
            blockchain_height,
            sequence_number,
            timestamp,
            responder_public_key: keypair.public_key_hex(),
            signature: String::new(),
        };
        reply.signature = keypair.sign_hex(&reply.signing_message());
        reply
    }

    pub fn verify(&self) -> bool {
        match keys::address_from_public_key_hex(&self.responder_public_key) {
            Some(addr) if addr == self.responder => {}
            _ => return false,
        }
        if self.path.last().map(|l| l != &self.responder).unwrap_or(true) {
            return false;
        }
        keys::verify_hex(
            &self.responder_public_key,
            &self.signing_message(),
            &self.signature,
        )
    }
}

/// Emitted when forwarding to a next hop failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteErrorMsg {
    pub destination: String,
    pub failed_next_hop: String,
    pub reporter: String,
}

/// One installed route.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub destination: String,
    pub next_hop: String,
    pub hop_count: u8,
    pub sequence_number: u64,
    pub link_quality: f64,
    pub node_type: NodeType,
    pub utxo_completeness: f64,
    pub blockchain_height: u64,
    pub last_refresh: u64,
    /// Signature of the route reply that installed this entry.
    pub signature: String,
}

/// Selection policy: lower hop count, then higher link quality, then
/// fresher sequence, then newer timestamp. Total order (ties broken by
/// destination id for determinism).
pub fn compare_routes(a: &RouteEntry, b: &RouteEntry) -> Ordering {
    a.hop_count
        .cmp(&b.hop_count)
        .then_with(|| b.link_quality.total_cmp(&a.link_quality))
        .then_with(|| b.sequence_number.cmp(&a.sequence_number))
        .then_with(|| b.last_refresh.cmp(&a.last_refresh))
        .then_with(|| a.destination.cmp(&b.destination))
}

/// For UTXO traffic, prefer full nodes at greater height before the
/// generic ordering.
pub fn compare_routes_for_utxo(a: &RouteEntry, b: &RouteEntry) -> Ordering {
    let rank = |t: NodeType| match t {
        NodeType::Full => 0,
        NodeType::Mining => 1,
        NodeType::Light => 2,
    };
    rank(a.node_type)
        .cmp(&rank(b.node_type))
        .then_with(|| b.blockchain_height.cmp(&a.blockchain_height))
        .then_with(|| compare_routes(a, b))
}

/// The routing table: best-known route per destination.
pub struct RoutingTable {
    routes: RwLock<HashMap<String, RouteEntry>>,
    ttl_ms: u64,
}

impl RoutingTable {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            ttl_ms,
        }
    }

    /// Install or replace per policy: a strictly newer sequence always
    /// wins; an equal sequence wins only if it orders better.
    pub fn upsert(&self, entry: RouteEntry) -> bool {
        let mut routes = self.routes.write();
        match routes.get(&entry.destination) {
            Some(existing) => {
                let replace = entry.sequence_number > existing.sequence_number
                    || (entry.sequence_number == existing.sequence_number
                        && compare_routes(&entry, existing) == Ordering::Less);
                if replace {
                    routes.insert(entry.destination.clone(), entry);
                }
                replace
            }
            None => {
                routes.insert(entry.destination.clone(), entry);
                true
            }
        }
    }

    pub fn lookup(&self, destination: &str, now: u64) -> Option<RouteEntry> {
        let routes = self.routes.read();
        routes
            .get(destination)
            .filter(|r| now.saturating_sub(r.last_refresh) <= self.ttl_ms)
            .cloned()
    }

    pub fn remove(&self, destination: &str) -> Option<RouteEntry> {
        self.routes.write().remove(destination)
    }

    /// Drop every route using `next_hop`; returns the destinations lost.
    pub fn invalidate_via(&self, next_hop: &str) -> Vec<String> {
        let mut routes = self.routes.write();
        let lost: Vec<String> = routes
            .values()
            .filter(|r| r.next_hop == next_hop)
            .map(|r| r.destination.clone())
            .collect();
        for destination in &lost {
            routes.remove(destination);
        }
        lost
    }

    pub fn purge_expired(&self, now: u64) -> Vec<String> {
        let mut routes = self.routes.write();
        let expired: Vec<String> = routes
            .values()
            .filter(|r| now.saturating_sub(r.last_refresh) > self.ttl_ms)
            .map(|r| r.destination.clone())
            .collect();
        for destination in &expired {
            routes.remove(destination);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

/// Request-id deduplication cache with TTL, the flood suppressor.
pub struct RequestCache {
    seen: Mutex<HashMap<u64, u64>>,
    ttl_ms: u64,
}

impl RequestCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl_ms,
        }
    }

    /// Returns true the first time an id is observed inside the TTL.
    pub fn first_sighting(&self, request_id: u64, now: u64) -> bool {
        let mut seen = self.seen.lock();
        seen.retain(|_, t| now.saturating_sub(*t) <= self.ttl_ms);
        match seen.get(&request_id) {
            Some(_) => false,
            None => {
                seen.insert(request_id, now);
                true
            }
        }
    }
}

/// Forwarding admission for a route request.
pub fn should_forward(
    request: &RouteRequest,
    my_id: &str,
    cache: &RequestCache,
    max_hops: u8,
    now: u64,
) -> Result<()> {
    if !cache.first_sighting(request.request_id, now) {
        return Err(CoreError::Protocol(format!(
            "route request {} already seen",
            request.request_id
        )));
    }
    if request.path.iter().any(|hop| hop == my_id) {
        return Err(CoreError::Protocol("already on path".into()));
    }
    if request.hop_count >= max_hops {
        return Err(CoreError::Protocol(format!(
            "hop count {} at limit",
            request.hop_count
        )));
    }
    if !request.verify_chain() {
        return Err(CoreError::Protocol("path signature chain invalid".into()));
    }
    Ok(())
}
