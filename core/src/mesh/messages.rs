use serde::{Deserialize, Serialize};

use crate::blockchain::block::Block;
use crate::blockchain::fee;
use crate::codec::frame::FrameKind;
use crate::crypto::keys::{self, Keypair};
use crate::error::{CoreError, Result};
use crate::mesh::dutycycle::Priority;
use crate::mesh::neighbors::HelloBeacon;
use crate::mesh::routing::{RouteErrorMsg, RouteReply, RouteRequest};
use crate::tx::Transaction;

/// Typed payload of one mesh message. Externally tagged so the bincode
/// wire form stays compact and self-contained.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MeshPayload {
    Transaction {
        transaction: Transaction,
    },
    Block {
        block: Block,
    },
    BlockRequest {
        height: u64,
    },
    /// Merkle inclusion proof for a confirmed transaction (light-client
    /// sync traffic).
    MerkleProof {
        tx_id: String,
        block_hash: String,
        merkle_root: String,
        proof: Vec<(String, bool)>,
    },
    ProofRequest {
        tx_id: String,
    },
    RouteRequest(RouteRequest),
    RouteReply(RouteReply),
    RouteError(RouteErrorMsg),
    Hello(HelloBeacon),
    Ack {
        message_id: u64,
    },
    /// Ask the sender of `message_id` to retransmit specific fragments.
    FragmentRequest {
        message_id: u64,
        indices: Vec<u32>,
    },
}

impl MeshPayload {
    pub fn frame_kind(&self) -> FrameKind {
        match self {
            MeshPayload::Transaction { .. } => FrameKind::Transaction,
            MeshPayload::Block { .. } | MeshPayload::BlockRequest { .. } => FrameKind::Block,
            MeshPayload::MerkleProof { .. } | MeshPayload::ProofRequest { .. } => FrameKind::Proof,
            MeshPayload::RouteRequest(_)
            | MeshPayload::RouteReply(_)
            | MeshPayload::RouteError(_) => FrameKind::Routing,
            MeshPayload::Hello(_) => FrameKind::Hello,
            MeshPayload::Ack { .. } => FrameKind::Ack,
            MeshPayload::FragmentRequest { .. } => FrameKind::Fragment,
        }
    }

    /// Transmission priority for UTXO traffic: blocks are critical,
    /// transactions tier by fee-per-byte, proofs ride high, route
    /// control normal, beacons low.
    pub fn priority(&self) -> Priority {
        match self {
            MeshPayload::Block { .. } => Priority::Critical,
            MeshPayload::Transaction { transaction } => {
                let rate = transaction.fee_rate();
                if rate >= fee::HIGH_PRIORITY_FEE_RATE {
                    Priority::High
                } else if rate >= fee::NORMAL_PRIORITY_FEE_RATE {
                    Priority::Normal
                } else {
                    Priority::Low
                }
            }
            MeshPayload::MerkleProof { .. } | MeshPayload::ProofRequest { .. } => Priority::High,
            MeshPayload::BlockRequest { .. } => Priority::High,
            MeshPayload::RouteRequest(_) | MeshPayload::RouteReply(_) => Priority::Normal,
            MeshPayload::RouteError(_) => Priority::Normal,
            MeshPayload::Ack { .. } => Priority::High,
            MeshPayload::FragmentRequest { .. } => Priority::Normal,
            MeshPayload::Hello(_) => Priority::Low,
        }
    }
}

/// A mesh message as it travels end-to-end: payload plus origin,
/// optional destination, and the originator's signature. Forwarders
/// re-frame but never re-sign an envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub payload: MeshPayload,
    /// Milliseconds since the Unix epoch at creation.
    pub timestamp: u64,
    /// Originating node id (its address).
    pub from: String,
    /// Final destination; `None` broadcasts.
    pub to: Option<String>,
    /// Receiver should answer with an `Ack` carrying the frame's
    /// message id (confirmed/guaranteed delivery).
    pub requires_ack: bool,
    pub sender_public_key: String,
    pub signature: String,
}

impl Envelope {
    pub fn new(
        payload: MeshPayload,
        to: Option<String>,
        requires_ack: bool,
        keypair: &Keypair,
        timestamp: u64,
    ) -> Self {
        let mut envelope = Self {
            payload,
            timestamp,
            from: keypair.address(),
            to,
            requires_ack,
            sender_public_key: keypair.public_key_hex(),
            signature: String::new(),
        };
        envelope.signature = keypair.sign_hex(&envelope.signing_bytes());
        envelope
    }

    fn signing_bytes(&self) -> Vec<u8> {
        let unsigned = (
            &self.payload,
            self.timestamp,
            &self.from,
            &self.to,
            self.requires_ack,
            &self.sender_public_key,
        );
        bincode::serialize(&unsigned).unwrap_or_default()
    }

    /// End-to-end verification: the signature must check out and the
    /// claimed origin must match the signing key.
    pub fn verify(&self) -> bool {
        match keys::address_from_public_key_hex(&self.sender_public_key) {
            Some(addr) if addr == self.from => {}
            _ => return false,
        }
        keys::verify_hex(
            &self.sender_public_key,
            &self.signing_bytes(),
            &self.signature,
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(CoreError::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_payload() -> MeshPayload {
        MeshPayload::Hello(HelloBeacon {
            node_id: "lora1me".into(),
            public_key: "ab".repeat(32),
            node_type: crate::mesh::routing::NodeType::Full,
            blockchain_height: 7,
            utxo_completeness: 1.0,
            sequence: 3,
        })
    }

    #[test]
    fn test_envelope_sign_verify_round_trip() {
        let kp = Keypair::generate();
        let env = Envelope::new(hello_payload(), None, false, &kp, 1_000);
        assert!(env.verify());
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
        assert!(decoded.verify());
    }

    #[test]
    fn test_tampered_envelope_fails() {
        let kp = Keypair::generate();
        let mut env = Envelope::new(hello_payload(), None, false, &kp, 1_000);
        env.timestamp += 1;
        assert!(!env.verify());
    }

    #[test]
    fn test_spoofed_origin_fails() {
        let kp = Keypair::generate();
        let mut env = Envelope::new(hello_payload(), None, false, &kp, 1_000);
        env.from = "lora1somebodyelse".into();
        assert!(!env.verify());
    }

    #[test]
    fn test_priority_mapping() {
        let kp = Keypair::generate();
        let block = crate::blockchain::block::Block::new(
            1,
            crate::tx::ZERO_HASH.to_string(),
            1_000,
            1,
            vec![],
        );
        assert_eq!(
            MeshPayload::Block { block }.priority(),
            Priority::Critical
        );
        assert_eq!(hello_payload().priority(), Priority::Low);

        let mut tx = Transaction::coinbase(&kp.address(), 5, 1);
        tx.fee = 0;
        assert_eq!(
            MeshPayload::Transaction { transaction: tx }.priority(),
            Priority::Low
        );
    }
}
