pub mod builder;

use serde::{Deserialize, Serialize};

use crate::crypto::{hash, keys};

/// Zero hash marks coinbase provenance and the genesis parent.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxInput {
    pub prev_tx_hash: String,
    pub output_index: u32,
    /// Hex encoded 64-byte Ed25519 signature over the signature-excluded
    /// transaction hash.
    pub signature: String,
    /// Hex encoded 32-byte Ed25519 public key.
    pub public_key: String,
    pub sequence: u32,
}

impl TxInput {
    pub fn outpoint(&self) -> String {
        format!("{}:{}", self.prev_tx_hash, self.output_index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    /// Address-bearing locking script: pay-to-public-key-hash form, the
    /// `lora1...` address string itself.
    pub locking_script: String,
    pub output_index: u32,
}

impl TxOutput {
    /// The address this output pays to.
    pub fn address(&self) -> &str {
        &self.locking_script
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    /// Content hash of the transaction (signatures excluded).
    pub id: String,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Derived: sum(inputs) - sum(outputs). Carried explicitly so the
    /// mempool can order by fee rate without the parent UTXOs at hand.
    pub fee: u64,
}

impl Transaction {
    /// Coinbase: the single input-less transaction paying the miner.
    pub fn coinbase(miner_address: &str, value: u64, timestamp: u64) -> Self {
        let mut tx = Self {
            id: String::new(),
            inputs: vec![],
            outputs: vec![TxOutput {
                value,
                locking_script: miner_address.to_string(),
                output_index: 0,
            }],
            lock_time: 0,
            timestamp,
            fee: 0,
        };
        tx.id = tx.calculate_hash();
        tx
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Content hash over everything except input signatures, so signing
    /// does not mutate the id.
    pub fn calculate_hash(&self) -> String {
        let mut data = Vec::new();
        for input in &self.inputs {
            data.extend_from_slice(input.prev_tx_hash.as_bytes());
            data.extend_from_slice(&input.output_index.to_le_bytes());
            data.extend_from_slice(input.public_key.as_bytes());
            data.extend_from_slice(&input.sequence.to_le_bytes());
        }
        for output in &self.outputs {
            data.extend_from_slice(&output.value.to_le_bytes());
            data.extend_from_slice(output.locking_script.as_bytes());
            data.extend_from_slice(&output.output_index.to_le_bytes());
        }
        data.extend_from_slice(&self.lock_time.to_le_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.fee.to_le_bytes());

        hex::encode(hash::blake(&data))
    }

    /// Sign every input with `keypair`. The message is the content hash,
    /// which is safe to compute because it excludes signatures.
    pub fn sign_inputs(&mut self, keypair: &keys::Keypair) {
        self.id = self.calculate_hash();
        let msg = self.id.clone();
        let public_key = keypair.public_key_hex();
        for input in &mut self.inputs {
            input.signature = keypair.sign_hex(msg.as_bytes());
            input.public_key = public_key.clone();
        }
    }

    /// Verify the id matches the content and every input signature checks
    /// out against its embedded public key.
    pub fn verify_signatures(&self) -> bool {
        let msg_hash_hex = self.calculate_hash();
        if self.id != msg_hash_hex {
            return false;
        }

        for input in &self.inputs {
            if !keys::verify_hex(&input.public_key, msg_hash_hex.as_bytes(), &input.signature) {
                return false;
            }
        }
        true
    }

    pub fn total_output(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Serialized byte weight, used for the block-size budget and fee-rate
    /// ordering.
    pub fn size_bytes(&self) -> usize {
        bincode::serialized_size(self).map(|s| s as usize).unwrap_or(0)
    }

    pub fn fee_rate(&self) -> u64 {
        let size = self.size_bytes() as u64;
        if size == 0 {
            return 0;
        }
        self.fee / size
    }
}
