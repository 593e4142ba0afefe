use serde::{Deserialize, Serialize};

use crate::crypto::hash;
use crate::tx::{Transaction, ZERO_HASH};

/// Block header (the proof-of-work preimage).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    /// Chain height of this block.
    pub index: u64,
    pub previous_hash: String,
    pub merkle_root: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Required count of leading zero bits of the header hash.
    pub difficulty: u32,
    pub nonce: u64,
}

impl BlockHeader {
    pub fn calculate_hash(&self) -> [u8; 32] {
        let mut data = Vec::with_capacity(4 + 8 + 64 + 64 + 8 + 4 + 8);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(&self.index.to_le_bytes());
        data.extend_from_slice(self.previous_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.difficulty.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        hash::blake(&data)
    }

    /// PoW check: the header hash must lead with at least `difficulty`
    /// zero bits.
    pub fn meets_difficulty(&self) -> bool {
        hash::leading_zero_bits(&self.calculate_hash()) >= self.difficulty
    }
}

/// Complete block: header, its cached hash, and the ordered transaction
/// list (coinbase first).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    /// Hex header hash, set when the block is sealed. Validation always
    /// recomputes; this field is for lookups and wire transfer.
    pub hash: String,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(
        index: u64,
        previous_hash: String,
        timestamp: u64,
        difficulty: u32,
        transactions: Vec<Transaction>,
    ) -> Self {
        let merkle_root = Self::calculate_merkle_root(&transactions);
        let header = BlockHeader {
            version: 1,
            index,
            previous_hash,
            merkle_root,
            timestamp,
            difficulty,
            nonce: 0,
        };
        let hash = hex::encode(header.calculate_hash());
        Self {
            header,
            hash,
            transactions,
        }
    }

    pub fn calculate_hash(&self) -> String {
        hex::encode(self.header.calculate_hash())
    }

    /// Re-derive and cache the hash after header mutation (nonce search).
    pub fn seal(&mut self) {
        self.hash = self.calculate_hash();
    }

    /// Merkle root over transaction ids. An odd node count duplicates the
    /// last node; an empty list roots at the zero hash.
    pub fn calculate_merkle_root(txs: &[Transaction]) -> String {
        if txs.is_empty() {
            return ZERO_HASH.to_string();
        }
        let mut hashes: Vec<Vec<u8>> = txs
            .iter()
            .map(|tx| hex::decode(&tx.id).unwrap_or_else(|_| vec![0u8; 32]))
            .collect();

        while hashes.len() > 1 {
            let mut next_level = Vec::new();
            for chunk in hashes.chunks(2) {
                let mut combined = chunk[0].clone();
                if chunk.len() > 1 {
                    combined.extend_from_slice(&chunk[1]);
                } else {
                    combined.extend_from_slice(&chunk[0]); // Duplicate last if odd
                }
                next_level.push(hash::blake(&combined).to_vec());
            }
            hashes = next_level;
        }
        hex::encode(&hashes[0])
    }

    /// Merkle inclusion proof for `tx_id`: sibling hashes from leaf to
    /// root, each flagged with whether the sibling sits on the right.
    pub fn merkle_proof(&self, tx_id: &str) -> Option<Vec<(String, bool)>> {
        let mut index = self.transactions.iter().position(|tx| tx.id == tx_id)?;
        let mut level: Vec<Vec<u8>> = self
            .transactions
            .iter()
            .map(|tx| hex::decode(&tx.id).unwrap_or_else(|_| vec![0u8; 32]))
            .collect();

        let mut proof = Vec::new();
        while level.len() > 1 {
            let sibling_idx = if index % 2 == 0 { index + 1 } else { index - 1 };
            let sibling = if sibling_idx < level.len() {
                &level[sibling_idx]
            } else {
                &level[index] // odd count: paired with itself
            };
            proof.push((hex::encode(sibling), index % 2 == 0));

            let mut next_level = Vec::new();
            for chunk in level.chunks(2) {
                let mut combined = chunk[0].clone();
                if chunk.len() > 1 {
                    combined.extend_from_slice(&chunk[1]);
                } else {
                    combined.extend_from_slice(&chunk[0]);
                }
                next_level.push(hash::blake(&combined).to_vec());
            }
            level = next_level;
            index /= 2;
        }
        Some(proof)
    }

    /// Verify a proof produced by [`Block::merkle_proof`].
    pub fn verify_merkle_proof(tx_id: &str, proof: &[(String, bool)], root: &str) -> bool {
        let mut acc = match hex::decode(tx_id) {
            Ok(b) => b,
            Err(_) => return false,
        };
        for (sibling_hex, sibling_right) in proof {
            let sibling = match hex::decode(sibling_hex) {
                Ok(b) => b,
                Err(_) => return false,
            };
            let mut combined = Vec::with_capacity(64);
            if *sibling_right {
                combined.extend_from_slice(&acc);
                combined.extend_from_slice(&sibling);
            } else {
                combined.extend_from_slice(&sibling);
                combined.extend_from_slice(&acc);
            }
            acc = hash::blake(&combined).to_vec();
        }
        hex::encode(&acc) == root
    }

    pub fn size_bytes(&self) -> usize {
        bincode::serialized_size(self).map(|s| s as usize).unwrap_or(0)
    }

    /// Fees collected from every non-coinbase transaction.
    pub fn total_fees(&self) -> u64 {
        self.transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .map(|tx| tx.fee)
            .sum()
    }

    // Convenience accessors
    pub fn index(&self) -> u64 {
        self.header.index
    }
    pub fn previous_hash(&self) -> &str {
        &self.header.previous_hash
    }
    pub fn merkle_root(&self) -> &str {
        &self.header.merkle_root
    }
    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }
    pub fn difficulty(&self) -> u32 {
        self.header.difficulty
    }
    pub fn nonce(&self) -> u64 {
        self.header.nonce
    }
}
