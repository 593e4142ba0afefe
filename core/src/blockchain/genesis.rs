use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::blockchain::block::Block;
use crate::crypto::keys;
use crate::error::{CoreError, Result};
use crate::tx::{Transaction, TxOutput, ZERO_HASH};

/// Consensus parameters fixed at genesis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkParams {
    /// Leading-zero-bit count required of the first blocks.
    pub initial_difficulty: u32,
    pub mining_reward: u64,
    pub max_block_size_bytes: usize,
    pub target_block_time_s: u64,
    pub adjustment_period_blocks: u64,
    /// Per-retarget clamp: new difficulty stays within
    /// [old / ratio, old × ratio].
    pub max_retarget_ratio: f64,
    pub min_difficulty: u32,
    pub max_difficulty: u32,
}

impl NetworkParams {
    pub fn target_block_time_ms(&self) -> u64 {
        self.target_block_time_s * 1_000
    }
}

/// One initial allocation: `amount` credited to `address` in the genesis
/// block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Allocation {
    pub address: String,
    pub amount: u64,
}

/// Chain parameters and initial coin distribution.
///
/// Sealed semantics: once a genesis block derived from this config is
/// persisted, only a config reproducing the stored genesis hash is
/// acceptable on reload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenesisConfig {
    pub chain_id: String,
    pub network_params: NetworkParams,
    pub initial_allocations: Vec<Allocation>,
    pub total_supply: u64,
    /// Fixed genesis timestamp (ms) so every node derives the same hash.
    pub timestamp: u64,
    pub metadata: HashMap<String, String>,
}

impl GenesisConfig {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Configuration(format!("cannot read {}: {}", path, e)))?;
        let cfg: GenesisConfig = serde_json::from_str(&raw)
            .map_err(|e| CoreError::Configuration(format!("cannot parse {}: {}", path, e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chain_id.is_empty() {
            return Err(CoreError::Configuration("chain_id must not be empty".into()));
        }
        let p = &self.network_params;
        if p.min_difficulty == 0
            || p.min_difficulty > p.max_difficulty
            || p.max_difficulty > 255
        {
            return Err(CoreError::Configuration(format!(
                "difficulty bounds [{}, {}] invalid",
                p.min_difficulty, p.max_difficulty
            )));
        }
        if !(p.min_difficulty..=p.max_difficulty).contains(&p.initial_difficulty) {
            return Err(CoreError::Configuration(format!(
                "initial_difficulty {} outside [{}, {}]",
                p.initial_difficulty, p.min_difficulty, p.max_difficulty
            )));
        }
        if p.target_block_time_s == 0 || p.adjustment_period_blocks == 0 {
            return Err(CoreError::Configuration(
                "target_block_time_s and adjustment_period_blocks must be > 0".into(),
            ));
        }
        if p.max_retarget_ratio < 1.0 {
            return Err(CoreError::Configuration(format!(
                "max_retarget_ratio {} must be >= 1",
                p.max_retarget_ratio
            )));
        }
        if p.max_block_size_bytes == 0 {
            return Err(CoreError::Configuration("max_block_size_bytes must be > 0".into()));
        }

        let mut sum: u128 = 0;
        for alloc in &self.initial_allocations {
            if !keys::is_valid_address(&alloc.address) {
                return Err(CoreError::Configuration(format!(
                    "allocation address {} invalid",
                    alloc.address
                )));
            }
            if alloc.amount == 0 {
                return Err(CoreError::Configuration(format!(
                    "allocation to {} has zero amount",
                    alloc.address
                )));
            }
            sum += alloc.amount as u128;
        }
        if sum != self.total_supply as u128 {
            return Err(CoreError::Configuration(format!(
                "total_supply {} does not match allocation sum {}",
                self.total_supply, sum
            )));
        }
        Ok(())
    }

    /// Materialize the deterministic genesis block: one input-less
    /// allocation transaction carrying every initial balance.
    pub fn build_genesis_block(&self) -> Block {
        let outputs: Vec<TxOutput> = self
            .initial_allocations
            .iter()
            .enumerate()
            .map(|(i, alloc)| TxOutput {
                value: alloc.amount,
                locking_script: alloc.address.clone(),
                output_index: i as u32,
            })
            .collect();

        let mut allocation_tx = Transaction {
            id: String::new(),
            inputs: vec![],
            outputs,
            lock_time: 0,
            timestamp: self.timestamp,
            fee: 0,
        };
        allocation_tx.id = allocation_tx.calculate_hash();

        let txs = if allocation_tx.outputs.is_empty() {
            vec![]
        } else {
            vec![allocation_tx]
        };

        Block::new(
            0,
            ZERO_HASH.to_string(),
            self.timestamp,
            self.network_params.initial_difficulty,
            txs,
        )
    }

    /// Seal check: does this config reproduce the persisted genesis hash?
    pub fn matches_sealed_hash(&self, stored_hash: &str) -> bool {
        self.build_genesis_block().calculate_hash() == stored_hash
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn test_genesis_block_deterministic() {
        let cfg = test_genesis(&random_address(), 1_000);
        let b1 = cfg.build_genesis_block();
        let b2 = cfg.build_genesis_block();
        assert_eq!(b1.calculate_hash(), b2.calculate_hash());
        assert_eq!(b1.index(), 0);
        assert_eq!(b1.previous_hash(), ZERO_HASH);
    }

    #[test]
    fn test_genesis_carries_allocations() {
        let addr = random_address();
        let cfg = test_genesis(&addr, 1_000);
        let block = cfg.build_genesis_block();
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.transactions[0].outputs[0].value, 1_000);
        assert_eq!(block.transactions[0].outputs[0].locking_script, addr);
        assert!(block.transactions[0].is_coinbase());
    }

    #[test]
    fn test_supply_mismatch_rejected() {
        let mut cfg = test_genesis(&random_address(), 1_000);
        cfg.total_supply = 999;
        assert!(matches!(cfg.validate(), Err(CoreError::Configuration(_))));
    }

    #[test]
    fn test_invalid_allocation_address_rejected() {
        let mut cfg = test_genesis(&random_address(), 1_000);
        cfg.initial_allocations[0].address = "not-an-address".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_initial_difficulty_must_be_in_bounds() {
        let mut cfg = test_genesis(&random_address(), 1_000);
        cfg.network_params.initial_difficulty = 200;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_seal_match() {
        let cfg = test_genesis(&random_address(), 1_000);
        let hash = cfg.build_genesis_block().calculate_hash();
        assert!(cfg.matches_sealed_hash(&hash));

        let mut other = cfg.clone();
        other.timestamp += 1;
        assert!(!other.matches_sealed_hash(&hash));
    }
}
