use std::collections::HashSet;

use crate::blockchain::block::Block;
use crate::blockchain::difficulty::{self, MAX_FUTURE_DRIFT_MS};
use crate::blockchain::fee;
use crate::blockchain::genesis::NetworkParams;
use crate::blockchain::utxo::UtxoSet;
use crate::crypto::keys;
use crate::error::{CoreError, Result};
use crate::tx::{Transaction, ZERO_HASH};

/// Everything block validation needs from the chain around the block.
pub struct BlockContext<'a> {
    pub parent: Option<&'a Block>,
    /// Timestamps of up to the last 11 blocks before this one, oldest
    /// first. Feeds the median rule.
    pub prior_timestamps: &'a [u64],
    /// Timestamps of the closed adjustment window (oldest first), only
    /// consulted at retarget heights.
    pub retarget_window: &'a [u64],
    /// The UTXO set at the parent state.
    pub utxo_set: &'a UtxoSet,
    pub params: &'a NetworkParams,
    pub now_ms: u64,
}

/// Comprehensive block validation: linkage, timestamp, difficulty
/// schedule, PoW, merkle, size, and every transaction.
pub fn validate_block(block: &Block, ctx: &BlockContext) -> Result<()> {
    // 1. Version
    if block.header.version != 1 {
        return Err(CoreError::Validation(format!(
            "invalid version: {}",
            block.header.version
        )));
    }

    // 2. Linkage
    match ctx.parent {
        Some(prev) => {
            if block.index() != prev.index() + 1 {
                return Err(CoreError::Consensus(format!(
                    "invalid height: {} (expected {})",
                    block.index(),
                    prev.index() + 1
                )));
            }
            let computed_prev_hash = prev.calculate_hash();
            if block.previous_hash() != computed_prev_hash {
                return Err(CoreError::Consensus(format!(
                    "prev_hash mismatch at height {}: expected {} got {}",
                    block.index(),
                    &computed_prev_hash[..16],
                    &block.previous_hash()[..16.min(block.previous_hash().len())]
                )));
            }
        }
        None => {
            if block.index() != 0 {
                return Err(CoreError::Consensus(format!(
                    "missing parent for height {}",
                    block.index()
                )));
            }
            if block.previous_hash() != ZERO_HASH {
                return Err(CoreError::Consensus(
                    "genesis must link to the zero hash".into(),
                ));
            }
            // Genesis is sealed by configuration, not mined; nothing
            // further to check here.
            return Ok(());
        }
    }

    // 3. Timestamp: strictly above the median of the last 11, and no
    //    more than 2 h into the future.
    if let Some(median) = difficulty::median_time_past(ctx.prior_timestamps) {
        if block.timestamp() <= median {
            return Err(CoreError::Validation(format!(
                "timestamp {} not above median {}",
                block.timestamp(),
                median
            )));
        }
    }
    if block.timestamp() > ctx.now_ms + MAX_FUTURE_DRIFT_MS {
        return Err(CoreError::Validation(format!(
            "timestamp {} too far in future (now {})",
            block.timestamp(),
            ctx.now_ms
        )));
    }

    // 4. Difficulty must follow the retarget schedule exactly.
    let parent_difficulty = ctx.parent.map(|p| p.difficulty()).unwrap_or(0);
    let expected = difficulty::expected_difficulty(
        block.index(),
        parent_difficulty,
        ctx.retarget_window,
        ctx.params,
    );
    if block.difficulty() != expected {
        return Err(CoreError::Consensus(format!(
            "difficulty {} at height {} (expected {})",
            block.difficulty(),
            block.index(),
            expected
        )));
    }

    // 5. Merkle root
    let calculated_root = Block::calculate_merkle_root(&block.transactions);
    if block.merkle_root() != calculated_root {
        return Err(CoreError::Consensus(format!(
            "invalid merkle root: {} (expected {})",
            block.merkle_root(),
            calculated_root
        )));
    }

    // 6. Proof-of-work
    if !block.header.meets_difficulty() {
        return Err(CoreError::Consensus(format!(
            "insufficient PoW: hash {} does not meet difficulty {}",
            block.calculate_hash(),
            block.difficulty()
        )));
    }

    // 7. Size budget
    let size = block.size_bytes();
    if size > ctx.params.max_block_size_bytes {
        return Err(CoreError::Validation(format!(
            "block size {} exceeds maximum {}",
            size, ctx.params.max_block_size_bytes
        )));
    }

    // 8. Transactions
    validate_block_transactions(block, ctx)
}

fn validate_block_transactions(block: &Block, ctx: &BlockContext) -> Result<()> {
    if block.transactions.is_empty() {
        return Err(CoreError::Validation(
            "block must contain at least the coinbase".into(),
        ));
    }

    let coinbase = &block.transactions[0];
    if !coinbase.is_coinbase() {
        return Err(CoreError::Validation(
            "first transaction must be coinbase".into(),
        ));
    }

    // Coinbase pays exactly reward + collected fees.
    let expected_payout = ctx
        .params
        .mining_reward
        .checked_add(block.total_fees())
        .ok_or_else(|| CoreError::Validation("coinbase payout overflows".into()))?;
    if coinbase.total_output() != expected_payout {
        return Err(CoreError::Validation(format!(
            "coinbase pays {} (expected reward {} + fees {})",
            coinbase.total_output(),
            ctx.params.mining_reward,
            block.total_fees()
        )));
    }

    // Inputs are validated in listed order; each outpoint must exist at
    // the parent state and may be consumed once across the block.
    let mut block_spent: HashSet<String> = HashSet::new();

    for tx in block.transactions.iter().skip(1) {
        if tx.is_coinbase() {
            return Err(CoreError::Validation(format!(
                "second coinbase {} in block",
                tx.id
            )));
        }
        validate_transaction_structure(tx)?;

        let mut input_sum: u64 = 0;
        for input in &tx.inputs {
            let outpoint = input.outpoint();
            if !block_spent.insert(outpoint.clone()) {
                return Err(CoreError::UtxoConflict(format!(
                    "outpoint {} consumed twice in block {}",
                    outpoint,
                    block.index()
                )));
            }

            let key = (input.prev_tx_hash.clone(), input.output_index);
            let utxo = ctx.utxo_set.get(&key).ok_or_else(|| {
                CoreError::UtxoConflict(format!("missing UTXO {} for tx {}", outpoint, tx.id))
            })?;

            let spender = keys::address_from_public_key_hex(&input.public_key)
                .ok_or_else(|| CoreError::Validation("malformed public key".into()))?;
            if spender != utxo.locking_script {
                return Err(CoreError::Validation(format!(
                    "UTXO {} locked to {}, spent by {}",
                    outpoint, utxo.locking_script, spender
                )));
            }

            input_sum = input_sum
                .checked_add(utxo.value)
                .ok_or_else(|| CoreError::Validation(format!("input sum overflow in tx {}", tx.id)))?;
        }

        let needed = tx
            .total_output()
            .checked_add(tx.fee)
            .ok_or_else(|| CoreError::Validation("output + fee overflows".into()))?;
        if input_sum < needed {
            return Err(CoreError::Validation(format!(
                "value not conserved in tx {}: inputs {} < outputs {} + fee {}",
                tx.id,
                input_sum,
                tx.total_output(),
                tx.fee
            )));
        }
    }

    Ok(())
}

/// Structure and signature checks that need no chain context.
pub fn validate_transaction_structure(tx: &Transaction) -> Result<()> {
    if tx.inputs.is_empty() {
        return Err(CoreError::Validation(format!("tx {} has no inputs", tx.id)));
    }
    if tx.outputs.is_empty() {
        return Err(CoreError::Validation(format!("tx {} has no outputs", tx.id)));
    }
    for (i, output) in tx.outputs.iter().enumerate() {
        if output.output_index != i as u32 {
            return Err(CoreError::Validation(format!(
                "tx {} output {} carries index {}",
                tx.id, i, output.output_index
            )));
        }
    }
    fee::validate_output_values(&tx.outputs.iter().map(|o| o.value).collect::<Vec<_>>())
        .map_err(CoreError::Validation)?;

    let size = tx.size_bytes();
    if size > fee::MAX_TX_SIZE_BYTES {
        return Err(CoreError::Validation(format!(
            "tx {} too large: {} bytes (max {})",
            tx.id,
            size,
            fee::MAX_TX_SIZE_BYTES
        )));
    }
    fee::validate_fee(tx.fee, size).map_err(CoreError::Validation)?;

    if !tx.verify_signatures() {
        return Err(CoreError::Validation(format!(
            "invalid signature in tx {}",
            tx.id
        )));
    }
    Ok(())
}

/// Minimal check for relay decisions: PoW and merkle only.
pub fn quick_validate_block(block: &Block) -> Result<()> {
    if !block.header.meets_difficulty() {
        return Err(CoreError::Consensus("insufficient PoW".into()));
    }
    let calculated_root = Block::calculate_merkle_root(&block.transactions);
    if block.merkle_root() != calculated_root {
        return Err(CoreError::Consensus("invalid merkle root".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::genesis::testutil::test_genesis;
    use crate::blockchain::mining;
    use crate::crypto::keys::Keypair;

    fn setup() -> (Block, UtxoSet, NetworkParams) {
        let cfg = test_genesis(&Keypair::generate().address(), 1_000);
        let genesis = cfg.build_genesis_block();
        let mut set = UtxoSet::new();
        for tx in &genesis.transactions {
            let (adds, _) = UtxoSet::diff_for_transaction(tx, 0);
            for u in adds {
                set.add(u).unwrap();
            }
        }
        (genesis, set, cfg.network_params)
    }

    fn mined_child(genesis: &Block, params: &NetworkParams, miner: &str, ts: u64) -> Block {
        let coinbase = Transaction::coinbase(miner, params.mining_reward, ts);
        let mut block = Block::new(1, genesis.calculate_hash(), ts, params.initial_difficulty, vec![coinbase]);
        mining::mine(&mut block).unwrap();
        block
    }

    #[test]
    fn test_valid_block_accepted() {
        let (genesis, set, params) = setup();
        let ts = genesis.timestamp() + 300_000;
        let block = mined_child(&genesis, &params, &Keypair::generate().address(), ts);
        let ctx = BlockContext {
            parent: Some(&genesis),
            prior_timestamps: &[genesis.timestamp()],
            retarget_window: &[],
            utxo_set: &set,
            params: &params,
            now_ms: ts,
        };
        validate_block(&block, &ctx).unwrap();
    }

    #[test]
    fn test_wrong_prev_hash_rejected() {
        let (genesis, set, params) = setup();
        let ts = genesis.timestamp() + 300_000;
        let mut block = mined_child(&genesis, &params, &Keypair::generate().address(), ts);
        block.header.previous_hash = "00".repeat(32);
        mining::mine(&mut block).unwrap();
        let ctx = BlockContext {
            parent: Some(&genesis),
            prior_timestamps: &[genesis.timestamp()],
            retarget_window: &[],
            utxo_set: &set,
            params: &params,
            now_ms: ts,
        };
        assert!(matches!(
            validate_block(&block, &ctx),
            Err(CoreError::Consensus(_))
        ));
    }

    #[test]
    fn test_timestamp_at_median_rejected_one_ms_later_accepted() {
        let (genesis, set, params) = setup();
        let median = genesis.timestamp();
        let miner = Keypair::generate().address();

        let at_median = mined_child(&genesis, &params, &miner, median);
        let ctx = BlockContext {
            parent: Some(&genesis),
            prior_timestamps: &[median],
            retarget_window: &[],
            utxo_set: &set,
            params: &params,
            now_ms: median + 10_000,
        };
        assert!(validate_block(&at_median, &ctx).is_err());

        let one_later = mined_child(&genesis, &params, &miner, median + 1);
        assert!(validate_block(&one_later, &ctx).is_ok());
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let (genesis, set, params) = setup();
        let now = genesis.timestamp() + 1_000;
        let ts = now + MAX_FUTURE_DRIFT_MS + 1;
        let block = mined_child(&genesis, &params, &Keypair::generate().address(), ts);
        let ctx = BlockContext {
            parent: Some(&genesis),
            prior_timestamps: &[genesis.timestamp()],
            retarget_window: &[],
            utxo_set: &set,
            params: &params,
            now_ms: now,
        };
        assert!(validate_block(&block, &ctx).is_err());
    }

    #[test]
    fn test_wrong_coinbase_payout_rejected() {
        let (genesis, set, params) = setup();
        let ts = genesis.timestamp() + 300_000;
        let coinbase = Transaction::coinbase("lora1miner", params.mining_reward + 1, ts);
        let mut block = Block::new(
            1,
            genesis.calculate_hash(),
            ts,
            params.initial_difficulty,
            vec![coinbase],
        );
        mining::mine(&mut block).unwrap();
        let ctx = BlockContext {
            parent: Some(&genesis),
            prior_timestamps: &[genesis.timestamp()],
            retarget_window: &[],
            utxo_set: &set,
            params: &params,
            now_ms: ts,
        };
        let err = validate_block(&block, &ctx).unwrap_err();
        assert!(err.to_string().contains("coinbase"));
    }

    #[test]
    fn test_off_schedule_difficulty_rejected() {
        let (genesis, set, params) = setup();
        let ts = genesis.timestamp() + 300_000;
        let coinbase = Transaction::coinbase("lora1miner", params.mining_reward, ts);
        let mut block = Block::new(
            1,
            genesis.calculate_hash(),
            ts,
            params.initial_difficulty + 1,
            vec![coinbase],
        );
        mining::mine(&mut block).unwrap();
        let ctx = BlockContext {
            parent: Some(&genesis),
            prior_timestamps: &[genesis.timestamp()],
            retarget_window: &[],
            utxo_set: &set,
            params: &params,
            now_ms: ts,
        };
        let err = validate_block(&block, &ctx).unwrap_err();
        assert!(err.to_string().contains("difficulty"));
    }
}
