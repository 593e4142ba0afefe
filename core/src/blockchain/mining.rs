use log::debug;

use crate::blockchain::block::Block;
use crate::blockchain::genesis::NetworkParams;
use crate::error::{CoreError, Result};
use crate::tx::Transaction;

/// Upper bound on the nonce search. At the difficulties this chain runs
/// (single-digit leading-zero bits) the search ends after a handful of
/// hashes; exhaustion means the caller asked for an absurd difficulty.
pub const MAX_NONCE: u64 = u64::MAX;

/// Assemble an unsealed candidate block: coinbase first (reward + fees
/// to the miner), then the given transactions in fee order as handed in.
pub fn assemble(
    index: u64,
    previous_hash: String,
    timestamp: u64,
    difficulty: u32,
    miner_address: &str,
    reward: u64,
    transactions: Vec<Transaction>,
) -> Block {
    let fees: u64 = transactions.iter().map(|tx| tx.fee).sum();
    let coinbase = Transaction::coinbase(miner_address, reward + fees, timestamp);

    let mut txs = Vec::with_capacity(transactions.len() + 1);
    txs.push(coinbase);
    txs.extend(transactions);

    Block::new(index, previous_hash, timestamp, difficulty, txs)
}

/// Select transactions from `candidates` (already fee-rate ordered,
/// highest first) until the serialized block would exceed `params`'
/// size budget. Returns the included transactions.
pub fn select_for_block(candidates: Vec<Transaction>, params: &NetworkParams) -> Vec<Transaction> {
    // Reserve room for header + coinbase.
    let mut budget = params.max_block_size_bytes.saturating_sub(512);
    let mut included = Vec::new();
    for tx in candidates {
        let size = tx.size_bytes();
        if size > budget {
            continue;
        }
        budget -= size;
        included.push(tx);
    }
    included
}

/// Proof-of-work search: increment the nonce until the header hash leads
/// with at least `difficulty` zero bits, then seal the block.
pub fn mine(block: &mut Block) -> Result<()> {
    for nonce in 0..=MAX_NONCE {
        block.header.nonce = nonce;
        if block.header.meets_difficulty() {
            block.seal();
            debug!(
                "mined height {} nonce {} difficulty {}",
                block.index(),
                nonce,
                block.difficulty()
            );
            return Ok(());
        }
    }
    Err(CoreError::Consensus(format!(
        "nonce space exhausted at difficulty {}",
        block.difficulty()
    )))
}
