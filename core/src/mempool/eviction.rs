use crate::mempool::Mempool;

/// Evict transactions until the pool holds at most `max_txs`.
///
/// Policy: lowest fee rate first; ties break by oldest timestamp.
/// Freed outpoints leave the spent-outpoints set. Returns the number of
/// evicted transactions.
pub fn evict_to_limit(mempool: &Mempool, max_txs: usize) -> usize {
    let mut pool = mempool.transactions.write();
    if pool.len() <= max_txs {
        return 0;
    }

    let mut candidates: Vec<(String, u64, u64)> = pool
        .values()
        .map(|tx| (tx.id.clone(), tx.fee_rate(), tx.timestamp))
        .collect();

    // Ascending by fee rate, then by timestamp (oldest first)
    candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

    let to_remove = pool.len().saturating_sub(max_txs);
    let mut spent = mempool.spent_outpoints.write();

    for (tx_id, _, _) in candidates.into_iter().take(to_remove) {
        if let Some(tx) = pool.remove(&tx_id) {
            for input in &tx.inputs {
                spent.remove(&input.outpoint());
            }
        }
    }

    to_remove
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::{Transaction, TxInput, TxOutput};

    fn tx(id: &str, fee: u64, timestamp: u64) -> Transaction {
        Transaction {
            id: id.to_string(),
            inputs: vec![TxInput {
                prev_tx_hash: format!("utxo_{}", id),
                output_index: 0,
                signature: "a".repeat(128),
                public_key: "b".repeat(64),
                sequence: 0,
            }],
            outputs: vec![TxOutput {
                value: 1_000,
                locking_script: "lora1test".to_string(),
                output_index: 0,
            }],
            lock_time: 0,
            timestamp,
            fee,
        }
    }

    #[test]
    fn test_evicts_lowest_fee_rate_first() {
        let pool = Mempool::new();
        pool.add_transaction(tx("cheap", 1, 10)).unwrap();
        pool.add_transaction(tx("rich", 90_000, 20)).unwrap();
        pool.add_transaction(tx("mid", 2_000, 30)).unwrap();

        let evicted = evict_to_limit(&pool, 2);
        assert_eq!(evicted, 1);
        assert!(pool.get_transaction("cheap").is_none());
        assert!(pool.get_transaction("rich").is_some());
        assert!(pool.get_transaction("mid").is_some());
    }

    #[test]
    fn test_eviction_frees_outpoints() {
        let pool = Mempool::new();
        pool.add_transaction(tx("cheap", 1, 10)).unwrap();
        pool.add_transaction(tx("rich", 90_000, 20)).unwrap();
        evict_to_limit(&pool, 1);
        assert!(!pool.is_outpoint_spent("utxo_cheap", 0));
        assert!(pool.is_outpoint_spent("utxo_rich", 0));
    }

    #[test]
    fn test_no_eviction_under_limit() {
        let pool = Mempool::new();
        pool.add_transaction(tx("a", 10, 1)).unwrap();
        assert_eq!(evict_to_limit(&pool, 5), 0);
        assert_eq!(pool.size(), 1);
    }
}
