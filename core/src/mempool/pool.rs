use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::blockchain::fee;
use crate::tx::Transaction;

/// Maximum number of pending transactions. Beyond this, lowest-fee-rate
/// entries are evicted.
pub const MAX_POOL_SIZE: usize = 2_048;

/// Maximum total byte size of the pool — a mesh node has little memory
/// to spare for other people's transactions.
pub const MAX_POOL_BYTES: usize = 2 * 1024 * 1024;

/// Result of attempting to add a transaction to the pending pool.
#[derive(Debug, Clone, PartialEq)]
pub enum MempoolError {
    /// Transaction already pending
    Duplicate,
    /// Fee below the policy minimum
    FeeTooLow(String),
    /// Transaction size exceeds MAX_TX_SIZE_BYTES
    TxTooLarge(usize),
    /// One or more inputs are already spent by another pending tx
    DoubleSpend(String),
    /// Output value validation failed
    InvalidOutputValue(String),
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MempoolError::Duplicate => write!(f, "transaction already pending"),
            MempoolError::FeeTooLow(msg) => write!(f, "fee too low: {}", msg),
            MempoolError::TxTooLarge(size) => write!(
                f,
                "transaction too large: {} bytes (max {})",
                size,
                fee::MAX_TX_SIZE_BYTES
            ),
            MempoolError::DoubleSpend(outpoint) => {
                write!(f, "double-spend: input {} already spent", outpoint)
            }
            MempoolError::InvalidOutputValue(msg) => write!(f, "invalid output value: {}", msg),
        }
    }
}

/// The pending pool. Membership is owned by the kernel; the pool itself
/// is internally locked so kernel queries can run against it directly.
#[derive(Debug, Clone, Default)]
pub struct Mempool {
    /// Map transaction ID → Transaction
    pub(crate) transactions: Arc<RwLock<HashMap<String, Transaction>>>,
    /// Set of spent outpoints "prev_tx_hash:output_index" for O(1)
    /// double-spend detection.
    pub(crate) spent_outpoints: Arc<RwLock<HashSet<String>>>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transaction with pool-level validation:
    /// duplicate, size, fee, output values, double-spend. Evicts the
    /// lowest fee rate when full.
    pub fn add_transaction(&self, tx: Transaction) -> Result<(), MempoolError> {
        let tx_size = tx.size_bytes();

        if tx_size > fee::MAX_TX_SIZE_BYTES {
            return Err(MempoolError::TxTooLarge(tx_size));
        }

        if let Err(msg) = fee::validate_fee(tx.fee, tx_size) {
            return Err(MempoolError::FeeTooLow(msg));
        }

        let values: Vec<u64> = tx.outputs.iter().map(|o| o.value).collect();
        if let Err(msg) = fee::validate_output_values(&values) {
            return Err(MempoolError::InvalidOutputValue(msg));
        }

        let mut pool = self.transactions.write();
        let mut spent = self.spent_outpoints.write();

        if pool.contains_key(&tx.id) {
            return Err(MempoolError::Duplicate);
        }

        for input in &tx.inputs {
            if spent.contains(&input.outpoint()) {
                return Err(MempoolError::DoubleSpend(input.outpoint()));
            }
        }

        for input in &tx.inputs {
            spent.insert(input.outpoint());
        }
        pool.insert(tx.id.clone(), tx);

        let over_count = pool.len() > MAX_POOL_SIZE;
        let over_bytes =
            pool.values().map(|t| t.size_bytes()).sum::<usize>() > MAX_POOL_BYTES;
        drop(pool);
        drop(spent);

        if over_count {
            self.evict_to_limit(MAX_POOL_SIZE);
        } else if over_bytes {
            // Evict ~10% to avoid constant eviction churn
            let target = self.size().saturating_sub(self.size() / 10);
            self.evict_to_limit(target);
        }

        Ok(())
    }

    pub fn get_transaction(&self, tx_id: &str) -> Option<Transaction> {
        self.transactions.read().get(tx_id).cloned()
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.transactions.read().contains_key(tx_id)
    }

    pub fn remove_transaction(&self, tx_id: &str) {
        let mut pool = self.transactions.write();
        if let Some(tx) = pool.remove(tx_id) {
            let mut spent = self.spent_outpoints.write();
            for input in &tx.inputs {
                spent.remove(&input.outpoint());
            }
        }
    }

    pub fn size(&self) -> usize {
        self.transactions.read().len()
    }

    /// All pending transactions sorted by fee rate (highest first), ties
    /// broken oldest first — the block template order.
    pub fn sorted_by_fee_rate(&self) -> Vec<Transaction> {
        let pool = self.transactions.read();
        let mut txs: Vec<Transaction> = pool.values().cloned().collect();
        txs.sort_by(|a, b| {
            b.fee_rate()
                .cmp(&a.fee_rate())
                .then(a.timestamp.cmp(&b.timestamp))
        });
        txs
    }

    pub fn get_all(&self) -> Vec<Transaction> {
        self.transactions.read().values().cloned().collect()
    }

    pub fn is_outpoint_spent(&self, prev_tx_hash: &str, output_index: u32) -> bool {
        self.spent_outpoints
            .read()
            .contains(&format!("{}:{}", prev_tx_hash, output_index))
    }

    pub fn evict_to_limit(&self, max_txs: usize) -> usize {
        crate::mempool::eviction::evict_to_limit(self, max_txs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::{TxInput, TxOutput};

    pub(crate) fn make_tx(id: &str, fee: u64, inputs: Vec<(&str, u32)>, outputs: Vec<u64>) -> Transaction {
        Transaction {
            id: id.to_string(),
            inputs: inputs
                .iter()
                .map(|(hash, idx)| TxInput {
                    prev_tx_hash: hash.to_string(),
                    output_index: *idx,
                    signature: "a".repeat(128),
                    public_key: "b".repeat(64),
                    sequence: 0,
                })
                .collect(),
            outputs: outputs
                .iter()
                .enumerate()
                .map(|(i, v)| TxOutput {
                    value: *v,
                    locking_script: "lora1test".to_string(),
                    output_index: i as u32,
                })
                .collect(),
            lock_time: 0,
            timestamp: 100,
            fee,
        }
    }

    #[test]
    fn test_add_valid_tx() {
        let pool = Mempool::new();
        let tx = make_tx("tx1", 50, vec![("aaa", 0)], vec![1_000]);
        assert!(pool.add_transaction(tx).is_ok());
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_reject_duplicate() {
        let pool = Mempool::new();
        let tx = make_tx("tx1", 50, vec![("aaa", 0)], vec![1_000]);
        assert!(pool.add_transaction(tx.clone()).is_ok());
        assert_eq!(pool.add_transaction(tx), Err(MempoolError::Duplicate));
    }

    #[test]
    fn test_reject_double_spend() {
        let pool = Mempool::new();
        let tx1 = make_tx("tx1", 50, vec![("utxo1", 0)], vec![1_000]);
        let tx2 = make_tx("tx2", 50, vec![("utxo1", 0)], vec![900]); // same input!
        assert!(pool.add_transaction(tx1).is_ok());
        assert!(matches!(
            pool.add_transaction(tx2),
            Err(MempoolError::DoubleSpend(_))
        ));
    }

    #[test]
    fn test_outpoint_freed_on_remove() {
        let pool = Mempool::new();
        let tx1 = make_tx("tx1", 50, vec![("utxo1", 0)], vec![1_000]);
        pool.add_transaction(tx1).unwrap();
        pool.remove_transaction("tx1");

        let tx2 = make_tx("tx2", 50, vec![("utxo1", 0)], vec![900]);
        assert!(pool.add_transaction(tx2).is_ok());
    }

    #[test]
    fn test_reject_zero_output() {
        let pool = Mempool::new();
        let tx = make_tx("tx1", 50, vec![("aaa", 0)], vec![0]);
        assert!(matches!(
            pool.add_transaction(tx),
            Err(MempoolError::InvalidOutputValue(_))
        ));
    }

    #[test]
    fn test_sorted_by_fee_rate() {
        let pool = Mempool::new();
        pool.add_transaction(make_tx("low", 1, vec![("a", 0)], vec![1_000]))
            .unwrap();
        pool.add_transaction(make_tx("high", 5_000, vec![("b", 0)], vec![1_000]))
            .unwrap();
        pool.add_transaction(make_tx("mid", 800, vec![("c", 0)], vec![1_000]))
            .unwrap();

        let sorted = pool.sorted_by_fee_rate();
        assert_eq!(sorted[0].id, "high");
        assert_eq!(sorted[1].id, "mid");
        assert_eq!(sorted[2].id, "low");
    }

    #[test]
    fn test_outpoint_tracking() {
        let pool = Mempool::new();
        pool.add_transaction(make_tx("tx1", 50, vec![("utxo_abc", 2)], vec![1_000]))
            .unwrap();
        assert!(pool.is_outpoint_spent("utxo_abc", 2));
        assert!(!pool.is_outpoint_spent("utxo_abc", 0));
        assert!(!pool.is_outpoint_spent("other", 2));
    }
}
