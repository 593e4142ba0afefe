use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::tx::Transaction;

/// One unspent transaction output.
///
/// Entries in the active set are unspent by definition; `spent` only ever
/// flips to true on audit copies handed out of the set (history records).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Utxo {
    pub tx_id: String,
    pub output_index: u32,
    pub value: u64,
    /// Address-bearing locking script (the `lora1...` address).
    pub locking_script: String,
    /// Height of the block that produced this output.
    pub block_height: u64,
    pub spent: bool,
}

impl Utxo {
    pub fn key(&self) -> UtxoKey {
        (self.tx_id.clone(), self.output_index)
    }

    pub fn outpoint(&self) -> String {
        format!("{}:{}", self.tx_id, self.output_index)
    }

    pub fn address(&self) -> &str {
        &self.locking_script
    }
}

/// (tx_id, output_index) — the primary key of the active set.
pub type UtxoKey = (String, u32);

/// The active UTXO set: ordered primary map plus an address index.
///
/// Owned exclusively by the kernel. Everything here is synchronous and
/// infallible except [`UtxoSet::apply_updates`], which is all-or-nothing.
#[derive(Debug, Default, Clone)]
pub struct UtxoSet {
    utxos: BTreeMap<UtxoKey, Utxo>,
    /// address -> keys of outputs locked to it. Kept consistent with the
    /// primary map by every mutation.
    by_address: HashMap<String, HashSet<UtxoKey>>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    pub fn contains(&self, key: &UtxoKey) -> bool {
        self.utxos.contains_key(key)
    }

    pub fn get(&self, key: &UtxoKey) -> Option<&Utxo> {
        self.utxos.get(key)
    }

    /// Insert a UTXO. Replacing an existing entry for the same outpoint is
    /// a programming error upstream, so it is rejected.
    pub fn add(&mut self, utxo: Utxo) -> Result<()> {
        let key = utxo.key();
        if self.utxos.contains_key(&key) {
            return Err(CoreError::UtxoConflict(format!(
                "outpoint {} already in active set",
                utxo.outpoint()
            )));
        }
        self.by_address
            .entry(utxo.locking_script.clone())
            .or_default()
            .insert(key.clone());
        self.utxos.insert(key, utxo);
        Ok(())
    }

    /// Remove and return a UTXO; the address index entry goes with it.
    pub fn remove(&mut self, key: &UtxoKey) -> Result<Utxo> {
        let utxo = self.utxos.remove(key).ok_or_else(|| {
            CoreError::UtxoConflict(format!("outpoint {}:{} not in active set", key.0, key.1))
        })?;
        if let Some(keys) = self.by_address.get_mut(&utxo.locking_script) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_address.remove(&utxo.locking_script);
            }
        }
        Ok(utxo)
    }

    pub fn get_for_address(&self, address: &str) -> Vec<Utxo> {
        let mut found: Vec<Utxo> = self
            .by_address
            .get(address)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| self.utxos.get(k))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        found.sort_by(|a, b| a.key().cmp(&b.key()));
        found
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.by_address
            .get(address)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| self.utxos.get(k))
                    .map(|u| u.value)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Immutable copy for lock-free readers.
    pub fn snapshot(&self) -> UtxoSet {
        self.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Utxo> {
        self.utxos.values()
    }

    /// Atomically apply a batch: every `removes` key must exist, every
    /// `adds` key must be fresh, and no outpoint may appear twice in
    /// `removes`. On any violation nothing changes.
    pub fn apply_updates(&mut self, adds: Vec<Utxo>, removes: &[UtxoKey]) -> Result<()> {
        let mut seen = HashSet::new();
        for key in removes {
            if !seen.insert(key.clone()) {
                return Err(CoreError::UtxoConflict(format!(
                    "outpoint {}:{} removed twice in one batch",
                    key.0, key.1
                )));
            }
            if !self.utxos.contains_key(key) {
                return Err(CoreError::UtxoConflict(format!(
                    "outpoint {}:{} not in active set",
                    key.0, key.1
                )));
            }
        }
        let mut fresh = HashSet::new();
        for utxo in &adds {
            let key = utxo.key();
            if self.utxos.contains_key(&key) || !fresh.insert(key) {
                return Err(CoreError::UtxoConflict(format!(
                    "outpoint {} already in active set",
                    utxo.outpoint()
                )));
            }
        }

        // Checks passed; mutations below cannot fail.
        for key in removes {
            let _ = self.remove(key);
        }
        for utxo in adds {
            let _ = self.add(utxo);
        }
        Ok(())
    }

    /// The diff a transaction applies: outputs created, outpoints consumed.
    pub fn diff_for_transaction(tx: &Transaction, block_height: u64) -> (Vec<Utxo>, Vec<UtxoKey>) {
        let adds = tx
            .outputs
            .iter()
            .map(|o| Utxo {
                tx_id: tx.id.clone(),
                output_index: o.output_index,
                value: o.value,
                locking_script: o.locking_script.clone(),
                block_height,
                spent: false,
            })
            .collect();
        let removes = tx
            .inputs
            .iter()
            .map(|i| (i.prev_tx_hash.clone(), i.output_index))
            .collect();
        (adds, removes)
    }

    /// Debug-only consistency check between primary map and address index.
    #[cfg(test)]
    pub fn index_consistent(&self) -> bool {
        let indexed: usize = self.by_address.values().map(|s| s.len()).sum();
        if indexed != self.utxos.len() {
            return false;
        }
        self.utxos.iter().all(|(key, utxo)| {
            self.by_address
                .get(&utxo.locking_script)
                .map(|keys| keys.contains(key))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(tx_id: &str, idx: u32, value: u64, addr: &str) -> Utxo {
        Utxo {
            tx_id: tx_id.to_string(),
            output_index: idx,
            value,
            locking_script: addr.to_string(),
            block_height: 1,
            spent: false,
        }
    }

    #[test]
    fn test_add_get_balance() {
        let mut set = UtxoSet::new();
        set.add(utxo("t1", 0, 100, "lora1a")).unwrap();
        set.add(utxo("t1", 1, 50, "lora1a")).unwrap();
        set.add(utxo("t2", 0, 25, "lora1b")).unwrap();

        assert_eq!(set.balance("lora1a"), 150);
        assert_eq!(set.balance("lora1b"), 25);
        assert_eq!(set.balance("lora1c"), 0);
        assert_eq!(set.get_for_address("lora1a").len(), 2);
        assert!(set.index_consistent());
    }

    #[test]
    fn test_duplicate_outpoint_rejected() {
        let mut set = UtxoSet::new();
        set.add(utxo("t1", 0, 100, "lora1a")).unwrap();
        assert!(set.add(utxo("t1", 0, 5, "lora1b")).is_err());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_remove_updates_index() {
        let mut set = UtxoSet::new();
        set.add(utxo("t1", 0, 100, "lora1a")).unwrap();
        set.remove(&("t1".to_string(), 0)).unwrap();
        assert_eq!(set.balance("lora1a"), 0);
        assert!(set.get_for_address("lora1a").is_empty());
        assert!(set.index_consistent());
    }

    #[test]
    fn test_apply_updates_atomic_on_missing_remove() {
        let mut set = UtxoSet::new();
        set.add(utxo("t1", 0, 100, "lora1a")).unwrap();

        let result = set.apply_updates(
            vec![utxo("t2", 0, 40, "lora1b")],
            &[("t1".to_string(), 0), ("missing".to_string(), 0)],
        );
        assert!(result.is_err());
        // Nothing applied: t1:0 still present, t2:0 absent.
        assert!(set.contains(&("t1".to_string(), 0)));
        assert!(!set.contains(&("t2".to_string(), 0)));
        assert!(set.index_consistent());
    }

    #[test]
    fn test_apply_updates_atomic_on_duplicate_add() {
        let mut set = UtxoSet::new();
        set.add(utxo("t1", 0, 100, "lora1a")).unwrap();

        let result = set.apply_updates(
            vec![utxo("t2", 0, 40, "lora1b"), utxo("t2", 0, 41, "lora1c")],
            &[],
        );
        assert!(result.is_err());
        assert_eq!(set.len(), 1);
        assert!(set.index_consistent());
    }

    #[test]
    fn test_apply_updates_success() {
        let mut set = UtxoSet::new();
        set.add(utxo("t1", 0, 100, "lora1a")).unwrap();

        set.apply_updates(
            vec![utxo("t2", 0, 60, "lora1b"), utxo("t2", 1, 39, "lora1a")],
            &[("t1".to_string(), 0)],
        )
        .unwrap();

        assert_eq!(set.balance("lora1a"), 39);
        assert_eq!(set.balance("lora1b"), 60);
        assert!(set.index_consistent());
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut set = UtxoSet::new();
        set.add(utxo("t1", 0, 100, "lora1a")).unwrap();
        let snap = set.snapshot();
        set.remove(&("t1".to_string(), 0)).unwrap();
        assert_eq!(snap.balance("lora1a"), 100);
        assert_eq!(set.balance("lora1a"), 0);
    }
}
