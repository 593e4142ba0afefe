use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use heed::byteorder::BigEndian;
use heed::types::*;
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};

use crate::blockchain::block::Block;
use crate::blockchain::genesis::GenesisConfig;
use crate::blockchain::utxo::{Utxo, UtxoKey};
use crate::error::{CoreError, Result};
use crate::mesh::dutycycle::TransmissionRecord;
use crate::tx::Transaction;

/// Direction of an address history entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// One row of an address's transaction history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub address: String,
    pub tx_id: String,
    pub height: u64,
    pub timestamp: u64,
    pub amount: u64,
    pub direction: Direction,
}

/// Values of the `meta` sublevel.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum MetaValue {
    /// Latest height and tip hash.
    Tail { height: u64, hash: String },
    /// Sealed genesis: the config and the hash its block must reproduce.
    Genesis { config: GenesisConfig, hash: String },
}

const TAIL_KEY: &str = "tail";

/// LMDB-backed chain store.
///
/// Named databases are the sublevels; a single write transaction is the
/// atomic multi-key batch. Every state transition touching more than one
/// key goes through one transaction.
#[derive(Clone, Debug)]
pub struct ChainStore {
    env: Env,
    // Sublevels
    blocks: Database<Str, SerdeBincode<Block>>, // hash -> Block
    height_to_hash: Database<U64<BigEndian>, Str>, // height -> hash
    txs: Database<Str, SerdeBincode<Transaction>>, // confirmed tx id -> tx
    tx_height: Database<Str, U64<BigEndian>>,   // tx id -> containing height
    utxos: Database<Str, SerdeBincode<Utxo>>,   // "txid:index" -> Utxo
    utxos_by_address: Database<Str, Str>,       // "addr/txid:index" -> "txid:index"
    pending: Database<Str, SerdeBincode<Transaction>>, // pending tx id -> tx
    meta: Database<Str, SerdeBincode<MetaValue>>,
    history: Database<Str, SerdeBincode<HistoryEntry>>, // "addr/height:txid"
    transmissions: Database<U64<BigEndian>, SerdeBincode<TransmissionRecord>>,
    tx_seq: Arc<AtomicU16>,
}

fn utxo_db_key(key: &UtxoKey) -> String {
    format!("{}:{}", key.0, key.1)
}

fn address_index_key(address: &str, key: &UtxoKey) -> String {
    format!("{}/{}:{}", address, key.0, key.1)
}

fn history_db_key(address: &str, height: u64, tx_id: &str) -> String {
    format!("{}/{:016x}:{}", address, height, tx_id)
}

impl ChainStore {
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let map_size_bytes = 1024 * 1024 * 1024; // 1 GB is plenty for a mesh node
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_bytes)
                .max_dbs(10)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let blocks = env.create_database(&mut wtxn, Some("blocks"))?;
        let height_to_hash = env.create_database(&mut wtxn, Some("height_to_hash"))?;
        let txs = env.create_database(&mut wtxn, Some("txs"))?;
        let tx_height = env.create_database(&mut wtxn, Some("tx_height"))?;
        let utxos = env.create_database(&mut wtxn, Some("utxos"))?;
        let utxos_by_address = env.create_database(&mut wtxn, Some("utxos_by_address"))?;
        let pending = env.create_database(&mut wtxn, Some("pending"))?;
        let meta = env.create_database(&mut wtxn, Some("meta"))?;
        let history = env.create_database(&mut wtxn, Some("history"))?;
        let transmissions = env.create_database(&mut wtxn, Some("transmissions"))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            blocks,
            height_to_hash,
            txs,
            tx_height,
            utxos,
            utxos_by_address,
            pending,
            meta,
            history,
            transmissions,
            tx_seq: Arc::new(AtomicU16::new(0)),
        })
    }

    // --- Genesis / tail ---

    pub fn save_genesis(&self, config: &GenesisConfig, genesis_hash: &str) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        let key = format!("genesis/{}", config.chain_id);
        self.meta.put(
            &mut wtxn,
            &key,
            &MetaValue::Genesis {
                config: config.clone(),
                hash: genesis_hash.to_string(),
            },
        )?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn load_genesis(&self, chain_id: &str) -> Result<Option<(GenesisConfig, String)>> {
        let rtxn = self.env.read_txn()?;
        let key = format!("genesis/{}", chain_id);
        match self.meta.get(&rtxn, &key)? {
            Some(MetaValue::Genesis { config, hash }) => Ok(Some((config, hash))),
            _ => Ok(None),
        }
    }

    pub fn tail(&self) -> Result<Option<(u64, String)>> {
        let rtxn = self.env.read_txn()?;
        match self.meta.get(&rtxn, TAIL_KEY)? {
            Some(MetaValue::Tail { height, hash }) => Ok(Some((height, hash))),
            _ => Ok(None),
        }
    }

    // --- Blocks ---

    pub fn get_block(&self, hash: &str) -> Result<Option<Block>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.blocks.get(&rtxn, hash)?)
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        let rtxn = self.env.read_txn()?;
        if let Some(hash) = self.height_to_hash.get(&rtxn, &height)? {
            Ok(self.blocks.get(&rtxn, hash)?)
        } else {
            Ok(None)
        }
    }

    pub fn has_block_at_height(&self, height: u64) -> Result<bool> {
        let rtxn = self.env.read_txn()?;
        Ok(self.height_to_hash.get(&rtxn, &height)?.is_some())
    }

    /// Timestamps for heights [start, end], skipping gaps. Single read
    /// transaction.
    pub fn timestamps_in_range(&self, start: u64, end: u64) -> Result<Vec<u64>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::with_capacity((end.saturating_sub(start) + 1) as usize);
        for h in start..=end {
            if let Some(hash) = self.height_to_hash.get(&rtxn, &h)? {
                if let Some(block) = self.blocks.get(&rtxn, hash)? {
                    out.push(block.timestamp());
                }
            }
        }
        Ok(out)
    }

    // --- Transactions ---

    pub fn get_transaction(&self, tx_id: &str) -> Result<Option<(Transaction, u64)>> {
        let rtxn = self.env.read_txn()?;
        let tx = match self.txs.get(&rtxn, tx_id)? {
            Some(tx) => tx,
            None => return Ok(None),
        };
        let height = self.tx_height.get(&rtxn, tx_id)?.unwrap_or(0);
        Ok(Some((tx, height)))
    }

    // --- UTXOs ---

    pub fn get_utxo(&self, key: &UtxoKey) -> Result<Option<Utxo>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.utxos.get(&rtxn, &utxo_db_key(key))?)
    }

    /// Prefix scan of the address index.
    pub fn utxos_for_address(&self, address: &str) -> Result<Vec<Utxo>> {
        let rtxn = self.env.read_txn()?;
        let prefix = format!("{}/", address);
        let mut out = Vec::new();
        for item in self.utxos_by_address.prefix_iter(&rtxn, &prefix)? {
            let (_, outpoint) = item?;
            if let Some(utxo) = self.utxos.get(&rtxn, outpoint)? {
                out.push(utxo);
            }
        }
        Ok(out)
    }

    /// Full scan, used once at kernel load to rebuild the in-memory set.
    pub fn all_utxos(&self) -> Result<Vec<Utxo>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for item in self.utxos.iter(&rtxn)? {
            let (_, utxo) = item?;
            out.push(utxo);
        }
        Ok(out)
    }

    // --- Pending pool ---

    pub fn put_pending(&self, tx: &Transaction) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.pending.put(&mut wtxn, &tx.id, tx)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn delete_pending(&self, tx_id: &str) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.pending.delete(&mut wtxn, tx_id)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn load_pending(&self) -> Result<Vec<Transaction>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for item in self.pending.iter(&rtxn)? {
            let (_, tx) = item?;
            out.push(tx);
        }
        Ok(out)
    }

    // --- Atomic block application ---

    /// Persist a block and its full state transition in ONE write
    /// transaction: block body + indexes, confirmed transactions, UTXO
    /// diff (with address index), pending removals, history rows, and
    /// the new tail. Either everything lands or nothing does.
    pub fn apply_block_batch(
        &self,
        block: &Block,
        utxo_adds: &[Utxo],
        utxo_removes: &[(UtxoKey, Utxo)],
        history: &[HistoryEntry],
    ) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        let hash = block.calculate_hash();

        self.blocks.put(&mut wtxn, &hash, block)?;
        self.height_to_hash.put(&mut wtxn, &block.index(), &hash)?;

        for tx in &block.transactions {
            self.txs.put(&mut wtxn, &tx.id, tx)?;
            self.tx_height.put(&mut wtxn, &tx.id, &block.index())?;
            self.pending.delete(&mut wtxn, &tx.id)?;
        }

        for (key, utxo) in utxo_removes {
            self.utxos.delete(&mut wtxn, &utxo_db_key(key))?;
            self.utxos_by_address
                .delete(&mut wtxn, &address_index_key(&utxo.locking_script, key))?;
        }
        for utxo in utxo_adds {
            let key = utxo.key();
            let db_key = utxo_db_key(&key);
            self.utxos.put(&mut wtxn, &db_key, utxo)?;
            self.utxos_by_address.put(
                &mut wtxn,
                &address_index_key(&utxo.locking_script, &key),
                &db_key,
            )?;
        }

        for entry in history {
            self.history.put(
                &mut wtxn,
                &history_db_key(&entry.address, entry.height, &entry.tx_id),
                entry,
            )?;
        }

        self.meta.put(
            &mut wtxn,
            TAIL_KEY,
            &MetaValue::Tail {
                height: block.index(),
                hash,
            },
        )?;

        wtxn.commit()?;
        Ok(())
    }

    // --- History ---

    pub fn history_for_address(&self, address: &str) -> Result<Vec<HistoryEntry>> {
        let rtxn = self.env.read_txn()?;
        let prefix = format!("{}/", address);
        let mut out = Vec::new();
        for item in self.history.prefix_iter(&rtxn, &prefix)? {
            let (_, entry) = item?;
            out.push(entry);
        }
        Ok(out)
    }

    // --- Transmission records (rolling window) ---

    /// Append a transmission record. Keys are `timestamp << 16 | seq` so
    /// same-millisecond records stay distinct and time-ordered.
    pub fn record_transmission(&self, record: &TransmissionRecord) -> Result<()> {
        let seq = self.tx_seq.fetch_add(1, Ordering::Relaxed) as u64;
        let key = (record.timestamp << 16) | (seq & 0xFFFF);
        let mut wtxn = self.env.write_txn()?;
        self.transmissions.put(&mut wtxn, &key, record)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn transmissions_since(&self, since_ms: u64) -> Result<Vec<TransmissionRecord>> {
        let rtxn = self.env.read_txn()?;
        let start = since_ms << 16;
        let mut out = Vec::new();
        for item in self.transmissions.range(&rtxn, &(start..))? {
            let (_, record) = item?;
            out.push(record);
        }
        Ok(out)
    }

    /// Age out records older than `before_ms`. Returns how many were
    /// dropped.
    pub fn prune_transmissions(&self, before_ms: u64) -> Result<usize> {
        let cutoff = before_ms << 16;
        let mut wtxn = self.env.write_txn()?;
        let mut keys = Vec::new();
        {
            let iter = self.transmissions.range(&wtxn, &(..cutoff))?;
            for item in iter {
                let (key, _) = item?;
                keys.push(key);
            }
        }
        let count = keys.len();
        for key in keys {
            self.transmissions.delete(&mut wtxn, &key)?;
        }
        wtxn.commit()?;
        Ok(count)
    }

    // --- Maintenance ---

    /// Compaction hint: copy the environment to a compacted file next to
    /// the data directory. Best effort.
    pub fn compact(&self, target: &Path) -> Result<()> {
        let mut file = std::fs::File::create(target)?;
        self.env
            .copy_to_file(&mut file, heed::CompactionOption::Enabled)
            .map(|_| ())
            .map_err(CoreError::from)
    }

    pub fn flush(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }

    /// Release the environment. Outstanding clones keep it alive until
    /// they drop; the returned event can be awaited by callers that need
    /// the files unlocked.
    pub fn close(self) {
        let Self { env, .. } = self;
        let _event = env.prepare_for_closing();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::genesis::testutil::test_genesis;
    use crate::crypto::keys::Keypair;
    use crate::mesh::dutycycle::Priority;
    use crate::tx::ZERO_HASH;

    fn store() -> (ChainStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();
        (store, dir)
    }

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
    fn test_genesis_seal_round_trip() {
        let (store, _dir) = store();
        let cfg = test_genesis(&Keypair::generate().address(), 1_000);
        let hash = cfg.build_genesis_block().calculate_hash();

        assert!(store.load_genesis(&cfg.chain_id).unwrap().is_none());
        store.save_genesis(&cfg, &hash).unwrap();
        let (loaded, stored_hash) = store.load_genesis(&cfg.chain_id).unwrap().unwrap();
        assert_eq!(loaded, cfg);
        assert_eq!(stored_hash, hash);
    }

    #[test]
    fn test_apply_block_batch_is_atomic_state() {
        let (store, _dir) = store();
        let addr = Keypair::generate().address();
        let block = Block::new(1, ZERO_HASH.to_string(), 1_000, 1, vec![]);

        let spent = utxo("old", 0, 40, &addr);
        // Seed the spent UTXO first, as a prior block would have.
        store
            .apply_block_batch(
                &Block::new(0, ZERO_HASH.to_string(), 500, 1, vec![]),
                &[spent.clone()],
                &[],
                &[],
            )
            .unwrap();

        let added = utxo("new", 0, 25, &addr);
        store
            .apply_block_batch(
                &block,
                &[added.clone()],
                &[(spent.key(), spent.clone())],
                &[HistoryEntry {
                    address: addr.clone(),
                    tx_id: "new".into(),
                    height: 1,
                    timestamp: 1_000,
                    amount: 25,
                    direction: Direction::Received,
                }],
            )
            .unwrap();

        assert_eq!(store.tail().unwrap(), Some((1, block.calculate_hash())));
        assert!(store.get_utxo(&spent.key()).unwrap().is_none());
        assert_eq!(store.get_utxo(&added.key()).unwrap().unwrap(), added);
        assert_eq!(store.utxos_for_address(&addr).unwrap().len(), 1);
        assert_eq!(store.history_for_address(&addr).unwrap().len(), 1);
        assert_eq!(
            store.get_block_by_height(1).unwrap().unwrap().calculate_hash(),
            block.calculate_hash()
        );
    }

    #[test]
    fn test_pending_round_trip() {
        let (store, _dir) = store();
        let tx = crate::tx::Transaction::coinbase("lora1x", 5, 123);
        store.put_pending(&tx).unwrap();
        assert_eq!(store.load_pending().unwrap().len(), 1);
        store.delete_pending(&tx.id).unwrap();
        assert!(store.load_pending().unwrap().is_empty());
    }

    #[test]
    fn test_transmission_window() {
        let (store, _dir) = store();
        for ts in [100u64, 200, 300] {
            store
                .record_transmission(&TransmissionRecord {
                    timestamp: ts,
                    duration_ms: 10,
                    frequency_mhz: 868.1,
                    power_dbm: 14,
                    priority: Priority::Normal,
                    message_type: "transaction".into(),
                    message_size: 64,
                })
                .unwrap();
        }
        assert_eq!(store.transmissions_since(0).unwrap().len(), 3);
        assert_eq!(store.transmissions_since(150).unwrap().len(), 2);
        assert_eq!(store.prune_transmissions(250).unwrap(), 2);
        assert_eq!(store.transmissions_since(0).unwrap().len(), 1);
    }

    #[test]
    fn test_same_millisecond_records_kept_distinct() {
        let (store, _dir) = store();
        for _ in 0..3 {
            store
                .record_transmission(&TransmissionRecord {
                    timestamp: 777,
                    duration_ms: 5,
                    frequency_mhz: 868.1,
                    power_dbm: 14,
                    priority: Priority::Low,
                    message_type: "hello".into(),
                    message_size: 16,
                })
                .unwrap();
        }
        assert_eq!(store.transmissions_since(777).unwrap().len(), 3);
    }
}
