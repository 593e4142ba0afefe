use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::blockchain::block::Block;
use crate::blockchain::difficulty;
use crate::blockchain::genesis::{GenesisConfig, NetworkParams};
use crate::blockchain::mining;
use crate::blockchain::utxo::{Utxo, UtxoKey, UtxoSet};
use crate::blockchain::validation::{self, BlockContext};
use crate::error::{CoreError, Result};
use crate::events::{EventBus, NodeEvent};
use crate::mempool::{Mempool, MempoolError};
use crate::metrics::Metrics;
use crate::now_ms;
use crate::storage::{ChainStore, Direction, HistoryEntry};
use crate::tx::{builder, Transaction};

/// Kernel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Uninitialized = 0,
    Loading = 1,
    Ready = 2,
    Closing = 3,
}

impl Lifecycle {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Lifecycle::Loading,
            2 => Lifecycle::Ready,
            3 => Lifecycle::Closing,
            _ => Lifecycle::Uninitialized,
        }
    }
}

/// The blockchain kernel.
///
/// Exclusively owns the UTXO set, the chain tail, and pending-pool
/// membership. All state-mutating operations (`submit_transaction`,
/// `mine_block`, `accept_block`) are serialized through `mutation_lock`;
/// queries read snapshots and never block writers for long.
#[derive(Debug)]
pub struct Inner {
    pub chain_id: String,
    pub params: NetworkParams,
    storage: ChainStore,
    mempool: Mempool,
    utxos: RwLock<UtxoSet>,
    height: AtomicU64,
    tip: Mutex<String>,
    lifecycle: AtomicU8,
    /// Serializes all mutations: no two blocks may touch the UTXO set
    /// concurrently.
    mutation_lock: Mutex<()>,
    pub events: EventBus,
    pub metrics: Arc<Metrics>,
}

pub type Kernel = Arc<Inner>;

impl Inner {
    /// Open the kernel: adopt a compatible persisted genesis or
    /// materialize a fresh one, rebuild the UTXO set, reload the pending
    /// pool, and go `Ready`.
    pub fn open(
        genesis: GenesisConfig,
        storage: ChainStore,
        events: EventBus,
        metrics: Arc<Metrics>,
    ) -> Result<Kernel> {
        genesis.validate()?;
        let lifecycle = AtomicU8::new(Lifecycle::Loading as u8);

        match storage.load_genesis(&genesis.chain_id)? {
            Some((_stored_cfg, stored_hash)) => {
                // Sealed: only a config reproducing the stored genesis
                // hash may reopen this chain.
                if !genesis.matches_sealed_hash(&stored_hash) {
                    return Err(CoreError::Configuration(format!(
                        "genesis config does not reproduce sealed hash {} for chain {}",
                        stored_hash, genesis.chain_id
                    )));
                }
                info!("adopted sealed genesis for chain {}", genesis.chain_id);
            }
            None => {
                let block = genesis.build_genesis_block();
                let hash = block.calculate_hash();
                let mut adds = Vec::new();
                for tx in &block.transactions {
                    let (tx_adds, _) = UtxoSet::diff_for_transaction(tx, 0);
                    adds.extend(tx_adds);
                }
                let history: Vec<HistoryEntry> = adds
                    .iter()
                    .map(|u| HistoryEntry {
                        address: u.locking_script.clone(),
                        tx_id: u.tx_id.clone(),
                        height: 0,
                        timestamp: block.timestamp(),
                        amount: u.value,
                        direction: Direction::Received,
                    })
                    .collect();
                storage.apply_block_batch(&block, &adds, &[], &history)?;
                storage.save_genesis(&genesis, &hash)?;
                info!(
                    "materialized genesis {} for chain {} ({} allocations)",
                    hash,
                    genesis.chain_id,
                    genesis.initial_allocations.len()
                );
            }
        }

        // Rebuild in-memory state from storage.
        let mut set = UtxoSet::new();
        for utxo in storage.all_utxos()? {
            set.add(utxo)?;
        }
        let (height, tip) = storage.tail()?.ok_or_else(|| {
            CoreError::Persistence("no tail after genesis materialization".into())
        })?;

        let mempool = Mempool::new();
        let mut reloaded = 0usize;
        for tx in storage.load_pending()? {
            if mempool.add_transaction(tx).is_ok() {
                reloaded += 1;
            }
        }
        if reloaded > 0 {
            info!("reloaded {} pending transactions", reloaded);
        }

        Metrics::set(&metrics.current_height, height);
        lifecycle.store(Lifecycle::Ready as u8, Ordering::SeqCst);

        Ok(Arc::new(Self {
            chain_id: genesis.chain_id.clone(),
            params: genesis.network_params.clone(),
            storage,
            mempool,
            utxos: RwLock::new(set),
            height: AtomicU64::new(height),
            tip: Mutex::new(tip),
            lifecycle,
            mutation_lock: Mutex::new(()),
            events,
            metrics,
        }))
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Ready => Ok(()),
            other => Err(CoreError::Validation(format!(
                "kernel not ready (state {:?})",
                other
            ))),
        }
    }

    // -----------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------

    /// Validate and admit a transaction to the pending pool.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<()> {
        self.ensure_ready()?;
        let _guard = self.mutation_lock.lock();
        Metrics::incr(&self.metrics.txs_submitted);

        if self.mempool.contains(&tx.id) {
            Metrics::incr(&self.metrics.txs_rejected);
            return Err(CoreError::Validation(format!(
                "duplicate pending transaction {}",
                tx.id
            )));
        }
        if self.storage.get_transaction(&tx.id)?.is_some() {
            Metrics::incr(&self.metrics.txs_rejected);
            return Err(CoreError::Validation(format!(
                "transaction {} already confirmed",
                tx.id
            )));
        }

        // Shape, signatures, input existence, conservation.
        {
            let set = self.utxos.read();
            builder::validate(&tx, &set).map_err(|e| {
                Metrics::incr(&self.metrics.txs_rejected);
                e
            })?;
        }

        // Pending-pool admission (double-spend against other pending txs).
        match self.mempool.add_transaction(tx.clone()) {
            Ok(()) => {}
            Err(MempoolError::DoubleSpend(outpoint)) => {
                Metrics::incr(&self.metrics.txs_rejected);
                return Err(CoreError::UtxoConflict(format!(
                    "outpoint {} already spent by a pending transaction",
                    outpoint
                )));
            }
            Err(e) => {
                Metrics::incr(&self.metrics.txs_rejected);
                return Err(CoreError::Validation(e.to_string()));
            }
        }

        // Persist; on failure restore the pre-operation pool.
        if let Err(e) = self.storage.put_pending(&tx) {
            self.mempool.remove_transaction(&tx.id);
            Metrics::incr(&self.metrics.txs_rejected);
            return Err(e);
        }

        Metrics::incr(&self.metrics.txs_accepted);
        self.events
            .publish(NodeEvent::TransactionAccepted { id: tx.id });
        Ok(())
    }

    /// Mine the next block: drain the pending pool under the size
    /// budget, pay `mining_reward` plus fees to `miner_address`, search
    /// the nonce, and append atomically. Returns `None` only when the
    /// kernel is shutting down.
    pub fn mine_block(&self, miner_address: &str) -> Result<Option<Block>> {
        if self.lifecycle() == Lifecycle::Closing {
            return Ok(None);
        }
        self.ensure_ready()?;
        let _guard = self.mutation_lock.lock();

        let parent_height = self.height.load(Ordering::SeqCst);
        let parent = self
            .storage
            .get_block_by_height(parent_height)?
            .ok_or_else(|| CoreError::Persistence(format!("missing tip {}", parent_height)))?;
        let next_height = parent_height + 1;

        // Candidates already in fee-rate order; re-check against the
        // current UTXO set and drop stale entries.
        let mut valid = Vec::new();
        {
            let set = self.utxos.read();
            for tx in self.mempool.sorted_by_fee_rate() {
                if builder::validate(&tx, &set).is_ok() {
                    valid.push(tx);
                } else {
                    warn!("dropping stale pending tx {}", tx.id);
                    self.mempool.remove_transaction(&tx.id);
                    let _ = self.storage.delete_pending(&tx.id);
                }
            }
        }
        let included = mining::select_for_block(valid, &self.params);

        let next_difficulty = self.scheduled_difficulty(next_height, parent.difficulty())?;
        let prior = self.prior_timestamps(parent_height)?;
        let median = difficulty::median_time_past(&prior).unwrap_or(0);
        let timestamp = now_ms().max(median + 1);

        let mut block = mining::assemble(
            next_height,
            parent.calculate_hash(),
            timestamp,
            next_difficulty,
            miner_address,
            self.params.mining_reward,
            included,
        );
        mining::mine(&mut block)?;

        self.apply_block(&block, &parent)?;
        Metrics::incr(&self.metrics.blocks_mined);
        self.events.publish(NodeEvent::BlockMined {
            height: block.index(),
            hash: block.hash.clone(),
        });
        Ok(Some(block))
    }

    /// Validate a peer block against the tail and append it.
    ///
    /// Idempotent: re-accepting the exact tip block is a no-op. A
    /// competing block at an occupied height is rejected — the first
    /// observed block wins.
    pub fn accept_block(&self, block: Block) -> Result<()> {
        self.ensure_ready()?;
        let _guard = self.mutation_lock.lock();

        let tip_height = self.height.load(Ordering::SeqCst);
        if block.index() <= tip_height {
            let have = self
                .storage
                .get_block_by_height(block.index())?
                .map(|b| b.calculate_hash());
            if have.as_deref() == Some(block.calculate_hash().as_str()) {
                return Ok(()); // already accepted
            }
            Metrics::incr(&self.metrics.blocks_rejected);
            return Err(CoreError::Consensus(format!(
                "height {} already occupied (first observed wins)",
                block.index()
            )));
        }
        if block.index() != tip_height + 1 {
            Metrics::incr(&self.metrics.blocks_rejected);
            return Err(CoreError::Consensus(format!(
                "block height {} does not extend tail {}",
                block.index(),
                tip_height
            )));
        }

        let parent = self
            .storage
            .get_block_by_height(tip_height)?
            .ok_or_else(|| CoreError::Persistence(format!("missing tip {}", tip_height)))?;

        self.apply_block(&block, &parent).map_err(|e| {
            Metrics::incr(&self.metrics.blocks_rejected);
            e
        })?;
        Ok(())
    }

    /// Shared append path: full validation, one storage batch, then the
    /// in-memory mutation. The batch and the memory update commit
    /// together or not at all — a storage failure leaves memory
    /// untouched.
    fn apply_block(&self, block: &Block, parent: &Block) -> Result<()> {
        let prior = self.prior_timestamps(parent.index())?;
        let window = self.retarget_window(block.index())?;

        let (adds, removes, history) = {
            let set = self.utxos.read();
            let ctx = BlockContext {
                parent: Some(parent),
                prior_timestamps: &prior,
                retarget_window: &window,
                utxo_set: &set,
                params: &self.params,
                now_ms: now_ms(),
            };
            validation::validate_block(block, &ctx)?;
            Self::collect_diff(block, &set)?
        };

        let remove_keys: Vec<UtxoKey> = removes.iter().map(|(k, _)| k.clone()).collect();
        self.storage
            .apply_block_batch(block, &adds, &removes, &history)?;

        {
            // Validation proved every remove exists and every add is
            // fresh, so this cannot fail after the batch committed.
            let mut set = self.utxos.write();
            set.apply_updates(adds, &remove_keys)
                .expect("utxo diff validated against this set");
        }

        for tx in &block.transactions {
            self.mempool.remove_transaction(&tx.id);
        }

        self.height.store(block.index(), Ordering::SeqCst);
        *self.tip.lock() = block.calculate_hash();

        Metrics::incr(&self.metrics.blocks_processed);
        Metrics::set(&self.metrics.current_height, block.index());
        Metrics::set(&self.metrics.current_difficulty, block.difficulty() as u64);
        self.events.publish(NodeEvent::BlockAccepted {
            height: block.index(),
            hash: block.calculate_hash(),
        });
        info!(
            "accepted block {} at height {} ({} txs)",
            block.calculate_hash(),
            block.index(),
            block.transactions.len()
        );
        Ok(())
    }

    /// UTXO diff and history rows for an already-validated block.
    fn collect_diff(
        block: &Block,
        set: &UtxoSet,
    ) -> Result<(Vec<Utxo>, Vec<(UtxoKey, Utxo)>, Vec<HistoryEntry>)> {
        let mut adds = Vec::new();
        let mut removes = Vec::new();
        let mut history = Vec::new();

        for tx in &block.transactions {
            for input in &tx.inputs {
                let key = (input.prev_tx_hash.clone(), input.output_index);
                let spent = set.get(&key).cloned().ok_or_else(|| {
                    CoreError::UtxoConflict(format!("missing UTXO {}", input.outpoint()))
                })?;
                history.push(HistoryEntry {
                    address: spent.locking_script.clone(),
                    tx_id: tx.id.clone(),
                    height: block.index(),
                    timestamp: block.timestamp(),
                    amount: spent.value,
                    direction: Direction::Sent,
                });
                removes.push((key, spent));
            }
            let (tx_adds, _) = UtxoSet::diff_for_transaction(tx, block.index());
            for utxo in &tx_adds {
                history.push(HistoryEntry {
                    address: utxo.locking_script.clone(),
                    tx_id: tx.id.clone(),
                    height: block.index(),
                    timestamp: block.timestamp(),
                    amount: utxo.value,
                    direction: Direction::Received,
                });
            }
            adds.extend(tx_adds);
        }
        Ok((adds, removes, history))
    }

    // -----------------------------------------------------------------
    // Difficulty schedule helpers
    // -----------------------------------------------------------------

    fn prior_timestamps(&self, up_to_height: u64) -> Result<Vec<u64>> {
        let start = up_to_height.saturating_sub(difficulty::MEDIAN_TIME_SPAN as u64 - 1);
        self.storage.timestamps_in_range(start, up_to_height)
    }

    fn retarget_window(&self, height: u64) -> Result<Vec<u64>> {
        if !difficulty::is_retarget_height(height, &self.params) {
            return Ok(Vec::new());
        }
        let period = self.params.adjustment_period_blocks;
        self.storage
            .timestamps_in_range(height.saturating_sub(period), height - 1)
    }

    fn scheduled_difficulty(&self, height: u64, parent_difficulty: u32) -> Result<u32> {
        let window = self.retarget_window(height)?;
        Ok(difficulty::expected_difficulty(
            height,
            parent_difficulty,
            &window,
            &self.params,
        ))
    }

    // -----------------------------------------------------------------
    // Queries (snapshot reads)
    // -----------------------------------------------------------------

    pub fn query_balance(&self, address: &str) -> u64 {
        self.utxos.read().balance(address)
    }

    pub fn query_utxos(&self, address: &str) -> Vec<Utxo> {
        self.utxos.read().get_for_address(address)
    }

    pub fn utxo_snapshot(&self) -> UtxoSet {
        self.utxos.read().snapshot()
    }

    pub fn query_block_by_index(&self, index: u64) -> Result<Option<Block>> {
        self.storage.get_block_by_height(index)
    }

    pub fn query_block_by_hash(&self, hash: &str) -> Result<Option<Block>> {
        self.storage.get_block(hash)
    }

    /// Confirmed lookup first, pending second (height `None`).
    pub fn query_tx(&self, id: &str) -> Result<Option<(Transaction, Option<u64>)>> {
        if let Some((tx, height)) = self.storage.get_transaction(id)? {
            return Ok(Some((tx, Some(height))));
        }
        Ok(self.mempool.get_transaction(id).map(|tx| (tx, None)))
    }

    pub fn query_history(&self, address: &str) -> Result<Vec<HistoryEntry>> {
        self.storage.history_for_address(address)
    }

    /// Merkle inclusion proof for a confirmed transaction.
    pub fn query_merkle_proof(&self, tx_id: &str) -> Result<Option<(String, Vec<(String, bool)>)>> {
        let (_, height) = match self.storage.get_transaction(tx_id)? {
            Some(found) => found,
            None => return Ok(None),
        };
        let block = match self.storage.get_block_by_height(height)? {
            Some(b) => b,
            None => return Ok(None),
        };
        Ok(block
            .merkle_proof(tx_id)
            .map(|proof| (block.calculate_hash(), proof)))
    }

    pub fn chain_height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }

    pub fn tip_hash(&self) -> String {
        self.tip.lock().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.mempool.size()
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.mempool.get_all()
    }

    /// Walk the chain from genesis re-applying full validation against a
    /// freshly rebuilt UTXO set.
    pub fn validate_chain(&self) -> Result<()> {
        let tip = self.chain_height();
        let mut set = UtxoSet::new();
        let mut parent: Option<Block> = None;
        let mut timestamps: Vec<u64> = Vec::new();

        for height in 0..=tip {
            let block = self
                .storage
                .get_block_by_height(height)?
                .ok_or_else(|| CoreError::Persistence(format!("missing block {}", height)))?;

            let window = if difficulty::is_retarget_height(height, &self.params) {
                let period = self.params.adjustment_period_blocks as usize;
                let start = timestamps.len().saturating_sub(period);
                timestamps[start..].to_vec()
            } else {
                Vec::new()
            };
            let prior_start = timestamps
                .len()
                .saturating_sub(difficulty::MEDIAN_TIME_SPAN);
            let ctx = BlockContext {
                parent: parent.as_ref(),
                prior_timestamps: &timestamps[prior_start..],
                retarget_window: &window,
                utxo_set: &set,
                params: &self.params,
                now_ms: now_ms(),
            };
            validation::validate_block(&block, &ctx)?;

            let (adds, removes, _) = Self::collect_diff(&block, &set)?;
            let remove_keys: Vec<UtxoKey> = removes.into_iter().map(|(k, _)| k).collect();
            set.apply_updates(adds, &remove_keys)?;

            timestamps.push(block.timestamp());
            parent = Some(block);
        }
        Ok(())
    }

    /// Flush state and release the storage handle.
    pub fn close(&self) -> Result<()> {
        self.lifecycle
            .store(Lifecycle::Closing as u8, Ordering::SeqCst);
        let _guard = self.mutation_lock.lock();
        self.storage.flush()?;
        info!("kernel closed at height {}", self.chain_height());
        Ok(())
    }
}
