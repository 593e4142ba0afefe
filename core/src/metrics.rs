use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Node counters. All atomics, all relaxed — these feed logs and status
/// output, never control flow.
#[derive(Debug, Default)]
pub struct Metrics {
    pub blocks_processed: AtomicU64,
    pub blocks_rejected: AtomicU64,
    pub blocks_mined: AtomicU64,
    pub txs_submitted: AtomicU64,
    pub txs_accepted: AtomicU64,
    pub txs_rejected: AtomicU64,
    pub current_height: AtomicU64,
    pub current_difficulty: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub frames_rejected: AtomicU64,
    pub duty_cycle_denials: AtomicU64,
    pub retries: AtomicU64,
    pub dead_letters: AtomicU64,
    pub airtime_ms_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(counter: &AtomicU64, v: u64) {
        counter.store(v, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
