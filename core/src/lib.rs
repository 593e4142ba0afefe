pub mod blockchain;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod kernel;
pub mod mempool;
pub mod mesh;
pub mod metrics;
pub mod storage;
pub mod tx;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. Block timestamps, mesh message
/// timestamps, and scheduler clocks all use this resolution.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
