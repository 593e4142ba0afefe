pub mod eviction;
pub mod pool;

pub use self::pool::{Mempool, MempoolError};
