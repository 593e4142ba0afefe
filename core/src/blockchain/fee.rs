/// Fee policy.
///
/// Fees are paid to the miner: the coinbase output is the block reward
/// plus every fee collected in the block. The minimum is the larger of an
/// absolute floor and a per-byte rate, which keeps dust off the mesh
/// where every byte costs airtime.
///
/// All values in atomic units.

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Absolute minimum transaction fee.
pub const MIN_TX_FEE: u64 = 1;

/// Minimum fee rate: atomic units per serialized byte.
pub const MIN_FEE_RATE: u64 = 0;

/// Maximum transaction size. Larger transactions are rejected outright —
/// they would fragment into too many radio frames to deliver reliably.
pub const MAX_TX_SIZE_BYTES: usize = 4_096;

/// Fee-per-byte thresholds mapping transactions onto transmission
/// priorities (high / normal / low).
pub const HIGH_PRIORITY_FEE_RATE: u64 = 4;
pub const NORMAL_PRIORITY_FEE_RATE: u64 = 1;

// ---------------------------------------------------------------------------
// Calculation
// ---------------------------------------------------------------------------

/// Estimate the serialized size of a transaction before it is built.
///
/// Rough formula:
///   - Base: 64 (id) + 8 (lock_time) + 8 (timestamp) + 8 (fee) = 88
///   - Per input: 64 (prev_hash) + 4 (index) + 128 (signature) + 64 (pubkey) + 4 (sequence) = 264
///   - Per output: 8 (value) + 44 (script) + 4 (index) = 56
pub fn estimate_tx_size(num_inputs: usize, num_outputs: usize) -> usize {
    88 + num_inputs * 264 + num_outputs * 56
}

/// Minimum required fee for a transaction of the given size:
/// max(MIN_TX_FEE, size × MIN_FEE_RATE).
pub fn minimum_fee_for_size(tx_size_bytes: usize) -> u64 {
    let rate_based = tx_size_bytes as u64 * MIN_FEE_RATE;
    rate_based.max(MIN_TX_FEE)
}

pub fn fee_rate(fee: u64, tx_size_bytes: usize) -> u64 {
    if tx_size_bytes == 0 {
        return 0;
    }
    fee / tx_size_bytes as u64
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub fn validate_fee(fee: u64, tx_size_bytes: usize) -> Result<(), String> {
    let min_for_size = minimum_fee_for_size(tx_size_bytes);
    if fee < min_for_size {
        return Err(format!(
            "fee {} below minimum {} for {} bytes",
            fee, min_for_size, tx_size_bytes
        ));
    }
    Ok(())
}

/// No zero-value outputs, no overflow across the output sum.
pub fn validate_output_values(values: &[u64]) -> Result<(), String> {
    let mut total: u128 = 0;
    for (i, v) in values.iter().enumerate() {
        if *v == 0 {
            return Err(format!("output {} has zero value", i));
        }
        total += *v as u128;
        if total > u64::MAX as u128 {
            return Err("output sum overflows".to_string());
        }
    }
    Ok(())
}
