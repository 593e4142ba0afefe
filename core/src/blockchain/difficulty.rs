/// Difficulty retargeting.
///
/// Difficulty is a leading-zero-bit count over the blake3 header hash.
/// Every `adjustment_period_blocks` blocks the required count is
/// recomputed from the observed average inter-block interval of the
/// closed window:
///
/// ```text
/// new = old × (target_interval / actual_interval)
/// new = clamp(new, old / ratio, old × ratio)
/// new = clamp(new, min_difficulty, max_difficulty)
/// ```
///
/// Blocks at non-retarget heights must carry the previous difficulty
/// unchanged; blocks at retarget heights must carry exactly the
/// recomputed value.
use crate::blockchain::genesis::NetworkParams;

/// Number of prior timestamps entering the median rule.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum tolerated clock skew into the future: 2 hours.
pub const MAX_FUTURE_DRIFT_MS: u64 = 2 * 60 * 60 * 1_000;

/// Is `height` a retarget boundary?
pub fn is_retarget_height(height: u64, params: &NetworkParams) -> bool {
    height > 0 && height % params.adjustment_period_blocks == 0
}

/// Recompute difficulty from the closed adjustment window.
///
/// `actual_interval_ms` is the observed average inter-block interval; a
/// zero observation (pathological timestamps) is treated as one
/// millisecond so the ratio stays finite.
pub fn retarget(old_difficulty: u32, actual_interval_ms: u64, params: &NetworkParams) -> u32 {
    let target = params.target_block_time_ms() as f64;
    let actual = actual_interval_ms.max(1) as f64;
    let ratio = params.max_retarget_ratio;

    let mut next = old_difficulty as f64 * (target / actual);

    // Clamp the swing to [old / ratio, old × ratio].
    let max_allowed = old_difficulty as f64 * ratio;
    let min_allowed = old_difficulty as f64 / ratio;
    next = next.min(max_allowed).max(min_allowed);

    // Global floor / ceiling. Rounding to nearest keeps the exact-ratio
    // boundary representable.
    (next.round() as u32)
        .max(params.min_difficulty)
        .min(params.max_difficulty)
}

/// The difficulty block `height` must carry, given the timestamps of the
/// closed window (`window_timestamps`, oldest first, length
/// `adjustment_period_blocks + 1` ideally) and the parent's difficulty.
pub fn expected_difficulty(
    height: u64,
    parent_difficulty: u32,
    window_timestamps: &[u64],
    params: &NetworkParams,
) -> u32 {
    if !is_retarget_height(height, params) {
        return parent_difficulty;
    }
    if window_timestamps.len() < 2 {
        return parent_difficulty;
    }
    let spans = (window_timestamps.len() - 1) as u64;
    let elapsed = window_timestamps
        .last()
        .unwrap()
        .saturating_sub(window_timestamps[0]);
    retarget(parent_difficulty, elapsed / spans.max(1), params)
}

/// Median of the last `MEDIAN_TIME_SPAN` timestamps (fewer in the early
/// chain). `prior` is oldest-first; returns `None` for an empty slice.
pub fn median_time_past(prior: &[u64]) -> Option<u64> {
    if prior.is_empty() {
        return None;
    }
    let start = prior.len().saturating_sub(MEDIAN_TIME_SPAN);
    let mut window: Vec<u64> = prior[start..].to_vec();
    window.sort_unstable();
    Some(window[window.len() / 2])
}
