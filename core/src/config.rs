use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Regulatory region the radio operates in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Region {
    Eu,
    Us,
    Ca,
    Mx,
    Jp,
    Au,
    Nz,
    Br,
    Ar,
    Custom,
}

impl Region {
    pub fn name(&self) -> &'static str {
        match self {
            Region::Eu => "EU",
            Region::Us => "US",
            Region::Ca => "CA",
            Region::Mx => "MX",
            Region::Jp => "JP",
            Region::Au => "AU",
            Region::Nz => "NZ",
            Region::Br => "BR",
            Region::Ar => "AR",
            Region::Custom => "CUSTOM",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "EU" => Ok(Region::Eu),
            "US" => Ok(Region::Us),
            "CA" => Ok(Region::Ca),
            "MX" => Ok(Region::Mx),
            "JP" => Ok(Region::Jp),
            "AU" => Ok(Region::Au),
            "NZ" => Ok(Region::Nz),
            "BR" => Ok(Region::Br),
            "AR" => Ok(Region::Ar),
            "CUSTOM" => Ok(Region::Custom),
            other => Err(CoreError::Configuration(format!(
                "unknown region '{}'",
                other
            ))),
        }
    }
}

/// Single configuration record for the whole node.
///
/// Loaded from a JSON file, then overridden field-by-field from
/// `LORACHAIN_*` environment variables in `main`. Validated once with
/// [`NodeConfig::validate`] before anything is constructed from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    // --- Radio / regulatory ---
    pub region: Region,
    /// Center frequency of the operating channel in MHz.
    pub frequency_mhz: f64,
    /// Only used when `region` is `Custom`.
    pub max_duty_cycle_percent: Option<f64>,
    /// Retention horizon for persisted transmission records.
    pub tracking_window_hours: u64,
    /// Radio MTU: fragments never exceed this many payload bytes.
    pub radio_mtu_bytes: usize,
    pub spreading_factor: u8,
    pub bandwidth_khz: u32,
    /// Coding rate denominator offset: 1..=4 maps to 4/5..4/8.
    pub coding_rate: u8,
    pub preamble_symbols: u16,
    pub tx_power_dbm: i8,

    // --- Consensus ---
    pub target_block_time_s: u64,
    pub adjustment_period_blocks: u64,
    pub max_difficulty_ratio: f64,
    /// Difficulty is a leading-zero-bit count over the header hash.
    pub min_difficulty: u32,
    pub max_difficulty: u32,
    pub max_block_size_bytes: usize,
    pub mining_reward: u64,

    // --- Queueing / reliability ---
    pub max_pending_messages: usize,
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_jitter_ms: u64,

    // --- Routing / neighbors ---
    pub neighbor_timeout_ms: u64,
    pub beacon_interval_ms: u64,
    pub max_neighbors: usize,
    pub route_discovery_timeout_ms: u64,
    pub max_route_hops: u8,
    pub route_ttl_ms: u64,

    // --- Compression ---
    pub compression_default_algorithm: String,
    pub compression_memory_limit_bytes: usize,
    pub compression_threshold_bytes: usize,
    pub enable_dictionary: bool,
    pub enable_integrity_check: bool,

    // --- Scheduling ---
    pub emergency_override: bool,
    pub scheduler_tick_ms: u64,
    pub message_ttl_ms: u64,
    pub fragment_ttl_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            region: Region::Eu,
            frequency_mhz: 868.1,
            max_duty_cycle_percent: None,
            tracking_window_hours: 24,
            radio_mtu_bytes: 256,
            spreading_factor: 9,
            bandwidth_khz: 125,
            coding_rate: 1,
            preamble_symbols: 8,
            tx_power_dbm: 14,

            target_block_time_s: 300,
            adjustment_period_blocks: 10,
            max_difficulty_ratio: 4.0,
            min_difficulty: 1,
            max_difficulty: 64,
            max_block_size_bytes: 8_192,
            mining_reward: 10,

            max_pending_messages: 128,
            ack_timeout_ms: 5_000,
            max_retries: 3,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            backoff_jitter_ms: 500,

            neighbor_timeout_ms: 180_000,
            beacon_interval_ms: 60_000,
            max_neighbors: 32,
            route_discovery_timeout_ms: 10_000,
            max_route_hops: 8,
            route_ttl_ms: 600_000,

            compression_default_algorithm: "lz".to_string(),
            compression_memory_limit_bytes: 4 * 1024 * 1024,
            compression_threshold_bytes: 64,
            enable_dictionary: true,
            enable_integrity_check: true,

            emergency_override: true,
            scheduler_tick_ms: 100,
            message_ttl_ms: 300_000,
            fragment_ttl_ms: 60_000,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Configuration(format!("cannot read {}: {}", path, e)))?;
        let cfg: NodeConfig = serde_json::from_str(&raw)
            .map_err(|e| CoreError::Configuration(format!("cannot parse {}: {}", path, e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Range-check every parameter. An out-of-range value aborts
    /// initialization with `Configuration`.
    pub fn validate(&self) -> Result<()> {
        if self.region == Region::Custom && self.max_duty_cycle_percent.is_none() {
            return Err(CoreError::Configuration(
                "region CUSTOM requires max_duty_cycle_percent".into(),
            ));
        }
        if let Some(pct) = self.max_duty_cycle_percent {
            if !(0.0..=100.0).contains(&pct) {
                return Err(CoreError::Configuration(format!(
                    "max_duty_cycle_percent {} out of range [0, 100]",
                    pct
                )));
            }
        }
        if !(6..=12).contains(&self.spreading_factor) {
            return Err(CoreError::Configuration(format!(
                "spreading_factor {} out of range [6, 12]",
                self.spreading_factor
            )));
        }
        if !matches!(self.bandwidth_khz, 125 | 250 | 500) {
            return Err(CoreError::Configuration(format!(
                "bandwidth_khz {} must be 125, 250 or 500",
                self.bandwidth_khz
            )));
        }
        if !(1..=4).contains(&self.coding_rate) {
            return Err(CoreError::Configuration(format!(
                "coding_rate {} out of range [1, 4]",
                self.coding_rate
            )));
        }
        if self.radio_mtu_bytes < 32 {
            return Err(CoreError::Configuration(format!(
                "radio_mtu_bytes {} too small (min 32)",
                self.radio_mtu_bytes
            )));
        }
        if self.target_block_time_s == 0 {
            return Err(CoreError::Configuration("target_block_time_s must be > 0".into()));
        }
        if self.adjustment_period_blocks == 0 {
            return Err(CoreError::Configuration(
                "adjustment_period_blocks must be > 0".into(),
            ));
        }
        if self.max_difficulty_ratio < 1.0 {
            return Err(CoreError::Configuration(format!(
                "max_difficulty_ratio {} must be >= 1",
                self.max_difficulty_ratio
            )));
        }
        if self.min_difficulty == 0 || self.min_difficulty > self.max_difficulty {
            return Err(CoreError::Configuration(format!(
                "difficulty bounds [{}, {}] invalid",
                self.min_difficulty, self.max_difficulty
            )));
        }
        if self.max_difficulty > 255 {
            return Err(CoreError::Configuration(format!(
                "max_difficulty {} exceeds hash width (255 bits)",
                self.max_difficulty
            )));
        }
        if self.max_block_size_bytes == 0 {
            return Err(CoreError::Configuration("max_block_size_bytes must be > 0".into()));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(CoreError::Configuration(format!(
                "backoff_multiplier {} must be >= 1",
                self.backoff_multiplier
            )));
        }
        if self.backoff_initial_ms == 0 || self.backoff_initial_ms > self.backoff_max_ms {
            return Err(CoreError::Configuration(format!(
                "backoff bounds [{}, {}] invalid",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }
        if self.max_pending_messages == 0 {
            return Err(CoreError::Configuration("max_pending_messages must be > 0".into()));
        }
        if self.max_route_hops == 0 {
            return Err(CoreError::Configuration("max_route_hops must be > 0".into()));
        }
        if self.beacon_interval_ms >= self.neighbor_timeout_ms {
            return Err(CoreError::Configuration(format!(
                "beacon_interval_ms {} must be below neighbor_timeout_ms {}",
                self.beacon_interval_ms, self.neighbor_timeout_ms
            )));
        }
        Ok(())
    }

    /// Target inter-block interval in milliseconds (block timestamps are ms).
    pub fn target_block_time_ms(&self) -> u64 {
        self.target_block_time_s * 1_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_custom_region_requires_percent() {
        let cfg = NodeConfig {
            region: Region::Custom,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(CoreError::Configuration(_))));

        let cfg = NodeConfig {
            region: Region::Custom,
            max_duty_cycle_percent: Some(5.0),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_spreading_factor() {
        let cfg = NodeConfig {
            spreading_factor: 13,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_difficulty_bounds() {
        let cfg = NodeConfig {
            min_difficulty: 20,
            max_difficulty: 10,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_backoff_multiplier_below_one() {
        let cfg = NodeConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_region_round_trip() {
        for name in ["EU", "US", "JP", "AU", "CUSTOM"] {
            assert_eq!(Region::from_str(name).unwrap().name(), name);
        }
        assert!(Region::from_str("MOON").is_err());
    }
}
