pub mod dictionary;
pub mod engines;
pub mod frame;
pub mod varint;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::NodeConfig;
use crate::error::{CoreError, Result};
use self::dictionary::DictionaryRegistry;
use self::engines::{
    CompressionEngine, DeflateEngine, DictionaryEngine, LzEngine, NoneEngine, UtxoTlvEngine,
};
use self::frame::{Frame, FrameKind};

/// Stable algorithm tags carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Algorithm {
    None = 0,
    Lz = 1,
    Deflate = 2,
    UtxoTlv = 3,
    Dictionary = 4,
}

impl Algorithm {
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Algorithm::None,
            1 => Algorithm::Lz,
            2 => Algorithm::Deflate,
            3 => Algorithm::UtxoTlv,
            4 => Algorithm::Dictionary,
            other => {
                return Err(CoreError::Protocol(format!(
                    "unknown compression tag {}",
                    other
                )))
            }
        })
    }

    pub fn from_name(name: &str) -> Result<Option<Self>> {
        Ok(match name {
            "none" => Some(Algorithm::None),
            "lz" => Some(Algorithm::Lz),
            "deflate" => Some(Algorithm::Deflate),
            "utxo-tlv" => Some(Algorithm::UtxoTlv),
            "dictionary" => Some(Algorithm::Dictionary),
            // Adaptive: no fixed default, score per payload.
            "adaptive" => None,
            other => {
                return Err(CoreError::Configuration(format!(
                    "unknown compression algorithm '{}'",
                    other
                )))
            }
        })
    }
}

/// Rolling per-algorithm benchmark, exponentially weighted.
#[derive(Debug, Clone, Copy)]
struct RollingStats {
    /// compressed / original
    ratio: f64,
    /// original bytes per microsecond
    throughput: f64,
    samples: u64,
}

const EMA_ALPHA: f64 = 0.2;

/// The codec layer: algorithm registry, selection policy, and frame
/// assembly.
pub struct Codec {
    engines: HashMap<u8, Arc<dyn CompressionEngine>>,
    pub dictionaries: DictionaryRegistry,
    /// `None` means adaptive selection.
    default_algorithm: Option<Algorithm>,
    threshold: usize,
    /// Cap on the decompressed size a frame may declare.
    memory_limit: usize,
    integrity_check: bool,
    enable_dictionary: bool,
    active_dictionary: RwLock<Option<u32>>,
    stats: RwLock<HashMap<u8, RollingStats>>,
}

impl Codec {
    pub fn new(config: &NodeConfig, dictionaries: DictionaryRegistry) -> Result<Self> {
        let mut engines: HashMap<u8, Arc<dyn CompressionEngine>> = HashMap::new();
        engines.insert(Algorithm::None as u8, Arc::new(NoneEngine));
        engines.insert(Algorithm::Lz as u8, Arc::new(LzEngine));
        engines.insert(Algorithm::Deflate as u8, Arc::new(DeflateEngine));
        engines.insert(Algorithm::UtxoTlv as u8, Arc::new(UtxoTlvEngine));

        let default_algorithm = Algorithm::from_name(&config.compression_default_algorithm)?;

        Ok(Self {
            engines,
            dictionaries,
            default_algorithm,
            threshold: config.compression_threshold_bytes,
            memory_limit: config.compression_memory_limit_bytes,
            integrity_check: config.enable_integrity_check,
            enable_dictionary: config.enable_dictionary,
            active_dictionary: RwLock::new(None),
            stats: RwLock::new(HashMap::new()),
        })
    }

    /// Register an additional engine under its tag. Adding an algorithm
    /// is exactly this call.
    pub fn register_engine(&mut self, tag: u8, engine: Arc<dyn CompressionEngine>) {
        self.engines.insert(tag, engine);
    }

    /// Choose the dictionary used for outgoing `Dictionary` frames. The
    /// id must already be registered.
    pub fn set_active_dictionary(&self, id: u32) -> Result<()> {
        if !self.dictionaries.contains(id) {
            return Err(CoreError::Protocol(format!("unknown dictionary id {}", id)));
        }
        *self.active_dictionary.write() = Some(id);
        Ok(())
    }

    fn engine_for(&self, algorithm: Algorithm) -> Result<Arc<dyn CompressionEngine>> {
        self.engines
            .get(&(algorithm as u8))
            .cloned()
            .ok_or_else(|| {
                CoreError::Protocol(format!("no engine registered for {:?}", algorithm))
            })
    }

    /// Adaptive score: (1 − ratio)·0.7 + normalized_throughput·0.3,
    /// from rolling benchmarks where available and engine priors
    /// otherwise.
    fn score(&self, algorithm: Algorithm) -> f64 {
        let engine = match self.engines.get(&(algorithm as u8)) {
            Some(e) => e,
            None => return f64::MIN,
        };
        let stats = self.stats.read();
        let (ratio, throughput) = match stats.get(&(algorithm as u8)) {
            Some(s) => (s.ratio, s.throughput),
            None => (engine.expected_ratio(), engine.speed() as f64),
        };
        let max_throughput = self
            .engines
            .values()
            .map(|e| e.speed() as f64)
            .fold(1.0_f64, f64::max)
            .max(throughput);
        (1.0 - ratio) * 0.7 + (throughput / max_throughput) * 0.3
    }

    fn select_algorithm(&self) -> Algorithm {
        if let Some(algorithm) = self.default_algorithm {
            return algorithm;
        }
        let mut candidates = vec![Algorithm::Lz, Algorithm::Deflate, Algorithm::UtxoTlv];
        if self.enable_dictionary && self.active_dictionary.read().is_some() {
            candidates.push(Algorithm::Dictionary);
        }
        candidates
            .into_iter()
            .max_by(|a, b| self.score(*a).total_cmp(&self.score(*b)))
            .unwrap_or(Algorithm::None)
    }

    fn record_benchmark(&self, algorithm: Algorithm, original: usize, compressed: usize, micros: u64) {
        let ratio = compressed as f64 / original.max(1) as f64;
        let throughput = original as f64 / micros.max(1) as f64;
        let mut stats = self.stats.write();
        let entry = stats.entry(algorithm as u8).or_insert(RollingStats {
            ratio,
            throughput,
            samples: 0,
        });
        entry.ratio = entry.ratio * (1.0 - EMA_ALPHA) + ratio * EMA_ALPHA;
        entry.throughput = entry.throughput * (1.0 - EMA_ALPHA) + throughput * EMA_ALPHA;
        entry.samples += 1;
    }

    /// Compress `payload` per policy and wrap it in a frame.
    ///
    /// Small payloads skip compression; an engine that fails to shrink
    /// the payload falls back to `None` so the wire never carries
    /// inflation.
    pub fn encode(&self, kind: FrameKind, payload: &[u8]) -> Result<Frame> {
        let checksum = Frame::checksum_of(payload);
        let original_size = payload.len() as u64;

        if payload.len() < self.threshold {
            return Ok(Frame {
                kind,
                compression: Algorithm::None as u8,
                original_size,
                checksum,
                dictionary_id: None,
                fragment: None,
                payload: payload.to_vec(),
                signature: None,
            });
        }

        let mut algorithm = self.select_algorithm();
        let mut dictionary_id = None;
        if algorithm == Algorithm::Dictionary {
            match *self.active_dictionary.read() {
                Some(id) if self.enable_dictionary => dictionary_id = Some(id),
                _ => algorithm = Algorithm::Lz,
            }
        }

        let (compressed, used, dict_used) = match algorithm {
            Algorithm::None => (payload.to_vec(), Algorithm::None, None),
            Algorithm::Dictionary => {
                let id = dictionary_id.unwrap();
                let dict = self.dictionaries.get(id).ok_or_else(|| {
                    CoreError::Protocol(format!("active dictionary {} disappeared", id))
                })?;
                let engine = DictionaryEngine::new(dict.bytes.clone());
                let start = Instant::now();
                let out = engine.compress(payload)?;
                self.record_benchmark(
                    Algorithm::Dictionary,
                    payload.len(),
                    out.len(),
                    start.elapsed().as_micros() as u64,
                );
                (out, Algorithm::Dictionary, Some(id))
            }
            other => {
                let engine = self.engine_for(other)?;
                let start = Instant::now();
                let out = engine.compress(payload)?;
                self.record_benchmark(
                    other,
                    payload.len(),
                    out.len(),
                    start.elapsed().as_micros() as u64,
                );
                (out, other, None)
            }
        };

        // Inflation guard.
        let (compression, final_payload, final_dict) = if compressed.len() >= payload.len() {
            (Algorithm::None, payload.to_vec(), None)
        } else {
            (used, compressed, dict_used)
        };

        Ok(Frame {
            kind,
            compression: compression as u8,
            original_size,
            checksum,
            dictionary_id: final_dict,
            fragment: None,
            payload: final_payload,
            signature: None,
        })
    }

    /// Recover the original payload from a frame: decompress per its tag
    /// and verify the integrity checksum. Frames referencing an unknown
    /// dictionary id are refused.
    pub fn decode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let algorithm = Algorithm::from_tag(frame.compression)?;
        let original_size = frame.original_size as usize;
        if original_size > self.memory_limit {
            return Err(CoreError::Protocol(format!(
                "declared size {} exceeds memory limit {}",
                original_size, self.memory_limit
            )));
        }

        let payload = match algorithm {
            Algorithm::None => frame.payload.clone(),
            Algorithm::Dictionary => {
                let id = frame.dictionary_id.ok_or_else(|| {
                    CoreError::Protocol("dictionary frame without dictionary id".into())
                })?;
                let dict = self.dictionaries.get(id).ok_or_else(|| {
                    CoreError::Protocol(format!("unknown dictionary id {}", id))
                })?;
                DictionaryEngine::new(dict.bytes.clone())
                    .decompress(&frame.payload, original_size)?
            }
            other => self
                .engine_for(other)?
                .decompress(&frame.payload, original_size)?,
        };

        if payload.len() != original_size {
            return Err(CoreError::Protocol(format!(
                "decompressed {} bytes, header declared {}",
                payload.len(),
                original_size
            )));
        }
        if self.integrity_check && Frame::checksum_of(&payload) != frame.checksum {
            return Err(CoreError::Protocol("payload checksum mismatch".into()));
        }
        Ok(payload)
    }
}
