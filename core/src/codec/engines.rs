use std::io::Write;

use crate::codec::varint::{read_uvarint, write_uvarint};
use crate::error::{CoreError, Result};

/// A pluggable compression algorithm.
///
/// `decompress` receives the original size from the frame header so
/// implementations can allocate exactly once and refuse oversized
/// output.
pub trait CompressionEngine: Send + Sync {
    fn name(&self) -> &'static str;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8], original_size: usize) -> Result<Vec<u8>>;
    /// Relative throughput class, higher is faster. Feeds the adaptive
    /// selector before real measurements exist.
    fn speed(&self) -> u32;
    /// Expected compressed/original ratio on UTXO traffic.
    fn expected_ratio(&self) -> f64;
}

// ---------------------------------------------------------------------------
// none
// ---------------------------------------------------------------------------

pub struct NoneEngine;

impl CompressionEngine for NoneEngine {
    fn name(&self) -> &'static str {
        "none"
    }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
    fn decompress(&self, data: &[u8], _original_size: usize) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
    fn speed(&self) -> u32 {
        100
    }
    fn expected_ratio(&self) -> f64 {
        1.0
    }
}

// ---------------------------------------------------------------------------
// lz (zstd, fastest level)
// ---------------------------------------------------------------------------

pub struct LzEngine;

impl CompressionEngine for LzEngine {
    fn name(&self) -> &'static str {
        "lz"
    }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(data, 1)
            .map_err(|e| CoreError::Protocol(format!("lz compress: {}", e)))
    }
    fn decompress(&self, data: &[u8], original_size: usize) -> Result<Vec<u8>> {
        zstd::bulk::decompress(data, original_size)
            .map_err(|e| CoreError::Protocol(format!("lz decompress: {}", e)))
    }
    fn speed(&self) -> u32 {
        80
    }
    fn expected_ratio(&self) -> f64 {
        0.6
    }
}

// ---------------------------------------------------------------------------
// deflate
// ---------------------------------------------------------------------------

pub struct DeflateEngine;

impl CompressionEngine for DeflateEngine {
    fn name(&self) -> &'static str {
        "deflate"
    }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| CoreError::Protocol(format!("deflate compress: {}", e)))
    }
    fn decompress(&self, data: &[u8], original_size: usize) -> Result<Vec<u8>> {
        let mut decoder = flate2::write::DeflateDecoder::new(Vec::with_capacity(original_size));
        decoder
            .write_all(data)
            .and_then(|_| decoder.finish())
            .map_err(|e| CoreError::Protocol(format!("deflate decompress: {}", e)))
    }
    fn speed(&self) -> u32 {
        40
    }
    fn expected_ratio(&self) -> f64 {
        0.55
    }
}

// ---------------------------------------------------------------------------
// utxo-tlv
// ---------------------------------------------------------------------------

/// Tag-length-value transform specialized for UTXO payloads: long zero
/// runs (hash padding), repeated bytes, and the `lora1` address prefix
/// collapse to short codes; everything else passes through as literals.
pub struct UtxoTlvEngine;

const TLV_LITERAL: u8 = 0x00;
const TLV_ZERO_RUN: u8 = 0x01;
const TLV_ADDR_PREFIX: u8 = 0x02;
const TLV_BYTE_RUN: u8 = 0x03;

const ADDR_PREFIX: &[u8] = b"lora1";
/// Runs shorter than this are not worth a TLV header.
const MIN_RUN: usize = 4;

impl UtxoTlvEngine {
    fn flush_literal(out: &mut Vec<u8>, literal: &mut Vec<u8>) {
        if literal.is_empty() {
            return;
        }
        out.push(TLV_LITERAL);
        write_uvarint(out, literal.len() as u64);
        out.extend_from_slice(literal);
        literal.clear();
    }
}

impl CompressionEngine for UtxoTlvEngine {
    fn name(&self) -> &'static str {
        "utxo-tlv"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2 + 8);
        let mut literal: Vec<u8> = Vec::new();
        let mut i = 0usize;

        while i < data.len() {
            if data[i..].starts_with(ADDR_PREFIX) {
                Self::flush_literal(&mut out, &mut literal);
                out.push(TLV_ADDR_PREFIX);
                i += ADDR_PREFIX.len();
                continue;
            }

            let byte = data[i];
            let mut run = 1usize;
            while i + run < data.len() && data[i + run] == byte {
                run += 1;
            }
            if run >= MIN_RUN {
                Self::flush_literal(&mut out, &mut literal);
                if byte == 0 {
                    out.push(TLV_ZERO_RUN);
                    write_uvarint(&mut out, run as u64);
                } else {
                    out.push(TLV_BYTE_RUN);
                    out.push(byte);
                    write_uvarint(&mut out, run as u64);
                }
                i += run;
            } else {
                literal.push(byte);
                i += 1;
            }
        }
        Self::flush_literal(&mut out, &mut literal);
        Ok(out)
    }

    fn decompress(&self, data: &[u8], original_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(original_size);
        let mut i = 0usize;

        while i < data.len() {
            let tag = data[i];
            i += 1;
            match tag {
                TLV_LITERAL => {
                    let (len, consumed) = read_uvarint(data, i)?;
                    i += consumed;
                    let len = len as usize;
                    let chunk = data
                        .get(i..i + len)
                        .ok_or_else(|| CoreError::Protocol("truncated TLV literal".into()))?;
                    out.extend_from_slice(chunk);
                    i += len;
                }
                TLV_ZERO_RUN => {
                    let (count, consumed) = read_uvarint(data, i)?;
                    i += consumed;
                    out.resize(out.len() + count as usize, 0);
                }
                TLV_ADDR_PREFIX => out.extend_from_slice(ADDR_PREFIX),
                TLV_BYTE_RUN => {
                    let byte = *data
                        .get(i)
                        .ok_or_else(|| CoreError::Protocol("truncated TLV run".into()))?;
                    i += 1;
                    let (count, consumed) = read_uvarint(data, i)?;
                    i += consumed;
                    out.resize(out.len() + count as usize, byte);
                }
                other => {
                    return Err(CoreError::Protocol(format!("unknown TLV tag {:#x}", other)))
                }
            }
            if out.len() > original_size {
                return Err(CoreError::Protocol("TLV output exceeds declared size".into()));
            }
        }
        Ok(out)
    }

    fn speed(&self) -> u32 {
        90
    }
    fn expected_ratio(&self) -> f64 {
        0.7
    }
}

// ---------------------------------------------------------------------------
// dictionary (zstd with a shared raw-content dictionary)
// ---------------------------------------------------------------------------

pub struct DictionaryEngine {
    dictionary: Vec<u8>,
}

impl DictionaryEngine {
    pub fn new(dictionary: Vec<u8>) -> Self {
        Self { dictionary }
    }
}

impl CompressionEngine for DictionaryEngine {
    fn name(&self) -> &'static str {
        "dictionary"
    }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut compressor = zstd::bulk::Compressor::with_dictionary(3, &self.dictionary)
            .map_err(|e| CoreError::Protocol(format!("dictionary init: {}", e)))?;
        compressor
            .compress(data)
            .map_err(|e| CoreError::Protocol(format!("dictionary compress: {}", e)))
    }
    fn decompress(&self, data: &[u8], original_size: usize) -> Result<Vec<u8>> {
        let mut decompressor = zstd::bulk::Decompressor::with_dictionary(&self.dictionary)
            .map_err(|e| CoreError::Protocol(format!("dictionary init: {}", e)))?;
        decompressor
            .decompress(data, original_size)
            .map_err(|e| CoreError::Protocol(format!("dictionary decompress: {}", e)))
    }
    fn speed(&self) -> u32 {
        60
    }
    fn expected_ratio(&self) -> f64 {
        0.45
    }
}
