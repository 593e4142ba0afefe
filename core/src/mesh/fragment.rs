use parking_lot::Mutex;
use std::collections::HashMap;

use crate::codec::frame::{Frame, FragmentInfo, FrameKind};
use crate::error::{CoreError, Result};

/// Split an encoded frame into MTU-sized fragment frames.
///
/// Fragments are uncompressed carriers: the payload chunks reassemble
/// into the original frame bytes, which then decode normally.
pub fn split(frame_bytes: &[u8], mtu: usize, message_id: u64) -> Vec<Frame> {
    let total = frame_bytes.len().div_ceil(mtu) as u32;
    frame_bytes
        .chunks(mtu)
        .enumerate()
        .map(|(index, chunk)| Frame {
            kind: FrameKind::Fragment,
            compression: 0,
            original_size: chunk.len() as u64,
            checksum: Frame::checksum_of(chunk),
            dictionary_id: None,
            fragment: Some(FragmentInfo {
                index: index as u32,
                total,
                message_id,
            }),
            payload: chunk.to_vec(),
            signature: None,
        })
        .collect()
}

#[derive(Debug)]
struct Buffer {
    total: u32,
    chunks: HashMap<u32, Vec<u8>>,
    created_at: u64,
}

/// Per-(sender, message id) reassembly buffers.
///
/// Buffers expire on TTL; a completed message id is remembered for the
/// same TTL so late duplicate fragments cannot resurface it.
pub struct Reassembler {
    ttl_ms: u64,
    buffers: Mutex<HashMap<(String, u64), Buffer>>,
    completed: Mutex<HashMap<(String, u64), u64>>,
}

impl Reassembler {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            buffers: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
        }
    }

    /// Accept one fragment. Returns the whole reassembled message when
    /// this fragment was the last missing piece, exactly once.
    pub fn accept(&self, sender: &str, frame: &Frame, now: u64) -> Result<Option<Vec<u8>>> {
        let info = frame
            .fragment
            .ok_or_else(|| CoreError::Protocol("fragment frame without fragment info".into()))?;

        if frame.payload.is_empty() {
            return Err(CoreError::Protocol("empty fragment".into()));
        }
        if Frame::checksum_of(&frame.payload) != frame.checksum {
            return Err(CoreError::Protocol("fragment checksum mismatch".into()));
        }

        let key = (sender.to_string(), info.message_id);
        if self.completed.lock().contains_key(&key) {
            return Ok(None); // duplicate after completion
        }

        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(key.clone()).or_insert_with(|| Buffer {
            total: info.total,
            chunks: HashMap::new(),
            created_at: now,
        });
        if buffer.total != info.total {
            let existing_total = buffer.total;
            buffers.remove(&key);
            return Err(CoreError::Protocol(format!(
                "fragment total changed mid-message ({} vs {})",
                info.total, existing_total
            )));
        }
        buffer.chunks.insert(info.index, frame.payload.clone());

        if buffer.chunks.len() as u32 != buffer.total {
            return Ok(None);
        }

        // Complete: stitch in index order.
        let buffer = buffers.remove(&key).expect("buffer exists");
        drop(buffers);
        let mut message = Vec::new();
        for index in 0..buffer.total {
            message.extend_from_slice(
                buffer
                    .chunks
                    .get(&index)
                    .expect("all indices present at completion"),
            );
        }
        self.completed.lock().insert(key, now);
        Ok(Some(message))
    }

    /// Indices still missing for a partially received message; the
    /// caller may request retransmission of exactly these.
    pub fn missing_indices(&self, sender: &str, message_id: u64) -> Vec<u32> {
        let buffers = self.buffers.lock();
        match buffers.get(&(sender.to_string(), message_id)) {
            Some(buffer) => (0..buffer.total)
                .filter(|i| !buffer.chunks.contains_key(i))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Discard buffers past their TTL; returns the discarded keys.
    pub fn purge_expired(&self, now: u64) -> Vec<(String, u64)> {
        let mut buffers = self.buffers.lock();
        let expired: Vec<(String, u64)> = buffers
            .iter()
            .filter(|(_, b)| now.saturating_sub(b.created_at) > self.ttl_ms)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            buffers.remove(key);
        }
        self.completed
            .lock()
            .retain(|_, done_at| now.saturating_sub(*done_at) <= self.ttl_ms);
        expired
    }

    pub fn pending_count(&self) -> usize {
        self.buffers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sizes() {
        let data = vec![7u8; 900];
        let fragments = split(&data, 256, 42);
        assert_eq!(fragments.len(), 4);
        assert_eq!(fragments[0].payload.len(), 256);
        assert_eq!(fragments[3].payload.len(), 900 - 3 * 256);
        for (i, frag) in fragments.iter().enumerate() {
            let info = frag.fragment.unwrap();
            assert_eq!(info.index, i as u32);
            assert_eq!(info.total, 4);
            assert_eq!(info.message_id, 42);
        }
    }

    #[test]
    fn test_out_of_order_reassembly_exactly_once() {
        // Delivery order [3, 1, 4, 2] (1-based) must reconstruct the
        // original payload exactly once.
        let data: Vec<u8> = (0..900).map(|i| (i % 251) as u8).collect();
        let fragments = split(&data, 256, 7);
        let reassembler = Reassembler::new(60_000);

        let order = [2usize, 0, 3, 1];
        let mut emitted = Vec::new();
        for &i in &order {
            if let Some(message) = reassembler.accept("lora1peer", &fragments[i], 1_000).unwrap() {
                emitted.push(message);
            }
        }
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0], data);

        // A late duplicate does not emit again.
        assert!(reassembler
            .accept("lora1peer", &fragments[0], 1_100)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_any_permutation_reconstructs() {
        let data: Vec<u8> = (0..700).map(|i| (i * 31 % 256) as u8).collect();
        let fragments = split(&data, 256, 9);
        // All 6 permutations of 3 fragments.
        let perms = [
            [0usize, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for (p, perm) in perms.iter().enumerate() {
            let reassembler = Reassembler::new(60_000);
            let mut result = None;
            for &i in perm {
                if let Some(m) = reassembler
                    .accept("lora1x", &fragments[i], 1_000)
                    .unwrap()
                {
                    result = Some(m);
                }
            }
            assert_eq!(result.as_deref(), Some(data.as_slice()), "perm {}", p);
        }
    }

    #[test]
    fn test_buffers_isolated_per_sender() {
        let data = vec![1u8; 500];
        let fragments = split(&data, 256, 5);
        let reassembler = Reassembler::new(60_000);

        reassembler.accept("lora1a", &fragments[0], 0).unwrap();
        // Same message id from a different sender must not complete a's buffer.
        assert!(reassembler
            .accept("lora1b", &fragments[1], 0)
            .unwrap()
            .is_none());
        assert_eq!(reassembler.missing_indices("lora1a", 5), vec![1]);
        assert_eq!(reassembler.missing_indices("lora1b", 5), vec![0]);
    }

    #[test]
    fn test_ttl_purge() {
        let data = vec![1u8; 500];
        let fragments = split(&data, 256, 5);
        let reassembler = Reassembler::new(1_000);
        reassembler.accept("lora1a", &fragments[0], 0).unwrap();

        let purged = reassembler.purge_expired(2_000);
        assert_eq!(purged, vec![("lora1a".to_string(), 5)]);
        assert_eq!(reassembler.pending_count(), 0);

        // After expiry the late fragment opens a fresh (incomplete) buffer.
        assert!(reassembler
            .accept("lora1a", &fragments[1], 2_500)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_corrupt_fragment_rejected() {
        let data = vec![1u8; 500];
        let mut fragments = split(&data, 256, 5);
        fragments[0].payload[0] ^= 0xFF;
        let reassembler = Reassembler::new(60_000);
        assert!(reassembler.accept("lora1a", &fragments[0], 0).is_err());
    }

    #[test]
    fn test_single_fragment_message() {
        let data = vec![9u8; 100];
        let fragments = split(&data, 256, 11);
        assert_eq!(fragments.len(), 1);
        let reassembler = Reassembler::new(60_000);
        let message = reassembler
            .accept("lora1a", &fragments[0], 0)
            .unwrap()
            .unwrap();
        assert_eq!(message, data);
    }
}
