use sha2::{Digest, Sha256};

/// 32-byte blake3 digest — the hash used for block headers, transaction
/// ids, merkle nodes, and frame checksums.
pub fn blake(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

pub fn blake_hex(data: &[u8]) -> String {
    hex::encode(blake(data))
}

/// sha256 — only used on the address derivation path.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Count of leading zero bits of a digest, the proof-of-work measure.
/// A difficulty of `d` means the header hash starts with at least `d`
/// zero bits.
pub fn leading_zero_bits(hash: &[u8]) -> u32 {
    let mut count = 0u32;
    for &byte in hash {
        if byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros();
            break;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake_is_deterministic() {
        assert_eq!(blake(b"lorachain"), blake(b"lorachain"));
        assert_ne!(blake(b"a"), blake(b"b"));
    }

    #[test]
    fn test_blake_hex_length() {
        assert_eq!(blake_hex(b"x").len(), 64);
    }

    #[test]
    fn test_leading_zero_bits() {
        assert_eq!(leading_zero_bits(&[0xFF]), 0);
        assert_eq!(leading_zero_bits(&[0x7F]), 1);
        assert_eq!(leading_zero_bits(&[0x00, 0xFF]), 8);
        assert_eq!(leading_zero_bits(&[0x00, 0x0F]), 12);
        assert_eq!(leading_zero_bits(&[0x00, 0x00]), 16);
    }
}
