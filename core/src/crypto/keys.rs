use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use std::convert::TryInto;
use zeroize::Zeroizing;

/// Node/wallet keypair. The secret half is kept in zeroizing storage and
/// never serialized by this module.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing: SigningKey::generate(&mut csprng),
        }
    }

    pub fn from_secret_hex(secret_hex: &str) -> Option<Self> {
        let bytes = Zeroizing::new(hex::decode(secret_hex).ok()?);
        let arr: [u8; 32] = bytes.as_slice().try_into().ok()?;
        Some(Self {
            signing: SigningKey::from_bytes(&arr),
        })
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().as_bytes())
    }

    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing.to_bytes()))
    }

    pub fn address(&self) -> String {
        address_from_public_key_bytes(self.signing.verifying_key().as_bytes())
    }

    /// 64-byte ed25519 signature, hex encoded.
    pub fn sign_hex(&self, msg: &[u8]) -> String {
        hex::encode(self.signing.sign(msg).to_bytes())
    }
}

pub fn verify(public_key_bytes: &[u8], msg: &[u8], signature_bytes: &[u8]) -> bool {
    let pk_array: [u8; 32] = match public_key_bytes.try_into() {
        Ok(arr) => arr,
        Err(_) => return false,
    };

    let public_key = match VerifyingKey::from_bytes(&pk_array) {
        Ok(pk) => pk,
        Err(_) => return false,
    };

    let signature_array: [u8; 64] = match signature_bytes.try_into() {
        Ok(arr) => arr,
        Err(_) => return false,
    };

    let signature = Signature::from_bytes(&signature_array);

    public_key.verify(msg, &signature).is_ok()
}

/// Hex-string convenience wrapper around [`verify`].
pub fn verify_hex(public_key_hex: &str, msg: &[u8], signature_hex: &str) -> bool {
    let pk = match hex::decode(public_key_hex) {
        Ok(b) => b,
        Err(_) => return false,
    };
    let sig = match hex::decode(signature_hex) {
        Ok(b) => b,
        Err(_) => return false,
    };
    verify(&pk, msg, &sig)
}

const LORA_BASE32_ALPHABET: &[u8; 32] = b"023456789acdefghjklmnpqrstuvwxyz";

/// Compute a 4-character checksum from the address body using SHA-256.
///
/// Derived from `"lora1" + body[0..35]` and encoded as 4 base32
/// characters, giving 2^20 ≈ 1M-to-1 typo detection rate.
fn compute_address_checksum(body_35: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"lora1");
    hasher.update(body_35.as_bytes());
    let hash = hasher.finalize();
    let mut ck = String::with_capacity(4);
    for &byte in &hash[..2] {
        ck.push(LORA_BASE32_ALPHABET[(byte % 32) as usize] as char);
        ck.push(LORA_BASE32_ALPHABET[((byte / 32) % 32) as usize] as char);
    }
    ck
}

/// Derive a `lora1...` address from public key bytes (44 chars):
///   `lora1` (5) + body (35) + checksum (4)
///
/// Algorithm:
///   1. `sha256(pubkey)` → `ripemd160(sha256)` → 20 bytes
///   2. Encode each byte as 2 base32 chars → 40 raw chars
///   3. Truncate to 35 body chars
///   4. Append 4-char checksum of `"lora1" + body`
pub fn address_from_public_key_bytes(public_key_bytes: &[u8]) -> String {
    let sha = Sha256::digest(public_key_bytes);
    let key_hash = Ripemd160::digest(sha);

    let mut data = String::with_capacity(40);
    for &byte in key_hash.as_slice() {
        data.push(LORA_BASE32_ALPHABET[(byte % 32) as usize] as char);
        data.push(LORA_BASE32_ALPHABET[((byte / 32) % 32) as usize] as char);
    }
    data.truncate(35);

    let checksum = compute_address_checksum(&data);
    format!("lora1{data}{checksum}")
}

pub fn address_from_public_key_hex(pk_hex: &str) -> Option<String> {
    let pk_bytes = hex::decode(pk_hex).ok()?;
    Some(address_from_public_key_bytes(&pk_bytes))
}

/// Validate a lora1 address: format + embedded checksum.
pub fn is_valid_address(address: &str) -> bool {
    if !address.starts_with("lora1") {
        return false;
    }
    if address.len() != 44 {
        return false;
    }
    if !address
        .as_bytes()
        .iter()
        .skip(5)
        .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'z'))
    {
        return false;
    }

    let body = &address[5..40];
    let expected_ck = compute_address_checksum(body);
    let actual_ck = &address[40..44];
    expected_ck == actual_ck
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_length_is_44() {
        let addr = address_from_public_key_bytes(&[1u8; 32]);
        assert_eq!(addr.len(), 44);
        assert!(addr.starts_with("lora1"));
    }

    #[test]
    fn test_checksum_round_trip() {
        for seed in 0u8..=255 {
            let addr = address_from_public_key_bytes(&[seed; 32]);
            assert!(is_valid_address(&addr), "checksum failed for seed {seed}");
        }
    }

    #[test]
    fn test_checksum_detects_single_char_mutation() {
        let addr = address_from_public_key_bytes(&[42u8; 32]);
        let mut bad = addr.clone().into_bytes();
        bad[10] = if bad[10] == b'0' { b'a' } else { b'0' };
        let bad_addr = String::from_utf8(bad).unwrap();
        assert!(!is_valid_address(&bad_addr));
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = Keypair::generate();
        let sig = kp.sign_hex(b"hello mesh");
        assert!(verify_hex(&kp.public_key_hex(), b"hello mesh", &sig));
        assert!(!verify_hex(&kp.public_key_hex(), b"hello nesh", &sig));
    }

    #[test]
    fn test_keypair_round_trip_through_secret() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_hex(&kp.secret_hex()).unwrap();
        assert_eq!(kp.address(), restored.address());
    }

    #[test]
    fn test_deterministic_address() {
        let pk = [99u8; 32];
        assert_eq!(
            address_from_public_key_bytes(&pk),
            address_from_public_key_bytes(&pk)
        );
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(!is_valid_address("btc1aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
        assert!(!is_valid_address("lora1short"));
        assert!(!is_valid_address(""));
    }
}
