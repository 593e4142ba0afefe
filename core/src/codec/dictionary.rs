use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::crypto::{hash, keys};
use crate::error::{CoreError, Result};

/// A versioned, signed compression dictionary.
///
/// Built from a sample corpus (repeated address prefixes, script
/// templates, common field patterns) and distributed to peers. The
/// content is a raw zstd dictionary: the concatenated high-frequency
/// samples themselves, most valuable material last (zstd weights the
/// tail of a raw dictionary highest).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dictionary {
    pub id: u32,
    pub version: u32,
    /// blake3 of `bytes`, hex.
    pub content_hash: String,
    pub bytes: Vec<u8>,
    pub signer_public_key: String,
    /// Signature over `(id, version, content_hash)`.
    pub signature: String,
}

impl Dictionary {
    fn signing_message(id: u32, version: u32, content_hash: &str) -> Vec<u8> {
        let mut msg = Vec::with_capacity(8 + content_hash.len());
        msg.extend_from_slice(&id.to_le_bytes());
        msg.extend_from_slice(&version.to_le_bytes());
        msg.extend_from_slice(content_hash.as_bytes());
        msg
    }

    /// Build a dictionary from a sample corpus, newest samples last,
    /// capped at `max_size` bytes (the tail is kept).
    pub fn build_from_samples(
        id: u32,
        version: u32,
        samples: &[Vec<u8>],
        max_size: usize,
        signer: &keys::Keypair,
    ) -> Result<Self> {
        if samples.is_empty() {
            return Err(CoreError::Configuration(
                "dictionary needs at least one sample".into(),
            ));
        }
        let mut bytes: Vec<u8> = Vec::new();
        for sample in samples {
            bytes.extend_from_slice(sample);
        }
        if bytes.len() > max_size {
            bytes = bytes.split_off(bytes.len() - max_size);
        }

        let content_hash = hash::blake_hex(&bytes);
        let signature = signer.sign_hex(&Self::signing_message(id, version, &content_hash));
        Ok(Self {
            id,
            version,
            content_hash,
            bytes,
            signer_public_key: signer.public_key_hex(),
            signature,
        })
    }

    pub fn verify(&self) -> bool {
        if self.content_hash != hash::blake_hex(&self.bytes) {
            return false;
        }
        keys::verify_hex(
            &self.signer_public_key,
            &Self::signing_message(self.id, self.version, &self.content_hash),
            &self.signature,
        )
    }
}

/// Known dictionaries, keyed by id. Frames referencing an id that is not
/// registered here are refused.
#[derive(Clone, Default)]
pub struct DictionaryRegistry {
    dictionaries: Arc<RwLock<HashMap<u32, Arc<Dictionary>>>>,
}

impl DictionaryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register after signature verification. A newer version replaces
    /// an older one under the same id; a stale version is ignored.
    pub fn register(&self, dictionary: Dictionary) -> Result<()> {
        if !dictionary.verify() {
            return Err(CoreError::Protocol(format!(
                "dictionary {} failed signature verification",
                dictionary.id
            )));
        }
        let mut map = self.dictionaries.write();
        match map.get(&dictionary.id) {
            Some(existing) if existing.version >= dictionary.version => Ok(()),
            _ => {
                map.insert(dictionary.id, Arc::new(dictionary));
                Ok(())
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<Arc<Dictionary>> {
        self.dictionaries.read().get(&id).cloned()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.dictionaries.read().contains_key(&id)
    }

    pub fn ids(&self) -> Vec<u32> {
        self.dictionaries.read().keys().copied().collect()
    }
}
