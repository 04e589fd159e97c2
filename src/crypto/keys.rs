//! Ed25519 verifying keys and the key ring that serves as signing material.

use crate::GateError;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;

/// Cache for decoded verifying keys.
static KEY_CACHE: OnceCell<RwLock<HashMap<String, VerifyingKey>>> = OnceCell::new();

/// Decode a hex-encoded Ed25519 public key.
///
/// The key is cached after first decode.
pub fn decode_public_key(hex_key: &str) -> Result<VerifyingKey, GateError> {
    let cache = KEY_CACHE.get_or_init(|| RwLock::new(HashMap::new()));
    if let Ok(guard) = cache.read() {
        if let Some(key) = guard.get(hex_key) {
            return Ok(*key);
        }
    }

    let bytes = hex::decode(hex_key)
        .map_err(|e| GateError::ConfigError(format!("Invalid public key hex: {}", e)))?;

    let key_array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| GateError::ConfigError("Public key must be 32 bytes".to_string()))?;

    let verifying_key = VerifyingKey::from_bytes(&key_array)
        .map_err(|e| GateError::ConfigError(format!("Invalid Ed25519 public key: {}", e)))?;

    // Best-effort insert; a poisoned cache only costs a re-decode.
    if let Ok(mut guard) = cache.write() {
        guard.insert(hex_key.to_string(), verifying_key);
    }

    Ok(verifying_key)
}

/// Key id: first 16 hex chars of SHA-256 over the raw public key.
pub fn key_id(key: &VerifyingKey) -> String {
    let hash = Sha256::digest(key.as_bytes());
    hex::encode(&hash[..8])
}

/// Check an Ed25519 signature over a signing string.
pub fn verify_ed25519(signature: &[u8], signing_string: &str, key: &VerifyingKey) -> bool {
    let Ok(sig_array) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_array);
    key.verify(signing_string.as_bytes(), &signature).is_ok()
}

/// Ordered set of verifying keys indexed by key id.
///
/// Rotation is done by building a new ring and handing it to
/// [`crate::crypto::verifier::CredentialVerifier::rotate`].
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: Vec<(String, VerifyingKey)>,
}

impl KeyRing {
    /// Empty ring. Every token verifies as invalid against it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ring from hex-encoded public keys.
    pub fn from_hex_keys(hex_keys: &[&str]) -> Result<Self, GateError> {
        let mut ring = Self::new();
        for hex_key in hex_keys {
            ring.add(decode_public_key(hex_key)?);
        }
        Ok(ring)
    }

    /// Add a key and return its id. Adding a key twice is a no-op.
    pub fn add(&mut self, key: VerifyingKey) -> String {
        let kid = key_id(&key);
        if self.get(&kid).is_none() {
            self.keys.push((kid.clone(), key));
        }
        kid
    }

    /// Look up a key by id.
    pub fn get(&self, kid: &str) -> Option<&VerifyingKey> {
        self.keys.iter().find(|(id, _)| id == kid).map(|(_, k)| k)
    }

    /// Keys in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &VerifyingKey> {
        self.keys.iter().map(|(_, k)| k)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the ring holds no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
