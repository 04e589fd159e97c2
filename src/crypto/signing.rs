//! Signing string construction and credential issuance.
//!
//! The signing string is the first two token segments joined by a dot:
//! ```text
//! <base64url(header)>.<base64url(claims)>
//! ```

use crate::crypto::keys::key_id;
use crate::crypto::token::{encode_segment, CredentialClaims, TokenHeader, ALGORITHM};
use crate::GateError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};

/// Build the string the Ed25519 signature covers.
///
/// Segments are used exactly as they appear on the wire, never re-encoded.
pub fn build_signing_string(header_b64: &str, claims_b64: &str) -> String {
    format!("{}.{}", header_b64, claims_b64)
}

/// Issues credentials in the format the verifier accepts.
///
/// Belongs to the external issuer; the engine itself only verifies.
pub struct CredentialSigner {
    key: SigningKey,
    kid: String,
}

impl CredentialSigner {
    /// Signer from a raw 32-byte Ed25519 seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let key = SigningKey::from_bytes(seed);
        let kid = key_id(&key.verifying_key());
        Self { key, kid }
    }

    /// Signer from a hex-encoded 32-byte seed.
    pub fn from_hex(seed_hex: &str) -> Result<Self, GateError> {
        let bytes = hex::decode(seed_hex)
            .map_err(|e| GateError::ConfigError(format!("Invalid signing seed hex: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| GateError::ConfigError("Signing seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// The matching verifying key, for the verifier's key ring.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Key id stamped into issued headers.
    pub fn key_id(&self) -> &str {
        &self.kid
    }

    /// Issue a credential for `subject` valid for `ttl` from `issued_at`.
    pub fn issue(&self, subject: &str, issued_at: DateTime<Utc>, ttl: Duration) -> String {
        self.sign_claims(&CredentialClaims {
            sub: Some(subject.to_string()),
            iat: issued_at.timestamp(),
            exp: (issued_at + ttl).timestamp(),
        })
    }

    /// Sign arbitrary claims. No validation is applied.
    pub fn sign_claims(&self, claims: &CredentialClaims) -> String {
        let header = TokenHeader {
            alg: ALGORITHM.to_string(),
            kid: Some(self.kid.clone()),
        };
        let header_b64 = encode_segment(&header);
        let claims_b64 = encode_segment(claims);
        let signing_string = build_signing_string(&header_b64, &claims_b64);
        let signature = self.key.sign(signing_string.as_bytes());
        format!(
            "{}.{}",
            signing_string,
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        )
    }
}
