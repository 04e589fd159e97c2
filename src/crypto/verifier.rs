//! Credential verification pipeline.
//!
//! 1. Split and decode the token (malformed → `Invalid`)
//! 2. Select key(s) from the ring by `kid`
//! 3. Verify the Ed25519 signature (mismatch → `Invalid`)
//! 4. Compare expiry to the clock (late → `Expired`, subject kept)

use crate::clock::Clock;
use crate::crypto::expiry::{claim_instant, within_expiry};
use crate::crypto::keys::{verify_ed25519, KeyRing};
use crate::crypto::token::{parse_token, ParsedToken, TokenDefect};
use chrono::Duration;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Outcome of verifying a bearer credential. Never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Signature checks out and `now <= expiry`.
    Valid(String),
    /// Signature checks out but the credential is past its expiry.
    Expired(String),
    /// Malformed, unsigned, wrongly signed, or missing its subject.
    Invalid,
}

impl Verification {
    /// Subject of a valid credential.
    pub fn valid_subject(&self) -> Option<&str> {
        match self {
            Verification::Valid(subject) => Some(subject),
            _ => None,
        }
    }
}

/// Verifies credentials against a rotatable key ring.
pub struct CredentialVerifier {
    keys: RwLock<Arc<KeyRing>>,
    clock: Arc<dyn Clock>,
    skew: Duration,
}

impl CredentialVerifier {
    /// Verifier with strict expiry (no skew tolerance).
    pub fn new(keys: KeyRing, clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: RwLock::new(Arc::new(keys)),
            clock,
            skew: Duration::zero(),
        }
    }

    /// Allow credentials up to `skew` past their expiry.
    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    /// Replace the signing material. In-flight verifications finish on the old ring.
    pub fn rotate(&self, keys: KeyRing) {
        let next = Arc::new(keys);
        match self.keys.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    fn ring(&self) -> Arc<KeyRing> {
        match self.keys.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Classify a token as valid, expired or invalid.
    pub fn verify(&self, token: &str) -> Verification {
        let parsed = match parse_token(token) {
            Ok(parsed) => parsed,
            Err(defect) => return invalid(defect),
        };

        if !self.signature_matches(&parsed) {
            return invalid(TokenDefect::Signature);
        }

        let Some(expiry) = claim_instant(parsed.claims.exp) else {
            return invalid(TokenDefect::Window);
        };

        let subject = parsed.subject().to_string();
        if within_expiry(expiry, self.clock.now_utc(), self.skew) {
            Verification::Valid(subject)
        } else {
            debug!(subject = %subject, expiry = %expiry, "credential expired");
            Verification::Expired(subject)
        }
    }

    fn signature_matches(&self, parsed: &ParsedToken) -> bool {
        let ring = self.ring();
        match parsed.header.kid.as_deref() {
            Some(kid) => ring
                .get(kid)
                .is_some_and(|key| verify_ed25519(&parsed.signature, &parsed.signing_string, key)),
            None => ring
                .iter()
                .any(|key| verify_ed25519(&parsed.signature, &parsed.signing_string, key)),
        }
    }
}

fn invalid(defect: TokenDefect) -> Verification {
    debug!(%defect, "credential rejected");
    Verification::Invalid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::crypto::signing::CredentialSigner;
    use crate::crypto::token::{encode_segment, CredentialClaims, TokenHeader};
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use chrono::{TimeZone, Utc};
    use ed25519_dalek::{Signer, SigningKey};

    // Test keypair (DO NOT USE IN PRODUCTION)
    const TEST_SEED_HEX: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";
    const OTHER_SEED: [u8; 32] = [7u8; 32];

    fn setup() -> (CredentialSigner, MockClock, CredentialVerifier) {
        let signer = CredentialSigner::from_hex(TEST_SEED_HEX).unwrap();
        let clock = MockClock::new(Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap());
        let mut ring = KeyRing::new();
        ring.add(signer.verifying_key());
        let verifier = CredentialVerifier::new(ring, Arc::new(clock.clone()));
        (signer, clock, verifier)
    }

    #[test]
    fn test_valid_token() {
        let (signer, clock, verifier) = setup();
        let token = signer.issue("seller@example.com", clock.now_utc(), Duration::hours(1));
        assert_eq!(
            verifier.verify(&token),
            Verification::Valid("seller@example.com".to_string())
        );
    }

    #[test]
    fn test_expiry_boundary_inclusive() {
        let (signer, clock, verifier) = setup();
        let token = signer.issue("a@example.com", clock.now_utc(), Duration::hours(1));
        clock.advance(Duration::hours(1));
        assert!(matches!(verifier.verify(&token), Verification::Valid(_)));
    }

    #[test]
    fn test_expired_one_second_ago_keeps_subject() {
        let (signer, clock, verifier) = setup();
        let issued = clock.now_utc() - Duration::hours(1) - Duration::seconds(1);
        let token = signer.issue("a@example.com", issued, Duration::hours(1));
        assert_eq!(
            verifier.verify(&token),
            Verification::Expired("a@example.com".to_string())
        );
    }

    #[test]
    fn test_skew_tolerance_extends_validity() {
        let (signer, clock, verifier) = setup();
        let verifier = verifier.with_skew(Duration::seconds(30));
        let issued = clock.now_utc() - Duration::hours(1) - Duration::seconds(10);
        let token = signer.issue("a@example.com", issued, Duration::hours(1));
        assert!(matches!(verifier.verify(&token), Verification::Valid(_)));
    }

    #[test]
    fn test_tampered_claims_invalid() {
        let (signer, clock, verifier) = setup();
        let token = signer.issue("a@example.com", clock.now_utc(), Duration::hours(1));
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = encode_segment(&CredentialClaims {
            sub: Some("admin@example.com".to_string()),
            iat: clock.now_utc().timestamp(),
            exp: (clock.now_utc() + Duration::days(365)).timestamp(),
        });
        parts[1] = &forged;
        assert_eq!(verifier.verify(&parts.join(".")), Verification::Invalid);
    }

    #[test]
    fn test_unknown_signer_invalid() {
        let (_, clock, verifier) = setup();
        let stranger = CredentialSigner::from_seed(&OTHER_SEED);
        let token = stranger.issue("a@example.com", clock.now_utc(), Duration::hours(1));
        assert_eq!(verifier.verify(&token), Verification::Invalid);
    }

    #[test]
    fn test_token_without_kid_tries_whole_ring() {
        let (_, clock, verifier) = setup();
        let key = SigningKey::from_bytes(&hex::decode(TEST_SEED_HEX).unwrap().try_into().unwrap());
        let header = encode_segment(&TokenHeader {
            alg: "EdDSA".to_string(),
            kid: None,
        });
        let claims = encode_segment(&CredentialClaims {
            sub: Some("a@example.com".to_string()),
            iat: clock.now_utc().timestamp(),
            exp: (clock.now_utc() + Duration::minutes(5)).timestamp(),
        });
        let signing_string = format!("{}.{}", header, claims);
        let sig = URL_SAFE_NO_PAD.encode(key.sign(signing_string.as_bytes()).to_bytes());
        let token = format!("{}.{}", signing_string, sig);
        assert!(matches!(verifier.verify(&token), Verification::Valid(_)));
    }

    #[test]
    fn test_missing_subject_invalid_even_if_signed() {
        let (signer, clock, verifier) = setup();
        let token = signer.sign_claims(&CredentialClaims {
            sub: None,
            iat: clock.now_utc().timestamp(),
            exp: (clock.now_utc() + Duration::hours(1)).timestamp(),
        });
        assert_eq!(verifier.verify(&token), Verification::Invalid);
    }

    #[test]
    fn test_garbage_invalid() {
        let (_, _, verifier) = setup();
        assert_eq!(verifier.verify("Bearer nonsense"), Verification::Invalid);
        assert_eq!(verifier.verify(""), Verification::Invalid);
    }

    #[test]
    fn test_rotation_drops_old_key() {
        let (signer, clock, verifier) = setup();
        let token = signer.issue("a@example.com", clock.now_utc(), Duration::hours(1));

        let next = CredentialSigner::from_seed(&OTHER_SEED);
        let mut ring = KeyRing::new();
        ring.add(next.verifying_key());
        verifier.rotate(ring);

        assert_eq!(verifier.verify(&token), Verification::Invalid);
        let fresh = next.issue("a@example.com", clock.now_utc(), Duration::hours(1));
        assert!(matches!(verifier.verify(&fresh), Verification::Valid(_)));
    }
}
