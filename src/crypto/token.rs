//! Compact credential token parsing.
//!
//! Wire form: `base64url(header).base64url(claims).base64url(signature)`,
//! unpadded. Header is `{"alg":"EdDSA","kid":"..."}`, claims are
//! `{"sub":"...","iat":<unix>,"exp":<unix>}`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The only accepted signature algorithm.
pub const ALGORITHM: &str = "EdDSA";

/// Token header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHeader {
    /// Signature algorithm, must be `EdDSA`.
    pub alg: String,
    /// Key id of the signing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

/// Credential claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialClaims {
    /// Subject identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// Why a token was rejected as structurally unusable.
///
/// Only used for diagnostics; callers see a plain `Invalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenDefect {
    /// Not exactly three dot-separated segments.
    Segments,
    /// A segment is not valid unpadded base64url.
    Encoding,
    /// Header JSON unreadable.
    Header,
    /// Claims JSON unreadable.
    Claims,
    /// Header names an algorithm other than EdDSA.
    Algorithm,
    /// `sub` missing or empty.
    MissingSubject,
    /// `exp` not after `iat`.
    Window,
    /// No key in the ring matches, or the signature does not check out.
    Signature,
}

impl fmt::Display for TokenDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TokenDefect::Segments => "wrong segment count",
            TokenDefect::Encoding => "bad base64url segment",
            TokenDefect::Header => "unreadable header",
            TokenDefect::Claims => "unreadable claims",
            TokenDefect::Algorithm => "unsupported algorithm",
            TokenDefect::MissingSubject => "subject claim absent",
            TokenDefect::Window => "expiry not after issuance",
            TokenDefect::Signature => "signature mismatch",
        };
        f.write_str(text)
    }
}

/// A token split into its verified-later parts.
#[derive(Debug, Clone)]
pub struct ParsedToken {
    /// Decoded header.
    pub header: TokenHeader,
    /// Decoded claims; `sub` is guaranteed present and non-empty.
    pub claims: CredentialClaims,
    /// The exact bytes the signature covers.
    pub signing_string: String,
    /// Raw signature bytes.
    pub signature: Vec<u8>,
}

impl ParsedToken {
    /// Subject claim.
    pub fn subject(&self) -> &str {
        self.claims.sub.as_deref().unwrap_or_default()
    }
}

/// Split and decode a token without checking its signature.
pub fn parse_token(token: &str) -> Result<ParsedToken, TokenDefect> {
    let mut parts = token.trim().split('.');
    let (Some(header_b64), Some(claims_b64), Some(sig_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenDefect::Segments);
    };

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| TokenDefect::Encoding)?;
    let claims_bytes = URL_SAFE_NO_PAD
        .decode(claims_b64)
        .map_err(|_| TokenDefect::Encoding)?;
    let signature = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| TokenDefect::Encoding)?;

    let header: TokenHeader =
        serde_json::from_slice(&header_bytes).map_err(|_| TokenDefect::Header)?;
    if header.alg != ALGORITHM {
        return Err(TokenDefect::Algorithm);
    }

    let claims: CredentialClaims =
        serde_json::from_slice(&claims_bytes).map_err(|_| TokenDefect::Claims)?;
    if claims.sub.as_deref().map_or(true, str::is_empty) {
        return Err(TokenDefect::MissingSubject);
    }
    if claims.exp <= claims.iat {
        return Err(TokenDefect::Window);
    }

    Ok(ParsedToken {
        header,
        claims,
        signing_string: super::signing::build_signing_string(header_b64, claims_b64),
        signature,
    })
}

/// Encode a JSON-serializable segment as unpadded base64url.
pub fn encode_segment<T: Serialize>(value: &T) -> String {
    // Header and claims are plain structs of strings and integers.
    let json = serde_json::to_vec(value).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}
