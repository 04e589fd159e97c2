//! Credential signing material and verification.

pub mod expiry;
pub mod keys;
pub mod signing;
pub mod token;
pub mod verifier;
