//! Subgate error types.

use crate::protocol::models::{SubscriptionId, SubscriptionStatus};
use thiserror::Error;

/// Errors raised by ledger operations, sweeps and configuration loading.
///
/// Credential verification and route classification never produce these;
/// they return classification values instead. Gate rejections are values too
/// (see [`crate::policy::access::Admission`]).
#[derive(Debug, Error)]
pub enum GateError {
    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Route rule table could not be parsed.
    #[error("Route table error: {0}")]
    RouteTable(String),

    /// Subject already holds a live subscription.
    #[error("Subject {subject} already has an active subscription")]
    Conflict {
        /// The subject that already holds a subscription.
        subject: String,
    },

    /// No row qualifies for the requested operation.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The row exists but its status does not permit the operation.
    #[error("Subscription {id} is {status}, operation not permitted")]
    InvalidState {
        /// Subscription the operation targeted.
        id: SubscriptionId,
        /// Status the row was found in.
        status: SubscriptionStatus,
    },

    /// Storage is unavailable or the call ran out of time. Retryable.
    #[error("Storage unavailable: {0}")]
    TransientStorage(String),

    /// Durable store I/O error.
    #[error("Storage I/O error: {0}")]
    StorageIO(String),

    /// Payment collaborator refused the charge.
    #[error("Payment declined: {0}")]
    PaymentDeclined(String),

    /// Notification sink could not deliver a message.
    #[error("Notification delivery failed: {0}")]
    NotifyFailed(String),
}

impl GateError {
    /// Whether a caller may retry the failed call with backoff.
    ///
    /// Conflict, not-found and invalid-state outcomes are deterministic and
    /// must not be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GateError::TransientStorage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_storage_is_retryable() {
        assert!(GateError::TransientStorage("down".into()).is_retryable());
        assert!(!GateError::Conflict {
            subject: "a@example.com".into()
        }
        .is_retryable());
        assert!(!GateError::NotFound("x".into()).is_retryable());
        assert!(!GateError::InvalidState {
            id: 1,
            status: SubscriptionStatus::Active
        }
        .is_retryable());
    }

    #[test]
    fn invalid_state_names_status() {
        let err = GateError::InvalidState {
            id: 7,
            status: SubscriptionStatus::Cancelled,
        };
        assert_eq!(
            err.to_string(),
            "Subscription 7 is CANCELLED, operation not permitted"
        );
    }
}
