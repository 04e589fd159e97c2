//! Payment collaborator used by auto-renewal.

use crate::protocol::models::Plan;
use crate::GateError;

/// Charges a subject for one period of a plan.
///
/// Implementations may block; the sweeper calls them from the blocking pool.
pub trait PaymentGateway: Send + Sync {
    /// Charge the subject and return the payment transaction reference.
    ///
    /// # Errors
    /// `PaymentDeclined` when the charge did not go through.
    fn charge(
        &self,
        subject: &str,
        plan: Plan,
        payment_method: Option<&str>,
    ) -> Result<String, GateError>;
}

/// Gateway that approves every charge with a fresh `AUTO_` reference.
///
/// Stand-in for deployments where billing happens outside this engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproveAll;

impl PaymentGateway for ApproveAll {
    fn charge(
        &self,
        _subject: &str,
        _plan: Plan,
        _payment_method: Option<&str>,
    ) -> Result<String, GateError> {
        Ok(format!("AUTO_{}", uuid::Uuid::new_v4()))
    }
}
