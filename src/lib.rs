//! # Subgate
//!
//! **Access control and subscription lifecycle for paid API services.**
//!
//! Subgate decides, per request, whether a caller may reach a route, and owns
//! the subscription state that gated routes depend on.
//!
//! ## Features
//!
//! - **Ed25519 bearer credentials** - signed, time-bounded tokens checked against a rotatable key ring
//! - **Declarative route table** - most specific rule wins, pre-flight always public
//! - **Subscription ledger** - create, activate, extend, cancel, auto-renew with at most one active subscription per subject
//! - **Lifecycle sweeps** - hourly expiry, daily reminders, daily auto-renewal
//! - **Typed outcomes** - rejections are values, only storage faults are retryable errors
//!
//! ## Quickstart
//!
//! ```no_run
//! use std::sync::Arc;
//! use subgate::{
//!     AccessManager, Collaborators, GateConfig, KeyRing, MemoryIdentityStore, RouteTable,
//!     Subject,
//! };
//!
//! # async fn run() -> Result<(), subgate::GateError> {
//! let identities = Arc::new(MemoryIdentityStore::new());
//! identities.insert(Subject::new("seller@example.com"));
//!
//! let keys = KeyRing::from_hex_keys(&[
//!     "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a",
//! ])?;
//! let manager = AccessManager::new(
//!     GateConfig::default(),
//!     keys,
//!     RouteTable::default_rules(),
//!     Collaborators::in_memory(identities),
//! )?;
//! let sweeps = manager.start_sweeper();
//!
//! let admission = manager
//!     .admit("GET", "/api/analytics/sales", Some("Bearer <token>"))
//!     .await?;
//! if !admission.is_admitted() {
//!     println!("refused: {:?}", admission.reason());
//! }
//!
//! sweeps.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Threat Model
//!
//! Subgate protects against:
//! - **Forged credentials** - tokens must carry a valid signature from a key in the ring
//! - **Stale credentials** - expired tokens are refused; the subject is reported for diagnostics
//! - **Double activation** - concurrent purchases can never leave two active subscriptions
//!
//! Subgate does **not** issue credentials to end users or collect payments;
//! those are collaborators supplied by the host service.
//!
//! ## Configuration
//!
//! - `storage_timeout` - deadline for a single ledger operation
//! - `expire_interval` / `reminder_interval` / `renewal_interval` - sweep cadence
//! - `expiring_soon_window` / `renewal_window` - sweep selection windows
//! - `clock_skew` - tolerance on credential expiry (zero by default)
//!
//! See [`GateConfig`] for full documentation.

#![warn(missing_docs)]

// Core modules
pub mod clock;
pub mod config;
pub mod errors;

// Crypto layer
pub mod crypto;

// Protocol layer
pub mod protocol;

// Collaborators
pub mod identity;
pub mod notify;

// Policy layer
pub mod policy;

// Ledger layer
pub mod ledger;

// Background sweeps
pub mod sweeper;

// Manager (main public API)
pub mod manager;

// Re-exports for public API
pub use clock::{Clock, SystemClock};
pub use config::GateConfig;
pub use crypto::keys::KeyRing;
pub use crypto::signing::CredentialSigner;
pub use crypto::verifier::{CredentialVerifier, Verification};
pub use errors::GateError;
pub use identity::{IdentityStore, MemoryIdentityStore};
pub use ledger::file::FileStore;
pub use ledger::lifecycle::SubscriptionLedger;
pub use ledger::store::{MemoryStore, SubscriptionStore};
pub use manager::{AccessManager, Collaborators};
pub use notify::sink::{LogSink, NotificationSink};
pub use notify::webhook::WebhookSink;
pub use policy::access::{bearer_token, Admission, RejectReason, Rejection, RequestGate};
pub use policy::routes::{RouteClass, RouteRule, RouteTable};
pub use protocol::models::{
    AccessCheck, Plan, PlanInfo, Subject, Subscription, SubscriptionInfo, SubscriptionStatus,
};
pub use sweeper::payment::{ApproveAll, PaymentGateway};
pub use sweeper::scheduler::{LifecycleSweeper, SweepReport, SweepTask, SweeperHandle};

#[cfg(any(test, feature = "test-seams"))]
pub use clock::MockClock;
#[cfg(any(test, feature = "test-seams"))]
pub use notify::sink::RecordingSink;
