//! Access Manager - the main public API for Subgate.
//!
//! The `AccessManager` wires one engine from a [`GateConfig`]:
//! - Credential verification against a rotatable key ring
//! - Route classification and request admission
//! - The subscription ledger and its background sweeps

use crate::clock::{Clock, SystemClock};
use crate::config::{chrono_window, GateConfig};
use crate::crypto::keys::KeyRing;
use crate::crypto::verifier::CredentialVerifier;
use crate::identity::IdentityStore;
use crate::ledger::file::FileStore;
use crate::ledger::lifecycle::SubscriptionLedger;
use crate::ledger::store::{MemoryStore, SubscriptionStore};
use crate::notify::sink::{LogSink, NotificationSink, Notifier};
use crate::policy::access::{Admission, RequestGate};
use crate::policy::routes::RouteTable;
use crate::sweeper::payment::{ApproveAll, PaymentGateway};
use crate::sweeper::scheduler::{LifecycleSweeper, SweeperHandle};
use crate::GateError;
use std::sync::Arc;

/// External systems the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Subject lookup and subscription linkage.
    pub identities: Arc<dyn IdentityStore>,

    /// Subscription persistence.
    pub store: Arc<dyn SubscriptionStore>,

    /// Outbound notification channel.
    pub notifications: Arc<dyn NotificationSink>,

    /// Charges for auto-renewal.
    pub payments: Arc<dyn PaymentGateway>,
}

impl Collaborators {
    /// In-memory store, log-only notifications, every charge approved.
    pub fn in_memory(identities: Arc<dyn IdentityStore>) -> Self {
        Self {
            identities,
            store: Arc::new(MemoryStore::new()),
            notifications: Arc::new(LogSink),
            payments: Arc::new(ApproveAll),
        }
    }

    /// Like [`Collaborators::in_memory`] but with a [`FileStore`] under the
    /// platform data directory.
    ///
    /// # Errors
    /// `StorageIO` if the data directory cannot be created or the existing
    /// file cannot be read.
    pub fn durable(
        identities: Arc<dyn IdentityStore>,
        config: &GateConfig,
    ) -> Result<Self, GateError> {
        Ok(Self {
            store: Arc::new(FileStore::new(config.data_namespace)?),
            ..Self::in_memory(identities)
        })
    }
}

/// Main entry point for Subgate.
///
/// Create one instance per service and share it across request handlers.
pub struct AccessManager {
    config: GateConfig,
    clock: Arc<dyn Clock>,
    verifier: Arc<CredentialVerifier>,
    ledger: SubscriptionLedger,
    gate: RequestGate,
    sweeper: Arc<LifecycleSweeper>,
}

impl AccessManager {
    /// Create a new access manager.
    ///
    /// Uses the system clock for time operations.
    ///
    /// # Errors
    /// `ConfigError` if configuration validation fails.
    pub fn new(
        config: GateConfig,
        keys: KeyRing,
        routes: RouteTable,
        collaborators: Collaborators,
    ) -> Result<Self, GateError> {
        Self::with_clock(config, keys, routes, collaborators, Arc::new(SystemClock))
    }

    /// Create an access manager with a custom clock (for testing).
    #[cfg(any(test, feature = "test-seams"))]
    pub fn new_with_clock(
        config: GateConfig,
        keys: KeyRing,
        routes: RouteTable,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GateError> {
        Self::with_clock(config, keys, routes, collaborators, clock)
    }

    fn with_clock(
        config: GateConfig,
        keys: KeyRing,
        routes: RouteTable,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GateError> {
        config.validate()?;

        let verifier = Arc::new(
            CredentialVerifier::new(keys, Arc::clone(&clock))
                .with_skew(chrono_window(config.clock_skew)?),
        );
        let ledger = SubscriptionLedger::new(
            collaborators.store,
            Arc::clone(&clock),
            Notifier::new(collaborators.notifications),
            &config,
        )?
        .with_identities(Arc::clone(&collaborators.identities));
        let gate = RequestGate::new(
            Arc::new(routes),
            Arc::clone(&verifier),
            collaborators.identities,
            ledger.clone(),
        );
        let sweeper = Arc::new(LifecycleSweeper::new(
            ledger.clone(),
            collaborators.payments,
            Arc::clone(&clock),
            &config,
        )?);

        Ok(Self {
            config,
            clock,
            verifier,
            ledger,
            gate,
            sweeper,
        })
    }

    /// Decide whether a request may proceed. See [`RequestGate::admit`].
    pub async fn admit(
        &self,
        method: &str,
        path: &str,
        credential: Option<&str>,
    ) -> Result<Admission, GateError> {
        self.gate.admit(method, path, credential).await
    }

    /// Subscription lifecycle operations.
    pub fn ledger(&self) -> &SubscriptionLedger {
        &self.ledger
    }

    /// Request gate.
    pub fn gate(&self) -> &RequestGate {
        &self.gate
    }

    /// Credential verifier.
    pub fn verifier(&self) -> &CredentialVerifier {
        &self.verifier
    }

    /// Route table in use.
    pub fn routes(&self) -> &RouteTable {
        self.gate.routes()
    }

    /// Lifecycle sweeper, for running sweeps on demand.
    pub fn sweeper(&self) -> &LifecycleSweeper {
        &self.sweeper
    }

    /// Active configuration.
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Clock used for every time decision.
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Replace the credential signing material.
    pub fn rotate_keys(&self, keys: KeyRing) {
        self.verifier.rotate(keys);
    }

    /// Spawn the periodic sweeps on the current tokio runtime.
    pub fn start_sweeper(&self) -> SweeperHandle {
        Arc::clone(&self.sweeper).start()
    }
}
