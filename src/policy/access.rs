//! Per-request admission.
//!
//! This module combines the route table, credential verifier, identity store
//! and ledger into one decision:
//! - Public routes are admitted without looking at the credential
//! - Protected routes need a valid credential for a known, enabled subject
//! - Gated routes additionally need an active subscription
//!
//! Rejections are values, not errors. Only a failed or timed-out identity or
//! subscription lookup surfaces as `Err`.

use crate::crypto::verifier::{CredentialVerifier, Verification};
use crate::identity::IdentityStore;
use crate::ledger::lifecycle::SubscriptionLedger;
use crate::policy::routes::{RouteClass, RouteTable};
use crate::protocol::models::Subject;
use crate::GateError;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Why a request was refused. Clients can tell the two apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// Missing, invalid or expired credential, or an unknown/disabled subject.
    Unauthenticated,
    /// Authenticated, but the route needs an active subscription.
    SubscriptionRequired,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectReason::Unauthenticated => "UNAUTHENTICATED",
            RejectReason::SubscriptionRequired => "SUBSCRIPTION_REQUIRED",
        })
    }
}

/// Refusal with diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Rejection category.
    pub reason: RejectReason,
    /// Subject recovered from an expired credential.
    pub stale_subject: Option<String>,
}

impl Rejection {
    fn new(reason: RejectReason) -> Self {
        Self {
            reason,
            stale_subject: None,
        }
    }
}

/// Gate decision for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Let the request through, with the resolved subject if one was needed.
    Admitted(Option<Subject>),
    /// Refuse the request.
    Rejected(Rejection),
}

impl Admission {
    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }

    /// Resolved subject of an admitted request.
    pub fn subject(&self) -> Option<&Subject> {
        match self {
            Admission::Admitted(subject) => subject.as_ref(),
            Admission::Rejected(_) => None,
        }
    }

    /// Reason of a rejected request.
    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Admission::Admitted(_) => None,
            Admission::Rejected(rejection) => Some(rejection.reason),
        }
    }

    fn reject(reason: RejectReason) -> Self {
        Admission::Rejected(Rejection::new(reason))
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
///
/// The scheme is matched case-insensitively. Returns `None` for other
/// schemes and empty tokens.
pub fn bearer_token(header: &str) -> Option<&str> {
    let header = header.trim();
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Request gate.
#[derive(Clone)]
pub struct RequestGate {
    routes: Arc<RouteTable>,
    verifier: Arc<CredentialVerifier>,
    identities: Arc<dyn IdentityStore>,
    ledger: SubscriptionLedger,
}

impl RequestGate {
    /// Gate over its collaborators.
    pub fn new(
        routes: Arc<RouteTable>,
        verifier: Arc<CredentialVerifier>,
        identities: Arc<dyn IdentityStore>,
        ledger: SubscriptionLedger,
    ) -> Self {
        Self {
            routes,
            verifier,
            identities,
            ledger,
        }
    }

    /// Route table in use.
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Decide whether a request may proceed.
    ///
    /// `credential` is either the raw token or an `Authorization` header
    /// value.
    ///
    /// # Errors
    /// `TransientStorage` if the identity lookup, or the subscription lookup
    /// for a gated route, fails or misses the storage deadline.
    pub async fn admit(
        &self,
        method: &str,
        path: &str,
        credential: Option<&str>,
    ) -> Result<Admission, GateError> {
        let route = self.routes.resolve(method, path);
        if route.class == RouteClass::Public {
            debug!(method, path, "public route");
            return Ok(Admission::Admitted(None));
        }

        let verification = credential
            .map(|value| bearer_token(value).unwrap_or(value.trim()))
            .filter(|token| !token.is_empty())
            .map_or(Verification::Invalid, |token| self.verifier.verify(token));

        let subject_id = match verification {
            Verification::Valid(subject) => subject,
            Verification::Expired(subject) => {
                info!(method, path, subject = %subject, "rejected expired credential");
                return Ok(Admission::Rejected(Rejection {
                    reason: RejectReason::Unauthenticated,
                    stale_subject: Some(subject),
                }));
            }
            Verification::Invalid => {
                if route.allow_anonymous && route.class != RouteClass::Gated {
                    debug!(method, path, "anonymous fallthrough");
                    return Ok(Admission::Admitted(None));
                }
                info!(method, path, "rejected missing or invalid credential");
                return Ok(Admission::reject(RejectReason::Unauthenticated));
            }
        };

        let subject = match self.lookup_subject(&subject_id).await? {
            Some(subject) if subject.enabled => subject,
            Some(_) => {
                info!(method, path, subject = %subject_id, "rejected disabled subject");
                return Ok(Admission::reject(RejectReason::Unauthenticated));
            }
            None => {
                info!(method, path, subject = %subject_id, "rejected unknown subject");
                return Ok(Admission::reject(RejectReason::Unauthenticated));
            }
        };

        if route.class == RouteClass::Gated
            && !self.ledger.has_active_subscription(&subject.id).await?
        {
            info!(method, path, subject = %subject.id, "rejected without subscription");
            return Ok(Admission::reject(RejectReason::SubscriptionRequired));
        }

        debug!(method, path, subject = %subject.id, class = ?route.class, "admitted");
        Ok(Admission::Admitted(Some(subject)))
    }

    /// Identity lookup on the blocking pool, bounded by the storage deadline.
    async fn lookup_subject(&self, id: &str) -> Result<Option<Subject>, GateError> {
        let identities = Arc::clone(&self.identities);
        let owner = id.to_string();
        let lookup = tokio::task::spawn_blocking(move || identities.find_subject(&owner));
        match tokio::time::timeout(self.ledger.timeout(), lookup).await {
            Ok(Ok(found)) => Ok(found),
            Ok(Err(e)) => Err(GateError::TransientStorage(format!(
                "identity lookup failed: {}",
                e
            ))),
            Err(_) => Err(GateError::TransientStorage(
                "identity lookup deadline exceeded".to_string(),
            )),
        }
    }
}
