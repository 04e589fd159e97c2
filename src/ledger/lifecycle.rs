//! Subscription ledger - the authoritative lifecycle API.
//!
//! Every mutating operation:
//! - takes the subject's async lock, so same-subject writes are serialized
//! - reads the current row and decides the next one
//! - commits through a single conditional store write, retried on a stale read
//!
//! Store calls run on the blocking pool under the operation deadline. The
//! deadline is checked right before the commit; a call that misses it fails
//! with `TransientStorage` and leaves the store untouched.

use crate::clock::Clock;
use crate::config::{chrono_window, GateConfig};
use crate::identity::IdentityStore;
use crate::ledger::store::{CasOutcome, RowQuery, SubscriptionStore};
use crate::notify::messages;
use crate::notify::sink::Notifier;
use crate::protocol::models::{
    AccessCheck, NewSubscription, Plan, PlanInfo, Subscription, SubscriptionDetails,
    SubscriptionId, SubscriptionInfo, SubscriptionStatus,
};
use crate::GateError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

/// Attempts of the read-decide-swap loop before giving up on a contended row.
const MAX_CAS_ATTEMPTS: usize = 3;

/// Lock table size above which idle entries are dropped.
const LOCK_PRUNE_THRESHOLD: usize = 1024;

/// Per-subject async locks.
#[derive(Debug, Default)]
struct SubjectLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SubjectLocks {
    fn handle(&self, subject: &str) -> Result<Arc<tokio::sync::Mutex<()>>, GateError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| GateError::TransientStorage("subject lock table poisoned".to_string()))?;
        if locks.len() > LOCK_PRUNE_THRESHOLD {
            // Only the table holds idle entries.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Ok(Arc::clone(locks.entry(subject.to_string()).or_default()))
    }
}

/// How a conditional transition ended.
enum Transition {
    Applied(Subscription),
    Unchanged(Subscription),
}

/// Row a transition operates on.
enum Target {
    Id(SubscriptionId),
    ActiveOf(String),
}

/// Subscription lifecycle operations over a [`SubscriptionStore`].
///
/// Cheap to clone; clones share the store, locks and notifier.
#[derive(Clone)]
pub struct SubscriptionLedger {
    store: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    identities: Option<Arc<dyn IdentityStore>>,
    locks: Arc<SubjectLocks>,
    timeout: Duration,
    expiring_soon: chrono::Duration,
}

impl SubscriptionLedger {
    /// Ledger over a store, using the configured storage timeout and
    /// expiring-soon window.
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        config: &GateConfig,
    ) -> Result<Self, GateError> {
        config.validate()?;
        Ok(Self {
            store,
            clock,
            notifier,
            identities: None,
            locks: Arc::new(SubjectLocks::default()),
            timeout: config.storage_timeout,
            expiring_soon: chrono_window(config.expiring_soon_window)?,
        })
    }

    /// Write first activations back to an identity store.
    pub fn with_identities(mut self, identities: Arc<dyn IdentityStore>) -> Self {
        self.identities = Some(identities);
        self
    }

    /// Handle whose operations use a different deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Current deadline per operation.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    // ----------------------------------------------------------------------
    // Lifecycle operations
    // ----------------------------------------------------------------------

    /// Create a PENDING subscription.
    ///
    /// # Errors
    /// - `Conflict` - the subject already has an ACTIVE row, or a PENDING row
    ///   that has not lapsed yet
    /// - `TransientStorage` - storage unavailable or deadline missed
    pub async fn create(
        &self,
        subject: &str,
        plan: Plan,
        payment_method: Option<&str>,
    ) -> Result<Subscription, GateError> {
        let deadline = self.deadline();
        let _guard = self.lock_subject(subject, deadline).await?;

        let now = self.now();
        let draft = NewSubscription {
            subject: subject.to_string(),
            plan,
            status: SubscriptionStatus::Pending,
            start: now,
            end: now + plan.period(),
            payment_method: payment_method.map(str::to_string),
            transaction_ref: transaction_ref("TXN"),
            created_at: now,
        };
        let row = self.commit(deadline, move |store| store.insert(draft)).await?;

        info!(
            subscription_id = row.id,
            subject,
            plan = plan.code(),
            "subscription created"
        );
        Ok(row)
    }

    /// Confirm payment for a PENDING subscription.
    ///
    /// # Errors
    /// - `NotFound` - no such subscription
    /// - `InvalidState` - the row is not PENDING
    /// - `Conflict` - the subject already has another ACTIVE row
    pub async fn activate(
        &self,
        id: SubscriptionId,
        transaction_ref: &str,
    ) -> Result<Subscription, GateError> {
        let deadline = self.deadline();
        let row = self
            .read(deadline, move |store| store.get(id))
            .await?
            .ok_or_else(|| GateError::NotFound(format!("subscription {}", id)))?;
        let _guard = self.lock_subject(&row.subject, deadline).await?;

        let txn = transaction_ref.to_string();
        let outcome = self
            .transition(Target::Id(id), deadline, |current, now| {
                if current.status != SubscriptionStatus::Pending {
                    return Err(GateError::InvalidState {
                        id: current.id,
                        status: current.status,
                    });
                }
                let mut next = current.clone();
                next.status = SubscriptionStatus::Active;
                next.transaction_ref = txn.clone();
                next.updated_at = Some(now);
                Ok(Some(next))
            })
            .await?
            .ok_or_else(|| GateError::NotFound(format!("subscription {}", id)))?;

        let row = applied(outcome);
        info!(subscription_id = row.id, subject = %row.subject, "subscription activated");
        self.link_subject(&row.subject).await;
        self.notify(&row.subject, messages::activated(row.days_left(self.now())));
        Ok(row)
    }

    /// Buy another period.
    ///
    /// With an ACTIVE row the period is appended to that row's end. Otherwise
    /// a new ACTIVE row starting now is inserted; any PENDING row is left
    /// alone.
    pub async fn extend(
        &self,
        subject: &str,
        plan: Plan,
        payment_method: Option<&str>,
    ) -> Result<Subscription, GateError> {
        let deadline = self.deadline();
        let _guard = self.lock_subject(subject, deadline).await?;
        let method = payment_method.map(str::to_string);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let owner = subject.to_string();
            let active = self
                .read(deadline, move |store| store.find_active(&owner))
                .await?;
            let now = self.now();

            let Some(current) = active else {
                let draft = NewSubscription {
                    subject: subject.to_string(),
                    plan,
                    status: SubscriptionStatus::Active,
                    start: now,
                    end: now + plan.period(),
                    payment_method: method.clone(),
                    transaction_ref: transaction_ref("EXT"),
                    created_at: now,
                };
                let row = self.commit(deadline, move |store| store.insert(draft)).await?;
                info!(
                    subscription_id = row.id,
                    subject,
                    plan = plan.code(),
                    "subscription started by extension"
                );
                self.link_subject(subject).await;
                self.notify(subject, messages::activated(row.days_left(now)));
                return Ok(row);
            };

            let mut next = current.clone();
            if current.end > now {
                next.end = current.end + plan.period();
            } else {
                // Lapsed but not yet swept: the new period starts now.
                next.start = now;
                next.end = now + plan.period();
            }
            next.plan = plan;
            next.transaction_ref = transaction_ref("EXT");
            next.payment_method = method.clone().or(current.payment_method.clone());
            next.updated_at = Some(now);

            let expected = current.clone();
            match self
                .commit(deadline, move |store| store.compare_and_swap(&expected, next))
                .await?
            {
                CasOutcome::Applied(row) => {
                    info!(
                        subscription_id = row.id,
                        subject,
                        end = %row.end,
                        "subscription extended"
                    );
                    self.notify(subject, messages::extended(row.days_left(now)));
                    return Ok(row);
                }
                CasOutcome::Stale(_) | CasOutcome::Missing => {
                    debug!(subscription_id = current.id, "stale row on extend, retrying");
                }
            }
        }
        Err(contended())
    }

    /// Cancel the subject's ACTIVE subscription.
    ///
    /// # Errors
    /// - `NotFound` - the subject has no ACTIVE subscription
    pub async fn cancel(&self, subject: &str) -> Result<Subscription, GateError> {
        let deadline = self.deadline();
        let _guard = self.lock_subject(subject, deadline).await?;

        let outcome = self
            .transition(
                Target::ActiveOf(subject.to_string()),
                deadline,
                |current, now| {
                    let mut next = current.clone();
                    next.status = SubscriptionStatus::Cancelled;
                    next.updated_at = Some(now);
                    Ok(Some(next))
                },
            )
            .await?
            .ok_or_else(no_active)?;

        let row = applied(outcome);
        info!(subscription_id = row.id, subject, "subscription cancelled");
        self.notify(subject, messages::cancelled());
        Ok(row)
    }

    /// Turn auto-renewal on or off for the subject's ACTIVE subscription.
    ///
    /// # Errors
    /// - `NotFound` - the subject has no ACTIVE subscription
    pub async fn set_auto_renew(
        &self,
        subject: &str,
        enabled: bool,
    ) -> Result<Subscription, GateError> {
        let deadline = self.deadline();
        let _guard = self.lock_subject(subject, deadline).await?;

        let outcome = self
            .transition(
                Target::ActiveOf(subject.to_string()),
                deadline,
                move |current, now| {
                    let mut next = current.clone();
                    next.auto_renew = enabled;
                    next.updated_at = Some(now);
                    Ok(Some(next))
                },
            )
            .await?
            .ok_or_else(no_active)?;

        let row = applied(outcome);
        info!(subscription_id = row.id, subject, enabled, "auto-renew updated");
        self.notify(subject, messages::auto_renew(enabled));
        Ok(row)
    }

    // ----------------------------------------------------------------------
    // Queries
    // ----------------------------------------------------------------------

    /// Whether the subject holds an ACTIVE row ending in the future.
    pub async fn has_active_subscription(&self, subject: &str) -> Result<bool, GateError> {
        Ok(self.current(subject).await?.is_some())
    }

    /// Display projection of the subject's current subscription.
    pub async fn info(&self, subject: &str) -> Result<SubscriptionInfo, GateError> {
        let now = self.now();
        Ok(match self.current(subject).await? {
            Some(row) => {
                SubscriptionInfo::Active(SubscriptionDetails::project(&row, now, self.expiring_soon))
            }
            None => SubscriptionInfo::Inactive,
        })
    }

    /// Entitlement flag plus the current subscription.
    pub async fn check_access(&self, subject: &str) -> Result<AccessCheck, GateError> {
        let info = self.info(subject).await?;
        Ok(AccessCheck {
            has_access: info.is_active(),
            info,
        })
    }

    /// Every row the subject ever had, newest first.
    pub async fn history(&self, subject: &str) -> Result<Vec<Subscription>, GateError> {
        let owner = subject.to_string();
        self.read(self.deadline(), move |store| store.for_subject(&owner))
            .await
    }

    /// Plans on sale.
    pub fn available_plans(&self) -> Vec<PlanInfo> {
        Plan::catalogue()
    }

    async fn current(&self, subject: &str) -> Result<Option<Subscription>, GateError> {
        let owner = subject.to_string();
        let active = self
            .read(self.deadline(), move |store| store.find_active(&owner))
            .await?;
        let now = self.now();
        Ok(active.filter(|row| row.is_active_at(now)))
    }

    // ----------------------------------------------------------------------
    // Sweep support
    // ----------------------------------------------------------------------

    /// ACTIVE rows whose end has passed.
    pub async fn due_for_expiry(&self) -> Result<Vec<Subscription>, GateError> {
        let now = self.now();
        self.read(self.deadline(), move |store| {
            store.query(RowQuery::LapsedBefore(now))
        })
        .await
    }

    /// ACTIVE rows ending within `window` from now.
    pub async fn expiring_within(
        &self,
        window: chrono::Duration,
    ) -> Result<Vec<Subscription>, GateError> {
        let now = self.now();
        self.read(self.deadline(), move |store| {
            store.query(RowQuery::EndingBetween(now, now + window))
        })
        .await
    }

    /// ACTIVE auto-renew rows ending within `window` from now.
    pub async fn renewal_candidates(
        &self,
        window: chrono::Duration,
    ) -> Result<Vec<Subscription>, GateError> {
        let now = self.now();
        self.read(self.deadline(), move |store| {
            store.query(RowQuery::RenewableBetween(now, now + window))
        })
        .await
    }

    /// Move a lapsed ACTIVE row to EXPIRED.
    ///
    /// Returns `false` when the row was already moved on or extended in the
    /// meantime.
    pub async fn expire(&self, row: &Subscription) -> Result<bool, GateError> {
        let deadline = self.deadline();
        let _guard = self.lock_subject(&row.subject, deadline).await?;

        let outcome = self
            .transition(Target::Id(row.id), deadline, |current, now| {
                if current.status != SubscriptionStatus::Active || current.end >= now {
                    return Ok(None);
                }
                let mut next = current.clone();
                next.status = SubscriptionStatus::Expired;
                next.updated_at = Some(now);
                Ok(Some(next))
            })
            .await?;

        match outcome {
            Some(Transition::Applied(expired)) => {
                info!(subscription_id = expired.id, subject = %expired.subject, "subscription expired");
                self.notify(&expired.subject, messages::expired());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Charge and append one period of the row's plan.
    ///
    /// The subject lock is held from the claim to the commit. `charge` runs
    /// only if the stored row still has the version the sweep selected, is
    /// ACTIVE with auto-renew on, and ends inside `[now, now + window]`.
    /// Returns `None` without charging when any of that no longer holds.
    ///
    /// # Errors
    /// The charge's own error when it is declined; the subject is told.
    pub async fn renew<C>(
        &self,
        row: &Subscription,
        window: chrono::Duration,
        charge: C,
    ) -> Result<Option<Subscription>, GateError>
    where
        C: FnOnce(&Subscription) -> Result<String, GateError> + Send + 'static,
    {
        let deadline = self.deadline();
        let _guard = self.lock_subject(&row.subject, deadline).await?;

        let id = row.id;
        let Some(claimed) = self.read(deadline, move |store| store.get(id)).await? else {
            return Ok(None);
        };
        if !still_renewable(&claimed, row, self.now(), window) {
            debug!(subscription_id = row.id, "renewal candidate moved on, skipping");
            return Ok(None);
        }

        let snapshot = claimed.clone();
        let charged = tokio::task::spawn_blocking(move || charge(&snapshot))
            .await
            .map_err(|e| GateError::PaymentDeclined(format!("payment task failed: {}", e)))
            .and_then(|result| result);
        let txn = match charged {
            Ok(txn) => txn,
            Err(e) => {
                self.notify(&row.subject, messages::auto_renew_failed());
                return Err(e);
            }
        };

        // The charge may outlast the storage deadline; the commit gets its own.
        let expected_version = claimed.version;
        let outcome = self
            .transition(Target::Id(row.id), self.deadline(), |current, now| {
                if current.version != expected_version {
                    return Ok(None);
                }
                let mut next = current.clone();
                next.end = current.end.max(now) + current.plan.period();
                next.transaction_ref = txn.clone();
                next.updated_at = Some(now);
                Ok(Some(next))
            })
            .await?;

        match outcome {
            Some(Transition::Applied(renewed)) => {
                info!(
                    subscription_id = renewed.id,
                    subject = %renewed.subject,
                    end = %renewed.end,
                    "subscription auto-renewed"
                );
                self.notify(&renewed.subject, messages::auto_renewed(renewed.plan.days()));
                Ok(Some(renewed))
            }
            _ => {
                warn!(
                    subscription_id = row.id,
                    transaction_ref = %txn,
                    "charged but subscription no longer renewable"
                );
                Ok(None)
            }
        }
    }

    /// Fire-and-forget notification through the shared sink.
    pub(crate) fn notify(&self, subject: &str, message: String) {
        self.notifier.send(subject, message);
    }

    // ----------------------------------------------------------------------
    // Plumbing
    // ----------------------------------------------------------------------

    async fn lock_subject(
        &self,
        subject: &str,
        deadline: Instant,
    ) -> Result<OwnedMutexGuard<()>, GateError> {
        let lock = self.locks.handle(subject)?;
        tokio::time::timeout(remaining(deadline), lock.lock_owned())
            .await
            .map_err(|_| timed_out())
    }

    /// Read-decide-swap loop. `Ok(None)` means the target row does not exist.
    async fn transition<F>(
        &self,
        target: Target,
        deadline: Instant,
        decide: F,
    ) -> Result<Option<Transition>, GateError>
    where
        F: Fn(&Subscription, DateTime<Utc>) -> Result<Option<Subscription>, GateError>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = match &target {
                Target::Id(id) => {
                    let id = *id;
                    self.read(deadline, move |store| store.get(id)).await?
                }
                Target::ActiveOf(subject) => {
                    let owner = subject.clone();
                    self.read(deadline, move |store| store.find_active(&owner))
                        .await?
                }
            };
            let Some(current) = current else {
                return Ok(None);
            };

            let Some(next) = decide(&current, self.now())? else {
                return Ok(Some(Transition::Unchanged(current)));
            };

            let expected = current.clone();
            match self
                .commit(deadline, move |store| store.compare_and_swap(&expected, next))
                .await?
            {
                CasOutcome::Applied(row) => return Ok(Some(Transition::Applied(row))),
                CasOutcome::Missing => return Ok(None),
                CasOutcome::Stale(_) => {
                    debug!(subscription_id = current.id, "stale row, retrying transition");
                }
            }
        }
        Err(contended())
    }

    /// Store read bounded by the deadline.
    async fn read<T, F>(&self, deadline: Instant, op: F) -> Result<T, GateError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SubscriptionStore) -> Result<T, GateError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || op(store.as_ref()));
        match tokio::time::timeout(remaining(deadline), task).await {
            Ok(joined) => flatten(joined),
            Err(_) => Err(timed_out()),
        }
    }

    /// Single store write, refused if the deadline has already passed.
    ///
    /// A write that started in time is awaited to completion so the caller
    /// always learns whether it committed.
    async fn commit<T, F>(&self, deadline: Instant, op: F) -> Result<T, GateError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SubscriptionStore) -> Result<T, GateError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || {
            if Instant::now() >= deadline {
                return Err(timed_out());
            }
            op(store.as_ref())
        });
        flatten(task.await)
    }

    async fn link_subject(&self, subject: &str) {
        let Some(identities) = self.identities.clone() else {
            return;
        };
        let owner = subject.to_string();
        let linked = tokio::task::spawn_blocking(move || identities.mark_subscribed(&owner)).await;
        match linked {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(subject, error = %e, "failed to link subscription to subject"),
            Err(e) => warn!(subject, error = %e, "subject link task failed"),
        }
    }
}

fn applied(outcome: Transition) -> Subscription {
    match outcome {
        Transition::Applied(row) | Transition::Unchanged(row) => row,
    }
}

/// The stored row is still the one a renewal sweep selected.
fn still_renewable(
    current: &Subscription,
    selected: &Subscription,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> bool {
    current.version == selected.version
        && current.status == SubscriptionStatus::Active
        && current.auto_renew
        && current.end >= now
        && current.end <= now + window
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn flatten<T>(joined: Result<Result<T, GateError>, JoinError>) -> Result<T, GateError> {
    match joined {
        Ok(result) => result.map_err(|e| match e {
            GateError::StorageIO(msg) => GateError::TransientStorage(msg),
            other => other,
        }),
        Err(e) => Err(GateError::TransientStorage(format!(
            "storage task failed: {}",
            e
        ))),
    }
}

fn timed_out() -> GateError {
    GateError::TransientStorage("storage deadline exceeded".to_string())
}

fn contended() -> GateError {
    GateError::TransientStorage("subscription row kept changing, retry".to_string())
}

fn no_active() -> GateError {
    GateError::NotFound("no active subscription".to_string())
}

fn transaction_ref(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::identity::MemoryIdentityStore;
    use crate::ledger::store::MemoryStore;
    use crate::notify::sink::RecordingSink;
    use crate::protocol::models::Subject;
    use chrono::{Duration as ChronoDuration, TimeZone};

    const SUBJECT: &str = "seller@example.com";

    struct Fixture {
        ledger: SubscriptionLedger,
        clock: MockClock,
        sink: Arc<RecordingSink>,
        store: Arc<MemoryStore>,
        identities: Arc<MemoryIdentityStore>,
    }

    fn fixture() -> Fixture {
        let clock = MockClock::new(Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap());
        let sink = Arc::new(RecordingSink::new());
        let store = Arc::new(MemoryStore::new());
        let identities = Arc::new(MemoryIdentityStore::new());
        identities.insert(Subject::new(SUBJECT));
        let ledger = SubscriptionLedger::new(
            store.clone(),
            Arc::new(clock.clone()),
            Notifier::new(sink.clone()),
            &GateConfig::default(),
        )
        .unwrap()
        .with_identities(identities.clone());
        Fixture {
            ledger,
            clock,
            sink,
            store,
            identities,
        }
    }

    fn active_rows(store: &MemoryStore, subject: &str) -> usize {
        store
            .for_subject(subject)
            .unwrap()
            .iter()
            .filter(|r| r.status == SubscriptionStatus::Active)
            .count()
    }

    #[tokio::test]
    async fn test_create_activate_info() {
        let f = fixture();
        let row = f.ledger.create(SUBJECT, Plan::Days30, Some("card")).await.unwrap();
        assert_eq!(row.status, SubscriptionStatus::Pending);
        assert!(row.transaction_ref.starts_with("TXN_"));
        assert!(!f.ledger.has_active_subscription(SUBJECT).await.unwrap());

        let active = f.ledger.activate(row.id, "PAY_1").await.unwrap();
        assert_eq!(active.status, SubscriptionStatus::Active);
        assert_eq!(active.transaction_ref, "PAY_1");
        assert!(active.updated_at.is_some());

        let SubscriptionInfo::Active(details) = f.ledger.info(SUBJECT).await.unwrap() else {
            panic!("expected active info");
        };
        assert_eq!(details.status_name, "Активна");
        assert_eq!(details.days_left, 30);
        assert!(f.identities.find_subject(SUBJECT).unwrap().has_subscription);

        let sent = f.sink.wait_for(1).await;
        assert!(sent[0].1.contains("активирована"));
    }

    #[tokio::test]
    async fn test_abandoned_checkout_stops_blocking_once_lapsed() {
        let f = fixture();
        let abandoned = f.ledger.create(SUBJECT, Plan::Days30, None).await.unwrap();
        assert!(matches!(
            f.ledger.create(SUBJECT, Plan::Days30, None).await,
            Err(GateError::Conflict { .. })
        ));

        f.clock.advance(ChronoDuration::days(400));
        let retry = f.ledger.create(SUBJECT, Plan::Days90, None).await.unwrap();
        assert_ne!(retry.id, abandoned.id);
        assert_eq!(retry.status, SubscriptionStatus::Pending);
        assert_eq!(f.ledger.activate(retry.id, "PAY_2").await.unwrap().plan, Plan::Days90);
    }

    #[tokio::test]
    async fn test_create_conflicts_with_active() {
        let f = fixture();
        f.ledger.extend(SUBJECT, Plan::Days30, None).await.unwrap();
        assert!(matches!(
            f.ledger.create(SUBJECT, Plan::Days30, None).await,
            Err(GateError::Conflict { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_yields_one_pending() {
        let f = fixture();
        let a = f.ledger.clone();
        let b = f.ledger.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.create(SUBJECT, Plan::Days30, None).await }),
            tokio::spawn(async move { b.create(SUBJECT, Plan::Days60, None).await }),
        );
        let results = [ra.unwrap(), rb.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(GateError::Conflict { .. }))));
        assert_eq!(f.store.for_subject(SUBJECT).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_activate_errors() {
        let f = fixture();
        assert!(matches!(
            f.ledger.activate(42, "PAY").await,
            Err(GateError::NotFound(_))
        ));

        let row = f.ledger.create(SUBJECT, Plan::Days30, None).await.unwrap();
        f.ledger.activate(row.id, "PAY").await.unwrap();
        assert!(matches!(
            f.ledger.activate(row.id, "PAY").await,
            Err(GateError::InvalidState { status: SubscriptionStatus::Active, .. })
        ));
    }

    #[tokio::test]
    async fn test_extend_while_active_appends_period() {
        let f = fixture();
        let now = f.clock.now_utc();
        let row = f.ledger.create(SUBJECT, Plan::Days30, None).await.unwrap();
        f.ledger.activate(row.id, "PAY").await.unwrap();

        // 20 days in, 10 days left.
        f.clock.advance(ChronoDuration::days(20));
        let extended = f.ledger.extend(SUBJECT, Plan::Days30, Some("card")).await.unwrap();
        assert_eq!(extended.id, row.id);
        assert_eq!(extended.end, now + ChronoDuration::days(60));
        assert_eq!(extended.end - f.clock.now_utc(), ChronoDuration::days(40));
        assert!(extended.transaction_ref.starts_with("EXT_"));
        assert_eq!(active_rows(&f.store, SUBJECT), 1);
    }

    #[tokio::test]
    async fn test_extend_after_expiry_starts_new_row() {
        let f = fixture();
        let row = f.ledger.extend(SUBJECT, Plan::Days30, None).await.unwrap();
        f.clock.advance(ChronoDuration::days(31));
        assert!(f.ledger.expire(&row).await.unwrap());

        let now = f.clock.now_utc();
        let fresh = f.ledger.extend(SUBJECT, Plan::Days30, None).await.unwrap();
        assert_ne!(fresh.id, row.id);
        assert_eq!(fresh.start, now);
        assert_eq!(fresh.end, now + ChronoDuration::days(30));
        assert_eq!(fresh.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_extend_on_lapsed_active_restarts_period() {
        let f = fixture();
        let row = f.ledger.extend(SUBJECT, Plan::Days30, None).await.unwrap();
        f.clock.advance(ChronoDuration::days(35));
        let now = f.clock.now_utc();

        let extended = f.ledger.extend(SUBJECT, Plan::Days60, None).await.unwrap();
        assert_eq!(extended.id, row.id);
        assert_eq!(extended.start, now);
        assert_eq!(extended.end, now + ChronoDuration::days(60));
        assert_eq!(extended.plan, Plan::Days60);
    }

    #[tokio::test]
    async fn test_extend_leaves_pending_row_alone() {
        let f = fixture();
        let pending = f.ledger.create(SUBJECT, Plan::Days30, None).await.unwrap();
        let active = f.ledger.extend(SUBJECT, Plan::Days30, None).await.unwrap();
        assert_ne!(active.id, pending.id);
        let stored = f.store.get(pending.id).unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Pending);

        // The stale PENDING row can no longer be activated.
        assert!(matches!(
            f.ledger.activate(pending.id, "PAY").await,
            Err(GateError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_and_auto_renew_need_active() {
        let f = fixture();
        assert!(matches!(
            f.ledger.cancel(SUBJECT).await,
            Err(GateError::NotFound(_))
        ));
        assert!(matches!(
            f.ledger.set_auto_renew(SUBJECT, true).await,
            Err(GateError::NotFound(_))
        ));

        f.ledger.extend(SUBJECT, Plan::Days30, None).await.unwrap();
        let renewing = f.ledger.set_auto_renew(SUBJECT, true).await.unwrap();
        assert!(renewing.auto_renew);

        let cancelled = f.ledger.cancel(SUBJECT).await.unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        assert!(!f.ledger.has_active_subscription(SUBJECT).await.unwrap());
        assert_eq!(f.ledger.info(SUBJECT).await.unwrap(), SubscriptionInfo::Inactive);

        let sent = f.sink.wait_for(3).await;
        assert!(sent.iter().any(|(_, m)| *m == messages::cancelled()));
    }

    #[tokio::test]
    async fn test_cancelled_only_history_has_no_access() {
        let f = fixture();
        f.ledger.extend(SUBJECT, Plan::Days30, None).await.unwrap();
        f.ledger.cancel(SUBJECT).await.unwrap();

        let check = f.ledger.check_access(SUBJECT).await.unwrap();
        assert!(!check.has_access);
        let history = f.ledger.history(SUBJECT).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, SubscriptionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_expire_is_idempotent() {
        let f = fixture();
        let row = f.ledger.extend(SUBJECT, Plan::Days30, None).await.unwrap();

        // Not lapsed yet.
        assert!(!f.ledger.expire(&row).await.unwrap());

        f.clock.advance(ChronoDuration::days(30) + ChronoDuration::seconds(1));
        assert_eq!(f.ledger.due_for_expiry().await.unwrap().len(), 1);
        assert!(f.ledger.expire(&row).await.unwrap());
        let expired = f.store.get(row.id).unwrap().unwrap();
        assert!(!f.ledger.expire(&row).await.unwrap());
        assert_eq!(f.store.get(row.id).unwrap().unwrap(), expired);
        assert!(f.ledger.due_for_expiry().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expire_skips_row_extended_after_selection() {
        let f = fixture();
        let row = f.ledger.extend(SUBJECT, Plan::Days30, None).await.unwrap();
        f.clock.advance(ChronoDuration::days(31));
        let due = f.ledger.due_for_expiry().await.unwrap();

        f.ledger.extend(SUBJECT, Plan::Days30, None).await.unwrap();
        assert!(!f.ledger.expire(&due[0]).await.unwrap());
        assert_eq!(
            f.store.get(row.id).unwrap().unwrap().status,
            SubscriptionStatus::Active
        );
    }

    fn counting_charge(
        charges: &Arc<std::sync::atomic::AtomicUsize>,
    ) -> impl FnOnce(&Subscription) -> Result<String, GateError> + Send + 'static {
        let charges = Arc::clone(charges);
        move |_| {
            charges.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok("PAY".to_string())
        }
    }

    #[tokio::test]
    async fn test_renew_requires_auto_renew_inside_window() {
        let f = fixture();
        let charges = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let window = ChronoDuration::days(3);
        let row = f.ledger.extend(SUBJECT, Plan::Days30, None).await.unwrap();
        f.clock.advance(ChronoDuration::days(28));
        let renew = f.ledger.renew(&row, window, counting_charge(&charges));
        assert!(renew.await.unwrap().is_none());

        f.clock.set(row.start);
        let renewing = f.ledger.set_auto_renew(SUBJECT, true).await.unwrap();
        let early = f.ledger.renew(&renewing, window, counting_charge(&charges));
        assert!(early.await.unwrap().is_none());
        assert_eq!(charges.load(std::sync::atomic::Ordering::SeqCst), 0);

        f.clock.advance(ChronoDuration::days(28));
        let renewed = f
            .ledger
            .renew(&renewing, window, counting_charge(&charges))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renewed.end, row.end + ChronoDuration::days(30));
        assert_eq!(renewed.transaction_ref, "PAY");
        assert_eq!(charges.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_renew_skips_row_changed_since_selection() {
        let f = fixture();
        let charges = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let window = ChronoDuration::days(3);
        f.ledger.extend(SUBJECT, Plan::Days30, None).await.unwrap();
        f.ledger.set_auto_renew(SUBJECT, true).await.unwrap();
        f.clock.advance(ChronoDuration::days(28));
        let selected = f.ledger.renewal_candidates(window).await.unwrap();
        assert_eq!(selected.len(), 1);

        let extended = f.ledger.extend(SUBJECT, Plan::Days30, None).await.unwrap();
        let renew = f.ledger.renew(&selected[0], window, counting_charge(&charges));
        assert!(renew.await.unwrap().is_none());
        assert_eq!(charges.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(f.store.get(extended.id).unwrap().unwrap(), extended);
    }

    #[tokio::test]
    async fn test_declined_renewal_leaves_row_and_tells_subject() {
        let f = fixture();
        let window = ChronoDuration::days(3);
        f.ledger.extend(SUBJECT, Plan::Days30, None).await.unwrap();
        let renewing = f.ledger.set_auto_renew(SUBJECT, true).await.unwrap();
        f.clock.advance(ChronoDuration::days(28));

        let declined = f
            .ledger
            .renew(&renewing, window, |_| {
                Err(GateError::PaymentDeclined("card expired".to_string()))
            })
            .await;
        assert!(matches!(declined, Err(GateError::PaymentDeclined(_))));
        assert_eq!(f.store.get(renewing.id).unwrap().unwrap(), renewing);

        let sent = f.sink.wait_for(3).await;
        assert!(sent
            .iter()
            .any(|(to, text)| to == SUBJECT && *text == messages::auto_renew_failed()));
    }

    #[tokio::test]
    async fn test_windows_select_rows() {
        let f = fixture();
        f.ledger.extend(SUBJECT, Plan::Days30, None).await.unwrap();
        f.ledger.set_auto_renew(SUBJECT, true).await.unwrap();

        assert!(f.ledger.expiring_within(ChronoDuration::days(7)).await.unwrap().is_empty());
        f.clock.advance(ChronoDuration::days(25));
        assert_eq!(f.ledger.expiring_within(ChronoDuration::days(7)).await.unwrap().len(), 1);
        assert!(f.ledger.renewal_candidates(ChronoDuration::days(3)).await.unwrap().is_empty());
        f.clock.advance(ChronoDuration::days(3));
        assert_eq!(f.ledger.renewal_candidates(ChronoDuration::days(3)).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_active_under_concurrency() {
        let f = fixture();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let ledger = f.ledger.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    ledger.extend(SUBJECT, Plan::Days30, None).await.map(|_| ())
                } else {
                    ledger.cancel(SUBJECT).await.map(|_| ())
                }
            }));
        }
        for task in tasks {
            let _ = task.await.unwrap();
        }
        assert!(active_rows(&f.store, SUBJECT) <= 1);
    }

    #[tokio::test]
    async fn test_zero_timeout_commits_nothing() {
        let f = fixture();
        let hurried = f.ledger.clone().with_timeout(Duration::ZERO);
        assert_eq!(hurried.timeout(), Duration::ZERO);
        let result = hurried.create(SUBJECT, Plan::Days30, None).await;
        assert!(matches!(result, Err(GateError::TransientStorage(_))));
        assert!(f.store.for_subject(SUBJECT).unwrap().is_empty());
    }

    #[test]
    fn test_available_plans() {
        let f = fixture();
        let plans = f.ledger.available_plans();
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[1].display_name, "60 дней");
    }
}
