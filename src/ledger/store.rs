//! Subscription storage with per-row conditional transitions.
//!
//! Every write to a subscription row goes through [`SubscriptionStore::compare_and_swap`],
//! which commits only when the row still has the version and status the
//! caller read. Inserts re-check the one-live-subscription-per-subject
//! constraint inside the same critical section.

use crate::protocol::models::{
    NewSubscription, Subscription, SubscriptionId, SubscriptionStatus,
};
use crate::GateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Outcome of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write committed; the stored row is returned.
    Applied(Subscription),
    /// The row changed since it was read; the current row is returned.
    Stale(Subscription),
    /// No row with that id.
    Missing,
}

/// Batch selections used by the lifecycle sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowQuery {
    /// ACTIVE rows whose end is before the instant.
    LapsedBefore(DateTime<Utc>),
    /// ACTIVE rows ending inside `[from, to]`.
    EndingBetween(DateTime<Utc>, DateTime<Utc>),
    /// ACTIVE auto-renew rows ending inside `[from, to]`.
    RenewableBetween(DateTime<Utc>, DateTime<Utc>),
}

impl RowQuery {
    fn matches(&self, row: &Subscription) -> bool {
        if row.status != SubscriptionStatus::Active {
            return false;
        }
        match *self {
            RowQuery::LapsedBefore(now) => row.end < now,
            RowQuery::EndingBetween(from, to) => row.end >= from && row.end <= to,
            RowQuery::RenewableBetween(from, to) => {
                row.auto_renew && row.end >= from && row.end <= to
            }
        }
    }
}

/// Subscription persistence. Each method is atomic on its own.
///
/// Calls may block; the ledger invokes them from the blocking pool.
pub trait SubscriptionStore: Send + Sync {
    /// Fetch one row.
    fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>, GateError>;

    /// All rows of a subject, newest first.
    fn for_subject(&self, subject: &str) -> Result<Vec<Subscription>, GateError>;

    /// The subject's ACTIVE row, regardless of its end date.
    fn find_active(&self, subject: &str) -> Result<Option<Subscription>, GateError>;

    /// Rows selected by a sweep query, oldest first.
    fn query(&self, query: RowQuery) -> Result<Vec<Subscription>, GateError>;

    /// Insert a PENDING or ACTIVE row.
    ///
    /// Fails with `Conflict` if the subject already has an ACTIVE row, or,
    /// for a PENDING insert, a PENDING row whose end is still after
    /// `draft.created_at`. Abandoned checkouts stop blocking once they lapse.
    fn insert(&self, draft: NewSubscription) -> Result<Subscription, GateError>;

    /// Replace `expected` with `next` if the stored row still matches
    /// `expected.version` and `expected.status`.
    ///
    /// Fails with `InvalidState` if the status change is not a lifecycle
    /// edge, and with `Conflict` if an activation would create a second
    /// ACTIVE row.
    fn compare_and_swap(
        &self,
        expected: &Subscription,
        next: Subscription,
    ) -> Result<CasOutcome, GateError>;
}

/// Row table shared by the in-memory and file-backed stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    next_id: SubscriptionId,
    rows: BTreeMap<SubscriptionId, Subscription>,
}

impl StoreState {
    /// Fetch one row.
    pub fn get(&self, id: SubscriptionId) -> Option<Subscription> {
        self.rows.get(&id).cloned()
    }

    /// All rows of a subject, newest first.
    pub fn for_subject(&self, subject: &str) -> Vec<Subscription> {
        let mut rows: Vec<Subscription> = self
            .rows
            .values()
            .filter(|r| r.subject == subject)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        rows
    }

    /// The subject's ACTIVE row.
    pub fn find_active(&self, subject: &str) -> Option<Subscription> {
        self.find_with_status(subject, SubscriptionStatus::Active)
    }

    fn find_with_status(&self, subject: &str, status: SubscriptionStatus) -> Option<Subscription> {
        self.rows
            .values()
            .find(|r| r.subject == subject && r.status == status)
            .cloned()
    }

    fn has_live_pending(&self, subject: &str, now: DateTime<Utc>) -> bool {
        self.rows.values().any(|r| {
            r.subject == subject && r.status == SubscriptionStatus::Pending && r.end > now
        })
    }

    /// Rows matching a sweep query.
    pub fn query(&self, query: RowQuery) -> Vec<Subscription> {
        self.rows.values().filter(|r| query.matches(r)).cloned().collect()
    }

    /// Insert with the live-subscription constraint.
    pub fn insert(&mut self, draft: NewSubscription) -> Result<Subscription, GateError> {
        if !matches!(
            draft.status,
            SubscriptionStatus::Pending | SubscriptionStatus::Active
        ) {
            return Err(GateError::InvalidState {
                id: self.next_id + 1,
                status: draft.status,
            });
        }
        if draft.end <= draft.start {
            return Err(GateError::ConfigError(
                "subscription end must be after start".to_string(),
            ));
        }
        let blocked = self.find_active(&draft.subject).is_some()
            || (draft.status == SubscriptionStatus::Pending
                && self.has_live_pending(&draft.subject, draft.created_at));
        if blocked {
            return Err(GateError::Conflict {
                subject: draft.subject,
            });
        }

        self.next_id += 1;
        let row = Subscription {
            id: self.next_id,
            subject: draft.subject,
            plan: draft.plan,
            status: draft.status,
            start: draft.start,
            end: draft.end,
            auto_renew: false,
            payment_method: draft.payment_method,
            transaction_ref: draft.transaction_ref,
            created_at: draft.created_at,
            updated_at: None,
            version: 1,
        };
        self.rows.insert(row.id, row.clone());
        Ok(row)
    }

    /// Conditional replace.
    pub fn compare_and_swap(
        &mut self,
        expected: &Subscription,
        mut next: Subscription,
    ) -> Result<CasOutcome, GateError> {
        let Some(current) = self.rows.get(&expected.id) else {
            return Ok(CasOutcome::Missing);
        };
        if current.version != expected.version || current.status != expected.status {
            return Ok(CasOutcome::Stale(current.clone()));
        }
        if !current.status.can_transition_to(next.status) {
            return Err(GateError::InvalidState {
                id: current.id,
                status: current.status,
            });
        }
        if next.end <= next.start {
            return Err(GateError::ConfigError(
                "subscription end must be after start".to_string(),
            ));
        }
        if next.status == SubscriptionStatus::Active
            && current.status != SubscriptionStatus::Active
        {
            if let Some(other) = self.find_active(&current.subject) {
                if other.id != current.id {
                    return Err(GateError::Conflict {
                        subject: current.subject.clone(),
                    });
                }
            }
        }

        // Identity fields never change.
        next.id = current.id;
        next.subject = current.subject.clone();
        next.created_at = current.created_at;
        next.version = current.version + 1;
        self.rows.insert(next.id, next.clone());
        Ok(CasOutcome::Applied(next))
    }
}

/// In-memory store behind a single reader-writer lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> GateError {
    GateError::TransientStorage("store lock poisoned".to_string())
}

impl SubscriptionStore for MemoryStore {
    fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>, GateError> {
        Ok(self.state.read().map_err(|_| poisoned())?.get(id))
    }

    fn for_subject(&self, subject: &str) -> Result<Vec<Subscription>, GateError> {
        Ok(self.state.read().map_err(|_| poisoned())?.for_subject(subject))
    }

    fn find_active(&self, subject: &str) -> Result<Option<Subscription>, GateError> {
        Ok(self.state.read().map_err(|_| poisoned())?.find_active(subject))
    }

    fn query(&self, query: RowQuery) -> Result<Vec<Subscription>, GateError> {
        Ok(self.state.read().map_err(|_| poisoned())?.query(query))
    }

    fn insert(&self, draft: NewSubscription) -> Result<Subscription, GateError> {
        self.state.write().map_err(|_| poisoned())?.insert(draft)
    }

    fn compare_and_swap(
        &self,
        expected: &Subscription,
        next: Subscription,
    ) -> Result<CasOutcome, GateError> {
        self.state
            .write()
            .map_err(|_| poisoned())?
            .compare_and_swap(expected, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::models::Plan;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap()
    }

    fn draft(subject: &str, status: SubscriptionStatus) -> NewSubscription {
        NewSubscription {
            subject: subject.to_string(),
            plan: Plan::Days30,
            status,
            start: now(),
            end: now() + Duration::days(30),
            payment_method: Some("card".to_string()),
            transaction_ref: "TXN_1".to_string(),
            created_at: now(),
        }
    }

    #[test]
    fn test_insert_assigns_ids_and_version() {
        let store = MemoryStore::new();
        let a = store.insert(draft("a", SubscriptionStatus::Pending)).unwrap();
        let b = store.insert(draft("b", SubscriptionStatus::Pending)).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(a.version, 1);
    }

    #[test]
    fn test_second_pending_conflicts() {
        let store = MemoryStore::new();
        store.insert(draft("a", SubscriptionStatus::Pending)).unwrap();
        assert!(matches!(
            store.insert(draft("a", SubscriptionStatus::Pending)),
            Err(GateError::Conflict { .. })
        ));
    }

    #[test]
    fn test_lapsed_pending_does_not_block_new_pending() {
        let store = MemoryStore::new();
        let abandoned = store.insert(draft("a", SubscriptionStatus::Pending)).unwrap();

        let mut later = draft("a", SubscriptionStatus::Pending);
        later.created_at = abandoned.end;
        assert!(matches!(
            store.insert(later.clone()),
            Err(GateError::Conflict { .. })
        ));

        later.created_at = abandoned.end + Duration::seconds(1);
        later.start = later.created_at;
        later.end = later.start + Duration::days(30);
        let fresh = store.insert(later).unwrap();
        assert_ne!(fresh.id, abandoned.id);
        assert_eq!(fresh.status, SubscriptionStatus::Pending);
    }

    #[test]
    fn test_active_insert_beside_pending_allowed_but_not_beside_active() {
        let store = MemoryStore::new();
        store.insert(draft("a", SubscriptionStatus::Pending)).unwrap();
        store.insert(draft("a", SubscriptionStatus::Active)).unwrap();
        assert!(matches!(
            store.insert(draft("a", SubscriptionStatus::Active)),
            Err(GateError::Conflict { .. })
        ));
    }

    #[test]
    fn test_insert_rejects_terminal_status() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.insert(draft("a", SubscriptionStatus::Expired)),
            Err(GateError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_cas_applies_and_bumps_version() {
        let store = MemoryStore::new();
        let row = store.insert(draft("a", SubscriptionStatus::Pending)).unwrap();
        let mut next = row.clone();
        next.status = SubscriptionStatus::Active;

        let CasOutcome::Applied(stored) = store.compare_and_swap(&row, next).unwrap() else {
            panic!("expected applied");
        };
        assert_eq!(stored.version, 2);
        assert_eq!(stored.status, SubscriptionStatus::Active);
    }

    #[test]
    fn test_cas_with_stale_version_is_refused() {
        let store = MemoryStore::new();
        let row = store.insert(draft("a", SubscriptionStatus::Pending)).unwrap();
        let mut next = row.clone();
        next.status = SubscriptionStatus::Active;
        store.compare_and_swap(&row, next.clone()).unwrap();

        // Second writer still holds the version-1 snapshot.
        let outcome = store.compare_and_swap(&row, next).unwrap();
        assert!(matches!(outcome, CasOutcome::Stale(current) if current.version == 2));
    }

    #[test]
    fn test_cas_rejects_illegal_edge() {
        let store = MemoryStore::new();
        let row = store.insert(draft("a", SubscriptionStatus::Pending)).unwrap();
        let mut next = row.clone();
        next.status = SubscriptionStatus::Expired;
        assert!(matches!(
            store.compare_and_swap(&row, next),
            Err(GateError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_cas_activation_conflicts_with_other_active() {
        let store = MemoryStore::new();
        let pending = store.insert(draft("a", SubscriptionStatus::Pending)).unwrap();
        store.insert(draft("a", SubscriptionStatus::Active)).unwrap();
        let mut next = pending.clone();
        next.status = SubscriptionStatus::Active;
        assert!(matches!(
            store.compare_and_swap(&pending, next),
            Err(GateError::Conflict { .. })
        ));
    }

    #[test]
    fn test_cas_missing_row() {
        let store = MemoryStore::new();
        let mut ghost = store.insert(draft("a", SubscriptionStatus::Pending)).unwrap();
        ghost.id = 99;
        assert_eq!(
            store.compare_and_swap(&ghost, ghost.clone()).unwrap(),
            CasOutcome::Missing
        );
    }

    #[test]
    fn test_queries_only_see_active_rows() {
        let store = MemoryStore::new();
        let row = store.insert(draft("a", SubscriptionStatus::Active)).unwrap();
        store.insert(draft("b", SubscriptionStatus::Pending)).unwrap();

        let later = row.end + Duration::seconds(1);
        assert_eq!(store.query(RowQuery::LapsedBefore(later)).unwrap().len(), 1);
        assert!(store.query(RowQuery::LapsedBefore(now())).unwrap().is_empty());

        let week = RowQuery::EndingBetween(row.end - Duration::days(7), row.end);
        assert_eq!(store.query(week).unwrap().len(), 1);

        let renew = RowQuery::RenewableBetween(row.end - Duration::days(3), row.end);
        assert!(store.query(renew).unwrap().is_empty());
    }

    #[test]
    fn test_history_newest_first() {
        let store = MemoryStore::new();
        let first = store.insert(draft("a", SubscriptionStatus::Active)).unwrap();
        let mut cancelled = first.clone();
        cancelled.status = SubscriptionStatus::Cancelled;
        store.compare_and_swap(&first, cancelled).unwrap();
        let second = store.insert(draft("a", SubscriptionStatus::Pending)).unwrap();

        let history = store.for_subject("a").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second.id);
    }
}
