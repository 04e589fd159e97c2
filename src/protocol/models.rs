//! Subjects, plans and subscription rows, plus their display projections.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned subscription identifier.
pub type SubscriptionId = u64;

/// Identity that credentials and subscriptions are anchored to.
///
/// Owned by the identity store; the engine only reads it and writes back
/// the `has_subscription` linkage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Opaque identifier, the credential `sub` claim (e.g. account email).
    pub id: String,

    /// Disabled subjects are refused even with a valid credential.
    pub enabled: bool,

    /// Whether this subject has ever had an activated subscription.
    pub has_subscription: bool,
}

impl Subject {
    /// An enabled subject with no subscription history.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            has_subscription: false,
        }
    }
}

/// Purchasable subscription plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Plan {
    /// 30 day access.
    #[serde(rename = "PLAN_30_DAYS")]
    Days30,
    /// 60 day access.
    #[serde(rename = "PLAN_60_DAYS")]
    Days60,
    /// 90 day access.
    #[serde(rename = "PLAN_90_DAYS")]
    Days90,
}

impl Plan {
    /// Every plan on sale, shortest first.
    pub const ALL: [Plan; 3] = [Plan::Days30, Plan::Days60, Plan::Days90];

    /// Length of one paid period in days.
    pub fn days(self) -> i64 {
        match self {
            Plan::Days30 => 30,
            Plan::Days60 => 60,
            Plan::Days90 => 90,
        }
    }

    /// Length of one paid period.
    pub fn period(self) -> Duration {
        Duration::days(self.days())
    }

    /// Price in minor currency units (kopecks).
    pub fn price_minor(self) -> u64 {
        match self {
            Plan::Days30 => 149_900,
            Plan::Days60 => 279_900,
            Plan::Days90 => 399_900,
        }
    }

    /// Stable machine code, as used on the wire.
    pub fn code(self) -> &'static str {
        match self {
            Plan::Days30 => "PLAN_30_DAYS",
            Plan::Days60 => "PLAN_60_DAYS",
            Plan::Days90 => "PLAN_90_DAYS",
        }
    }

    /// Parse a machine code back into a plan.
    pub fn from_code(code: &str) -> Option<Plan> {
        Plan::ALL.into_iter().find(|p| p.code() == code)
    }

    /// Human-readable plan name.
    pub fn display_name(self) -> &'static str {
        match self {
            Plan::Days30 => "30 дней",
            Plan::Days60 => "60 дней",
            Plan::Days90 => "90 дней",
        }
    }

    /// Catalogue entries for every plan on sale.
    pub fn catalogue() -> Vec<PlanInfo> {
        Plan::ALL.into_iter().map(PlanInfo::from).collect()
    }
}

/// Catalogue entry describing one plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanInfo {
    /// Machine code (`PLAN_30_DAYS`, ...).
    pub code: &'static str,
    /// Human-readable name.
    pub display_name: &'static str,
    /// Period length in days.
    pub days: i64,
    /// Price in minor currency units.
    pub price_minor: u64,
}

impl From<Plan> for PlanInfo {
    fn from(plan: Plan) -> Self {
        Self {
            code: plan.code(),
            display_name: plan.display_name(),
            days: plan.days(),
            price_minor: plan.price_minor(),
        }
    }
}

/// Subscription lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    /// Created, awaiting payment confirmation.
    Pending,
    /// Paid and current.
    Active,
    /// Lapsed; set only by the expire sweep.
    Expired,
    /// Cancelled by the subject; terminal.
    Cancelled,
}

impl SubscriptionStatus {
    /// Whether `self -> next` is an edge of the lifecycle state machine.
    ///
    /// `Active -> Active` covers in-place extension and flag updates.
    pub fn can_transition_to(self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, next),
            (Pending, Active) | (Active, Active) | (Active, Expired) | (Active, Cancelled)
        )
    }

    /// Expired and cancelled rows are history and never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Expired | SubscriptionStatus::Cancelled
        )
    }

    /// Human-readable status name.
    pub fn display_name(self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "Активна",
            SubscriptionStatus::Expired => "Истекла",
            SubscriptionStatus::Cancelled => "Отменена",
            SubscriptionStatus::Pending => "Ожидает оплаты",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            SubscriptionStatus::Pending => "PENDING",
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Expired => "EXPIRED",
            SubscriptionStatus::Cancelled => "CANCELLED",
        };
        f.write_str(code)
    }
}

/// One subscription row. Rows are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Row identifier.
    pub id: SubscriptionId,

    /// Owning subject id.
    pub subject: String,

    /// Plan of the current period.
    pub plan: Plan,

    /// Lifecycle status.
    pub status: SubscriptionStatus,

    /// Start of the current period.
    pub start: DateTime<Utc>,

    /// End of the current period; always after `start`.
    pub end: DateTime<Utc>,

    /// Whether the renewal sweep should extend this row.
    pub auto_renew: bool,

    /// Payment method tag supplied at purchase.
    pub payment_method: Option<String>,

    /// Latest payment transaction reference.
    pub transaction_ref: String,

    /// Row creation time.
    pub created_at: DateTime<Utc>,

    /// Last transition time.
    pub updated_at: Option<DateTime<Utc>>,

    /// Optimistic-concurrency version, bumped on every committed write.
    pub version: u64,
}

impl Subscription {
    /// Whole days remaining, never negative. Derived, never stored.
    pub fn days_left(&self, now: DateTime<Utc>) -> i64 {
        (self.end - now).num_days().max(0)
    }

    /// ACTIVE and not yet past its end.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.end > now
    }

    /// Ends within `window` of `now`.
    pub fn is_expiring_soon(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.end - now <= window
    }
}

/// Values for a row about to be inserted; the store assigns id and version.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    /// Owning subject id.
    pub subject: String,
    /// Plan of the first period.
    pub plan: Plan,
    /// Either `Pending` or, for extend-after-lapse, `Active`.
    pub status: SubscriptionStatus,
    /// Period start.
    pub start: DateTime<Utc>,
    /// Period end.
    pub end: DateTime<Utc>,
    /// Payment method tag.
    pub payment_method: Option<String>,
    /// Payment transaction reference.
    pub transaction_ref: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Display projection of a subject's current subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionDetails {
    /// Row identifier.
    pub id: SubscriptionId,
    /// Plan display name.
    pub plan_name: &'static str,
    /// Machine status.
    pub status: SubscriptionStatus,
    /// Status display name.
    pub status_name: &'static str,
    /// Period start.
    pub start: DateTime<Utc>,
    /// Period end.
    pub end: DateTime<Utc>,
    /// Whole days remaining.
    pub days_left: i64,
    /// Auto-renew flag.
    pub auto_renew: bool,
    /// Ends within the expiring-soon window.
    pub expiring_soon: bool,
}

impl SubscriptionDetails {
    /// Project a row as seen at `now`.
    pub fn project(row: &Subscription, now: DateTime<Utc>, soon: Duration) -> Self {
        Self {
            id: row.id,
            plan_name: row.plan.display_name(),
            status: row.status,
            status_name: row.status.display_name(),
            start: row.start,
            end: row.end,
            days_left: row.days_left(now),
            auto_renew: row.auto_renew,
            expiring_soon: row.is_expiring_soon(now, soon),
        }
    }
}

/// Result of an info query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubscriptionInfo {
    /// The subject holds a current subscription.
    Active(SubscriptionDetails),
    /// No current subscription.
    Inactive,
}

impl SubscriptionInfo {
    /// Whether the subject currently holds a subscription.
    pub fn is_active(&self) -> bool {
        matches!(self, SubscriptionInfo::Active(_))
    }
}

/// Entitlement check result for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessCheck {
    /// Whether gated routes would admit this subject right now.
    pub has_access: bool,
    /// Current subscription, if any.
    pub info: SubscriptionInfo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(status: SubscriptionStatus, end_in_days: i64) -> Subscription {
        let start = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        Subscription {
            id: 1,
            subject: "seller@example.com".to_string(),
            plan: Plan::Days30,
            status,
            start,
            end: start + Duration::days(end_in_days),
            auto_renew: false,
            payment_method: Some("card".to_string()),
            transaction_ref: "TXN_test".to_string(),
            created_at: start,
            updated_at: None,
            version: 0,
        }
    }

    #[test]
    fn plan_catalogue_matches_prices() {
        let plans = Plan::catalogue();
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[0].code, "PLAN_30_DAYS");
        assert_eq!(plans[0].price_minor, 149_900);
        assert_eq!(plans[2].days, 90);
    }

    #[test]
    fn plan_code_roundtrips_through_serde() {
        let json = serde_json::to_string(&Plan::Days60).unwrap();
        assert_eq!(json, "\"PLAN_60_DAYS\"");
        assert_eq!(Plan::from_code("PLAN_60_DAYS"), Some(Plan::Days60));
        assert_eq!(Plan::from_code("PLAN_7_DAYS"), None);
    }

    #[test]
    fn state_machine_edges() {
        use SubscriptionStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Active.can_transition_to(Expired));
        assert!(Active.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Active));

        assert!(!Pending.can_transition_to(Expired));
        assert!(!Pending.can_transition_to(Cancelled));
        assert!(!Expired.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Active));
        assert!(!Expired.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Expired));
    }

    #[test]
    fn days_left_never_negative() {
        let sub = row(SubscriptionStatus::Active, 30);
        assert_eq!(sub.days_left(sub.start), 30);
        assert_eq!(sub.days_left(sub.end + Duration::days(2)), 0);
    }

    #[test]
    fn active_requires_future_end() {
        let sub = row(SubscriptionStatus::Active, 30);
        assert!(sub.is_active_at(sub.start));
        assert!(!sub.is_active_at(sub.end));

        let cancelled = row(SubscriptionStatus::Cancelled, 30);
        assert!(!cancelled.is_active_at(cancelled.start));
    }

    #[test]
    fn expiring_soon_boundary_is_inclusive() {
        let sub = row(SubscriptionStatus::Active, 30);
        let week = Duration::days(7);
        assert!(!sub.is_expiring_soon(sub.end - Duration::days(8), week));
        assert!(sub.is_expiring_soon(sub.end - week, week));
    }

    #[test]
    fn details_use_display_names() {
        let sub = row(SubscriptionStatus::Active, 30);
        let details = SubscriptionDetails::project(&sub, sub.start, Duration::days(7));
        assert_eq!(details.status_name, "Активна");
        assert_eq!(details.plan_name, "30 дней");
        assert_eq!(details.days_left, 30);
        assert!(!details.expiring_soon);
    }

    #[test]
    fn info_serializes_with_state_tag() {
        let json = serde_json::to_value(SubscriptionInfo::Inactive).unwrap();
        assert_eq!(json["state"], "inactive");
    }
}
