//! Credential validity window checks.

use chrono::{DateTime, Duration, Utc};

/// Convert a unix-seconds claim into a UTC instant.
///
/// Out-of-range values yield `None`.
pub fn claim_instant(unix_seconds: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(unix_seconds, 0)
}

/// Whether a credential expiring at `expiry` is still usable at `now`.
///
/// The bound is inclusive: a credential is valid through its expiry second.
/// `skew` widens the bound; zero means no tolerance. A bound past the
/// representable range never excludes `now`.
pub fn within_expiry(expiry: DateTime<Utc>, now: DateTime<Utc>, skew: Duration) -> bool {
    expiry
        .checked_add_signed(skew)
        .map_or(true, |bound| now <= bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, h, m, s).unwrap()
    }

    #[test]
    fn test_claim_instant_valid() {
        let instant = claim_instant(1_736_942_400).unwrap();
        assert_eq!(instant.to_rfc3339(), "2025-01-15T12:00:00+00:00");
    }

    #[test]
    fn test_claim_instant_out_of_range() {
        assert!(claim_instant(i64::MAX).is_none());
    }

    #[test]
    fn test_expiry_exact_second_is_valid() {
        assert!(within_expiry(at(12, 0, 0), at(12, 0, 0), Duration::zero()));
    }

    #[test]
    fn test_expiry_one_second_late() {
        assert!(!within_expiry(at(12, 0, 0), at(12, 0, 1), Duration::zero()));
    }

    #[test]
    fn test_expiry_skew_tolerance() {
        let skew = Duration::seconds(30);
        assert!(within_expiry(at(12, 0, 0), at(12, 0, 30), skew));
        assert!(!within_expiry(at(12, 0, 0), at(12, 0, 31), skew));
    }

    #[test]
    fn test_expiry_at_calendar_limit_with_skew() {
        let far = DateTime::<Utc>::MAX_UTC;
        assert!(within_expiry(far, at(12, 0, 0), Duration::seconds(30)));
        assert!(within_expiry(far, far, Duration::seconds(30)));
    }
}
