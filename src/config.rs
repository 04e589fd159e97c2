//! Subgate configuration.

use crate::GateError;
use std::time::Duration;

/// Engine-wide settings: storage timeouts, sweep cadence and time windows.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Default deadline for a single ledger operation.
    /// A call that exceeds it fails with `TransientStorage` and commits nothing.
    pub storage_timeout: Duration,

    /// Upper bound on one sweep run; rows left over wait for the next tick.
    pub sweep_timeout: Duration,

    /// Cadence of the expire sweep (hourly by default).
    pub expire_interval: Duration,

    /// Cadence of the expiring-soon reminder sweep (daily by default).
    pub reminder_interval: Duration,

    /// Cadence of the auto-renewal sweep (daily by default).
    pub renewal_interval: Duration,

    /// A subscription ending within this window counts as expiring soon.
    pub expiring_soon_window: Duration,

    /// Auto-renewal picks up subscriptions ending within this window.
    pub renewal_window: Duration,

    /// Tolerance added to credential expiry. Zero means strict `now <= exp`.
    pub clock_skew: Duration,

    /// Directory name under the platform data dir used by the file store.
    pub data_namespace: &'static str,
}

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            storage_timeout: Duration::from_secs(5),
            sweep_timeout: Duration::from_secs(10 * 60),
            expire_interval: Duration::from_secs(HOUR),
            reminder_interval: Duration::from_secs(DAY),
            renewal_interval: Duration::from_secs(DAY),
            expiring_soon_window: Duration::from_secs(7 * DAY),
            renewal_window: Duration::from_secs(3 * DAY),
            clock_skew: Duration::ZERO,
            data_namespace: "subgate",
        }
    }
}

impl GateConfig {
    /// Validate configuration for obvious errors.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.storage_timeout.is_zero() {
            return Err(GateError::ConfigError(
                "storage_timeout cannot be zero".to_string(),
            ));
        }
        if self.sweep_timeout.is_zero() {
            return Err(GateError::ConfigError(
                "sweep_timeout cannot be zero".to_string(),
            ));
        }
        for (name, interval) in [
            ("expire_interval", self.expire_interval),
            ("reminder_interval", self.reminder_interval),
            ("renewal_interval", self.renewal_interval),
        ] {
            if interval.is_zero() {
                return Err(GateError::ConfigError(format!("{} cannot be zero", name)));
            }
        }
        if self.data_namespace.is_empty() {
            return Err(GateError::ConfigError(
                "data_namespace cannot be empty".to_string(),
            ));
        }
        // All windows must be representable as signed chrono durations.
        chrono_window(self.expiring_soon_window)?;
        chrono_window(self.renewal_window)?;
        chrono_window(self.clock_skew)?;
        Ok(())
    }
}

/// Convert a configured window into a signed duration for date arithmetic.
pub(crate) fn chrono_window(window: Duration) -> Result<chrono::Duration, GateError> {
    chrono::Duration::from_std(window)
        .map_err(|e| GateError::ConfigError(format!("window out of range: {}", e)))
}
