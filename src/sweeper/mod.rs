//! Periodic lifecycle sweeps: expiry, reminders, auto-renewal.

pub mod payment;
pub mod scheduler;
