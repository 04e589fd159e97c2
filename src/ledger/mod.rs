//! Subscription ledger: storage seam, durable store and lifecycle operations.

pub mod file;
pub mod lifecycle;
pub mod store;
