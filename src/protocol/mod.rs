//! Domain model shared by the ledger, sweeper and gate.

pub mod models;
