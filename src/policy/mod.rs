//! Route classification and request admission.

pub mod access;
pub mod routes;
