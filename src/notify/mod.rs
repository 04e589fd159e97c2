//! Outbound notifications: sink interface, dispatcher, webhook adapter.

pub mod messages;
pub mod sink;
pub mod webhook;
