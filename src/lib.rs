//! Identity relay — per-account protocol workers driven over a message bus.

pub mod bus;
pub mod config;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod store;
pub mod worker;
