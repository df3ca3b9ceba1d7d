//! Domain-level building blocks shared by the monitor and storage crates.
//!
//! Holds the transfer/deposit model, environment-driven configuration, the
//! signature ledger used for deduplication, and the telemetry bootstrap so
//! every binary wires tracing and metrics the same way.

pub mod config;
pub mod model;
pub mod services;
pub mod storage;

pub use model::*;
