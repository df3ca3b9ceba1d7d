//! Shared service helpers such as the signature ledger and telemetry wiring.

pub mod ledger;
pub mod telemetry;

pub use ledger::*;
pub use telemetry::*;
