//! Deposit-detection pipeline for a single monitored address: push and poll
//! sources feed one idempotent dispatcher. The binary in `main.rs` wires it to
//! the SeaORM deposit store; embedders can supply their own handler.

pub mod dispatcher;
pub mod extractor;
pub mod handler;
pub mod pipeline;
pub mod poller;
pub mod push;
pub mod rpc;
pub mod worker;

pub use dispatcher::{
    CandidateSource, DepositHandler, DispatchFailure, DispatchOutcome, Dispatcher, HandlerError,
};
pub use extractor::{extract, parse_transaction, ExtractError, SYSTEM_PROGRAM_ID};
pub use handler::StoringDepositHandler;
pub use pipeline::{Pipeline, PipelineSettings};
pub use push::{ReconnectSupervisor, SubscriptionState};
pub use rpc::{HttpLedgerRpc, LedgerRpc, RpcError};
pub use worker::{build_pipeline, run_monitor, run_until, MonitorError};
