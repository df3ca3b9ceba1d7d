//! Pulls the deposit into the monitored address out of a raw transaction.

use chrono::Utc;
use claimwatch_domain::model::{Address, TransferEvent};
use serde_json::Value;
use thiserror::Error;

use crate::rpc::{Instruction, ParsedInstruction, RawTransaction, TransferInfo};

/// Well-known id of the native System Program.
pub const SYSTEM_PROGRAM_ID: &str = "11111111111111111111111111111111";

const TRANSFER_KIND: &str = "transfer";

/// A candidate payload whose shape does not match a transaction record.
#[derive(Debug, Error)]
#[error("malformed transaction record: {0}")]
pub struct ExtractError(#[from] serde_json::Error);

/// Decodes an untyped payload into a [`RawTransaction`].
pub fn parse_transaction(payload: Value) -> Result<RawTransaction, ExtractError> {
    Ok(serde_json::from_value(payload)?)
}

/// Returns the first native transfer into `monitored` carried by `raw`.
///
/// Failed transactions and records without execution metadata yield `None`.
/// Top-level instructions are scanned before inner instructions. Only the
/// first matching transfer is reported; further transfers into the monitored
/// address within the same transaction are not surfaced.
pub fn extract(raw: &RawTransaction, monitored: &Address) -> Option<TransferEvent> {
    if raw.succeeded() != Some(true) {
        return None;
    }
    let signature = raw.signature()?;

    raw.instructions()
        .filter_map(decode_transfer)
        .find(|info| monitored == info.destination.as_str() && info.lamports > 0)
        .map(|info| TransferEvent {
            signature: signature.to_owned(),
            source: info.source,
            destination: info.destination,
            amount: info.lamports,
            observed_at: Utc::now(),
        })
}

fn decode_transfer(instruction: &Instruction) -> Option<TransferInfo> {
    if instruction.program_id != SYSTEM_PROGRAM_ID {
        return None;
    }
    let parsed: ParsedInstruction = serde_json::from_value(instruction.parsed.clone()?).ok()?;
    if parsed.kind != TRANSFER_KIND {
        return None;
    }
    serde_json::from_value(parsed.info).ok()
}
