//! Push detection over a WebSocket transaction subscription.

mod source;
mod supervisor;

use claimwatch_domain::model::Address;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    extractor::{parse_transaction, ExtractError},
    rpc::{JsonRpcError, JsonRpcRequest, RawTransaction},
};

#[cfg(test)]
pub(crate) use source::loopback;
pub use source::{PushSource, SessionEnd};
pub use supervisor::{
    IllegalTransition, LifecycleEvent, ReconnectSupervisor, SubscriptionState, TransitionEffect,
};

pub const SUBSCRIBE_METHOD: &str = "transactionSubscribe";
pub const NOTIFICATION_METHOD: &str = "transactionNotification";

/// Transport-level failures. All of them end the session and lead to a
/// reconnect, never to process termination.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("subscription rejected: {} ({})", .0.message, .0.code)]
    SubscriptionRejected(JsonRpcError),
    #[error("connection closed: {0}")]
    Closed(String),
}

/// Subscription request scoped to one address, asking for full transactions
/// with parsed instructions.
pub fn subscribe_request(id: u64, address: &Address, commitment: &str) -> JsonRpcRequest<Value> {
    JsonRpcRequest::new(
        id,
        SUBSCRIBE_METHOD,
        json!([
            {
                "accountInclude": [address.as_str()],
                "failed": false
            },
            {
                "commitment": commitment,
                "encoding": "jsonParsed",
                "transactionDetails": "full",
                "maxSupportedTransactionVersion": 0
            }
        ]),
    )
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct NotificationParams {
    #[serde(default)]
    subscription: Option<u64>,
    result: NotificationResult,
}

#[derive(Debug, Deserialize)]
struct NotificationResult {
    #[serde(default)]
    signature: Option<String>,
    transaction: Value,
}

/// A classified inbound frame.
#[derive(Debug)]
pub enum Inbound {
    /// Reply to the subscribe request carrying the subscription id.
    Ack { id: u64, subscription: u64 },
    Rejected { id: u64, error: JsonRpcError },
    Notification {
        subscription: Option<u64>,
        transaction: Box<RawTransaction>,
    },
    /// Anything else the server may send (other replies, unknown methods).
    Other,
}

#[derive(Debug, Error)]
pub enum InboundError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Transaction(#[from] ExtractError),
}

/// Classifies one text frame. Notification payloads are decoded into a
/// transaction record; when the embedded record lacks signatures the one from
/// the notification envelope is used.
pub fn parse_inbound(text: &str) -> Result<Inbound, InboundError> {
    let envelope: Envelope = serde_json::from_str(text)?;

    if envelope.method.as_deref() == Some(NOTIFICATION_METHOD) {
        let Some(params) = envelope.params else {
            return Ok(Inbound::Other);
        };
        let params: NotificationParams = serde_json::from_value(params)?;
        let mut transaction = parse_transaction(params.result.transaction)?;
        if transaction.transaction.signatures.is_empty() {
            if let Some(signature) = params.result.signature {
                transaction.transaction.signatures.push(signature);
            }
        }
        return Ok(Inbound::Notification {
            subscription: params.subscription,
            transaction: Box::new(transaction),
        });
    }

    match (envelope.id, envelope.error, envelope.result) {
        (Some(id), Some(error), _) => Ok(Inbound::Rejected { id, error }),
        (Some(id), None, Some(Value::Number(number))) => match number.as_u64() {
            Some(subscription) => Ok(Inbound::Ack { id, subscription }),
            None => Ok(Inbound::Other),
        },
        _ => Ok(Inbound::Other),
    }
}
