use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use claimwatch_domain::model::Address;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

mod types;

pub use types::{
    InnerInstructions, Instruction, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    ParsedInstruction, RawTransaction, SignatureInfo, TransactionEnvelope, TransactionMessage,
    TransactionMeta, TransferInfo,
};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Server { code: i64, message: String },
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for RpcError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Decode(value.to_string())
        } else {
            Self::Transport(value.to_string())
        }
    }
}

impl From<JsonRpcError> for RpcError {
    fn from(value: JsonRpcError) -> Self {
        Self::Server {
            code: value.code,
            message: value.message,
        }
    }
}

/// Read-only ledger queries used by the polling source.
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    /// Most recent transaction signatures touching `address`, newest first.
    async fn recent_signatures(
        &self,
        address: &Address,
        limit: usize,
    ) -> Result<Vec<SignatureInfo>, RpcError>;

    /// Full transaction record, or `None` if the node does not have it yet.
    async fn transaction(&self, signature: &str) -> Result<Option<RawTransaction>, RpcError>;
}

/// `LedgerRpc` over HTTP JSON-RPC.
pub struct HttpLedgerRpc {
    client: reqwest::Client,
    url: String,
    commitment: String,
    next_id: AtomicU64,
}

impl HttpLedgerRpc {
    /// Every request, connect included, fails with a transport error once
    /// `timeout` elapses, so a node that accepts and never answers cannot
    /// wedge a polling tick.
    pub fn new(
        url: impl Into<String>,
        commitment: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self::with_client(client, url, commitment))
    }

    pub fn with_client(
        client: reqwest::Client,
        url: impl Into<String>,
        commitment: impl Into<String>,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            commitment: commitment.into(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn call<P, R>(&self, method: &'static str, params: P) -> Result<Option<R>, RpcError>
    where
        P: Serialize + Send,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let outcome = self.send(&request).await;

        let result = if outcome.is_ok() { "ok" } else { "error" };
        counter!("monitor_rpc_calls_total", "method" => method, "result" => result).increment(1);
        outcome
    }

    async fn send<P, R>(&self, request: &JsonRpcRequest<P>) -> Result<Option<R>, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let response: JsonRpcResponse<R> = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match response.error {
            Some(err) => Err(err.into()),
            None => Ok(response.result),
        }
    }
}

#[async_trait]
impl LedgerRpc for HttpLedgerRpc {
    async fn recent_signatures(
        &self,
        address: &Address,
        limit: usize,
    ) -> Result<Vec<SignatureInfo>, RpcError> {
        let params = signatures_params(address, limit, &self.commitment);
        Ok(self
            .call("getSignaturesForAddress", params)
            .await?
            .unwrap_or_default())
    }

    async fn transaction(&self, signature: &str) -> Result<Option<RawTransaction>, RpcError> {
        let params = transaction_params(signature, &self.commitment);
        self.call("getTransaction", params).await
    }
}

fn signatures_params(address: &Address, limit: usize, commitment: &str) -> serde_json::Value {
    json!([
        address.as_str(),
        { "limit": limit, "commitment": commitment }
    ])
}

fn transaction_params(signature: &str, commitment: &str) -> serde_json::Value {
    json!([
        signature,
        {
            "encoding": "jsonParsed",
            "commitment": commitment,
            "maxSupportedTransactionVersion": 0
        }
    ])
}
