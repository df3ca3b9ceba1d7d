use async_trait::async_trait;
use thiserror::Error;

use crate::model::{DepositRecord, NewDeposit};

/// Common result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
}

impl StorageError {
    pub fn from_source(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }
}

#[async_trait]
pub trait DepositStore: Send + Sync {
    /// Records a deposit. Returns `false` when the signature was already stored.
    async fn insert_deposit(&self, deposit: NewDeposit) -> StorageResult<bool>;
    async fn find_deposit(&self, signature: &str) -> StorageResult<Option<DepositRecord>>;
    /// Most recently recorded signatures, newest first.
    async fn recent_signatures(&self, limit: u64) -> StorageResult<Vec<String>>;
}
