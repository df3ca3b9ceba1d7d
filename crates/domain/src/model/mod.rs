//! Data structures and helpers shared across the monitor and storage crates.

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Decoded length (in bytes) of a ledger account address.
pub const ADDRESS_LENGTH: usize = 32;

/// Errors emitted when an account address fails validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressFormatError {
    #[error("address is empty")]
    Empty,
    #[error("address is not valid base58")]
    NotBase58,
    #[error("address must decode to {ADDRESS_LENGTH} bytes, got {0}")]
    WrongLength(usize),
}

/// Validates that the supplied string is a base58 encoded 32-byte address.
pub fn validate_address(address: &str) -> Result<(), AddressFormatError> {
    if address.is_empty() {
        return Err(AddressFormatError::Empty);
    }

    let decoded = bs58::decode(address)
        .into_vec()
        .map_err(|_| AddressFormatError::NotBase58)?;
    if decoded.len() != ADDRESS_LENGTH {
        return Err(AddressFormatError::WrongLength(decoded.len()));
    }

    Ok(())
}

/// Ledger account address in its canonical base58 text form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    pub fn parse(address: &str) -> Result<Self, AddressFormatError> {
        let trimmed = address.trim();
        validate_address(trimmed)?;
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for Address {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// A native-value transfer into the monitored address, as observed by one of
/// the detection sources.
///
/// `observed_at` is the local wall clock at extraction time, never ledger
/// time. Events are created per inspection and are not persisted by the
/// pipeline itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub signature: String,
    pub source: String,
    pub destination: String,
    /// Amount in lamports.
    pub amount: u64,
    pub observed_at: DateTime<Utc>,
}

impl TransferEvent {
    pub fn observed_at_millis(&self) -> i64 {
        self.observed_at.timestamp_millis()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeposit {
    pub signature: String,
    pub source: String,
    pub destination: String,
    pub amount: u64,
    pub observed_at: DateTime<Utc>,
}

impl From<&TransferEvent> for NewDeposit {
    fn from(event: &TransferEvent) -> Self {
        Self {
            signature: event.signature.clone(),
            source: event.source.clone(),
            destination: event.destination.clone(),
            amount: event.amount,
            observed_at: event.observed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositRecord {
    pub signature: String,
    pub source: String,
    pub destination: String,
    pub amount: u64,
    pub observed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
