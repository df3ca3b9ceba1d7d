//! Environment-driven configuration structures shared by all binaries.

use std::{env, time::Duration};

use thiserror::Error;

use crate::model::{Address, AddressFormatError};

const DEFAULT_COMMITMENT: &str = "confirmed";
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_RPC_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_POLL_SIGNATURE_LIMIT: usize = 5;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;
const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;
const DEFAULT_LEDGER_CAPACITY: usize = 1_000;
const DEFAULT_MIN_DEPOSIT_LAMPORTS: u64 = 1;

/// Commitment levels accepted by the ledger RPC.
const COMMITMENTS: [&str; 3] = ["processed", "confirmed", "finalized"];

/// Monitor configuration derived from `.env`/process variables.
///
/// A missing or malformed monitored address is the one fatal configuration
/// error of the detection pipeline; everything else has a default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    monitored_address: Address,
    rpc_url: String,
    ws_url: String,
    database_url: String,
    commitment: String,
    poll_interval: Duration,
    poll_signature_limit: usize,
    rpc_timeout: Duration,
    reconnect_delay: Duration,
    ping_interval: Duration,
    ledger_capacity: usize,
    min_deposit_lamports: u64,
    enable_push: bool,
    enable_poll: bool,
}

impl MonitorConfig {
    /// Loads configuration by hydrating `.env` (if present) and reading the
    /// process variables. Missing or malformed entries surface as
    /// `ConfigError` so binaries can refuse to start.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        let monitored_address = Address::parse(&get_required_var("MONITORED_ADDRESS")?)
            .map_err(|source| ConfigError::InvalidAddress {
                key: "MONITORED_ADDRESS",
                source,
            })?;

        let commitment = get_optional_var("MONITOR_COMMITMENT")
            .unwrap_or_else(|| DEFAULT_COMMITMENT.to_string());
        if !COMMITMENTS.contains(&commitment.as_str()) {
            return Err(ConfigError::InvalidCommitment(commitment));
        }

        let enable_push = parse_bool("MONITOR_ENABLE_PUSH", true)?;
        let enable_poll = parse_bool("MONITOR_ENABLE_POLL", true)?;
        if !enable_push && !enable_poll {
            return Err(ConfigError::NoSourceEnabled);
        }

        Ok(Self {
            monitored_address,
            rpc_url: get_required_var("SOLANA_RPC_URL")?,
            ws_url: get_required_var("SOLANA_WS_URL")?,
            database_url: get_required_var("DATABASE_URL")?,
            commitment,
            poll_interval: parse_nonzero_millis(
                "MONITOR_POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL_MS,
            )?,
            poll_signature_limit: parse_number(
                "MONITOR_POLL_SIGNATURE_LIMIT",
                DEFAULT_POLL_SIGNATURE_LIMIT,
            )?,
            rpc_timeout: parse_nonzero_millis("MONITOR_RPC_TIMEOUT_MS", DEFAULT_RPC_TIMEOUT_MS)?,
            reconnect_delay: Duration::from_millis(parse_number(
                "MONITOR_RECONNECT_DELAY_MS",
                DEFAULT_RECONNECT_DELAY_MS,
            )?),
            ping_interval: Duration::from_millis(parse_number(
                "MONITOR_PING_INTERVAL_MS",
                DEFAULT_PING_INTERVAL_MS,
            )?),
            ledger_capacity: parse_number("MONITOR_LEDGER_CAPACITY", DEFAULT_LEDGER_CAPACITY)?,
            min_deposit_lamports: parse_number(
                "MONITOR_MIN_DEPOSIT_LAMPORTS",
                DEFAULT_MIN_DEPOSIT_LAMPORTS,
            )?,
            enable_push,
            enable_poll,
        })
    }

    pub fn monitored_address(&self) -> &Address {
        &self.monitored_address
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn commitment(&self) -> &str {
        &self.commitment
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn poll_signature_limit(&self) -> usize {
        self.poll_signature_limit
    }

    /// Upper bound on one JSON-RPC round trip.
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    pub fn ledger_capacity(&self) -> usize {
        self.ledger_capacity
    }

    pub fn min_deposit_lamports(&self) -> u64 {
        self.min_deposit_lamports
    }

    pub fn enable_push(&self) -> bool {
        self.enable_push
    }

    pub fn enable_poll(&self) -> bool {
        self.enable_poll
    }
}

fn get_required_var(key: &'static str) -> Result<String, ConfigError> {
    get_optional_var(key).ok_or(ConfigError::MissingVar { key })
}

pub(crate) fn get_optional_var(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_number<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = std::num::ParseIntError>,
{
    match get_optional_var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|source| ConfigError::InvalidNumber { key, source }),
        None => Ok(default),
    }
}

fn parse_nonzero_millis(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match parse_number(key, default)? {
        0 => Err(ConfigError::ZeroDuration { key }),
        millis => Ok(Duration::from_millis(millis)),
    }
}

fn parse_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match get_optional_var(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool { key, value: raw }),
        },
        None => Ok(default),
    }
}

pub fn hydrate_env_file() -> Result<(), ConfigError> {
    if env::var_os("CLAIMWATCH_SKIP_DOTENV").is_some() {
        return Ok(());
    }
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ConfigError::Dotenv { source: err }),
    }

    Ok(())
}

/// Errors emitted when `.env` hydration or environment parsing fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable `{key}`")]
    MissingVar { key: &'static str },
    #[error("invalid integer in `{key}`: {source}")]
    InvalidNumber {
        key: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("`{key}` must be greater than zero")]
    ZeroDuration { key: &'static str },
    #[error("invalid boolean in `{key}`: `{value}`")]
    InvalidBool { key: &'static str, value: String },
    #[error("invalid address in `{key}`: {source}")]
    InvalidAddress {
        key: &'static str,
        #[source]
        source: AddressFormatError,
    },
    #[error("unsupported commitment level `{0}`")]
    InvalidCommitment(String),
    #[error("at least one of push or poll detection must be enabled")]
    NoSourceEnabled,
    #[error("failed to load .env file: {source}")]
    Dotenv {
        #[from]
        source: dotenvy::Error,
    },
}

#[cfg(test)]
pub(crate) static ENV_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";

    const OPTIONAL_KEYS: [&str; 11] = [
        "MONITOR_COMMITMENT",
        "MONITOR_POLL_INTERVAL_MS",
        "MONITOR_RPC_TIMEOUT_MS",
        "MONITOR_POLL_SIGNATURE_LIMIT",
        "MONITOR_RECONNECT_DELAY_MS",
        "MONITOR_PING_INTERVAL_MS",
        "MONITOR_LEDGER_CAPACITY",
        "MONITOR_MIN_DEPOSIT_LAMPORTS",
        "MONITOR_ENABLE_PUSH",
        "MONITOR_ENABLE_POLL",
        "MONITOR_LOG_FILTER",
    ];

    fn set_env() {
        env::set_var("CLAIMWATCH_SKIP_DOTENV", "1");
        env::set_var("MONITORED_ADDRESS", ADDRESS);
        env::set_var("SOLANA_RPC_URL", "http://127.0.0.1:8899");
        env::set_var("SOLANA_WS_URL", "ws://127.0.0.1:8900");
        env::set_var("DATABASE_URL", "sqlite://test.db");
        for key in OPTIONAL_KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn config_loader_applies_defaults() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        set_env();

        let config = MonitorConfig::load_from_env().expect("config loads");
        assert_eq!(config.monitored_address().as_str(), ADDRESS);
        assert_eq!(config.rpc_url(), "http://127.0.0.1:8899");
        assert_eq!(config.ws_url(), "ws://127.0.0.1:8900");
        assert_eq!(config.commitment(), "confirmed");
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.poll_signature_limit(), 5);
        assert_eq!(config.rpc_timeout(), Duration::from_secs(10));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.ledger_capacity(), 1000);
        assert_eq!(config.min_deposit_lamports(), 1);
        assert!(config.enable_push());
        assert!(config.enable_poll());
    }

    #[test]
    fn config_loader_reads_overrides() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        set_env();
        env::set_var("MONITOR_COMMITMENT", "finalized");
        env::set_var("MONITOR_POLL_INTERVAL_MS", "10000");
        env::set_var("MONITOR_POLL_SIGNATURE_LIMIT", " 20 ");
        env::set_var("MONITOR_LEDGER_CAPACITY", "50");
        env::set_var("MONITOR_RPC_TIMEOUT_MS", "2500");
        env::set_var("MONITOR_ENABLE_PUSH", "false");

        let config = MonitorConfig::load_from_env().expect("config loads");
        assert_eq!(config.commitment(), "finalized");
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.poll_signature_limit(), 20);
        assert_eq!(config.ledger_capacity(), 50);
        assert_eq!(config.rpc_timeout(), Duration::from_millis(2500));
        assert!(!config.enable_push());

        set_env();
    }

    #[test]
    fn missing_monitored_address_is_fatal() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        set_env();
        env::set_var("MONITORED_ADDRESS", "   ");

        let err = MonitorConfig::load_from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingVar {
                key: "MONITORED_ADDRESS"
            }
        ));

        set_env();
    }

    #[test]
    fn malformed_monitored_address_is_rejected() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        set_env();
        env::set_var("MONITORED_ADDRESS", "not-an-address");

        let err = MonitorConfig::load_from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress { .. }));

        set_env();
    }

    #[test]
    fn invalid_values_are_rejected() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        set_env();
        env::set_var("MONITOR_POLL_INTERVAL_MS", "soon");
        assert!(matches!(
            MonitorConfig::load_from_env().unwrap_err(),
            ConfigError::InvalidNumber {
                key: "MONITOR_POLL_INTERVAL_MS",
                ..
            }
        ));

        set_env();
        env::set_var("MONITOR_COMMITMENT", "recent");
        assert!(matches!(
            MonitorConfig::load_from_env().unwrap_err(),
            ConfigError::InvalidCommitment(_)
        ));

        set_env();
        env::set_var("MONITOR_ENABLE_POLL", "maybe");
        assert!(matches!(
            MonitorConfig::load_from_env().unwrap_err(),
            ConfigError::InvalidBool { .. }
        ));

        set_env();
    }

    #[test]
    fn zero_durations_are_rejected() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        set_env();
        env::set_var("MONITOR_POLL_INTERVAL_MS", "0");
        assert!(matches!(
            MonitorConfig::load_from_env().unwrap_err(),
            ConfigError::ZeroDuration {
                key: "MONITOR_POLL_INTERVAL_MS"
            }
        ));

        set_env();
        env::set_var("MONITOR_RPC_TIMEOUT_MS", "0");
        assert!(matches!(
            MonitorConfig::load_from_env().unwrap_err(),
            ConfigError::ZeroDuration {
                key: "MONITOR_RPC_TIMEOUT_MS"
            }
        ));

        set_env();
    }

    #[test]
    fn disabling_both_sources_is_rejected() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        set_env();
        env::set_var("MONITOR_ENABLE_PUSH", "0");
        env::set_var("MONITOR_ENABLE_POLL", "off");

        assert!(matches!(
            MonitorConfig::load_from_env().unwrap_err(),
            ConfigError::NoSourceEnabled
        ));

        set_env();
    }
}
