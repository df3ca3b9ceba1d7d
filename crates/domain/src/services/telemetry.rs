use std::{net::SocketAddr, sync::Arc};

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{get_optional_var, hydrate_env_file};

const DEFAULT_LOG_FILTER: &str = "info";

static SUBSCRIBER_INSTALLED: OnceCell<()> = OnceCell::new();
static METRICS_HANDLE: OnceCell<Arc<PrometheusHandle>> = OnceCell::new();

/// Observability options for the monitor binary.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    log_filter: String,
    metrics_address: Option<String>,
}

impl TelemetryConfig {
    /// Reads `<PREFIX>_LOG_FILTER` and `<PREFIX>_METRICS_ADDRESS`. Both are
    /// optional; without a metrics address the recorder is installed but
    /// nothing listens.
    pub fn from_env(prefix: &str) -> Self {
        let _ = hydrate_env_file();
        let upper = prefix.trim().to_ascii_uppercase();

        Self {
            log_filter: get_optional_var(&format!("{upper}_LOG_FILTER"))
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            metrics_address: get_optional_var(&format!("{upper}_METRICS_ADDRESS")),
        }
    }

    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    pub fn metrics_address(&self) -> Option<&str> {
        self.metrics_address.as_deref()
    }

    fn metrics_socket(&self) -> Result<Option<SocketAddr>, TelemetryError> {
        self.metrics_address
            .as_deref()
            .map(|addr| {
                addr.parse().map_err(|err: std::net::AddrParseError| {
                    TelemetryError::InvalidMetricsAddress(addr.to_string(), err.to_string())
                })
            })
            .transpose()
    }
}

/// Keeps the Prometheus handle reachable for callers that render on demand.
#[derive(Clone)]
pub struct TelemetryGuard {
    metrics: Arc<PrometheusHandle>,
}

impl TelemetryGuard {
    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}

/// Installs the tracing subscriber and the metrics recorder once per process.
/// Later calls reuse what the first call installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let socket = config.metrics_socket()?;
    install_tracing(config)?;
    let metrics = install_metrics(socket)?;
    describe_metrics();

    Ok(TelemetryGuard { metrics })
}

fn install_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    if SUBSCRIBER_INSTALLED.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_new(config.log_filter())
        .map_err(|err| TelemetryError::InvalidLogFilter(err.to_string()))?;

    if SUBSCRIBER_INSTALLED.set(()).is_ok() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .map_err(|err| TelemetryError::Tracing(err.to_string()))?;
    }

    Ok(())
}

fn install_metrics(socket: Option<SocketAddr>) -> Result<Arc<PrometheusHandle>, TelemetryError> {
    METRICS_HANDLE
        .get_or_try_init(|| {
            let mut builder = PrometheusBuilder::new();
            if let Some(socket) = socket {
                builder = builder.with_http_listener(socket);
            }

            builder
                .install_recorder()
                .map(Arc::new)
                .map_err(|err| TelemetryError::Metrics(err.to_string()))
        })
        .cloned()
}

/// Registers help text for the metrics the pipeline emits.
fn describe_metrics() {
    describe_counter!(
        "monitor_dispatch_total",
        Unit::Count,
        "Deposit candidates seen by the dispatcher, by source and result"
    );
    describe_counter!(
        "monitor_handler_failures_total",
        Unit::Count,
        "Deposit handler calls that returned an error"
    );
    describe_counter!(
        "monitor_poll_ticks_total",
        Unit::Count,
        "Polling ticks, started or skipped because one was still running"
    );
    describe_counter!(
        "monitor_rpc_calls_total",
        Unit::Count,
        "JSON-RPC calls to the ledger node, by method and result"
    );
    describe_counter!(
        "monitor_push_notifications_total",
        Unit::Count,
        "Frames received on the push subscription"
    );
    describe_counter!(
        "monitor_push_reconnects_total",
        Unit::Count,
        "Reconnects scheduled after the push connection was lost"
    );
    describe_counter!(
        "monitor_deposits_stored_total",
        Unit::Count,
        "Deposits written by the storing handler"
    );
    describe_gauge!(
        "monitor_push_state",
        "Push subscription state (0 down, 1 reconnect pending, 2 connecting, 3 subscribed)"
    );
    describe_gauge!(
        "monitor_ledger_entries",
        Unit::Count,
        "Signatures held by the dedup ledger"
    );
    describe_histogram!(
        "monitor_poll_batch_entries",
        Unit::Count,
        "Signatures listed per polling tick"
    );
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    InvalidLogFilter(String),
    #[error("failed to install tracing subscriber: {0}")]
    Tracing(String),
    #[error("invalid metrics address `{0}`: {1}")]
    InvalidMetricsAddress(String, String),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}
