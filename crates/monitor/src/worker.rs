use std::{future::Future, io, sync::Arc};

use thiserror::Error;
use tokio::{signal, sync::broadcast::error::RecvError};
use tracing::{error, info, warn};

use claimwatch_domain::{
    config::{ConfigError, MonitorConfig},
    services::telemetry::TelemetryError,
    storage::{DepositStore, StorageError},
};

use crate::{
    dispatcher::DepositHandler,
    handler::StoringDepositHandler,
    pipeline::{Pipeline, PipelineSettings},
    rpc::{HttpLedgerRpc, LedgerRpc, RpcError},
};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("rpc client error: {0}")]
    Rpc(#[from] RpcError),
    #[error("signal error: {0}")]
    Signal(#[from] io::Error),
}

/// Pipeline wired to the HTTP RPC endpoint and a storing handler.
pub type StoringPipeline<S> = Pipeline<HttpLedgerRpc, StoringDepositHandler<S>>;

/// Builds the pipeline and pre-marks the signatures the store already holds so
/// a restart does not hand them to the handler again.
pub async fn build_pipeline<S>(
    config: &MonitorConfig,
    storage: Arc<S>,
) -> Result<StoringPipeline<S>, MonitorError>
where
    S: DepositStore + 'static,
{
    let rpc = Arc::new(HttpLedgerRpc::new(
        config.rpc_url(),
        config.commitment(),
        config.rpc_timeout(),
    )?);
    let handler = Arc::new(StoringDepositHandler::new(Arc::clone(&storage)));
    let pipeline = Pipeline::new(PipelineSettings::from_config(config), rpc, handler);
    seed_from_store(&pipeline, storage.as_ref()).await?;
    Ok(pipeline)
}

pub async fn seed_from_store<R, H, S>(
    pipeline: &Pipeline<R, H>,
    store: &S,
) -> Result<usize, StorageError>
where
    R: LedgerRpc + 'static,
    H: DepositHandler + 'static,
    S: DepositStore + ?Sized,
{
    let limit = pipeline.ledger().capacity() as u64;
    let signatures = store.recent_signatures(limit).await?;
    let count = signatures.len();
    pipeline.seed_ledger(signatures);
    Ok(count)
}

/// Runs the monitor until Ctrl-C.
pub async fn run_monitor<S>(config: MonitorConfig, storage: Arc<S>) -> Result<(), MonitorError>
where
    S: DepositStore + 'static,
{
    run_until(config, storage, signal::ctrl_c()).await
}

/// Runs the monitor until `shutdown` resolves, then stops the pipeline.
pub async fn run_until<S, F>(
    config: MonitorConfig,
    storage: Arc<S>,
    shutdown: F,
) -> Result<(), MonitorError>
where
    S: DepositStore + 'static,
    F: Future<Output = io::Result<()>>,
{
    let pipeline = build_pipeline(&config, storage).await?;
    serve(&pipeline, shutdown).await
}

/// Starts `pipeline`, reports handler failures until `shutdown` resolves,
/// then stops it.
async fn serve<R, H, F>(pipeline: &Pipeline<R, H>, shutdown: F) -> Result<(), MonitorError>
where
    R: LedgerRpc + 'static,
    H: DepositHandler + 'static,
    F: Future<Output = io::Result<()>>,
{
    let mut failures = pipeline.failures();
    pipeline.start();

    let reporter = tokio::spawn(async move {
        loop {
            match failures.recv().await {
                Ok(failure) => error!(
                    signature = %failure.event.signature,
                    amount = failure.event.amount,
                    error = %failure.error,
                    "deposit requires manual attention"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "handler failure reports dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let result = shutdown.await;
    info!("shutdown requested");
    pipeline.stop().await;
    reporter.abort();
    result.map_err(MonitorError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::testing::RecordingHandler;
    use crate::extractor::fixtures::MONITORED;
    use async_trait::async_trait;
    use claimwatch_domain::model::{Address, DepositRecord, NewDeposit};
    use crate::push::SubscriptionState;
    use claimwatch_domain::storage::StorageResult;
    use std::env;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct HistoryStore {
        requested_limit: AtomicU64,
        fail: bool,
    }

    #[async_trait]
    impl DepositStore for HistoryStore {
        async fn insert_deposit(&self, _deposit: NewDeposit) -> StorageResult<bool> {
            Ok(true)
        }

        async fn find_deposit(&self, _signature: &str) -> StorageResult<Option<DepositRecord>> {
            Ok(None)
        }

        async fn recent_signatures(&self, limit: u64) -> StorageResult<Vec<String>> {
            self.requested_limit.store(limit, Ordering::SeqCst);
            if self.fail {
                return Err(StorageError::Database("locked".into()));
            }
            Ok(vec!["newest".into(), "older".into(), "oldest".into()])
        }
    }

    fn pipeline() -> Pipeline<HttpLedgerRpc, RecordingHandler> {
        let settings = PipelineSettings {
            address: Address::parse(MONITORED).unwrap(),
            ws_url: "ws://127.0.0.1:9".into(),
            commitment: "confirmed".into(),
            poll_interval: Duration::from_secs(5),
            poll_signature_limit: 5,
            reconnect_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            ledger_capacity: 2,
            min_deposit_lamports: 1,
            enable_push: true,
            enable_poll: true,
        };
        Pipeline::new(
            settings,
            Arc::new(
                HttpLedgerRpc::new("http://127.0.0.1:9", "confirmed", Duration::from_secs(1))
                    .unwrap(),
            ),
            Arc::new(RecordingHandler::default()),
        )
    }

    #[tokio::test]
    async fn seeds_ledger_with_newest_signatures_up_to_capacity() {
        let pipeline = pipeline();
        let store = HistoryStore::default();

        let seeded = seed_from_store(&pipeline, &store).await.unwrap();

        assert_eq!(seeded, 3);
        assert_eq!(store.requested_limit.load(Ordering::SeqCst), 2);
        assert!(pipeline.ledger().has("newest"));
        assert!(pipeline.ledger().has("older"));
        assert!(!pipeline.ledger().has("oldest"));
    }

    #[tokio::test]
    async fn seeding_propagates_storage_errors() {
        let pipeline = pipeline();
        let store = HistoryStore {
            fail: true,
            ..HistoryStore::default()
        };

        let err = seed_from_store(&pipeline, &store).await.unwrap_err();
        assert_eq!(err, StorageError::Database("locked".into()));
        assert!(pipeline.ledger().is_empty());
    }

    #[tokio::test]
    async fn serve_stops_the_pipeline_once_shutdown_resolves() {
        let pipeline = pipeline();

        tokio::time::timeout(Duration::from_secs(5), serve(&pipeline, async { Ok(()) }))
            .await
            .expect("serve returns")
            .unwrap();

        assert_eq!(*pipeline.push_state().borrow(), SubscriptionState::Stopped);
        assert!(!pipeline.start());
    }

    #[tokio::test]
    async fn serve_reports_a_failed_shutdown_signal() {
        let pipeline = pipeline();
        let signal = async { Err(io::Error::new(io::ErrorKind::Other, "no signal handler")) };

        let err = serve(&pipeline, signal).await.unwrap_err();
        assert!(matches!(err, MonitorError::Signal(_)));
        assert!(!pipeline.start());
    }

    #[tokio::test]
    async fn run_until_seeds_from_the_store_and_returns_on_shutdown() {
        env::set_var("CLAIMWATCH_SKIP_DOTENV", "1");
        env::set_var("MONITORED_ADDRESS", MONITORED);
        env::set_var("SOLANA_RPC_URL", "http://127.0.0.1:9");
        env::set_var("SOLANA_WS_URL", "ws://127.0.0.1:9");
        env::set_var("DATABASE_URL", "sqlite::memory:");
        env::set_var("MONITOR_LEDGER_CAPACITY", "16");
        let config = MonitorConfig::load_from_env().unwrap();
        let store = Arc::new(HistoryStore::default());

        tokio::time::timeout(
            Duration::from_secs(5),
            run_until(config, Arc::clone(&store), async { Ok(()) }),
        )
        .await
        .expect("monitor returns once shutdown resolves")
        .unwrap();

        assert_eq!(store.requested_limit.load(Ordering::SeqCst), 16);
    }
}
