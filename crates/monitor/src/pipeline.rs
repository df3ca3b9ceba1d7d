//! Wires the detection sources, the dispatcher and the signature ledger into
//! one start/stop unit.

use std::{
    mem,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use claimwatch_domain::{config::MonitorConfig, model::Address, services::SignatureLedger};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    dispatcher::{DepositHandler, DispatchFailure, Dispatcher},
    poller::PollingSource,
    push::{PushSource, ReconnectSupervisor, SubscriptionState},
    rpc::LedgerRpc,
};

/// Knobs of a pipeline instance. `from_config` maps the environment-driven
/// configuration; tests build it directly.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub address: Address,
    pub ws_url: String,
    pub commitment: String,
    pub poll_interval: Duration,
    pub poll_signature_limit: usize,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    pub ledger_capacity: usize,
    pub min_deposit_lamports: u64,
    pub enable_push: bool,
    pub enable_poll: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            address: config.monitored_address().clone(),
            ws_url: config.ws_url().to_string(),
            commitment: config.commitment().to_string(),
            poll_interval: config.poll_interval(),
            poll_signature_limit: config.poll_signature_limit(),
            reconnect_delay: config.reconnect_delay(),
            ping_interval: config.ping_interval(),
            ledger_capacity: config.ledger_capacity(),
            min_deposit_lamports: config.min_deposit_lamports(),
            enable_push: config.enable_push(),
            enable_poll: config.enable_poll(),
        }
    }
}

enum Lifecycle {
    Idle(Option<ReconnectSupervisor>),
    Running(Vec<JoinHandle<()>>),
    Stopped,
}

/// The deposit-detection pipeline. The processed-signature ledger lives here,
/// so two pipelines never share dedup state.
pub struct Pipeline<R, H> {
    settings: PipelineSettings,
    rpc: Arc<R>,
    dispatcher: Dispatcher<H>,
    shutdown: watch::Sender<bool>,
    push_state: watch::Receiver<SubscriptionState>,
    lifecycle: Mutex<Lifecycle>,
}

impl<R, H> Pipeline<R, H>
where
    R: LedgerRpc + 'static,
    H: DepositHandler + 'static,
{
    pub fn new(settings: PipelineSettings, rpc: Arc<R>, handler: Arc<H>) -> Self {
        let ledger = Arc::new(SignatureLedger::new(settings.ledger_capacity));
        let dispatcher = Dispatcher::new(ledger, handler, settings.min_deposit_lamports);
        let supervisor = ReconnectSupervisor::new(settings.reconnect_delay);
        let push_state = supervisor.subscribe();
        let (shutdown, _) = watch::channel(false);

        Self {
            settings,
            rpc,
            dispatcher,
            shutdown,
            push_state,
            lifecycle: Mutex::new(Lifecycle::Idle(Some(supervisor))),
        }
    }

    pub fn ledger(&self) -> &Arc<SignatureLedger> {
        self.dispatcher.ledger()
    }

    /// Pre-marks signatures dispatched by an earlier run, newest first.
    pub fn seed_ledger(&self, signatures: Vec<String>) {
        let count = signatures.len();
        self.ledger().seed(signatures);
        info!(count, "seeded signature ledger");
    }

    /// Handler failures, for operators.
    pub fn failures(&self) -> broadcast::Receiver<DispatchFailure> {
        self.dispatcher.failures()
    }

    /// Push subscription state as published by the supervisor.
    pub fn push_state(&self) -> watch::Receiver<SubscriptionState> {
        self.push_state.clone()
    }

    /// Starts the enabled sources. Returns `false` when the pipeline already
    /// ran; a stopped pipeline is not restarted.
    pub fn start(&self) -> bool {
        let mut lifecycle = self.lock();
        let Lifecycle::Idle(supervisor) = &mut *lifecycle else {
            warn!("pipeline already started");
            return false;
        };
        let supervisor = supervisor.take();

        let mut tasks = Vec::with_capacity(2);
        if self.settings.enable_push {
            if let Some(supervisor) = supervisor {
                let source = PushSource::new(
                    self.settings.ws_url.clone(),
                    self.settings.address.clone(),
                    self.settings.commitment.clone(),
                    self.settings.ping_interval,
                    self.dispatcher.clone(),
                );
                tasks.push(tokio::spawn(
                    supervisor.run(source, self.shutdown.subscribe()),
                ));
            }
        }
        if self.settings.enable_poll {
            let poller = PollingSource::new(
                Arc::clone(&self.rpc),
                self.dispatcher.clone(),
                self.settings.address.clone(),
                self.settings.poll_signature_limit,
                self.settings.poll_interval,
            );
            tasks.push(tokio::spawn(poller.run(self.shutdown.subscribe())));
        }

        info!(
            address = %self.settings.address,
            push = self.settings.enable_push,
            poll = self.settings.enable_poll,
            "deposit pipeline started"
        );
        *lifecycle = Lifecycle::Running(tasks);
        true
    }

    /// Closes the push connection and stops both timers. Safe to call any
    /// number of times; in-flight handler calls are left to finish.
    pub async fn stop(&self) {
        let previous = mem::replace(&mut *self.lock(), Lifecycle::Stopped);
        let Lifecycle::Running(tasks) = previous else {
            return;
        };

        self.shutdown.send_replace(true);
        for task in tasks {
            if let Err(err) = task.await {
                warn!(?err, "pipeline task ended abnormally");
            }
        }
        info!("deposit pipeline stopped");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::testing::RecordingHandler;
    use crate::extractor::{fixtures::*, parse_transaction};
    use crate::push::loopback::{notification, spawn_server};
    use crate::rpc::{RawTransaction, RpcError, SignatureInfo};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Always lists the same deposits.
    #[derive(Default)]
    struct StaticRpc {
        deposits: Vec<(String, Value)>,
    }

    #[async_trait]
    impl LedgerRpc for StaticRpc {
        async fn recent_signatures(
            &self,
            _address: &Address,
            limit: usize,
        ) -> Result<Vec<SignatureInfo>, RpcError> {
            Ok(self
                .deposits
                .iter()
                .take(limit)
                .map(|(signature, _)| SignatureInfo {
                    signature: signature.clone(),
                    slot: 1,
                    err: None,
                    block_time: None,
                    confirmation_status: Some("confirmed".into()),
                })
                .collect())
        }

        async fn transaction(&self, signature: &str) -> Result<Option<RawTransaction>, RpcError> {
            Ok(self
                .deposits
                .iter()
                .find(|(candidate, _)| candidate == signature)
                .map(|(_, record)| parse_transaction(record.clone()).unwrap()))
        }
    }

    fn settings(ws_url: &str) -> PipelineSettings {
        PipelineSettings {
            address: Address::parse(MONITORED).unwrap(),
            ws_url: ws_url.to_string(),
            commitment: "confirmed".into(),
            poll_interval: Duration::from_millis(20),
            poll_signature_limit: 5,
            reconnect_delay: Duration::from_millis(50),
            ping_interval: Duration::from_secs(30),
            ledger_capacity: 16,
            min_deposit_lamports: 1,
            enable_push: true,
            enable_poll: true,
        }
    }

    async fn wait_for_calls(handler: &RecordingHandler, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.calls() < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("handler called in time");
    }

    #[tokio::test]
    async fn push_and_poll_of_same_signature_dispatch_once() {
        let record = deposit_record("sig-both", 100_000_000);
        let (url, _requests, _closes) = spawn_server(vec![notification(record.clone())]).await;
        let rpc = Arc::new(StaticRpc {
            deposits: vec![("sig-both".into(), record)],
        });
        let handler = Arc::new(RecordingHandler::default());
        let pipeline = Pipeline::new(settings(&url), Arc::clone(&rpc), Arc::clone(&handler));

        assert!(pipeline.start());
        wait_for_calls(&handler, 1).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        pipeline.stop().await;

        assert_eq!(handler.calls(), 1);
        assert!(pipeline.ledger().has("sig-both"));
    }

    #[tokio::test]
    async fn seeded_signatures_are_not_dispatched_again() {
        let rpc = Arc::new(StaticRpc {
            deposits: vec![
                ("sig-new".into(), deposit_record("sig-new", 7)),
                ("sig-old".into(), deposit_record("sig-old", 5)),
            ],
        });
        let handler = Arc::new(RecordingHandler::default());
        let mut settings = settings("ws://127.0.0.1:9");
        settings.enable_push = false;
        let pipeline = Pipeline::new(settings, rpc, Arc::clone(&handler));
        pipeline.seed_ledger(vec!["sig-old".to_string()]);

        pipeline.start();
        wait_for_calls(&handler, 1).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        pipeline.stop().await;

        assert_eq!(*handler.signatures.lock().unwrap(), vec!["sig-new".to_string()]);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let never_started = Pipeline::new(
            settings("ws://127.0.0.1:9"),
            Arc::new(StaticRpc::default()),
            Arc::new(RecordingHandler::default()),
        );
        never_started.stop().await;
        assert!(!never_started.start());
        assert_eq!(
            *never_started.push_state().borrow(),
            SubscriptionState::Disconnected
        );

        let pipeline = Pipeline::new(
            settings("ws://127.0.0.1:9"),
            Arc::new(StaticRpc::default()),
            Arc::new(RecordingHandler::default()),
        );
        let mut push_state = pipeline.push_state();
        assert!(pipeline.start());
        assert!(!pipeline.start());
        push_state.changed().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), pipeline.stop())
            .await
            .expect("stop completes");
        pipeline.stop().await;
        assert_eq!(*push_state.borrow_and_update(), SubscriptionState::Stopped);
    }

    #[tokio::test]
    async fn stop_leaves_running_handler_calls_alone() {
        struct SlowHandler(AtomicUsize);

        #[async_trait]
        impl DepositHandler for SlowHandler {
            async fn handle_deposit(
                &self,
                _event: &claimwatch_domain::model::TransferEvent,
            ) -> Result<(), crate::dispatcher::HandlerError> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let rpc = Arc::new(StaticRpc {
            deposits: vec![("sig-slow".into(), deposit_record("sig-slow", 9))],
        });
        let handler = Arc::new(SlowHandler(AtomicUsize::new(0)));
        let mut settings = settings("ws://127.0.0.1:9");
        settings.enable_push = false;
        let pipeline = Pipeline::new(settings, Arc::clone(&rpc), Arc::clone(&handler));

        pipeline.start();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !pipeline.ledger().has("sig-slow") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        pipeline.stop().await;
        assert_eq!(handler.0.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
    }
}
