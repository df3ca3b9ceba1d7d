use std::sync::Arc;

use async_trait::async_trait;
use claimwatch_domain::{model::TransferEvent, services::SignatureLedger};
use metrics::counter;
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Failure reported by a deposit handler. The event stays consumed.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn from_source(err: impl std::fmt::Display) -> Self {
        Self(err.to_string())
    }
}

/// External collaborator invoked once per newly observed deposit.
///
/// Calls for distinct signatures may run concurrently.
#[async_trait]
pub trait DepositHandler: Send + Sync {
    async fn handle_deposit(&self, event: &TransferEvent) -> Result<(), HandlerError>;
}

/// Which detection path produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Push,
    Poll,
}

impl CandidateSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Poll => "poll",
        }
    }
}

/// Published on the failure channel whenever a handler call fails.
#[derive(Debug, Clone)]
pub struct DispatchFailure {
    pub event: TransferEvent,
    pub error: HandlerError,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// The candidate carried no deposit.
    Ignored,
    /// Below the configured minimum deposit.
    Dust,
    /// Already dispatched through another path or an earlier delivery.
    Duplicate,
    /// The handler call runs on its own task.
    Dispatched(JoinHandle<()>),
}

impl DispatchOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Self::Dispatched(_))
    }

    /// Waits for the spawned handler call, if any.
    pub async fn settle(self) {
        if let Self::Dispatched(handle) = self {
            if let Err(err) = handle.await {
                error!(?err, "deposit handler task aborted");
            }
        }
    }
}

/// Funnels candidates from every source into the handler, at most once per
/// signature.
pub struct Dispatcher<H> {
    ledger: Arc<SignatureLedger>,
    handler: Arc<H>,
    min_deposit_lamports: u64,
    failures: broadcast::Sender<DispatchFailure>,
}

impl<H> Clone for Dispatcher<H> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            handler: Arc::clone(&self.handler),
            min_deposit_lamports: self.min_deposit_lamports,
            failures: self.failures.clone(),
        }
    }
}

impl<H> Dispatcher<H>
where
    H: DepositHandler + 'static,
{
    const FAILURE_CHANNEL_CAPACITY: usize = 64;

    pub fn new(ledger: Arc<SignatureLedger>, handler: Arc<H>, min_deposit_lamports: u64) -> Self {
        let (failures, _) = broadcast::channel(Self::FAILURE_CHANNEL_CAPACITY);
        Self {
            ledger,
            handler,
            min_deposit_lamports,
            failures,
        }
    }

    pub fn ledger(&self) -> &Arc<SignatureLedger> {
        &self.ledger
    }

    /// Subscribes to handler failures.
    pub fn failures(&self) -> broadcast::Receiver<DispatchFailure> {
        self.failures.subscribe()
    }

    /// Gates the candidate on the signature ledger and, when it is new, hands it
    /// to the handler on a separate task. Never blocks on the handler.
    pub fn on_candidate(
        &self,
        candidate: Option<TransferEvent>,
        source: CandidateSource,
    ) -> DispatchOutcome {
        let Some(event) = candidate else {
            counter!("monitor_dispatch_total", "source" => source.as_str(), "result" => "ignored")
                .increment(1);
            return DispatchOutcome::Ignored;
        };

        if event.amount < self.min_deposit_lamports {
            warn!(
                amount = event.amount,
                min_deposit_lamports = self.min_deposit_lamports,
                signature = %event.signature,
                "skipping dust deposit below minimum amount"
            );
            counter!("monitor_dispatch_total", "source" => source.as_str(), "result" => "dust")
                .increment(1);
            return DispatchOutcome::Dust;
        }

        if !self.ledger.check_and_mark(&event.signature) {
            debug!(signature = %event.signature, source = source.as_str(), "duplicate deposit");
            counter!("monitor_dispatch_total", "source" => source.as_str(), "result" => "duplicate")
                .increment(1);
            return DispatchOutcome::Duplicate;
        }

        info!(
            signature = %event.signature,
            source_address = %event.source,
            amount = event.amount,
            via = source.as_str(),
            "dispatching deposit"
        );
        counter!("monitor_dispatch_total", "source" => source.as_str(), "result" => "dispatched")
            .increment(1);

        let handler = Arc::clone(&self.handler);
        let failures = self.failures.clone();
        DispatchOutcome::Dispatched(tokio::spawn(async move {
            if let Err(err) = handler.handle_deposit(&event).await {
                error!(
                    signature = %event.signature,
                    amount = event.amount,
                    error = %err,
                    "deposit handler failed; event will not be retried"
                );
                counter!("monitor_handler_failures_total").increment(1);
                let _ = failures.send(DispatchFailure { event, error: err });
            }
        }))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingHandler;
    use super::*;
    use chrono::Utc;

    fn event(signature: &str, amount: u64) -> TransferEvent {
        TransferEvent {
            signature: signature.to_string(),
            source: "sender".to_string(),
            destination: "monitored".to_string(),
            amount,
            observed_at: Utc::now(),
        }
    }

    fn dispatcher(handler: Arc<RecordingHandler>) -> Dispatcher<RecordingHandler> {
        Dispatcher::new(Arc::new(SignatureLedger::new(16)), handler, 1)
    }

    #[tokio::test]
    async fn none_candidate_is_ignored() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = dispatcher(Arc::clone(&handler));

        let outcome = dispatcher.on_candidate(None, CandidateSource::Push);
        assert!(matches!(outcome, DispatchOutcome::Ignored));
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn repeated_signature_reaches_handler_once() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = dispatcher(Arc::clone(&handler));

        let first = dispatcher.on_candidate(Some(event("sig", 100_000_000)), CandidateSource::Push);
        assert!(first.is_dispatched());
        first.settle().await;

        let second = dispatcher.on_candidate(Some(event("sig", 100_000_000)), CandidateSource::Poll);
        assert!(matches!(second, DispatchOutcome::Duplicate));

        assert_eq!(handler.calls(), 1);
        assert_eq!(*handler.signatures.lock().unwrap(), vec!["sig".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_push_and_poll_deliveries_dispatch_once() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = dispatcher(Arc::clone(&handler));

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let dispatcher = dispatcher.clone();
                let source = if i % 2 == 0 {
                    CandidateSource::Push
                } else {
                    CandidateSource::Poll
                };
                tokio::spawn(async move {
                    dispatcher
                        .on_candidate(Some(event("shared", 5)), source)
                        .settle()
                        .await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn dust_is_not_marked() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = Dispatcher::new(
            Arc::new(SignatureLedger::new(16)),
            Arc::clone(&handler),
            1_000,
        );

        let outcome = dispatcher.on_candidate(Some(event("tiny", 999)), CandidateSource::Poll);
        assert!(matches!(outcome, DispatchOutcome::Dust));
        assert!(!dispatcher.ledger().has("tiny"));
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn handler_failure_is_surfaced_and_not_retried() {
        let handler = Arc::new(RecordingHandler::failing());
        let dispatcher = dispatcher(Arc::clone(&handler));
        let mut failures = dispatcher.failures();

        dispatcher
            .on_candidate(Some(event("boom", 10)), CandidateSource::Push)
            .settle()
            .await;

        let failure = failures.recv().await.expect("failure published");
        assert_eq!(failure.event.signature, "boom");
        assert_eq!(failure.error.to_string(), "mint rejected");

        let retry = dispatcher.on_candidate(Some(event("boom", 10)), CandidateSource::Poll);
        assert!(matches!(retry, DispatchOutcome::Duplicate));
        assert_eq!(handler.calls(), 1);
    }
}
