//! Polling fallback: rediscovers deposits the push subscription missed.

use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use claimwatch_domain::model::Address;
use lru::LruCache;
use metrics::{counter, histogram};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    dispatcher::{CandidateSource, DepositHandler, DispatchOutcome, Dispatcher},
    extractor::extract,
    rpc::LedgerRpc,
};

/// Counts for one completed polling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub listed: usize,
    pub fetched: usize,
    pub dispatched: usize,
    pub fetch_errors: usize,
    /// Listed signatures skipped because an earlier pass found nothing to
    /// dispatch in them.
    pub already_inspected: usize,
}

/// Signatures whose transaction was fetched and carried no dispatchable
/// deposit. A confirmed transaction does not change, so later passes skip
/// them instead of fetching them again. Not shared with the push path.
pub struct InspectedSignatures {
    inner: Mutex<LruCache<String, ()>>,
}

impl InspectedSignatures {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.lock().contains(signature)
    }

    fn insert(&self, signature: &str) {
        self.lock().put(signature.to_owned(), ());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, ()>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub enum TickOutcome {
    Started(JoinHandle<TickReport>),
    /// The previous tick was still running.
    Skipped,
}

/// Held by a running tick; releases the in-flight flag on drop, including
/// when the tick task is aborted.
struct TickGuard(Arc<AtomicBool>);

impl TickGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PollingSource<R, H> {
    rpc: Arc<R>,
    dispatcher: Dispatcher<H>,
    address: Address,
    signature_limit: usize,
    interval: Duration,
    in_flight: Arc<AtomicBool>,
    inspected: Arc<InspectedSignatures>,
}

impl<R, H> PollingSource<R, H>
where
    R: LedgerRpc + 'static,
    H: DepositHandler + 'static,
{
    const MIN_INTERVAL: Duration = Duration::from_millis(1);

    pub fn new(
        rpc: Arc<R>,
        dispatcher: Dispatcher<H>,
        address: Address,
        signature_limit: usize,
        interval: Duration,
    ) -> Self {
        let signature_limit = signature_limit.max(1);
        Self {
            rpc,
            dispatcher,
            address,
            signature_limit,
            interval: interval.max(Self::MIN_INTERVAL),
            in_flight: Arc::new(AtomicBool::new(false)),
            inspected: Arc::new(InspectedSignatures::new(signature_limit * 2)),
        }
    }

    /// Starts a polling pass on its own task unless one is still running.
    pub fn try_tick(&self) -> TickOutcome {
        let Some(guard) = TickGuard::acquire(&self.in_flight) else {
            debug!("previous poll still running; skipping tick");
            counter!("monitor_poll_ticks_total", "result" => "skipped").increment(1);
            return TickOutcome::Skipped;
        };

        counter!("monitor_poll_ticks_total", "result" => "started").increment(1);
        let rpc = Arc::clone(&self.rpc);
        let dispatcher = self.dispatcher.clone();
        let inspected = Arc::clone(&self.inspected);
        let address = self.address.clone();
        let limit = self.signature_limit;
        TickOutcome::Started(tokio::spawn(async move {
            let _guard = guard;
            poll_once(rpc.as_ref(), &dispatcher, &inspected, &address, limit).await
        }))
    }

    /// Fires a tick every interval until `shutdown` flips to `true`; aborts
    /// the tick in flight on the way out.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            address = %self.address,
            interval_ms = self.interval.as_millis() as u64,
            limit = self.signature_limit,
            "polling source started"
        );
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut current: Option<JoinHandle<TickReport>> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let TickOutcome::Started(handle) = self.try_tick() {
                        current = Some(handle);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(handle) = current {
            handle.abort();
        }
        info!("polling source stopped");
    }
}

/// One pass over the most recent signatures of `address`.
///
/// Per-signature failures are logged and skipped; the signature is retried on
/// the next pass while it stays in the recent window. Fetched transactions
/// that yield no dispatch are remembered in `inspected`.
pub async fn poll_once<R, H>(
    rpc: &R,
    dispatcher: &Dispatcher<H>,
    inspected: &InspectedSignatures,
    address: &Address,
    limit: usize,
) -> TickReport
where
    R: LedgerRpc + ?Sized,
    H: DepositHandler + 'static,
{
    let mut report = TickReport::default();

    let signatures = match rpc.recent_signatures(address, limit).await {
        Ok(signatures) => signatures,
        Err(err) => {
            warn!(%err, "listing recent signatures failed");
            return report;
        }
    };
    report.listed = signatures.len();
    histogram!("monitor_poll_batch_entries").record(signatures.len() as f64);

    for info in signatures.iter().take(limit) {
        if info.failed() || dispatcher.ledger().has(&info.signature) {
            continue;
        }
        if inspected.contains(&info.signature) {
            report.already_inspected += 1;
            continue;
        }

        let raw = match rpc.transaction(&info.signature).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(signature = %info.signature, "transaction not yet available");
                continue;
            }
            Err(err) => {
                warn!(signature = %info.signature, %err, "fetching transaction failed");
                report.fetch_errors += 1;
                continue;
            }
        };
        report.fetched += 1;

        match dispatcher.on_candidate(extract(&raw, address), CandidateSource::Poll) {
            DispatchOutcome::Dispatched(_) => report.dispatched += 1,
            DispatchOutcome::Ignored | DispatchOutcome::Dust => inspected.insert(&info.signature),
            DispatchOutcome::Duplicate => {}
        }
    }

    report
}
