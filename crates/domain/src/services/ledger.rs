use std::{
    num::NonZeroUsize,
    sync::{Mutex, MutexGuard, PoisonError},
};

use lru::LruCache;
use metrics::gauge;

/// Bounded record of transaction signatures that were already dispatched.
///
/// Both detection sources race to report the same transaction, so this is the
/// exactly-once gate: [`SignatureLedger::check_and_mark`] returns `true` for
/// exactly one caller per retained signature. The lock covers the membership
/// test and insert only.
///
/// Entries are never read through the recency-updating API, so the LRU order
/// of the backing cache is insertion order and the oldest-inserted signature
/// is evicted first once capacity is exceeded.
#[derive(Debug)]
pub struct SignatureLedger {
    inner: Mutex<LruCache<String, ()>>,
}

impl SignatureLedger {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns `true` if the signature was already dispatched.
    pub fn has(&self, signature: &str) -> bool {
        self.lock().contains(signature)
    }

    /// Records the signature as dispatched.
    pub fn mark_processed(&self, signature: &str) {
        let mut guard = self.lock();
        if !guard.contains(signature) {
            guard.push(signature.to_owned(), ());
        }
        gauge!("monitor_ledger_entries").set(guard.len() as f64);
    }

    /// Atomically tests and records the signature. Returns `true` only for the
    /// caller that inserted it.
    pub fn check_and_mark(&self, signature: &str) -> bool {
        let mut guard = self.lock();
        if guard.contains(signature) {
            return false;
        }
        guard.push(signature.to_owned(), ());
        gauge!("monitor_ledger_entries").set(guard.len() as f64);
        true
    }

    /// Preloads signatures handled by a previous run. Input is expected newest
    /// first, so it is inserted oldest first to keep eviction order intact.
    pub fn seed<I>(&self, signatures: I)
    where
        I: IntoIterator<Item = String>,
        I::IntoIter: DoubleEndedIterator,
    {
        let mut guard = self.lock();
        for signature in signatures.into_iter().rev() {
            if !guard.contains(&signature) {
                guard.push(signature, ());
            }
        }
        gauge!("monitor_ledger_entries").set(guard.len() as f64);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, ()>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SignatureLedger {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
