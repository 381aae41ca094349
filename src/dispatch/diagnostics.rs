use crate::error::{DispatchError, SendFailReason};
use crate::io::mpmc::{MpmcChannel, MpmcReceiver, MpmcSender};
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// A dispatch failure as seen by listeners.
#[derive(Debug)]
pub struct DispatchFailure {
    /// Owner of the queue that ran the closure (node id).
    pub source: Arc<str>,
    pub error: Arc<DispatchError>,
    pub at: SystemTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub invoked: u64,
    pub failed: u64,
    pub consistency_violations: u64,
}

/// Sink for dispatch outcomes of one callback queue.
///
/// Every failure is logged, counted and forwarded to subscribed listeners.
/// Listeners are bounded channels; a full listener loses the record, a
/// disconnected one is dropped.
pub struct Diagnostics {
    source: Arc<str>,
    invoked: CachePadded<AtomicU64>,
    failed: AtomicU64,
    consistency_violations: AtomicU64,
    listeners: Mutex<Vec<MpmcSender<DispatchFailure>>>,
}

impl Diagnostics {
    pub fn new(source: impl Into<Arc<str>>) -> Arc<Self> {
        Arc::new(Self {
            source: source.into(),
            invoked: CachePadded::new(AtomicU64::new(0)),
            failed: AtomicU64::new(0),
            consistency_violations: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Attach a listener that receives every future failure.
    pub fn subscribe(&self, capacity: usize) -> MpmcReceiver<DispatchFailure> {
        let (tx, rx) = MpmcChannel::bounded(capacity.max(1));
        self.listeners.lock().push(tx);
        rx
    }

    #[inline]
    pub(crate) fn record_success(&self) {
        self.invoked.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one invoked closure.
    pub(crate) fn record_invocation(&self, error: DispatchError) {
        self.invoked.fetch_add(1, Ordering::Relaxed);
        self.report(error);
    }

    /// Record a failure that happened outside a closure (e.g. on the delivery path).
    pub(crate) fn report(&self, error: DispatchError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if error.is_consistency_violation() {
            self.consistency_violations.fetch_add(1, Ordering::Relaxed);
            tracing::error!("[Diagnostics] {}: internal error: {}", self.source, error);
        } else {
            tracing::error!("[Diagnostics] {}: {}", self.source, error);
        }

        let mut listeners = self.listeners.lock();
        if listeners.is_empty() {
            return;
        }

        let error = Arc::new(error);
        let at = SystemTime::now();
        listeners.retain(|tx| {
            let record = DispatchFailure {
                source: Arc::clone(&self.source),
                error: Arc::clone(&error),
                at,
            };
            match tx.try_send(record) {
                Ok(()) => true,
                Err(e) => e.reason != SendFailReason::Closed,
            }
        });
    }

    pub fn invoked(&self) -> u64 {
        self.invoked.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            invoked: self.invoked(),
            failed: self.failed(),
            consistency_violations: self.consistency_violations.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("source", &self.source)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
