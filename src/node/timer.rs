use crate::dispatch::{CallbackOutput, CallbackQueue};
use crate::error::DispatchResult;
use crate::utils::Rate;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

type TimerCallback = Box<dyn FnMut() -> DispatchResult + Send + 'static>;

/// Periodic callback driven by its node's spin logic.
///
/// A due timer queues one invocation on the node's callback queue. Ticks that
/// pass while an invocation is still queued, or while nobody spins the node,
/// collapse into that single invocation.
pub struct Timer {
    rate: Mutex<Rate>,
    callback: Mutex<TimerCallback>,
    cancelled: AtomicBool,
    queued: AtomicBool,
    fire_count: AtomicU64,
}

impl Timer {
    pub(crate) fn new<F, R>(period: Duration, mut callback: F) -> Self
    where
        F: FnMut() -> R + Send + 'static,
        R: CallbackOutput,
    {
        let callback: TimerCallback = Box::new(move || callback().into_dispatch());
        Self {
            rate: Mutex::new(Rate::new(period)),
            callback: Mutex::new(callback),
            cancelled: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            fire_count: AtomicU64::new(0),
        }
    }

    pub fn period(&self) -> Duration {
        self.rate.lock().period()
    }

    /// Stop firing. Already queued invocations are skipped.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Restart the period from now and resume if cancelled.
    pub fn reset(&self) {
        self.rate.lock().reset();
        self.cancelled.store(false, Ordering::Release);
    }

    /// How many times the callback actually ran.
    pub fn fire_count(&self) -> u64 {
        self.fire_count.load(Ordering::Relaxed)
    }

    /// Time until the next tick; `None` while cancelled.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        if self.is_cancelled() {
            return None;
        }
        Some(self.rate.lock().remaining(now))
    }

    /// Queue an invocation if a tick is due. Returns the time until the next tick.
    pub(crate) fn poll(self: &Arc<Self>, now: Instant, queue: &CallbackQueue) -> Option<Duration> {
        if self.is_cancelled() {
            return None;
        }
        let mut rate = self.rate.lock();
        if rate.try_tick(now) && !self.queued.swap(true, Ordering::AcqRel) {
            let weak = Arc::downgrade(self);
            queue.push(Box::new(move || match weak.upgrade() {
                Some(timer) => timer.fire(),
                None => Ok(()),
            }));
        }
        Some(rate.remaining(now))
    }

    fn fire(&self) -> DispatchResult {
        self.queued.store(false, Ordering::Release);
        if self.is_cancelled() {
            return Ok(());
        }
        self.fire_count.fetch_add(1, Ordering::Relaxed);
        let mut callback = self.callback.lock();
        (*callback)()
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("period", &self.period())
            .field("cancelled", &self.is_cancelled())
            .field("fire_count", &self.fire_count())
            .finish()
    }
}
