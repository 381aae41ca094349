use crate::dispatch::{Callback, Diagnostics};
use crate::error::DispatchError;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Thread-safe FIFO of pending callback invocations.
///
/// Producers (transport delivery threads, timer polling) append closures with
/// [`push`](Self::push); consumers invoke them on their own thread through the
/// drain/wait methods. A closure's error or panic is caught here and reported
/// to the queue's [`Diagnostics`]; it never reaches the consumer and never
/// prevents the closures behind it from running.
pub struct CallbackQueue {
    pending: Mutex<VecDeque<Callback>>,
    ready: Condvar,
    diagnostics: Arc<Diagnostics>,
}

impl CallbackQueue {
    pub fn new(diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            diagnostics,
        }
    }

    #[inline]
    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    /// Append a closure. Safe from any thread; wakes one waiting consumer.
    pub fn push(&self, callback: Callback) {
        self.pending.lock().push_back(callback);
        self.ready.notify_one();
    }

    /// Append an infallible closure.
    pub fn push_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Box::new(move || {
            f();
            Ok(())
        }));
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Invoke every closure present at the moment of the call, in FIFO order.
    /// Never blocks on an empty queue. Closures pushed while draining wait for
    /// the next call.
    pub fn drain_available(&self) -> usize {
        let batch = mem::take(&mut *self.pending.lock());
        let count = batch.len();
        for callback in batch {
            self.invoke(callback);
        }
        count
    }

    /// Invoke the front closure if there is one.
    pub fn try_drain_one(&self) -> bool {
        let next = self.pending.lock().pop_front();
        match next {
            Some(callback) => {
                self.invoke(callback);
                true
            }
            None => false,
        }
    }

    /// Block until a closure is present, then invoke exactly one.
    ///
    /// Returns false without invoking anything once `stop` reports true.
    /// `stop` is evaluated before each wait and at least every `poll`;
    /// [`wake`](Self::wake) re-evaluates it immediately.
    pub fn wait_and_drain_one(&self, stop: &dyn Fn() -> bool, poll: Duration) -> bool {
        self.wait_one(stop, poll, None)
    }

    /// Like [`wait_and_drain_one`](Self::wait_and_drain_one) but gives up after `timeout`.
    pub fn wait_and_drain_one_timeout(&self, timeout: Duration, stop: &dyn Fn() -> bool) -> bool {
        self.wait_one(stop, timeout, Some(Instant::now() + timeout))
    }

    /// Wake every blocked consumer so it re-checks its stop condition.
    pub fn wake(&self) {
        // Taking the lock orders this notification after any waiter's stop check.
        let _guard = self.pending.lock();
        self.ready.notify_all();
    }

    /// Drop every pending closure without invoking it. Teardown only.
    pub fn clear(&self) -> usize {
        let dropped = mem::take(&mut *self.pending.lock());
        dropped.len()
    }

    fn wait_one(&self, stop: &dyn Fn() -> bool, poll: Duration, deadline: Option<Instant>) -> bool {
        let poll = poll.max(Duration::from_micros(1));
        let mut pending = self.pending.lock();
        loop {
            if let Some(callback) = pending.pop_front() {
                drop(pending);
                self.invoke(callback);
                return true;
            }
            if stop() {
                return false;
            }
            let wait = match deadline {
                None => poll,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return false;
                    }
                    left.min(poll)
                }
            };
            self.ready.wait_for(&mut pending, wait);
        }
    }

    fn invoke(&self, callback: Callback) {
        match panic::catch_unwind(AssertUnwindSafe(callback)) {
            Ok(Ok(())) => self.diagnostics.record_success(),
            Ok(Err(err)) => self.diagnostics.record_invocation(err),
            Err(payload) => self
                .diagnostics
                .record_invocation(DispatchError::Panicked(panic_message(payload))),
        }
    }
}

impl fmt::Debug for CallbackQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("pending", &self.len())
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic (unknown type)".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchResult;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    fn queue() -> Arc<CallbackQueue> {
        Arc::new(CallbackQueue::new(Diagnostics::new("queue-test")))
    }

    #[test]
    fn drain_available_is_fifo() {
        let q = queue();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = seen.clone();
            q.push_fn(move || seen.lock().push(i));
        }

        assert_eq!(q.drain_available(), 100);
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
        assert!(q.is_empty());
    }

    #[test]
    fn drain_on_empty_queue_returns_immediately() {
        let q = queue();
        let start = Instant::now();
        assert_eq!(q.drain_available(), 0);
        assert!(!q.try_drain_one());
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[test]
    fn closures_pushed_while_draining_wait_for_next_drain() {
        let q = queue();
        let inner = q.clone();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        q.push_fn(move || {
            let ran3 = ran2.clone();
            inner.push_fn(move || {
                ran3.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert_eq!(q.drain_available(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(q.drain_available(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_closures_do_not_stop_the_drain() {
        let q = queue();
        let ran = Arc::new(AtomicUsize::new(0));
        let failures = q.diagnostics().subscribe(8);

        let r = ran.clone();
        q.push_fn(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        q.push(Box::new(|| -> DispatchResult {
            Err(DispatchError::Callback(anyhow::anyhow!("bad input")))
        }));
        q.push_fn(|| panic!("callback exploded"));
        let r = ran.clone();
        q.push_fn(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(q.drain_available(), 4);
        assert_eq!(ran.load(Ordering::SeqCst), 2);

        let snap = q.diagnostics().snapshot();
        assert_eq!(snap.invoked, 4);
        assert_eq!(snap.failed, 2);

        let first = failures.try_recv().unwrap();
        assert!(matches!(*first.error, DispatchError::Callback(_)));
        let second = failures.try_recv().unwrap();
        assert!(matches!(*second.error, DispatchError::Panicked(ref m) if m == "callback exploded"));
    }

    #[test]
    fn wait_and_drain_one_blocks_until_push() {
        let q = queue();
        let ran = Arc::new(AtomicBool::new(false));
        let producer = {
            let q = q.clone();
            let ran = ran.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.push_fn(move || ran.store(true, Ordering::SeqCst));
            })
        };

        assert!(q.wait_and_drain_one(&|| false, Duration::from_secs(5)));
        assert!(ran.load(Ordering::SeqCst));
        producer.join().unwrap();
    }

    #[test]
    fn wait_and_drain_one_returns_on_stop() {
        let q = queue();
        let stop = Arc::new(AtomicBool::new(false));
        let waiter = {
            let q = q.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                q.wait_and_drain_one(&|| stop.load(Ordering::SeqCst), Duration::from_secs(10))
            })
        };

        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        stop.store(true, Ordering::SeqCst);
        q.wake();
        assert!(!waiter.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_with_timeout_gives_up() {
        let q = queue();
        let start = Instant::now();
        assert!(!q.wait_and_drain_one_timeout(Duration::from_millis(10), &|| false));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn clear_drops_without_invoking() {
        let q = queue();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let r = ran.clone();
            q.push_fn(move || {
                r.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(q.clear(), 3);
        assert_eq!(q.drain_available(), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(q.diagnostics().invoked(), 0);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let q = queue();
        let count = Arc::new(AtomicUsize::new(0));
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let q = q.clone();
                let count = count.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        let c = count.clone();
                        q.push_fn(move || {
                            c.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let mut drained = 0;
        while drained < 1000 {
            drained += q.drain_available();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1000);
    }
}
