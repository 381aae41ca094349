use crate::config::BufferPolicy;
use crate::dispatch::{CallbackOutput, CallbackQueue};
use crate::error::{DispatchError, DispatchResult};
use crate::transport::{AnyMessage, Message, MessageSink, MessageType, SinkId, Transport};
use crate::warn_throttled;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

type MessageCallback<T> = Box<dyn FnMut(&T) -> DispatchResult + Send + 'static>;

/// Result of offering one message to the buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Admission {
    /// Appended; one more dispatch closure is needed.
    Queued,
    /// Appended after evicting the oldest; the evicted message's closure serves it.
    Replaced,
    Rejected,
}

pub(crate) struct SubscriptionShared<T: Message> {
    topic: String,
    message_type: MessageType,
    policy: BufferPolicy,
    buffer: Mutex<VecDeque<T>>,
    callback: Mutex<MessageCallback<T>>,
    queue: Weak<CallbackQueue>,
    publisher_count: AtomicI32,
    received: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl<T: Message> SubscriptionShared<T> {
    fn admit(&self, message: T) -> Admission {
        let mut buffer = self.buffer.lock();
        match self.policy {
            BufferPolicy::Unbounded => {
                buffer.push_back(message);
                Admission::Queued
            }
            BufferPolicy::DropOldest { .. } | BufferPolicy::DropNewest { .. } => {
                let capacity = self.policy.capacity().unwrap_or(usize::MAX);
                if buffer.len() < capacity {
                    buffer.push_back(message);
                    Admission::Queued
                } else if matches!(self.policy, BufferPolicy::DropOldest { .. }) {
                    buffer.pop_front();
                    buffer.push_back(message);
                    Admission::Replaced
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Hand the front message to the callback. Runs on the consumer thread.
    fn dispatch(&self) -> DispatchResult {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut callback = self.callback.lock();
        let Some(message) = self.buffer.lock().pop_front() else {
            return Err(DispatchError::EmptyBuffer {
                topic: self.topic.clone(),
            });
        };
        (*callback)(&message)
    }
}

/// Transport-facing half of a subscription.
pub(crate) struct SubscriptionSink<T: Message> {
    shared: Arc<SubscriptionShared<T>>,
}

impl<T: Message> MessageSink for SubscriptionSink<T> {
    fn on_message(&self, message: AnyMessage) {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(queue) = shared.queue.upgrade() else {
            return;
        };
        let Some(message) = message.downcast_ref::<T>() else {
            queue.diagnostics().report(DispatchError::UnexpectedPayload {
                topic: shared.topic.clone(),
                expected: shared.message_type.rust_name(),
            });
            return;
        };

        shared.received.fetch_add(1, Ordering::Relaxed);
        match shared.admit(message.clone()) {
            Admission::Queued => {
                let weak = Arc::downgrade(shared);
                queue.push(Box::new(move || match weak.upgrade() {
                    Some(shared) => shared.dispatch(),
                    None => Ok(()),
                }));
            }
            Admission::Replaced | Admission::Rejected => {
                shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn_throttled!(
                    Duration::from_secs(1),
                    "[Subscription] '{}' buffer full ({:?}), message dropped",
                    shared.topic,
                    shared.policy
                );
            }
        }
    }

    fn on_matched(&self, current_count: i32) {
        self.shared
            .publisher_count
            .store(current_count, Ordering::Relaxed);
        tracing::debug!(
            "[Subscription] '{}' matched publishers: {}",
            self.shared.topic,
            current_count
        );
    }
}

/// Message subscription owned by a [`Node`](super::Node).
///
/// Each delivered message is copied into the subscription's buffer and one
/// dispatch closure is queued on the node; the closure pops the front message
/// and runs the callback on whichever thread spins the node. Callbacks of one
/// subscription never run concurrently.
pub struct Subscription<T: Message> {
    shared: Arc<SubscriptionShared<T>>,
    sink_id: SinkId,
    transport: Arc<dyn Transport>,
}

impl<T: Message> Subscription<T> {
    /// Build the shared state and the sink to hand to the transport.
    pub(crate) fn prepare<F, R>(
        topic: String,
        message_type: MessageType,
        policy: BufferPolicy,
        queue: &Arc<CallbackQueue>,
        mut callback: F,
    ) -> (Arc<SubscriptionShared<T>>, Arc<SubscriptionSink<T>>)
    where
        F: FnMut(&T) -> R + Send + 'static,
        R: CallbackOutput,
    {
        let callback: MessageCallback<T> =
            Box::new(move |message: &T| callback(message).into_dispatch());
        let shared = Arc::new(SubscriptionShared {
            topic,
            message_type,
            policy,
            buffer: Mutex::new(VecDeque::new()),
            callback: Mutex::new(callback),
            queue: Arc::downgrade(queue),
            publisher_count: AtomicI32::new(0),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let sink = Arc::new(SubscriptionSink {
            shared: shared.clone(),
        });
        (shared, sink)
    }

    pub(crate) fn new(
        shared: Arc<SubscriptionShared<T>>,
        sink_id: SinkId,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            shared,
            sink_id,
            transport,
        }
    }

    /// Fully qualified topic name, prefix included.
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    pub fn message_type(&self) -> &MessageType {
        &self.shared.message_type
    }

    pub fn buffer_policy(&self) -> BufferPolicy {
        self.shared.policy
    }

    /// Last matched-publisher count reported by the transport.
    pub fn get_publisher_count(&self) -> i32 {
        self.shared.publisher_count.load(Ordering::Relaxed)
    }

    /// Messages waiting for their callback.
    pub fn buffered(&self) -> usize {
        self.shared.buffer.lock().len()
    }

    pub fn received(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }

    /// Messages discarded by the buffer policy.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl<T: Message> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Message> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.shared.topic)
            .field("message_type", &self.shared.message_type)
            .field("buffered", &self.buffered())
            .finish()
    }
}

/// Type-erased view used by the node and the handle API.
pub trait AnySubscription: Send + Sync + 'static {
    fn topic(&self) -> &str;

    fn get_publisher_count(&self) -> i32;

    /// Messages delivered but not yet dispatched.
    fn buffered(&self) -> usize;

    fn received(&self) -> u64;

    fn dropped(&self) -> u64;

    /// Detach from the transport; pending dispatches become no-ops. Idempotent.
    fn close(&self);
}

impl<T: Message> AnySubscription for Subscription<T> {
    fn topic(&self) -> &str {
        Subscription::topic(self)
    }

    fn get_publisher_count(&self) -> i32 {
        Subscription::get_publisher_count(self)
    }

    fn buffered(&self) -> usize {
        Subscription::buffered(self)
    }

    fn received(&self) -> u64 {
        Subscription::received(self)
    }

    fn dropped(&self) -> u64 {
        Subscription::dropped(self)
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.unregister_sink(self.sink_id);
        self.shared.buffer.lock().clear();
        tracing::debug!("[Subscription] '{}' closed", self.shared.topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Diagnostics;
    use crate::transport::LoopbackTransport;

    #[derive(Clone, Debug, PartialEq)]
    struct Sample(u32);

    fn setup(
        policy: BufferPolicy,
    ) -> (
        Arc<CallbackQueue>,
        Arc<SubscriptionSink<Sample>>,
        Arc<Mutex<Vec<u32>>>,
    ) {
        let queue = Arc::new(CallbackQueue::new(Diagnostics::new("sub-test")));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let out = seen.clone();
        let (_shared, sink) = Subscription::<Sample>::prepare(
            "rt/sample".into(),
            MessageType::of::<Sample>("Sample"),
            policy,
            &queue,
            move |m: &Sample| out.lock().push(m.0),
        );
        (queue, sink, seen)
    }

    #[test]
    fn one_closure_per_message_in_order() {
        let (queue, sink, seen) = setup(BufferPolicy::Unbounded);
        for i in 0..5 {
            sink.on_message(Arc::new(Sample(i)));
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.drain_available(), 5);
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn drop_oldest_keeps_latest_messages() {
        let (queue, sink, seen) = setup(BufferPolicy::DropOldest { capacity: 2 });
        for i in 0..5 {
            sink.on_message(Arc::new(Sample(i)));
        }
        // closures match buffered messages, not deliveries
        assert_eq!(queue.len(), 2);
        assert_eq!(sink.shared.dropped.load(Ordering::Relaxed), 3);
        queue.drain_available();
        assert_eq!(*seen.lock(), vec![3, 4]);
        assert_eq!(queue.diagnostics().failed(), 0);
    }

    #[test]
    fn drop_newest_keeps_earliest_messages() {
        let (queue, sink, seen) = setup(BufferPolicy::DropNewest { capacity: 2 });
        for i in 0..5 {
            sink.on_message(Arc::new(Sample(i)));
        }
        queue.drain_available();
        assert_eq!(*seen.lock(), vec![0, 1]);
        assert_eq!(sink.shared.received.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn wrong_payload_type_is_a_consistency_violation() {
        let (queue, sink, seen) = setup(BufferPolicy::Unbounded);
        sink.on_message(Arc::new("not a sample"));
        assert!(queue.is_empty());
        assert!(seen.lock().is_empty());
        assert_eq!(queue.diagnostics().snapshot().consistency_violations, 1);
    }

    #[test]
    fn empty_buffer_at_dispatch_is_reported_without_callback() {
        let (queue, sink, seen) = setup(BufferPolicy::Unbounded);
        sink.on_message(Arc::new(Sample(1)));
        // steal the message behind the closure's back
        sink.shared.buffer.lock().clear();

        queue.drain_available();
        assert!(seen.lock().is_empty());
        assert_eq!(queue.diagnostics().snapshot().consistency_violations, 1);
    }

    #[test]
    fn matched_count_tracks_transport_reports() {
        let (_queue, sink, _) = setup(BufferPolicy::Unbounded);
        sink.on_matched(2);
        assert_eq!(sink.shared.publisher_count.load(Ordering::Relaxed), 2);
        sink.on_matched(0);
        assert_eq!(sink.shared.publisher_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn closed_subscription_ignores_pending_and_new_messages() {
        let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new());
        let (queue, sink, seen) = setup(BufferPolicy::Unbounded);
        let subscription = Subscription::new(sink.shared.clone(), SinkId(0), transport);

        sink.on_message(Arc::new(Sample(1)));
        subscription.close();
        sink.on_message(Arc::new(Sample(2)));

        assert_eq!(queue.drain_available(), 1);
        assert!(seen.lock().is_empty());
        assert_eq!(queue.diagnostics().failed(), 0);
    }
}
