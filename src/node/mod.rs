//! Nodes: the unit of callback execution.
//!
//! A node owns a transport participant, a [`CallbackQueue`] and the entities
//! created through it (subscriptions, publishers, timers). Messages delivered
//! on transport threads become queued closures; whoever spins the node runs
//! them. Exactly one consumer spins a node at any moment.

pub use publisher::*;
pub use spin_thread::*;
pub use subscription::*;
pub use timer::*;

mod publisher;
mod spin_thread;
mod subscription;
mod timer;

use crate::config::{NodeConfig, SubscriptionOptions};
use crate::dispatch::{CallbackOutput, CallbackQueue, Diagnostics};
use crate::error::{RuntimeError, RuntimeResult};
use crate::transport::{Message, MessageSink, MessageType, ParticipantId, Qos, Transport};
use crate::utils::{ActivityFlag, CancelToken};
use parking_lot::Mutex;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Node-local identifier of a subscription, publisher or timer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// Non-owning reference to an entity owned by a node.
///
/// Stops resolving once the entity is destroyed or its node is dropped.
pub struct EntityRef<T: ?Sized> {
    id: EntityId,
    target: Weak<T>,
}

impl<T: ?Sized> EntityRef<T> {
    fn new(id: EntityId, target: Weak<T>) -> Self {
        Self { id, target }
    }

    #[inline]
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn upgrade(&self) -> Option<Arc<T>> {
        self.target.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }

    pub(crate) fn weak(&self) -> Weak<T> {
        self.target.clone()
    }
}

impl<T: ?Sized> Clone for EntityRef<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            target: self.target.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for EntityRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRef")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[derive(Default)]
struct Entities {
    subscriptions: Vec<(EntityId, Arc<dyn AnySubscription>)>,
    publishers: Vec<(EntityId, Arc<dyn AnyPublisher>)>,
    timers: Vec<(EntityId, Arc<Timer>)>,
}

pub struct Node {
    id: NodeId,
    domain_id: u16,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    participant: ParticipantId,
    queue: Arc<CallbackQueue>,
    cancel: CancelToken,
    spinning: ActivityFlag,
    /// Held by whoever is currently consuming the queue.
    consumer: Mutex<()>,
    entities: Mutex<Entities>,
    next_entity: AtomicU64,
}

impl Node {
    /// Create a node on `domain_id`. `cancel` is the process-wide context;
    /// the node observes it through a child token.
    pub fn new(
        domain_id: u16,
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        cancel: &CancelToken,
    ) -> RuntimeResult<Arc<Self>> {
        let participant = transport
            .create_participant(domain_id)
            .map_err(|e| RuntimeError::construction("participant", e))?;
        let id = NodeId::new();
        let node = Arc::new(Self {
            queue: Arc::new(CallbackQueue::new(Diagnostics::new(id.as_str()))),
            id,
            domain_id,
            config,
            transport,
            participant,
            cancel: cancel.new_child(),
            spinning: ActivityFlag::new(),
            consumer: Mutex::new(()),
            entities: Mutex::new(Entities::default()),
            next_entity: AtomicU64::new(1),
        });
        tracing::info!("[Node] {} created on domain {}", node.id, domain_id);
        Ok(node)
    }

    #[inline]
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    #[inline]
    pub fn domain_id(&self) -> u16 {
        self.domain_id
    }

    #[inline]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[inline]
    pub fn queue(&self) -> &Arc<CallbackQueue> {
        &self.queue
    }

    #[inline]
    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        self.queue.diagnostics()
    }

    fn next_entity_id(&self) -> EntityId {
        EntityId(self.next_entity.fetch_add(1, Ordering::Relaxed))
    }

    /// Subscribe to `topic` (prefixed with the node's topic prefix).
    ///
    /// `message_type` must describe `T`. The callback runs on the thread that
    /// spins this node, once per delivered message, in delivery order.
    pub fn create_subscription<T, F, R>(
        &self,
        message_type: &MessageType,
        topic: &str,
        options: &SubscriptionOptions,
        callback: F,
    ) -> RuntimeResult<EntityRef<Subscription<T>>>
    where
        T: Message,
        F: FnMut(&T) -> R + Send + 'static,
        R: CallbackOutput,
    {
        ensure_type::<T>(message_type)?;
        let topic = self.config.topic_name(topic);
        let policy = options.buffer_policy.unwrap_or(self.config.buffer_policy);

        let (shared, sink) = Subscription::<T>::prepare(
            topic.clone(),
            message_type.clone(),
            policy,
            &self.queue,
            callback,
        );
        let sink_id = self
            .transport
            .register_sink(
                self.participant,
                &topic,
                message_type,
                &options.qos,
                sink as Arc<dyn MessageSink>,
            )
            .map_err(|e| RuntimeError::construction("subscription", e))?;

        let subscription = Arc::new(Subscription::new(shared, sink_id, self.transport.clone()));
        let id = self.next_entity_id();
        let entity = EntityRef::new(id, Arc::downgrade(&subscription));
        self.entities
            .lock()
            .subscriptions
            .push((id, subscription as Arc<dyn AnySubscription>));
        tracing::debug!("[Node] {} subscribed to '{}' ({:?})", self.id, topic, policy);
        Ok(entity)
    }

    /// Create a publisher on `topic` (prefixed with the node's topic prefix).
    pub fn create_publisher<T: Message>(
        &self,
        message_type: &MessageType,
        topic: &str,
        qos: &Qos,
    ) -> RuntimeResult<EntityRef<Publisher<T>>> {
        ensure_type::<T>(message_type)?;
        let topic = self.config.topic_name(topic);
        let writer = self
            .transport
            .create_writer(self.participant, &topic, message_type, qos)
            .map_err(|e| RuntimeError::construction("publisher", e))?;

        let publisher = Arc::new(Publisher::<T>::new(
            topic.clone(),
            message_type.clone(),
            writer,
            self.transport.clone(),
        ));
        let id = self.next_entity_id();
        let entity = EntityRef::new(id, Arc::downgrade(&publisher));
        self.entities
            .lock()
            .publishers
            .push((id, publisher as Arc<dyn AnyPublisher>));
        tracing::debug!("[Node] {} publishing on '{}'", self.id, topic);
        Ok(entity)
    }

    /// Create a periodic timer fired from this node's spin logic.
    pub fn create_timer<F, R>(&self, period: Duration, callback: F) -> EntityRef<Timer>
    where
        F: FnMut() -> R + Send + 'static,
        R: CallbackOutput,
    {
        let timer = Arc::new(Timer::new(period, callback));
        let id = self.next_entity_id();
        let entity = EntityRef::new(id, Arc::downgrade(&timer));
        self.entities.lock().timers.push((id, timer));
        // wake a blocked spin so it recomputes its wait deadline
        self.queue.wake();
        entity
    }

    pub fn destroy_subscription(&self, id: EntityId) -> bool {
        let removed = take_entity(&mut self.entities.lock().subscriptions, id);
        removed.map(|s| s.close()).is_some()
    }

    pub fn destroy_publisher(&self, id: EntityId) -> bool {
        let removed = take_entity(&mut self.entities.lock().publishers, id);
        removed.map(|p| p.close()).is_some()
    }

    pub fn destroy_timer(&self, id: EntityId) -> bool {
        let removed = take_entity(&mut self.entities.lock().timers, id);
        removed.map(|t| t.cancel()).is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.entities.lock().subscriptions.len()
    }

    pub fn publisher_count(&self) -> usize {
        self.entities.lock().publishers.len()
    }

    pub fn timer_count(&self) -> usize {
        self.entities.lock().timers.len()
    }

    /// Queue invocations for due timers; returns the time until the earliest next tick.
    fn poll_timers(&self, now: Instant) -> Option<Duration> {
        let entities = self.entities.lock();
        entities
            .timers
            .iter()
            .filter_map(|(_, timer)| timer.poll(now, &self.queue))
            .min()
    }

    /// Run callbacks as they arrive until [`stop`](Self::stop) or process-wide
    /// cancellation. Blocks while another consumer is spinning this node.
    pub fn spin(&self) {
        let _consumer = self.consumer.lock();
        if self.should_stop() {
            return;
        }
        let _active = self.spinning.enter();
        tracing::debug!("[Node] {} spinning", self.id);

        let poll = self.config.poll_interval();
        let stop = || self.should_stop();
        while !self.should_stop() {
            let wait = self
                .poll_timers(Instant::now())
                .map_or(poll, |next| next.min(poll));
            self.queue.wait_and_drain_one_timeout(wait, &stop);
        }

        tracing::debug!("[Node] {} stopped spinning", self.id);
    }

    /// Run at most one pending callback without blocking.
    ///
    /// Returns false when nothing ran, including when another consumer holds the node.
    pub fn spin_once(&self) -> bool {
        let Some(_consumer) = self.consumer.try_lock() else {
            return false;
        };
        self.poll_timers(Instant::now());
        self.queue.try_drain_one()
    }

    /// Run every callback pending at the moment of the call without blocking.
    ///
    /// Returns 0 without touching the queue when another consumer holds the node.
    pub fn spin_some(&self) -> usize {
        let Some(_consumer) = self.consumer.try_lock() else {
            tracing::trace!("[Node] {} busy, skipping spin_some", self.id);
            return 0;
        };
        self.poll_timers(Instant::now());
        self.queue.drain_available()
    }

    /// Make the current and every future [`spin`](Self::spin) return. Sticky.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("[Node] {} stop requested", self.id);
        }
        self.cancel.cancel();
        self.queue.wake();
    }

    /// True once stopped locally or cancelled process-wide.
    #[inline]
    pub fn should_stop(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[inline]
    pub fn is_spinning(&self) -> bool {
        self.spinning.is_active()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.cancel.cancel();
        let entities = mem::take(&mut *self.entities.lock());
        for (_, timer) in &entities.timers {
            timer.cancel();
        }
        for (_, subscription) in &entities.subscriptions {
            subscription.close();
        }
        for (_, publisher) in &entities.publishers {
            publisher.close();
        }
        drop(entities);

        let dropped = self.queue.clear();
        self.transport.delete_participant(self.participant);
        tracing::info!(
            "[Node] {} destroyed ({} pending callbacks dropped)",
            self.id,
            dropped
        );
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("domain_id", &self.domain_id)
            .field("participant", &self.participant)
            .field("spinning", &self.is_spinning())
            .field("stopped", &self.should_stop())
            .finish()
    }
}

fn ensure_type<T: Message>(message_type: &MessageType) -> RuntimeResult<()> {
    if message_type.is::<T>() {
        Ok(())
    } else {
        Err(RuntimeError::TypeMismatch {
            expected: message_type.name().to_string(),
            actual: std::any::type_name::<T>(),
        })
    }
}

fn take_entity<E>(list: &mut Vec<(EntityId, E)>, id: EntityId) -> Option<E> {
    let pos = list.iter().position(|(eid, _)| *eid == id)?;
    Some(list.remove(pos).1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferPolicy;
    use crate::transport::LoopbackTransport;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Clone, Debug, PartialEq)]
    struct Reading(u32);

    fn reading_type() -> MessageType {
        MessageType::of::<Reading>("Reading")
    }

    fn node_on(transport: &Arc<LoopbackTransport>) -> Arc<Node> {
        Node::new(
            0,
            NodeConfig::default(),
            transport.clone(),
            &CancelToken::new_root(),
        )
        .unwrap()
    }

    #[test]
    fn spin_some_without_sources_is_immediate() {
        let transport = Arc::new(LoopbackTransport::new());
        let node = node_on(&transport);
        let start = Instant::now();
        assert_eq!(node.spin_some(), 0);
        assert!(!node.spin_once());
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[test]
    fn published_messages_reach_subscription_in_order() {
        let transport = Arc::new(LoopbackTransport::new());
        let node = node_on(&transport);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let out = seen.clone();

        let sub = node
            .create_subscription(
                &reading_type(),
                "readings",
                &SubscriptionOptions::default(),
                move |r: &Reading| out.lock().push(r.0),
            )
            .unwrap();
        let publisher = node
            .create_publisher::<Reading>(&reading_type(), "readings", &Qos::default())
            .unwrap();

        assert_eq!(sub.upgrade().unwrap().topic(), "rt/readings");
        assert_eq!(sub.upgrade().unwrap().get_publisher_count(), 1);
        assert_eq!(publisher.upgrade().unwrap().get_subscriber_count(), 1);

        for i in 0..3 {
            publisher.upgrade().unwrap().publish(Reading(i)).unwrap();
        }
        assert_eq!(node.spin_some(), 3);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn mismatched_type_is_rejected_without_registering() {
        let transport = Arc::new(LoopbackTransport::new());
        let node = node_on(&transport);
        let err = node
            .create_subscription(
                &MessageType::of::<String>("Text"),
                "readings",
                &SubscriptionOptions::default(),
                |_: &Reading| {},
            )
            .unwrap_err();
        assert!(matches!(err, RuntimeError::TypeMismatch { .. }));
        assert_eq!(transport.sink_count(), 0);
    }

    #[test]
    fn transport_failure_is_a_construction_error() {
        let transport = Arc::new(LoopbackTransport::new());
        transport.reject_topic("rt/blocked");
        let node = node_on(&transport);
        let err = node
            .create_publisher::<Reading>(&reading_type(), "blocked", &Qos::default())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Construction { what: "publisher", .. }));
        assert_eq!(node.publisher_count(), 0);
    }

    #[test]
    fn stop_ends_spin_promptly() {
        let transport = Arc::new(LoopbackTransport::new());
        let node = node_on(&transport);
        let spinner = {
            let node = node.clone();
            thread::spawn(move || node.spin())
        };
        while !node.is_spinning() {
            thread::yield_now();
        }

        let start = Instant::now();
        node.stop();
        spinner.join().unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(!node.is_spinning());

        // sticky: a later spin returns at once
        let start = Instant::now();
        node.spin();
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn process_cancellation_stops_spin() {
        let transport = Arc::new(LoopbackTransport::new());
        let root = CancelToken::new_root();
        let node = Node::new(0, NodeConfig::default(), transport.clone(), &root).unwrap();
        let spinner = {
            let node = node.clone();
            thread::spawn(move || node.spin())
        };
        thread::sleep(Duration::from_millis(5));
        root.cancel();
        spinner.join().unwrap();
        assert!(node.should_stop());
    }

    #[test]
    fn spin_fires_timers() {
        let transport = Arc::new(LoopbackTransport::new());
        let node = node_on(&transport);
        let hits = Arc::new(AtomicUsize::new(0));
        let stopper = node.clone();
        let h = hits.clone();
        let timer = node.create_timer(Duration::from_millis(2), move || {
            if h.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                stopper.stop();
            }
        });

        node.spin();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(timer.upgrade().unwrap().fire_count(), 3);
    }

    #[test]
    fn second_consumer_skips_busy_node() {
        let transport = Arc::new(LoopbackTransport::new());
        let node = node_on(&transport);
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let inner = node.clone();
        node.queue().push_fn(move || {
            // re-entrant consumer attempt from inside a callback
            assert_eq!(inner.spin_some(), 0);
            r.fetch_add(1, Ordering::SeqCst);
        });
        node.queue().push_fn(|| {});

        assert_eq!(node.spin_some(), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(node.diagnostics().failed(), 0);
    }

    #[test]
    fn destroyed_entities_stop_resolving() {
        let transport = Arc::new(LoopbackTransport::new());
        let node = node_on(&transport);
        let sub = node
            .create_subscription(
                &reading_type(),
                "a",
                &SubscriptionOptions::default().with_buffer_policy(BufferPolicy::DropOldest {
                    capacity: 1,
                }),
                |_: &Reading| {},
            )
            .unwrap();
        assert_eq!(transport.sink_count(), 1);

        assert!(node.destroy_subscription(sub.id()));
        assert!(!sub.is_alive());
        assert!(!node.destroy_subscription(sub.id()));
        assert_eq!(transport.sink_count(), 0);
    }

    #[test]
    fn dropping_node_releases_transport_objects() {
        let transport = Arc::new(LoopbackTransport::new());
        let node = node_on(&transport);
        let sub = node
            .create_subscription(
                &reading_type(),
                "r",
                &SubscriptionOptions::default(),
                |_: &Reading| {},
            )
            .unwrap();
        let publisher = node
            .create_publisher::<Reading>(&reading_type(), "r", &Qos::default())
            .unwrap();
        publisher.upgrade().unwrap().publish(Reading(1)).unwrap();

        drop(node);
        assert!(!sub.is_alive());
        assert!(!publisher.is_alive());
        assert_eq!(transport.participant_count(), 0);
        assert_eq!(transport.topic_count(), 0);
    }
}
