use crate::config::{RuntimeConfig, SubscriptionOptions};
use crate::dispatch::CallbackOutput;
use crate::error::RuntimeError;
use crate::executor::{Executor, ExecutorKind, build_executor};
use crate::node::{AnyPublisher, AnySubscription, EntityId, Node, Timer};
use crate::registry::{Handle, HandleKind, HandleTable, INVALID_HANDLE};
use crate::transport::{Message, MessageType, Qos, Transport, TypeRegistry};
use crate::utils::CancelToken;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;

/// Handle-table entry for an entity owned by a node.
struct ChildEntry<T: ?Sized> {
    node: Handle,
    entity: EntityId,
    target: Weak<T>,
}

impl<T: ?Sized> Clone for ChildEntry<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node,
            entity: self.entity,
            target: self.target.clone(),
        }
    }
}

/// Handle-based facade over nodes, entities and executors.
///
/// Every object is addressed by an opaque non-zero [`Handle`]. Operations on
/// a zero, stale or wrong-kind handle log an error and return a default value
/// (`false`, `0`, `INVALID_HANDLE`); they never touch freed state. Creation
/// failures are logged and reported as [`INVALID_HANDLE`].
pub struct Runtime {
    config: RuntimeConfig,
    transport: Arc<dyn Transport>,
    cancel: CancelToken,
    types: TypeRegistry,
    nodes: HandleTable<Arc<Node>>,
    publishers: HandleTable<ChildEntry<dyn AnyPublisher>>,
    subscriptions: HandleTable<ChildEntry<dyn AnySubscription>>,
    timers: HandleTable<ChildEntry<Timer>>,
    executors: HandleTable<Arc<dyn Executor>>,
    _log_guard: Option<WorkerGuard>,
}

impl Runtime {
    /// Build a runtime over `transport`.
    ///
    /// Installs the logger when configured and, with `handle_signals`, routes
    /// termination signals into the runtime's cancellation flag. Failing to
    /// install the signal handlers is the only fatal error.
    pub fn new(config: RuntimeConfig, transport: Arc<dyn Transport>) -> anyhow::Result<Self> {
        let log_guard = match &config.logger {
            Some(logger) => logger.init()?,
            None => None,
        };

        let cancel = CancelToken::new_root();
        if config.handle_signals {
            cancel.register_term_signals()?;
        }
        tracing::info!(
            "[Runtime] started (signals: {}, topic prefix: '{}')",
            config.handle_signals,
            config.node.topic_prefix
        );

        Ok(Self {
            config,
            transport,
            cancel,
            types: TypeRegistry::new(),
            nodes: HandleTable::new(HandleKind::Node),
            publishers: HandleTable::new(HandleKind::Publisher),
            subscriptions: HandleTable::new(HandleKind::Subscription),
            timers: HandleTable::new(HandleKind::Timer),
            executors: HandleTable::new(HandleKind::Executor),
            _log_guard: log_guard,
        })
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Process-wide cancellation context.
    #[inline]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Add message types by name. Names already known keep their descriptor.
    /// Returns how many names were added.
    pub fn register_message_types<I, S>(&self, types: I) -> usize
    where
        I: IntoIterator<Item = (S, MessageType)>,
        S: Into<String>,
    {
        let added = self.types.register(types);
        tracing::debug!("[Runtime] {} message types registered", added);
        added
    }

    pub fn message_type(&self, name: &str) -> Option<MessageType> {
        self.types.get(name)
    }

    fn lookup_type(&self, name: &str) -> Option<MessageType> {
        let found = self.types.get(name);
        if found.is_none() {
            tracing::error!(
                "[Runtime] {}",
                RuntimeError::UnknownMessageType(name.to_string())
            );
        }
        found
    }

    fn node_entry(&self, handle: Handle) -> Option<Arc<Node>> {
        let node = self.nodes.get(handle);
        if node.is_none() {
            log_invalid(HandleKind::Node, handle);
        }
        node
    }

    // ---- nodes ----

    pub fn create_node(&self, domain_id: u16) -> Handle {
        match Node::new(
            domain_id,
            self.config.node.clone(),
            self.transport.clone(),
            &self.cancel,
        ) {
            Ok(node) => self.nodes.insert(node),
            Err(e) => {
                tracing::error!("[Runtime] create_node failed: {}", e);
                INVALID_HANDLE
            }
        }
    }

    /// Stop the node and release it with everything it owns.
    ///
    /// A thread still inside `spin` keeps the node alive until it returns.
    pub fn destroy_node(&self, node: Handle) -> bool {
        let Some(removed) = self.nodes.remove(node) else {
            log_invalid(HandleKind::Node, node);
            return false;
        };
        removed.stop();
        for executor in self.executors.values() {
            executor.remove_node(&removed);
        }
        self.timers.remove_where(|e| e.node == node);
        self.subscriptions.remove_where(|e| e.node == node);
        self.publishers.remove_where(|e| e.node == node);
        tracing::debug!("[Runtime] node {} destroyed", removed.id());
        true
    }

    /// Direct access to the node behind a handle.
    pub fn node(&self, node: Handle) -> Option<Arc<Node>> {
        self.node_entry(node)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ---- publishers ----

    pub fn create_publisher<T: Message>(
        &self,
        node: Handle,
        type_name: &str,
        topic: &str,
        qos: &Qos,
    ) -> Handle {
        let Some(owner) = self.node_entry(node) else {
            return INVALID_HANDLE;
        };
        let Some(message_type) = self.lookup_type(type_name) else {
            return INVALID_HANDLE;
        };
        match owner.create_publisher::<T>(&message_type, topic, qos) {
            Ok(entity) => {
                let target: Weak<dyn AnyPublisher> = entity.weak();
                self.publishers.insert(ChildEntry {
                    node,
                    entity: entity.id(),
                    target,
                })
            }
            Err(e) => {
                tracing::error!("[Runtime] create_publisher on '{}' failed: {}", topic, e);
                INVALID_HANDLE
            }
        }
    }

    pub fn destroy_publisher(&self, publisher: Handle) -> bool {
        let Some(entry) = self.publishers.remove(publisher) else {
            log_invalid(HandleKind::Publisher, publisher);
            return false;
        };
        if let Some(node) = self.nodes.get(entry.node) {
            node.destroy_publisher(entry.entity);
        }
        true
    }

    fn publisher(&self, publisher: Handle) -> Option<Arc<dyn AnyPublisher>> {
        let found = self
            .publishers
            .with(publisher, |e| e.target.upgrade())
            .flatten();
        if found.is_none() {
            log_invalid(HandleKind::Publisher, publisher);
        }
        found
    }

    /// Publish `message`. False if the handle is invalid or the write failed.
    pub fn publish<T: Message>(&self, publisher: Handle, message: T) -> bool {
        let Some(target) = self.publisher(publisher) else {
            return false;
        };
        match target.publish_any(Arc::new(message)) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("[Runtime] {}", e);
                false
            }
        }
    }

    pub fn get_subscriber_count(&self, publisher: Handle) -> i32 {
        self.publisher(publisher)
            .map_or(0, |p| p.get_subscriber_count())
    }

    // ---- subscriptions ----

    /// Subscribe `callback` to `topic` on `node`.
    ///
    /// An unregistered `type_name` yields [`INVALID_HANDLE`] and nothing is
    /// registered with the transport.
    pub fn create_subscription<T, F, R>(
        &self,
        node: Handle,
        type_name: &str,
        topic: &str,
        options: &SubscriptionOptions,
        callback: F,
    ) -> Handle
    where
        T: Message,
        F: FnMut(&T) -> R + Send + 'static,
        R: CallbackOutput,
    {
        let Some(owner) = self.node_entry(node) else {
            return INVALID_HANDLE;
        };
        let Some(message_type) = self.lookup_type(type_name) else {
            return INVALID_HANDLE;
        };
        match owner.create_subscription::<T, F, R>(&message_type, topic, options, callback) {
            Ok(entity) => {
                let target: Weak<dyn AnySubscription> = entity.weak();
                self.subscriptions.insert(ChildEntry {
                    node,
                    entity: entity.id(),
                    target,
                })
            }
            Err(e) => {
                tracing::error!("[Runtime] create_subscription on '{}' failed: {}", topic, e);
                INVALID_HANDLE
            }
        }
    }

    pub fn destroy_subscription(&self, subscription: Handle) -> bool {
        let Some(entry) = self.subscriptions.remove(subscription) else {
            log_invalid(HandleKind::Subscription, subscription);
            return false;
        };
        if let Some(node) = self.nodes.get(entry.node) {
            node.destroy_subscription(entry.entity);
        }
        true
    }

    /// The subscription behind a handle, for its buffer and delivery counters.
    pub fn subscription(&self, subscription: Handle) -> Option<Arc<dyn AnySubscription>> {
        let found = self
            .subscriptions
            .with(subscription, |e| e.target.upgrade())
            .flatten();
        if found.is_none() {
            log_invalid(HandleKind::Subscription, subscription);
        }
        found
    }

    pub fn get_publisher_count(&self, subscription: Handle) -> i32 {
        let found = self
            .subscriptions
            .with(subscription, |e| e.target.upgrade())
            .flatten();
        match found {
            Some(s) => s.get_publisher_count(),
            None => {
                log_invalid(HandleKind::Subscription, subscription);
                0
            }
        }
    }

    // ---- timers ----

    pub fn create_timer<F, R>(&self, node: Handle, period: Duration, callback: F) -> Handle
    where
        F: FnMut() -> R + Send + 'static,
        R: CallbackOutput,
    {
        let Some(owner) = self.node_entry(node) else {
            return INVALID_HANDLE;
        };
        let entity = owner.create_timer(period, callback);
        self.timers.insert(ChildEntry {
            node,
            entity: entity.id(),
            target: entity.weak(),
        })
    }

    pub fn destroy_timer(&self, timer: Handle) -> bool {
        let Some(entry) = self.timers.remove(timer) else {
            log_invalid(HandleKind::Timer, timer);
            return false;
        };
        if let Some(node) = self.nodes.get(entry.node) {
            node.destroy_timer(entry.entity);
        }
        true
    }

    /// The timer behind a handle, for `cancel`/`reset`/`fire_count`.
    pub fn timer(&self, timer: Handle) -> Option<Arc<Timer>> {
        let found = self.timers.with(timer, |e| e.target.upgrade()).flatten();
        if found.is_none() {
            log_invalid(HandleKind::Timer, timer);
        }
        found
    }

    // ---- spinning ----

    /// Block running `node`'s callbacks until [`stop_spin`](Self::stop_spin),
    /// node destruction or process-wide cancellation.
    pub fn spin(&self, node: Handle) {
        if let Some(node) = self.node_entry(node) {
            node.spin();
        }
    }

    pub fn spin_once(&self, node: Handle) -> bool {
        self.node_entry(node).is_some_and(|n| n.spin_once())
    }

    pub fn spin_some(&self, node: Handle) -> usize {
        self.node_entry(node).map_or(0, |n| n.spin_some())
    }

    pub fn stop_spin(&self, node: Handle) -> bool {
        match self.node_entry(node) {
            Some(node) => {
                node.stop();
                true
            }
            None => false,
        }
    }

    // ---- executors ----

    pub fn create_executor(&self, kind: ExecutorKind) -> Handle {
        let executor = build_executor(kind, self.config.executor.clone(), &self.cancel);
        self.executors.insert(executor)
    }

    fn executor(&self, executor: Handle) -> Option<Arc<dyn Executor>> {
        let found = self.executors.get(executor);
        if found.is_none() {
            log_invalid(HandleKind::Executor, executor);
        }
        found
    }

    pub fn executor_add_node(&self, executor: Handle, node: Handle) -> bool {
        let (Some(executor), Some(node)) = (self.executor(executor), self.node_entry(node)) else {
            return false;
        };
        match executor.add_node(&node) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("[Runtime] executor_add_node: {}", e);
                false
            }
        }
    }

    pub fn executor_remove_node(&self, executor: Handle, node: Handle) -> bool {
        let (Some(executor), Some(node)) = (self.executor(executor), self.node_entry(node)) else {
            return false;
        };
        executor.remove_node(&node)
    }

    /// Block driving the executor's nodes until it is stopped or cancelled.
    pub fn executor_spin(&self, executor: Handle) {
        if let Some(executor) = self.executor(executor) {
            executor.spin();
        }
    }

    pub fn executor_stop(&self, executor: Handle) -> bool {
        match self.executor(executor) {
            Some(executor) => {
                executor.stop();
                true
            }
            None => false,
        }
    }

    pub fn destroy_executor(&self, executor: Handle) -> bool {
        let Some(removed) = self.executors.remove(executor) else {
            log_invalid(HandleKind::Executor, executor);
            return false;
        };
        removed.stop();
        true
    }

    /// Cancel everything and release every handle. Idempotent.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("[Runtime] shutdown");
        }
        self.cancel.cancel();
        for executor in self.executors.drain() {
            executor.stop();
        }
        self.timers.drain();
        self.subscriptions.drain();
        self.publishers.drain();
        for node in self.nodes.drain() {
            node.stop();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("nodes", &self.nodes.len())
            .field("publishers", &self.publishers.len())
            .field("subscriptions", &self.subscriptions.len())
            .field("timers", &self.timers.len())
            .field("executors", &self.executors.len())
            .field("types", &self.types)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn log_invalid(kind: HandleKind, handle: Handle) {
    tracing::error!(
        "[Runtime] {}",
        RuntimeError::invalid_handle(kind.as_str(), handle)
    );
}
