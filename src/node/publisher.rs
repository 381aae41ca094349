use crate::error::{RuntimeError, RuntimeResult};
use crate::transport::{AnyMessage, Message, MessageType, Transport, WriterId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Typed writer on one topic, owned by a [`Node`](super::Node).
pub struct Publisher<T: Message> {
    topic: String,
    message_type: MessageType,
    writer: WriterId,
    transport: Arc<dyn Transport>,
    published: AtomicU64,
    closed: AtomicBool,
    _message: PhantomData<fn(T)>,
}

impl<T: Message> Publisher<T> {
    pub(crate) fn new(
        topic: String,
        message_type: MessageType,
        writer: WriterId,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            topic,
            message_type,
            writer,
            transport,
            published: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            _message: PhantomData,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    pub fn publish(&self, message: T) -> RuntimeResult<()> {
        self.write(Arc::new(message))
    }

    /// Number of subscriptions currently matched with this publisher.
    pub fn get_subscriber_count(&self) -> i32 {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        self.transport.subscriber_count(self.writer)
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn write(&self, message: AnyMessage) -> RuntimeResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::Publish {
                topic: self.topic.clone(),
                source: anyhow::anyhow!("publisher destroyed"),
            });
        }
        self.transport
            .write(self.writer, message)
            .map_err(|source| RuntimeError::Publish {
                topic: self.topic.clone(),
                source,
            })?;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl<T: Message> Drop for Publisher<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Message> fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.topic)
            .field("message_type", &self.message_type)
            .field("writer", &self.writer)
            .finish()
    }
}

/// Type-erased view used by the node and the handle API.
pub trait AnyPublisher: Send + Sync + 'static {
    fn topic(&self) -> &str;

    fn message_type(&self) -> &MessageType;

    /// Publish a payload whose concrete type is checked against the publisher's.
    fn publish_any(&self, message: AnyMessage) -> RuntimeResult<()>;

    fn get_subscriber_count(&self) -> i32;

    /// Release the transport writer. Idempotent.
    fn close(&self);
}

impl<T: Message> AnyPublisher for Publisher<T> {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    fn publish_any(&self, message: AnyMessage) -> RuntimeResult<()> {
        if !message.is::<T>() {
            return Err(RuntimeError::TypeMismatch {
                expected: self.message_type.name().to_string(),
                actual: "foreign payload",
            });
        }
        self.write(message)
    }

    fn get_subscriber_count(&self) -> i32 {
        Publisher::get_subscriber_count(self)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.delete_writer(self.writer);
        tracing::debug!("[Publisher] '{}' closed", self.topic);
    }
}
