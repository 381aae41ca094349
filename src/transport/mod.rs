//! Boundary with the publish/subscribe transport.
//!
//! The runtime never creates topics, negotiates QoS or encodes messages
//! itself. It asks a [`Transport`] for participants, readers ("sinks") and
//! writers, and the transport calls back into a [`MessageSink`] once per
//! delivered message and on every peer-match change.

pub use loopback::*;
pub use types::*;

mod loopback;
mod types;

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Type-erased message as carried by the transport.
pub type AnyMessage = Arc<dyn Any + Send + Sync>;

macro_rules! transport_id {
    ($name:ident, $label:literal) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }
    };
}

transport_id!(ParticipantId, "participant");
transport_id!(SinkId, "sink");
transport_id!(WriterId, "writer");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    #[default]
    Reliable,
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    #[default]
    Volatile,
    TransientLocal,
}

/// QoS options forwarded verbatim to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Qos {
    pub reliability: Reliability,
    pub durability: Durability,
    pub history_depth: usize,
}

impl Default for Qos {
    fn default() -> Self {
        Self {
            reliability: Reliability::Reliable,
            durability: Durability::Volatile,
            history_depth: 10,
        }
    }
}

/// Receiving side of a registered reader.
///
/// Both methods are called on transport delivery threads and must not block
/// for long.
pub trait MessageSink: Send + Sync + 'static {
    /// One decoded message became available.
    fn on_message(&self, message: AnyMessage);

    /// The number of matched writers changed.
    fn on_matched(&self, current_count: i32);
}

/// The publish/subscribe collaborator.
///
/// Topic names arrive already namespaced by the caller.
pub trait Transport: Send + Sync + 'static {
    fn create_participant(&self, domain_id: u16) -> anyhow::Result<ParticipantId>;

    fn delete_participant(&self, participant: ParticipantId);

    fn register_sink(
        &self,
        participant: ParticipantId,
        topic: &str,
        message_type: &MessageType,
        qos: &Qos,
        sink: Arc<dyn MessageSink>,
    ) -> anyhow::Result<SinkId>;

    fn unregister_sink(&self, sink: SinkId);

    fn create_writer(
        &self,
        participant: ParticipantId,
        topic: &str,
        message_type: &MessageType,
        qos: &Qos,
    ) -> anyhow::Result<WriterId>;

    fn delete_writer(&self, writer: WriterId);

    fn write(&self, writer: WriterId, message: AnyMessage) -> anyhow::Result<()>;

    /// Number of readers currently matched with `writer`.
    fn subscriber_count(&self, writer: WriterId) -> i32;
}
