use crate::registry::Handle;
use std::{error::Error, fmt};

const ERR_MSG_QUEUE_FULL: &str = "channel is full";
const ERR_MSG_CHANNEL_CLOSED: &str = "channel is closed";
const ERR_MSG_TIMEOUT: &str = "operation timed out";
const ERR_MSG_CANCELLED: &str = "operation cancelled";

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Failures surfaced by node, executor and handle-table operations.
#[derive(Debug)]
pub enum RuntimeError {
    /// A transport object (participant, reader, writer) could not be created.
    Construction {
        what: &'static str,
        source: anyhow::Error,
    },
    /// Zero, stale or foreign handle.
    InvalidHandle { kind: &'static str, handle: Handle },
    /// Message type name not present in the type registry.
    UnknownMessageType(String),
    /// Registered descriptor does not describe the Rust type used at the call site.
    TypeMismatch {
        expected: String,
        actual: &'static str,
    },
    /// Node is already registered with this executor.
    DuplicateNode(String),
    /// Transport rejected an outgoing message.
    Publish { topic: String, source: anyhow::Error },
}

impl RuntimeError {
    pub fn construction(what: &'static str, source: anyhow::Error) -> Self {
        Self::Construction { what, source }
    }

    pub fn invalid_handle(kind: &'static str, handle: Handle) -> Self {
        Self::InvalidHandle { kind, handle }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Construction { what, source } => write!(f, "failed to create {what}: {source}"),
            Self::InvalidHandle { kind, handle } => write!(f, "invalid {kind} handle: {handle:#x}"),
            Self::UnknownMessageType(name) => write!(f, "message type '{name}' is not registered"),
            Self::TypeMismatch { expected, actual } => {
                write!(f, "message type '{expected}' does not describe {actual}")
            }
            Self::DuplicateNode(id) => write!(f, "node {id} is already registered"),
            Self::Publish { topic, source } => write!(f, "publish on '{topic}' failed: {source}"),
        }
    }
}

impl Error for RuntimeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Construction { source, .. } | Self::Publish { source, .. } => {
                Some(source.as_ref())
            }
            _ => None,
        }
    }
}

pub type DispatchResult = Result<(), DispatchError>;

/// Outcome of a failed dispatch closure, reported to [`Diagnostics`](crate::dispatch::Diagnostics).
#[derive(Debug)]
pub enum DispatchError {
    /// User callback returned an error.
    Callback(anyhow::Error),
    /// User callback panicked; payload message when it was a string.
    Panicked(String),
    /// Dispatch closure found no buffered message to hand to the callback.
    EmptyBuffer { topic: String },
    /// Transport delivered a payload of the wrong runtime type.
    UnexpectedPayload {
        topic: String,
        expected: &'static str,
    },
}

impl DispatchError {
    /// True for internal consistency violations, false for user callback failures.
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            Self::EmptyBuffer { .. } | Self::UnexpectedPayload { .. }
        )
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callback(err) => write!(f, "callback failed: {err}"),
            Self::Panicked(msg) => write!(f, "callback panicked: {msg}"),
            Self::EmptyBuffer { topic } => {
                write!(f, "dispatch on '{topic}' found an empty message buffer")
            }
            Self::UnexpectedPayload { topic, expected } => {
                write!(f, "payload on '{topic}' is not a {expected}")
            }
        }
    }
}

impl Error for DispatchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Callback(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for DispatchError {
    fn from(err: anyhow::Error) -> Self {
        DispatchError::Callback(err)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendFailReason {
    Timeout,
    Cancelled,
    Full,
    Closed,
}

impl fmt::Display for SendFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendFailReason::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            SendFailReason::Cancelled => write!(f, "{ERR_MSG_CANCELLED}"),
            SendFailReason::Full => write!(f, "{ERR_MSG_QUEUE_FULL}"),
            SendFailReason::Closed => write!(f, "{ERR_MSG_CHANNEL_CLOSED}"),
        }
    }
}

/// Send failure carrying the rejected value back to the caller.
#[derive(Debug)]
pub struct SendError<T> {
    pub value: Option<T>,
    pub reason: SendFailReason,
}

impl<T> SendError<T> {
    pub fn new(reason: SendFailReason, value: Option<T>) -> Self {
        Self { value, reason }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl<T: fmt::Debug> Error for SendError<T> {}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecvError {
    Timeout,
    Disconnected,
    Cancelled,
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvError::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            RecvError::Disconnected => write!(f, "{ERR_MSG_CHANNEL_CLOSED}"),
            RecvError::Cancelled => write!(f, "{ERR_MSG_CANCELLED}"),
        }
    }
}

impl Error for RecvError {}
