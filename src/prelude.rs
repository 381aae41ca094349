pub use crate::config::{
    BufferPolicy, ExecutorConfig, NodeConfig, RuntimeConfig, SubscriptionOptions,
};
pub use crate::dispatch::{CallbackOutput, CallbackQueue, Diagnostics, DispatchFailure};
pub use crate::error::{DispatchError, DispatchResult, RuntimeError, RuntimeResult};
pub use crate::executor::{
    Executor, ExecutorKind, MultiThreadedExecutor, SingleThreadedExecutor, build_executor,
};
pub use crate::node::{
    AnySubscription, EntityId, EntityRef, Node, NodeId, Publisher, SpinThread, Subscription, Timer,
};
pub use crate::registry::{Handle, INVALID_HANDLE};
pub use crate::runtime::Runtime;
pub use crate::transport::{
    AnyMessage, LoopbackTransport, Message, MessageSink, MessageType, Qos, Transport,
};
pub use crate::utils::logger::LoggerConfig;
pub use crate::utils::{CancelToken, Rate};
