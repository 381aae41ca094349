//! Executors drive many nodes from one or more threads by repeatedly calling
//! [`Node::spin_some`] on each registered node.

pub use multi::*;
pub use single::*;

mod multi;
mod single;

use crate::config::ExecutorConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::node::{Node, NodeId};
use crate::utils::{ActiveGuard, ActivityFlag, CancelToken};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    SingleThreaded,
    MultiThreaded,
}

pub trait Executor: Send + Sync + 'static {
    /// Register a node. The executor keeps only a weak reference.
    fn add_node(&self, node: &Arc<Node>) -> RuntimeResult<()>;

    /// Unregister a node; takes effect from the next spin cycle.
    fn remove_node(&self, node: &Node) -> bool;

    /// Drive registered nodes until [`stop`](Self::stop) or process-wide cancellation.
    fn spin(&self);

    /// End `spin` and stop every registered node. Idempotent and final: a
    /// stopped executor is not restarted by a later `spin`, which returns at
    /// once. Stopped nodes stay stopped too, so build a new executor and new
    /// nodes to resume.
    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Number of registered nodes still alive.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind(&self) -> ExecutorKind;
}

/// Build an executor of `kind` observing `cancel`.
pub fn build_executor(
    kind: ExecutorKind,
    config: ExecutorConfig,
    cancel: &CancelToken,
) -> Arc<dyn Executor> {
    match kind {
        ExecutorKind::SingleThreaded => Arc::new(SingleThreadedExecutor::new(config, cancel)),
        ExecutorKind::MultiThreaded => Arc::new(MultiThreadedExecutor::new(config, cancel)),
    }
}

/// Weakly held, ordered set of nodes.
#[derive(Default)]
pub(crate) struct NodeSet {
    nodes: Mutex<Vec<(NodeId, Weak<Node>)>>,
}

impl NodeSet {
    pub(crate) fn add(&self, node: &Arc<Node>) -> RuntimeResult<()> {
        let mut nodes = self.nodes.lock();
        nodes.retain(|(_, weak)| weak.strong_count() > 0);
        if nodes.iter().any(|(id, _)| id == node.id()) {
            return Err(RuntimeError::DuplicateNode(node.id().to_string()));
        }
        nodes.push((node.id().clone(), Arc::downgrade(node)));
        Ok(())
    }

    pub(crate) fn remove(&self, id: &NodeId) -> bool {
        let mut nodes = self.nodes.lock();
        let before = nodes.len();
        nodes.retain(|(nid, _)| nid != id);
        nodes.len() != before
    }

    /// Live nodes in registration order. The lock is held only while copying.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Node>> {
        self.nodes
            .lock()
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes
            .lock()
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }
}

/// State shared by both executor flavours.
pub(crate) struct ExecutorCore {
    pub(crate) nodes: NodeSet,
    pub(crate) config: ExecutorConfig,
    cancel: CancelToken,
    running: ActivityFlag,
}

impl ExecutorCore {
    pub(crate) fn new(config: ExecutorConfig, cancel: &CancelToken) -> Self {
        Self {
            nodes: NodeSet::default(),
            config,
            cancel: cancel.new_child(),
            running: ActivityFlag::new(),
        }
    }

    /// Claim the running flag for the lifetime of the guard. None if already
    /// spinning or already stopped.
    pub(crate) fn begin(&self, name: &str) -> Option<ActiveGuard> {
        if self.cancel.is_cancelled() {
            tracing::debug!("[{}] spin after stop/cancel, returning", name);
            return None;
        }
        let guard = self.running.try_enter();
        if guard.is_none() {
            tracing::warn!("[{}] already spinning", name);
        }
        guard
    }

    #[inline]
    pub(crate) fn should_stop(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn stop(&self, name: &str) {
        if !self.cancel.is_cancelled() {
            tracing::info!("[{}] stop requested", name);
        }
        self.cancel.cancel();
        for node in self.nodes.snapshot() {
            node.stop();
        }
    }

    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.running.is_active()
    }
}

impl fmt::Debug for ExecutorCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorCore")
            .field("nodes", &self.nodes.len())
            .field("running", &self.is_running())
            .field("stopped", &self.should_stop())
            .finish()
    }
}
