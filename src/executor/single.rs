use super::{Executor, ExecutorCore, ExecutorKind};
use crate::config::ExecutorConfig;
use crate::error::RuntimeResult;
use crate::node::Node;
use crate::utils::{CancelToken, IdleBackoff, core_for_slot, try_pin_core};
use std::sync::Arc;

/// Drives every registered node from the thread that calls [`spin`](Executor::spin).
///
/// Each cycle snapshots the node list, calls `spin_some` on each node in
/// registration order and backs off when no node had work.
#[derive(Debug)]
pub struct SingleThreadedExecutor {
    core: ExecutorCore,
}

impl SingleThreadedExecutor {
    pub fn new(config: ExecutorConfig, cancel: &CancelToken) -> Self {
        Self {
            core: ExecutorCore::new(config, cancel),
        }
    }

    /// One pass over the registered nodes. Returns the number of callbacks run.
    pub fn spin_some(&self) -> usize {
        self.core
            .nodes
            .snapshot()
            .iter()
            .map(|node| node.spin_some())
            .sum()
    }
}

impl Executor for SingleThreadedExecutor {
    fn add_node(&self, node: &Arc<Node>) -> RuntimeResult<()> {
        self.core.nodes.add(node)?;
        tracing::debug!("[Executor] node {} added", node.id());
        Ok(())
    }

    fn remove_node(&self, node: &Node) -> bool {
        self.core.nodes.remove(node.id())
    }

    fn spin(&self) {
        let Some(_running) = self.core.begin("Executor") else {
            return;
        };
        if let Some(core_id) = core_for_slot(self.core.config.core_ids.as_deref(), 0) {
            match try_pin_core(core_id) {
                Ok(core_id) => tracing::info!("[Executor] pinned to core: {}", core_id),
                Err(e) => tracing::warn!("[Executor] cannot pin core: {}", e),
            }
        }
        tracing::info!("[Executor] spinning {} nodes", self.core.nodes.len());

        let mut backoff = IdleBackoff::new(self.core.config.idle_sleep());
        while !self.core.should_stop() {
            if self.spin_some() > 0 {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }

        tracing::info!("[Executor] stopped");
    }

    fn stop(&self) {
        self.core.stop("Executor");
    }

    fn is_running(&self) -> bool {
        self.core.is_running()
    }

    fn len(&self) -> usize {
        self.core.nodes.len()
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::SingleThreaded
    }
}
