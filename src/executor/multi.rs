use super::{Executor, ExecutorCore, ExecutorKind};
use crate::config::ExecutorConfig;
use crate::error::RuntimeResult;
use crate::node::Node;
use crate::utils::{CancelToken, IdleBackoff, core_for_slot, try_pin_core};
use std::sync::Arc;
use std::thread;

/// Drives registered nodes from a fixed pool of worker threads.
///
/// Worker `w` of `n` handles the nodes at positions `w, w + n, ...` of each
/// cycle's snapshot; the thread calling [`spin`](Executor::spin) acts as
/// worker 0. A node never runs on two workers at once: a worker that finds
/// the node busy skips it for that cycle.
#[derive(Debug)]
pub struct MultiThreadedExecutor {
    core: ExecutorCore,
    workers: usize,
}

impl MultiThreadedExecutor {
    pub fn new(config: ExecutorConfig, cancel: &CancelToken) -> Self {
        let workers = config.worker_count();
        Self {
            core: ExecutorCore::new(config, cancel),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn run_worker(&self, worker: usize, workers: usize) {
        if let Some(core_id) = core_for_slot(self.core.config.core_ids.as_deref(), worker) {
            match try_pin_core(core_id) {
                Ok(core_id) => {
                    tracing::info!("[MtExecutor] worker {} pinned to core: {}", worker, core_id)
                }
                Err(e) => tracing::warn!("[MtExecutor] worker {} cannot pin core: {}", worker, e),
            }
        }

        let mut backoff = IdleBackoff::new(self.core.config.idle_sleep());
        while !self.core.should_stop() {
            let ran: usize = self
                .core
                .nodes
                .snapshot()
                .iter()
                .skip(worker)
                .step_by(workers)
                .map(|node| node.spin_some())
                .sum();
            if ran > 0 {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
        tracing::debug!("[MtExecutor] worker {} exited", worker);
    }
}

impl Executor for MultiThreadedExecutor {
    fn add_node(&self, node: &Arc<Node>) -> RuntimeResult<()> {
        self.core.nodes.add(node)?;
        tracing::debug!("[MtExecutor] node {} added", node.id());
        Ok(())
    }

    fn remove_node(&self, node: &Node) -> bool {
        self.core.nodes.remove(node.id())
    }

    fn spin(&self) {
        let Some(_running) = self.core.begin("MtExecutor") else {
            return;
        };
        let workers = self.workers;
        tracing::info!(
            "[MtExecutor] spinning {} nodes on {} workers",
            self.core.nodes.len(),
            workers
        );

        thread::scope(|scope| {
            for worker in 1..workers {
                let spawned = thread::Builder::new()
                    .name(format!("executor-{worker}"))
                    .spawn_scoped(scope, move || self.run_worker(worker, workers));
                if let Err(e) = spawned {
                    tracing::error!("[MtExecutor] failed to spawn worker {}: {}", worker, e);
                    self.core.stop("MtExecutor");
                    return;
                }
            }
            self.run_worker(0, workers);
        });

        tracing::info!("[MtExecutor] stopped");
    }

    fn stop(&self) {
        self.core.stop("MtExecutor");
    }

    fn is_running(&self) -> bool {
        self.core.is_running()
    }

    fn len(&self) -> usize {
        self.core.nodes.len()
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::MultiThreaded
    }
}
