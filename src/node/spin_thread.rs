use super::Node;
use crate::utils::try_pin_core;
use anyhow::{Context, anyhow};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A node spinning on its own thread.
///
/// Dropping the guard stops the node and joins the thread.
pub struct SpinThread {
    node: Arc<Node>,
    join: Option<JoinHandle<()>>,
}

impl Node {
    /// Run [`Node::spin`] on a dedicated thread, optionally pinned to `core_id`.
    pub fn spawn_spin(self: &Arc<Self>, core_id: Option<usize>) -> anyhow::Result<SpinThread> {
        let node = self.clone();
        let join = thread::Builder::new()
            .name(format!("spin-{}", &self.id.as_str()[..8]))
            .spawn(move || {
                if let Some(core_id) = core_id {
                    match try_pin_core(core_id) {
                        Ok(core_id) => tracing::info!("[SpinThread] pinned to core: {}", core_id),
                        Err(e) => tracing::warn!("[SpinThread] cannot pin core: {}", e),
                    }
                }
                node.spin();
            })
            .context("failed to spawn spin thread")?;

        Ok(SpinThread {
            node: self.clone(),
            join: Some(join),
        })
    }
}

impl SpinThread {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop the node and join the thread.
    pub fn stop(mut self) -> anyhow::Result<()> {
        self.node.stop();
        self.join_inner()
    }

    /// Block until the node is stopped (locally or by process-wide
    /// cancellation), then join the thread.
    pub fn wait(mut self) -> anyhow::Result<()> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> anyhow::Result<()> {
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        join.join().map_err(|p| {
            anyhow!(
                "spin thread panicked: {}",
                p.downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| p.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic (unknown type)".into())
            )
        })
    }
}

impl Drop for SpinThread {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.node.stop();
            if let Err(e) = self.join_inner() {
                tracing::error!("[SpinThread] {}", e);
            }
        }
    }
}
