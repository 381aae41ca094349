use crate::transport::Qos;
use crate::utils::logger::LoggerConfig;
use anyhow::Context;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variables with this prefix override file values, nested keys
/// joined by `__` (`SPINRT_NODE__TOPIC_PREFIX=sim/`).
pub const ENV_PREFIX: &str = "SPINRT";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Route SIGINT/SIGTERM/SIGQUIT into the runtime's cancellation flag.
    pub handle_signals: bool,
    pub node: NodeConfig,
    pub executor: ExecutorConfig,
    pub logger: Option<LoggerConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            handle_signals: true,
            node: NodeConfig::default(),
            executor: ExecutorConfig::default(),
            logger: None,
        }
    }
}

impl RuntimeConfig {
    /// Load from a TOML, JSON or YAML file (picked by extension), then apply
    /// `SPINRT_*` overrides. Missing fields take defaults.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        Config::builder()
            .add_source(File::from(path))
            .add_source(Self::env_source())
            .build()
            .and_then(Config::try_deserialize)
            .with_context(|| format!("failed to load runtime config from {}", path.display()))
    }

    /// Defaults with `SPINRT_*` overrides only.
    pub fn from_env() -> anyhow::Result<Self> {
        Config::builder()
            .add_source(Self::env_source())
            .build()
            .and_then(Config::try_deserialize)
            .context("failed to load runtime config from environment")
    }

    fn env_source() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Prepended to every topic name before it reaches the transport.
    pub topic_prefix: String,
    /// Upper bound on how long a blocked spin waits before re-checking cancellation.
    pub poll_interval_us: u64,
    /// Buffer policy for subscriptions that do not set their own.
    pub buffer_policy: BufferPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "rt/".to_string(),
            poll_interval_us: 1_000,
            buffer_policy: BufferPolicy::Unbounded,
        }
    }
}

impl NodeConfig {
    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us.max(1))
    }

    pub fn topic_name(&self, topic: &str) -> String {
        format!("{}{}", self.topic_prefix, topic)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker threads of the multi-threaded executor; `None` means available parallelism.
    pub workers: Option<usize>,
    /// Cores to pin executor threads to, assigned round-robin by worker index.
    pub core_ids: Option<Vec<usize>>,
    /// Longest sleep of an idle executor cycle.
    pub idle_sleep_us: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: None,
            core_ids: None,
            idle_sleep_us: 100,
        }
    }
}

impl ExecutorConfig {
    #[inline]
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_sleep_us)
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }
}

/// What a subscription does with messages that arrive faster than they are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BufferPolicy {
    /// Keep everything.
    #[default]
    Unbounded,
    /// Evict the oldest buffered message to make room.
    DropOldest { capacity: usize },
    /// Discard the incoming message when full.
    DropNewest { capacity: usize },
}

impl BufferPolicy {
    #[inline]
    pub fn capacity(&self) -> Option<usize> {
        match self {
            BufferPolicy::Unbounded => None,
            BufferPolicy::DropOldest { capacity } | BufferPolicy::DropNewest { capacity } => {
                Some((*capacity).max(1))
            }
        }
    }
}

/// Per-subscription options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SubscriptionOptions {
    pub qos: Qos,
    /// Overrides [`NodeConfig::buffer_policy`] when set.
    pub buffer_policy: Option<BufferPolicy>,
}

impl SubscriptionOptions {
    pub fn with_buffer_policy(mut self, policy: BufferPolicy) -> Self {
        self.buffer_policy = Some(policy);
        self
    }

    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Reliability;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.handle_signals);
        assert_eq!(cfg.node.topic_prefix, "rt/");
        assert_eq!(cfg.node.poll_interval(), Duration::from_millis(1));
        assert_eq!(cfg.node.buffer_policy, BufferPolicy::Unbounded);
        assert_eq!(cfg.executor.idle_sleep(), Duration::from_micros(100));
        assert!(cfg.executor.worker_count() >= 1);
        assert_eq!(SubscriptionOptions::default().qos.history_depth, 10);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str(
            r#"{
                "handle_signals": false,
                "node": { "buffer_policy": { "kind": "drop_oldest", "capacity": 4 } },
                "executor": { "workers": 3, "core_ids": [0, 1] }
            }"#,
        )
        .unwrap();

        assert!(!cfg.handle_signals);
        assert_eq!(cfg.node.topic_prefix, "rt/");
        assert_eq!(cfg.node.buffer_policy, BufferPolicy::DropOldest { capacity: 4 });
        assert_eq!(cfg.executor.worker_count(), 3);
        assert_eq!(cfg.executor.core_ids, Some(vec![0, 1]));
        assert!(cfg.logger.is_none());
    }

    #[test]
    fn subscription_options_parse_qos() {
        let opts: SubscriptionOptions = serde_json::from_str(
            r#"{ "qos": { "reliability": "best_effort" }, "buffer_policy": { "kind": "drop_newest", "capacity": 0 } }"#,
        )
        .unwrap();
        assert_eq!(opts.qos.reliability, Reliability::BestEffort);
        assert_eq!(opts.qos.history_depth, 10);
        // zero capacity is treated as one slot
        assert_eq!(opts.buffer_policy.and_then(|p| p.capacity()), Some(1));
    }

    #[test]
    fn topic_names_are_prefixed() {
        let node = NodeConfig::default();
        assert_eq!(node.topic_name("chatter"), "rt/chatter");
    }

    #[test]
    fn from_file_reads_toml() {
        let path = std::env::temp_dir().join(format!("spinrt-cfg-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "handle_signals = false\n[node]\ntopic_prefix = \"sim/\"\npoll_interval_us = 250\n",
        )
        .unwrap();

        let cfg = RuntimeConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(!cfg.handle_signals);
        assert_eq!(cfg.node.topic_prefix, "sim/");
        assert_eq!(cfg.node.poll_interval(), Duration::from_micros(250));
    }
}
