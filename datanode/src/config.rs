use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::container::applier::RetryPolicy;
use crate::snapshot::{
    AnyTrigger, EntryCountTrigger, IntervalTrigger, RetentionPolicy, SnapshotTrigger,
};
use crate::state_machine::StateMachineConfig;

static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::new()))
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RaftConfig {
    pub tick_interval_ms: u64,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub mailbox_size: usize,
    /// Level of raft-rs internal logging
    pub log_level: String,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            tick_interval_ms: 100,
            election_tick: 10,
            heartbeat_tick: 3,
            mailbox_size: 4096,
            log_level: "info".to_string(),
        }
    }
}

impl RaftConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Capture after this many applied entries, 0 disables
    pub entry_threshold: u64,
    /// Capture after this many seconds with new entries, 0 disables
    pub interval_secs: u64,
    pub keep_last: usize,
    /// Snapshots at or above this index are never pruned
    pub retain_from_index: Option<u64>,
    /// How often the trigger is evaluated
    pub check_interval_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            entry_threshold: 1000,
            interval_secs: 60,
            keep_last: 2,
            retain_from_index: None,
            check_interval_ms: 100,
        }
    }
}

impl SnapshotConfig {
    pub fn trigger(&self) -> Box<dyn SnapshotTrigger> {
        let mut triggers: Vec<Box<dyn SnapshotTrigger>> = Vec::new();
        if self.entry_threshold > 0 {
            triggers.push(Box::new(EntryCountTrigger(self.entry_threshold)));
        }
        if self.interval_secs > 0 {
            triggers.push(Box::new(IntervalTrigger(Duration::from_secs(
                self.interval_secs,
            ))));
        }
        Box::new(AnyTrigger(triggers))
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            keep_last: self.keep_last,
            min_index: self.retain_from_index,
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        RetryConfig {
            attempts: policy.attempts,
            backoff_ms: policy.backoff.as_millis() as u64,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            attempts: config.attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    pub base_path: String,
    pub replicas: Vec<u64>,
    pub metrics_addr: String,
    /// Recent apply outcomes kept per replica to answer redeliveries
    pub outcome_window: usize,
    pub raft: RaftConfig,
    pub snapshot: SnapshotConfig,
    pub retry: RetryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::new()
    }
}

/// Everything one replica needs to start.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: u64,
    pub peers: Vec<u64>,
    pub base_path: PathBuf,
    pub raft: RaftConfig,
    pub snapshot: SnapshotConfig,
    pub state_machine: StateMachineConfig,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            base_path: "data".to_string(),
            replicas: vec![1, 2, 3],
            metrics_addr: "0.0.0.0:4010".to_string(),
            outcome_window: 1024,
            raft: RaftConfig::default(),
            snapshot: SnapshotConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Loads the config file, falling back to defaults when it is unusable.
    pub fn from_toml(path: &str) -> Self {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<RuntimeConfig>(&contents) {
                Ok(c) => c,
                Err(e) => {
                    warn!(
                        "Something went wrong parsing the runtime config file, {:?}",
                        e
                    );
                    RuntimeConfig::new()
                }
            },
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                RuntimeConfig::new()
            }
        };
        *instance().lock().unwrap_or_else(|e| e.into_inner()) = config.clone();
        config
    }

    pub fn node_config(&self, id: u64) -> NodeConfig {
        let mut state_machine = StateMachineConfig::new(id);
        state_machine.retry = RetryPolicy::from(&self.retry);
        state_machine.outcome_window = self.outcome_window;
        state_machine.retention = self.snapshot.retention();
        NodeConfig {
            id,
            peers: self.replicas.clone(),
            base_path: PathBuf::from(&self.base_path).join(format!("replica_{}", id)),
            raft: self.raft.clone(),
            snapshot: self.snapshot.clone(),
            state_machine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotProgress;
    use crate::term_index::TermIndex;
    use std::time::Instant;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            base_path = "/var/lib/datanode"
            replicas = [1, 2, 3, 4, 5]

            [snapshot]
            entry_threshold = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.replicas.len(), 5);
        assert_eq!(config.snapshot.entry_threshold, 50);
        assert_eq!(config.snapshot.keep_last, 2);
        assert_eq!(config.raft.election_tick, 10);

        let node = config.node_config(4);
        assert_eq!(node.base_path, PathBuf::from("/var/lib/datanode/replica_4"));
        assert_eq!(node.state_machine.replica_id, 4);
        assert_eq!(node.state_machine.retention.keep_last, 2);
        assert_eq!(node.state_machine.retention.min_index, None);
    }

    #[test]
    fn test_retained_index_reaches_retention() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [snapshot]
            keep_last = 1
            retain_from_index = 40
            "#,
        )
        .unwrap();
        let retention = config.node_config(2).state_machine.retention;
        assert_eq!(retention.keep_last, 1);
        assert_eq!(retention.min_index, Some(40));
    }

    #[test]
    fn test_loaded_file_becomes_instance() {
        let current = || instance().lock().unwrap().clone();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("datanode.toml");
        std::fs::write(
            &path,
            "replicas = [7, 8, 9]\nmetrics_addr = \"127.0.0.1:9100\"\n",
        )
        .unwrap();

        let loaded = RuntimeConfig::from_toml(path.to_str().unwrap());
        assert_eq!(loaded.replicas, vec![7, 8, 9]);
        assert_eq!(current().replicas, vec![7, 8, 9]);
        assert_eq!(current().metrics_addr, "127.0.0.1:9100");

        // A missing file falls back to defaults and replaces the old instance.
        let config = RuntimeConfig::from_toml("/nonexistent/datanode.toml");
        assert_eq!(config.replicas, vec![1, 2, 3]);
        assert_eq!(config.metrics_addr, "0.0.0.0:4010");
        assert_eq!(current().replicas, vec![1, 2, 3]);
    }

    #[test]
    fn test_trigger_from_thresholds() {
        let mut snapshot = SnapshotConfig::default();
        snapshot.entry_threshold = 3;
        snapshot.interval_secs = 0;
        let trigger = snapshot.trigger();
        let progress = |applied_since| SnapshotProgress {
            last_applied: TermIndex::new(1, applied_since),
            last_snapshot: None,
            applied_since,
            since: Instant::now(),
        };
        assert!(!trigger.is_due(&progress(2)));
        assert!(trigger.is_due(&progress(3)));

        snapshot.entry_threshold = 0;
        assert!(!snapshot.trigger().is_due(&progress(100)));
    }
}
