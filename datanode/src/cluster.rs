//! A replica group running in one process
//!
//! Replicas talk through the in-process `Router` and keep their data under
//! `<base_path>/replica_<id>`, so a stopped replica can be started again from
//! its snapshot and raft log.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::time::{self, Duration, Instant};

use crate::config::RuntimeConfig;
use crate::container::operation::Operation;
use crate::container::storage::FileContainerStorage;
use crate::error::{ProposeError, RecoveryError};
use crate::raft::{Node, NodeHandle, ProposeResult, Router};
use crate::state_machine::ContainerStateMachine;
use crate::term_index::TermIndex;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub type Replica = NodeHandle<FileContainerStorage>;

pub struct LocalCluster {
    config: RuntimeConfig,
    router: Router,
    nodes: BTreeMap<u64, Replica>,
}

impl LocalCluster {
    /// Starts every replica listed in `config`.
    pub fn start(config: RuntimeConfig) -> Result<Self, RecoveryError> {
        let mut cluster = LocalCluster {
            config,
            router: Router::new(),
            nodes: BTreeMap::new(),
        };
        for id in cluster.config.replicas.clone() {
            cluster.start_node(id)?;
        }
        Ok(cluster)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Ids of the replicas currently started.
    pub fn ids(&self) -> Vec<u64> {
        self.nodes.keys().copied().collect()
    }

    pub fn node(&self, id: u64) -> Option<&Replica> {
        self.nodes.get(&id)
    }

    pub fn state_machine(&self, id: u64) -> Option<Arc<ContainerStateMachine<FileContainerStorage>>> {
        self.nodes.get(&id).map(|node| node.state_machine().clone())
    }

    pub fn start_node(&mut self, id: u64) -> Result<(), RecoveryError> {
        if self.nodes.contains_key(&id) {
            return Ok(());
        }
        let config = self.config.node_config(id);
        let storage = FileContainerStorage::new(&config.base_path)?;
        let handle = Node::start(config, storage, &self.router)?;
        self.nodes.insert(id, handle);
        Ok(())
    }

    /// Stops a replica and returns the TermIndex it had applied.
    pub async fn stop_node(&mut self, id: u64) -> Option<TermIndex> {
        let node = self.nodes.remove(&id)?;
        let state_machine = node.state_machine().clone();
        node.stop().await;
        Some(state_machine.last_applied())
    }

    pub async fn restart(&mut self, id: u64) -> Result<(), RecoveryError> {
        if let Some(applied) = self.stop_node(id).await {
            log::info!("restarting replica {} stopped at {}", id, applied);
        }
        self.start_node(id)
    }

    /// The replica that currently considers itself leader.
    pub fn leader(&self) -> Option<u64> {
        self.nodes
            .values()
            .find(|node| node.is_running() && node.is_leader())
            .map(|node| node.id())
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<u64> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader() {
                return Some(leader);
            }
            if Instant::now() >= deadline {
                return None;
            }
            time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Proposes `op` through the leader, retrying across elections.
    pub async fn propose(&self, op: &Operation, timeout: Duration) -> ProposeResult {
        let data = op
            .encode()
            .map_err(|e| ProposeError::Encode(e.to_string()))?;
        self.propose_raw(data, timeout).await
    }

    pub async fn propose_raw(&self, data: Vec<u8>, timeout: Duration) -> ProposeResult {
        let deadline = Instant::now() + timeout;
        loop {
            let result = match self.leader().and_then(|id| self.nodes.get(&id)) {
                Some(leader) => {
                    match time::timeout_at(deadline, leader.propose_raw(data.clone())).await {
                        Ok(result) => result,
                        Err(_) => return Err(ProposeError::Dropped),
                    }
                }
                None => Err(ProposeError::NotLeader),
            };
            match result {
                Err(ProposeError::NotLeader) | Err(ProposeError::Dropped)
                    if Instant::now() < deadline =>
                {
                    time::sleep(POLL_INTERVAL).await;
                }
                other => return other,
            }
        }
    }

    /// Waits until every started replica applied `index`.
    pub async fn wait_applied(&self, index: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let caught_up = self
                .nodes
                .values()
                .all(|node| node.state_machine().last_applied().index >= index);
            if caught_up {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stops every replica; each takes a final snapshot.
    pub async fn shutdown(mut self) {
        for id in self.ids() {
            self.stop_node(id).await;
        }
    }
}
