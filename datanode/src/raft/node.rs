//! Raft node implementation
//!
//! A `Node` drives one replica: it steps raft messages, proposes operations,
//! persists the log and feeds committed entries to the container state
//! machine. Snapshots are captured off the loop and the log is compacted up to
//! each published snapshot.

#![allow(clippy::field_reassign_with_default)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use protobuf::Message as PbMessage;
use raft::{prelude::*, StateRole};
use slog::{o, Drain};
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::NodeConfig;
use crate::container::applier::ApplyOutcome;
use crate::container::operation::{LogEntry, Operation};
use crate::container::storage::ContainerStorage;
use crate::error::{ApplyError, NodeError, ProposeError, RecoveryError, SnapshotError};
use crate::raft::proposal::{Proposal, ProposeResult};
use crate::raft::router::Router;
use crate::raft::storage::LogStore;
use crate::recovery::RecoveryCoordinator;
use crate::snapshot::{SnapshotStore, SnapshotTrigger};
use crate::state_machine::ContainerStateMachine;
use crate::term_index::TermIndex;

const LOGGER_CHANNEL_SIZE: usize = 4096; // Size of logger channel buffer
const PROPOSAL_CHANNEL_SIZE: usize = 1024;

type CaptureResult = Result<Option<crate::snapshot::Snapshot>, SnapshotError>;

static RAFT_LOGGER: OnceCell<slog::Logger> = OnceCell::new();

/// Process-wide logger for raft-rs internals.
fn raft_logger(level: &str) -> &'static slog::Logger {
    RAFT_LOGGER.get_or_init(|| {
        let level = level.parse::<slog::Level>().unwrap_or(slog::Level::Info);
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain)
            .chan_size(LOGGER_CHANNEL_SIZE)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
            .fuse();
        slog::Logger::root(drain.filter_level(level).fuse(), o!())
    })
}

fn raft_config(config: &NodeConfig, applied: u64) -> Config {
    Config {
        id: config.id,
        election_tick: config.raft.election_tick,
        heartbeat_tick: config.raft.heartbeat_tick,
        applied,
        check_quorum: true,
        pre_vote: true,
        ..Default::default()
    }
}

/// Client side of a running replica.
pub struct NodeHandle<S: ContainerStorage + 'static> {
    id: u64,
    state_machine: Arc<ContainerStateMachine<S>>,
    proposals: Sender<Proposal>,
    leader_id: Arc<AtomicU64>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl<S: ContainerStorage + 'static> NodeHandle<S> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state_machine(&self) -> &Arc<ContainerStateMachine<S>> {
        &self.state_machine
    }

    /// Leader as last seen by this replica, 0 when unknown.
    pub fn leader_id(&self) -> u64 {
        self.leader_id.load(Ordering::Acquire)
    }

    pub fn is_leader(&self) -> bool {
        self.leader_id() == self.id
    }

    /// Whether the consensus loop is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |task| !task.is_finished())
    }

    /// Proposes `op` and waits until it is applied on this replica.
    pub async fn propose(&self, op: &Operation) -> ProposeResult {
        let (proposal, rx) = Proposal::normal(op)?;
        self.submit(proposal, rx).await
    }

    /// Proposes an encoded payload as is.
    pub async fn propose_raw(&self, data: Vec<u8>) -> ProposeResult {
        let (proposal, rx) = Proposal::raw(data);
        self.submit(proposal, rx).await
    }

    async fn submit(
        &self,
        proposal: Proposal,
        rx: oneshot::Receiver<ProposeResult>,
    ) -> ProposeResult {
        if self.state_machine.is_halted() {
            return Err(ProposeError::Halted);
        }
        self.proposals
            .send(proposal)
            .await
            .map_err(|_| ProposeError::Dropped)?;
        rx.await.unwrap_or(Err(ProposeError::Dropped))
    }

    /// Stops the replica after it took a final snapshot.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("replica {} task failed: {}", self.id, e);
            }
        }
    }
}

/// Raft node implementation
pub struct Node<S: ContainerStorage + 'static> {
    id: u64,
    config: NodeConfig,
    raft_group: RawNode<LogStore>,
    router: Router,
    my_mailbox: Receiver<Message>,
    proposals: Receiver<Proposal>,
    proposed: VecDeque<Proposal>,
    state_machine: Arc<ContainerStateMachine<S>>,
    recovery: RecoveryCoordinator,
    trigger: Arc<dyn SnapshotTrigger>,
    snapshot_task: Option<JoinHandle<()>>,
    snapshot_done_tx: UnboundedSender<CaptureResult>,
    snapshot_done: UnboundedReceiver<CaptureResult>,
    leader_id: Arc<AtomicU64>,
}

impl<S: ContainerStorage + 'static> Node<S> {
    /// Recovers the replica from its directory and starts its consensus loop.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(
        config: NodeConfig,
        storage: S,
        router: &Router,
    ) -> Result<NodeHandle<S>, RecoveryError> {
        let id = config.id;
        let snapshots = SnapshotStore::open(config.base_path.join("sm"))
            .map_err(RecoveryError::InstallFailure)?;
        let state_machine = Arc::new(ContainerStateMachine::new(
            config.state_machine.clone(),
            Arc::new(storage),
            snapshots.clone(),
        ));

        let mut recovery = RecoveryCoordinator::new();
        let installed = recovery.load_snapshot(&*state_machine)?;
        let store = LogStore::open(
            config.base_path.join("raft"),
            &config.peers,
            snapshots,
            installed,
        )?;
        recovery.set_replay_target(&*state_machine, store.commit());

        let logger = raft_logger(&config.raft.log_level).new(o!("tag" => format!("peer_{}", id)));
        let raft_group = RawNode::new(&raft_config(&config, installed.index), store, &logger)?;

        let (mailbox_tx, my_mailbox) = mpsc::channel(config.raft.mailbox_size.max(1));
        let (proposals_tx, proposals) = mpsc::channel(PROPOSAL_CHANNEL_SIZE);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (snapshot_done_tx, snapshot_done) = mpsc::unbounded_channel();
        let leader_id = Arc::new(AtomicU64::new(0));
        router.register(id, mailbox_tx);

        log::info!(
            "replica {} started from {}, resuming at index {}",
            id,
            installed,
            recovery.resume_index()
        );
        let node = Node {
            id,
            trigger: Arc::from(config.snapshot.trigger()),
            config,
            raft_group,
            router: router.clone(),
            my_mailbox,
            proposals,
            proposed: VecDeque::new(),
            state_machine: state_machine.clone(),
            recovery,
            snapshot_task: None,
            snapshot_done_tx,
            snapshot_done,
            leader_id: leader_id.clone(),
        };
        let task = tokio::spawn(node.run(stop_rx));

        Ok(NodeHandle {
            id,
            state_machine,
            proposals: proposals_tx,
            leader_id,
            stop: Some(stop_tx),
            task: Some(task),
        })
    }

    /// Main event loop that handles messages, proposals, and periodic tasks
    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        let mut ticker = time::interval(self.config.raft.tick_interval());
        let mut snapshot_check = time::interval(self.config.snapshot.check_interval());

        loop {
            tokio::select! {
                Some(msg) = self.my_mailbox.recv() => {
                    self.step(msg);
                    while let Ok(msg) = self.my_mailbox.try_recv() {
                        self.step(msg);
                    }
                }
                Some(proposal) = self.proposals.recv() => {
                    self.propose(proposal);
                    while let Ok(proposal) = self.proposals.try_recv() {
                        self.propose(proposal);
                    }
                }
                Some(result) = self.snapshot_done.recv() => {
                    self.on_snapshot_taken(result);
                }
                _ = ticker.tick() => {
                    self.raft_group.tick();
                }
                _ = snapshot_check.tick() => {
                    self.maybe_snapshot();
                }
                _ = &mut stop => {
                    self.shutdown().await;
                    return;
                }
            }

            if let Err(e) = self.on_ready() {
                self.on_fatal(e);
                return;
            }
            self.leader_id
                .store(self.raft_group.raft.leader_id, Ordering::Release);
        }
    }

    fn step(&mut self, msg: Message) {
        if let Err(e) = self.raft_group.step(msg) {
            log::debug!("replica {} ignored message: {}", self.id, e);
        }
    }

    /// Submits a new proposal to the Raft group if this node is the leader
    fn propose(&mut self, mut proposal: Proposal) {
        if self.raft_group.raft.state != StateRole::Leader {
            proposal.complete(Err(ProposeError::NotLeader));
            return;
        }

        let last_index = self.raft_group.raft.raft_log.last_index();
        let data = std::mem::take(&mut proposal.data);
        if let Err(e) = self.raft_group.propose(vec![], data) {
            log::warn!("replica {} dropped proposal: {}", self.id, e);
            proposal.complete(Err(ProposeError::Dropped));
            return;
        }

        let new_last_index = self.raft_group.raft.raft_log.last_index();
        if new_last_index == last_index {
            proposal.complete(Err(ProposeError::Dropped));
        } else {
            proposal.proposed = Some(TermIndex::new(self.raft_group.raft.term, new_last_index));
            self.proposed.push_back(proposal);
        }
    }

    /// Handles the ready state of the Raft node: entries and hard state are
    /// persisted before committed entries are applied.
    fn on_ready(&mut self) -> Result<(), NodeError> {
        if !self.raft_group.has_ready() {
            return Ok(());
        }

        let mut ready = self.raft_group.ready();

        if !ready.messages().is_empty() {
            self.router.send_all(ready.take_messages());
        }

        if *ready.snapshot() != Snapshot::default() {
            self.install_snapshot(ready.snapshot())?;
        }

        self.raft_group.mut_store().append_entries(ready.entries())?;
        if let Some(hs) = ready.hs() {
            self.raft_group.mut_store().set_hardstate(hs.clone())?;
        }
        if !ready.persisted_messages().is_empty() {
            self.router.send_all(ready.take_persisted_messages());
        }

        self.handle_committed_entries(ready.take_committed_entries())?;

        let mut light_rd = self.raft_group.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            self.raft_group.mut_store().set_commit(commit)?;
        }
        self.router.send_all(light_rd.take_messages());
        self.handle_committed_entries(light_rd.take_committed_entries())?;
        self.raft_group.advance_apply();
        Ok(())
    }

    /// Fast-forwards a lagging replica with the leader's snapshot.
    fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), NodeError> {
        let metadata = snapshot.get_metadata();
        let term_index = TermIndex::new(metadata.term, metadata.index);
        match self.state_machine.install_transferred(snapshot.get_data()) {
            Ok(installed) => {
                log::info!(
                    "replica {} installed transferred snapshot {}",
                    self.id,
                    installed.term_index
                );
            }
            Err(e) => {
                self.state_machine.halt(
                    Some(term_index),
                    self.state_machine.last_applied(),
                    format!("transferred snapshot: {}", e),
                );
                return Err(NodeError::Apply(ApplyError::Corrupt {
                    term_index,
                    reason: e.to_string(),
                }));
            }
        }
        self.raft_group.mut_store().apply_snapshot(snapshot)?;
        Ok(())
    }

    /// Applies committed entries to the state machine and handles configuration changes
    fn handle_committed_entries(&mut self, entries: Vec<Entry>) -> Result<(), NodeError> {
        if entries.is_empty() {
            return Ok(());
        }
        for entry in entries {
            let term_index = TermIndex::new(entry.term, entry.index);
            let log_entry = match entry.get_entry_type() {
                EntryType::EntryNormal => LogEntry::new(term_index, entry.get_data().to_vec()),
                EntryType::EntryConfChange => {
                    if !entry.get_data().is_empty() {
                        let mut cc = ConfChange::default();
                        cc.merge_from_bytes(entry.get_data())
                            .map_err(raft::Error::from)?;
                        let cs = self.raft_group.apply_conf_change(&cc)?;
                        self.raft_group.mut_store().set_conf_state(cs)?;
                    }
                    LogEntry::noop(term_index)
                }
                EntryType::EntryConfChangeV2 => {
                    if !entry.get_data().is_empty() {
                        let mut cc = ConfChangeV2::default();
                        cc.merge_from_bytes(entry.get_data())
                            .map_err(raft::Error::from)?;
                        let cs = self.raft_group.apply_conf_change(&cc)?;
                        self.raft_group.mut_store().set_conf_state(cs)?;
                    }
                    LogEntry::noop(term_index)
                }
            };

            let result = self.state_machine.apply_entry(&log_entry);
            self.notice_proposed(term_index, &result);
            result?;
        }
        self.recovery.observe_applied(&*self.state_machine);
        Ok(())
    }

    /// Reports outcomes to the proposals settled by applying `applied`.
    fn notice_proposed(&mut self, applied: TermIndex, result: &Result<ApplyOutcome, ApplyError>) {
        let mut i = 0;
        while i < self.proposed.len() {
            let settled = self.proposed[i]
                .proposed
                .filter(|proposed| proposed.index <= applied.index);
            let proposed = match settled {
                Some(proposed) => proposed,
                None => {
                    i += 1;
                    continue;
                }
            };
            if let Some(proposal) = self.proposed.remove(i) {
                let outcome = if proposed != applied {
                    // Another leader's entry took this index.
                    Err(ProposeError::Dropped)
                } else {
                    match result {
                        Ok(outcome) => Ok(outcome.clone()),
                        Err(_) => Err(ProposeError::Halted),
                    }
                };
                proposal.complete(outcome);
            }
        }
    }

    fn maybe_snapshot(&mut self) {
        if self
            .snapshot_task
            .as_ref()
            .map_or(false, |task| !task.is_finished())
        {
            return;
        }
        if !self.state_machine.is_snapshot_due(self.trigger.as_ref()) {
            return;
        }
        let state_machine = self.state_machine.clone();
        let trigger = self.trigger.clone();
        let done = self.snapshot_done_tx.clone();
        self.snapshot_task = Some(tokio::task::spawn_blocking(move || {
            let _ = done.send(state_machine.take_snapshot_if_due(trigger.as_ref()));
        }));
    }

    fn on_snapshot_taken(&mut self, result: CaptureResult) {
        match result {
            Ok(Some(snapshot)) => {
                if let Err(e) = self
                    .raft_group
                    .mut_store()
                    .compact(snapshot.term_index.index)
                {
                    log::warn!("replica {} failed to compact raft log: {}", self.id, e);
                }
            }
            Ok(None) => {}
            // Left due; the next check retries.
            Err(e) => log::debug!("replica {} capture failed: {}", self.id, e),
        }
    }

    /// Takes a final snapshot so a restart resumes exactly where this run stopped.
    async fn shutdown(&mut self) {
        if let Some(task) = self.snapshot_task.take() {
            let _ = task.await;
        }
        while let Ok(result) = self.snapshot_done.try_recv() {
            self.on_snapshot_taken(result);
        }

        if !self.state_machine.is_halted() {
            let state_machine = self.state_machine.clone();
            match tokio::task::spawn_blocking(move || state_machine.take_snapshot()).await {
                Ok(Ok(Some(snapshot))) => {
                    log::info!(
                        "replica {} took final snapshot {}",
                        self.id,
                        snapshot.term_index
                    );
                    self.on_snapshot_taken(Ok(Some(snapshot)));
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => log::error!("replica {} final snapshot failed: {}", self.id, e),
                Err(e) => log::error!("replica {} final snapshot task failed: {}", self.id, e),
            }
        }

        self.router.unregister(self.id);
        self.leader_id.store(0, Ordering::Release);
        self.fail_pending(ProposeError::Dropped);
        log::info!(
            "replica {} stopped at {}",
            self.id,
            self.state_machine.last_applied()
        );
    }

    /// Stops the replica without a final snapshot.
    fn on_fatal(&mut self, e: NodeError) {
        if !self.state_machine.is_halted() {
            self.state_machine.halt(
                None,
                self.state_machine.last_applied(),
                format!("consensus loop failed: {}", e),
            );
        }
        log::error!("replica {} stopped: {}", self.id, e);
        self.router.unregister(self.id);
        self.leader_id.store(0, Ordering::Release);
        self.fail_pending(ProposeError::Halted);
    }

    fn fail_pending(&mut self, error: ProposeError) {
        for proposal in self.proposed.drain(..) {
            proposal.complete(Err(error.clone()));
        }
        self.proposals.close();
        while let Ok(proposal) = self.proposals.try_recv() {
            proposal.complete(Err(error.clone()));
        }
    }
}
