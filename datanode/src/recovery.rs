//! Restart handling
//!
//! A replica moves through `Uninitialized -> LoadingSnapshot -> ReplayingLog ->
//! Ready`. The state machine refuses entries until the snapshot is installed,
//! and consensus resumes delivery right after the installed TermIndex.

use crate::container::operation::LogEntry;
use crate::container::storage::ContainerStorage;
use crate::error::RecoveryError;
use crate::state_machine::ContainerStateMachine;
use crate::term_index::TermIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Uninitialized,
    LoadingSnapshot,
    ReplayingLog,
    Ready,
}

impl RecoveryState {
    pub fn accepts_entries(&self) -> bool {
        matches!(self, RecoveryState::ReplayingLog | RecoveryState::Ready)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: u64,
    /// Entries covered by the installed snapshot
    pub skipped: u64,
}

pub struct RecoveryCoordinator {
    state: RecoveryState,
    installed: TermIndex,
    replay_target: Option<u64>,
}

impl Default for RecoveryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryCoordinator {
    pub fn new() -> Self {
        RecoveryCoordinator {
            state: RecoveryState::Uninitialized,
            installed: TermIndex::ZERO,
            replay_target: None,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// TermIndex of the snapshot installed on start, zero without one.
    pub fn installed(&self) -> TermIndex {
        self.installed
    }

    /// First index consensus has to deliver.
    pub fn resume_index(&self) -> u64 {
        self.installed.next_index()
    }

    /// Installs the latest snapshot, or empty state when there is none.
    ///
    /// An unreadable snapshot is fatal: the replica is halted and never falls
    /// back to a full replay.
    pub fn load_snapshot<S: ContainerStorage>(
        &mut self,
        sm: &ContainerStateMachine<S>,
    ) -> Result<TermIndex, RecoveryError> {
        self.expect(RecoveryState::Uninitialized)?;
        self.transition(sm, RecoveryState::LoadingSnapshot);

        let installed = match sm.latest_snapshot() {
            Some(snapshot) => {
                log::info!(
                    "replica {} restoring snapshot {} from {:?}",
                    sm.replica_id(),
                    snapshot.term_index,
                    snapshot.path
                );
                sm.install_snapshot(&snapshot).map(|_| snapshot.term_index)
            }
            None => {
                log::info!(
                    "replica {} has no snapshot, replaying from the start",
                    sm.replica_id()
                );
                sm.install_empty().map(|_| TermIndex::ZERO)
            }
        };
        let installed = match installed {
            Ok(installed) => installed,
            Err(e) => {
                sm.halt(None, sm.last_applied(), format!("recovery failed: {}", e));
                return Err(e.into());
            }
        };

        self.installed = installed;
        self.transition(sm, RecoveryState::ReplayingLog);
        Ok(installed)
    }

    /// Sets the last committed index consensus will replay before `Ready`.
    pub fn set_replay_target<S: ContainerStorage>(
        &mut self,
        sm: &ContainerStateMachine<S>,
        commit: u64,
    ) -> RecoveryState {
        if self.state == RecoveryState::ReplayingLog {
            log::info!(
                "replica {} replaying up to index {} from {}",
                sm.replica_id(),
                commit,
                self.installed
            );
            self.replay_target = Some(commit);
        }
        self.observe_applied(sm)
    }

    /// Moves to `Ready` once the replay target has been applied.
    pub fn observe_applied<S: ContainerStorage>(
        &mut self,
        sm: &ContainerStateMachine<S>,
    ) -> RecoveryState {
        if self.state != RecoveryState::ReplayingLog {
            return self.state;
        }
        if let Some(target) = self.replay_target {
            let applied = sm.last_applied();
            if applied.index >= target {
                log::info!(
                    "replica {} ready at {} (snapshot {})",
                    sm.replica_id(),
                    applied,
                    self.installed
                );
                self.transition(sm, RecoveryState::Ready);
            }
        }
        self.state
    }

    /// Applies committed entries during replay.
    ///
    /// Entries covered by the installed snapshot are skipped without touching
    /// the state machine.
    pub fn replay<S, I>(
        &mut self,
        sm: &ContainerStateMachine<S>,
        entries: I,
    ) -> Result<ReplayStats, RecoveryError>
    where
        S: ContainerStorage,
        I: IntoIterator<Item = LogEntry>,
    {
        self.expect(RecoveryState::ReplayingLog)?;
        let mut stats = ReplayStats::default();
        for entry in entries {
            if entry.term_index.index <= self.installed.index {
                stats.skipped += 1;
                continue;
            }
            sm.apply_entry(&entry).map_err(RecoveryError::Replay)?;
            stats.applied += 1;
        }
        self.observe_applied(sm);
        Ok(stats)
    }

    fn expect(&self, expected: RecoveryState) -> Result<(), RecoveryError> {
        if self.state != expected {
            return Err(RecoveryError::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn transition<S: ContainerStorage>(
        &mut self,
        sm: &ContainerStateMachine<S>,
        state: RecoveryState,
    ) {
        log::debug!(
            "replica {} recovery {:?} -> {:?}",
            sm.replica_id(),
            self.state,
            state
        );
        self.state = state;
        sm.set_recovery_state(state);
    }
}
