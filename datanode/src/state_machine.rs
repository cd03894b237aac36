//! State machine implementation for the datanode
//!
//! `ContainerStateMachine` is the single integration point the consensus layer
//! drives. It applies committed entries in delivery order, captures snapshots
//! alongside the apply stream and answers watermark and snapshot queries for
//! restart handling and verification tooling.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::container::applier::{ApplyOutcome, RetryPolicy, TransactionApplier};
use crate::container::data::{ContainerMeta, ContainerSet};
use crate::container::operation::LogEntry;
use crate::container::storage::{ContainerStorage, FileContainerStorage};
use crate::error::{ApplyError, HaltReason, SnapshotError};
use crate::metrics;
use crate::recovery::RecoveryState;
use crate::snapshot::{
    ExplicitTrigger, RetentionPolicy, Snapshot, SnapshotProgress, SnapshotStore, SnapshotTrigger,
};
use crate::term_index::TermIndex;

#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    pub replica_id: u64,
    pub retry: RetryPolicy,
    /// Number of recent outcomes kept to answer redeliveries
    pub outcome_window: usize,
    pub retention: RetentionPolicy,
}

impl StateMachineConfig {
    pub fn new(replica_id: u64) -> Self {
        StateMachineConfig {
            replica_id,
            retry: RetryPolicy::default(),
            outcome_window: 1024,
            retention: RetentionPolicy::default(),
        }
    }
}

/// Point-in-time view of a replica for operational tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub replica_id: u64,
    pub last_applied: TermIndex,
    pub latest_snapshot: Option<TermIndex>,
    pub recovery: RecoveryState,
    pub halted: Option<HaltReason>,
}

/// Timing of the most recent successful capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub term_index: TermIndex,
    /// Time the applied state was held to fix the capture boundary
    pub pause: Duration,
    pub total: Duration,
}

struct CaptureProgress {
    last_snapshot: Option<TermIndex>,
    base_index: u64,
    since: Instant,
    last_stats: Option<CaptureStats>,
}

/// Clears the in-flight flag when a capture ends, successfully or not.
struct CaptureGuard<'a>(&'a AtomicBool);

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A snapshot may not move the watermark back, neither as a TermIndex nor
/// by index alone.
fn ensure_not_behind(installed: TermIndex, offered: TermIndex) -> Result<(), SnapshotError> {
    if offered < installed || offered.index < installed.index {
        return Err(SnapshotError::Regression { installed, offered });
    }
    Ok(())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ContainerStateMachine<S: ContainerStorage = FileContainerStorage> {
    config: StateMachineConfig,
    label: String,
    state: Arc<RwLock<ContainerSet>>,
    applier: Mutex<TransactionApplier<S>>,
    snapshots: SnapshotStore,
    progress: Mutex<CaptureProgress>,
    capturing: AtomicBool,
    recovery: RwLock<RecoveryState>,
    halted: RwLock<Option<HaltReason>>,
}

impl<S: ContainerStorage> ContainerStateMachine<S> {
    /// Creates a state machine that accepts no entries until recovery ran.
    pub fn new(config: StateMachineConfig, storage: Arc<S>, snapshots: SnapshotStore) -> Self {
        let state = Arc::new(RwLock::new(ContainerSet::new()));
        let applier = TransactionApplier::new(
            storage,
            state.clone(),
            config.retry,
            config.outcome_window,
        );
        let last_snapshot = snapshots.latest().map(|s| s.term_index);
        let label = config.replica_id.to_string();
        metrics::HALTED_GAUGE_VEC.with_label_values(&[&label]).set(0);
        ContainerStateMachine {
            label,
            config,
            state,
            applier: Mutex::new(applier),
            snapshots,
            progress: Mutex::new(CaptureProgress {
                last_snapshot,
                base_index: 0,
                since: Instant::now(),
                last_stats: None,
            }),
            capturing: AtomicBool::new(false),
            recovery: RwLock::new(RecoveryState::Uninitialized),
            halted: RwLock::new(None),
        }
    }

    pub fn replica_id(&self) -> u64 {
        self.config.replica_id
    }

    /// Applies a committed entry; entries must arrive in consensus order.
    ///
    /// Any error other than `NotReady` halts the replica: later calls fail
    /// with `ApplyError::Halted`.
    pub fn apply_entry(&self, entry: &LogEntry) -> Result<ApplyOutcome, ApplyError> {
        if let Some(reason) = self.halt_reason() {
            return Err(ApplyError::Halted(reason));
        }
        let recovery = self.recovery_state();
        if !recovery.accepts_entries() {
            return Err(ApplyError::NotReady(recovery));
        }

        let mut applier = lock(&self.applier);
        let result = metrics::record_duration(&metrics::APPLY_HISTOGRAM_VEC, &self.label, || {
            applier.apply_entry(entry)
        });
        match result {
            Ok(outcome) => {
                metrics::APPLY_COUNTER_VEC
                    .with_label_values(&[&self.label, outcome.label()])
                    .inc();
                metrics::LAST_APPLIED_GAUGE_VEC
                    .with_label_values(&[&self.label])
                    .set(applier.last_applied().index as i64);
                Ok(outcome)
            }
            Err(e) => {
                self.halt(e.term_index(), applier.last_applied(), e.to_string());
                Err(e)
            }
        }
    }

    /// The watermark: TermIndex of the last applied entry.
    pub fn last_applied(&self) -> TermIndex {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last_applied()
    }

    /// Captures a snapshot if `trigger` says so and there is something new.
    ///
    /// Only the clone of the applied state holds the state lock; serialization
    /// and I/O run while entries keep being applied.
    pub fn take_snapshot_if_due(
        &self,
        trigger: &dyn SnapshotTrigger,
    ) -> Result<Option<Snapshot>, SnapshotError> {
        if !self.is_snapshot_due(trigger) {
            return Ok(None);
        }
        if self
            .capturing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("replica {} capture already in flight", self.label);
            return Ok(None);
        }
        let _capturing = CaptureGuard(&self.capturing);

        let started = Instant::now();
        let frozen = self
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let pause = started.elapsed();
        metrics::SNAPSHOT_PAUSE_HISTOGRAM_VEC
            .with_label_values(&[&self.label])
            .observe(pause.as_secs_f64());

        let term_index = frozen.last_applied();
        match self.snapshots.capture(&frozen, term_index) {
            Ok(snapshot) => {
                let stats = CaptureStats {
                    term_index,
                    pause,
                    total: started.elapsed(),
                };
                metrics::SNAPSHOT_HISTOGRAM_VEC
                    .with_label_values(&[&self.label])
                    .observe(stats.total.as_secs_f64());
                metrics::SNAPSHOT_COUNTER_VEC
                    .with_label_values(&[&self.label, "ok"])
                    .inc();
                self.note_captured(stats);
                log::info!(
                    "replica {} captured snapshot {} (pause {:?}, total {:?})",
                    self.label,
                    term_index,
                    stats.pause,
                    stats.total
                );
                if let Err(e) = self.snapshots.prune(&self.config.retention) {
                    log::warn!("replica {} failed to prune snapshots: {}", self.label, e);
                }
                Ok(Some(snapshot))
            }
            Err(e) => {
                metrics::SNAPSHOT_COUNTER_VEC
                    .with_label_values(&[&self.label, "failed"])
                    .inc();
                log::warn!(
                    "replica {} snapshot at {} aborted, keeping previous: {}",
                    self.label,
                    term_index,
                    e
                );
                Err(e)
            }
        }
    }

    /// Whether `trigger` asks for a capture and there is anything to capture.
    pub fn is_snapshot_due(&self, trigger: &dyn SnapshotTrigger) -> bool {
        if self.is_halted() || !self.recovery_state().accepts_entries() {
            return false;
        }
        let progress = self.snapshot_progress();
        !progress.last_applied.is_zero()
            && progress.last_snapshot != Some(progress.last_applied)
            && trigger.is_due(&progress)
    }

    /// Captures a snapshot of everything applied so far.
    pub fn take_snapshot(&self) -> Result<Option<Snapshot>, SnapshotError> {
        self.take_snapshot_if_due(&ExplicitTrigger)
    }

    /// Replaces the applied state with a published snapshot.
    ///
    /// Entries are not accepted while the install runs. A snapshot older than
    /// the current watermark is refused.
    pub fn install_snapshot(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let mut applier = lock(&self.applier);
        ensure_not_behind(applier.last_applied(), snapshot.term_index)?;
        let _pin = self.snapshots.pin(snapshot);
        let set: ContainerSet = self.snapshots.load(snapshot)?;
        if set.last_applied() != snapshot.term_index {
            return Err(SnapshotError::Corrupt {
                path: snapshot.path.clone(),
                reason: format!(
                    "payload reflects {}, snapshot is {}",
                    set.last_applied(),
                    snapshot.term_index
                ),
            });
        }
        applier
            .install(set)
            .map_err(|source| SnapshotError::Install {
                term_index: snapshot.term_index,
                source,
            })?;
        self.reset_progress(Some(snapshot.term_index));
        log::info!(
            "replica {} installed snapshot {} from {:?}",
            self.label,
            snapshot.term_index,
            snapshot.path
        );
        Ok(())
    }

    /// Resets container storage for a replica that has no snapshot yet.
    pub fn install_empty(&self) -> Result<(), SnapshotError> {
        let mut applier = lock(&self.applier);
        let installed = applier.last_applied();
        if !installed.is_zero() {
            return Err(SnapshotError::Regression {
                installed,
                offered: TermIndex::ZERO,
            });
        }
        applier
            .install(ContainerSet::new())
            .map_err(|source| SnapshotError::Install {
                term_index: TermIndex::ZERO,
                source,
            })?;
        self.reset_progress(None);
        Ok(())
    }

    /// Imports a snapshot shipped by the consensus layer and installs it.
    pub fn install_transferred(&self, raw: &[u8]) -> Result<Snapshot, SnapshotError> {
        let offered = SnapshotStore::verify_transferred(raw)?;
        ensure_not_behind(self.last_applied(), offered)?;
        let snapshot = self.snapshots.import(raw)?;
        self.install_snapshot(&snapshot)?;
        Ok(snapshot)
    }

    pub fn snapshot_store(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn latest_snapshot(&self) -> Option<Snapshot> {
        self.snapshots.latest()
    }

    pub fn snapshot_file_for(&self, term: u64, index: u64) -> PathBuf {
        self.snapshots.snapshot_file_for(term, index)
    }

    pub fn last_capture_stats(&self) -> Option<CaptureStats> {
        lock(&self.progress).last_stats
    }

    pub fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            replica_id: self.config.replica_id,
            last_applied: self.last_applied(),
            latest_snapshot: self.latest_snapshot().map(|s| s.term_index),
            recovery: self.recovery_state(),
            halted: self.halt_reason(),
        }
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        self.halted
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_halted(&self) -> bool {
        self.halt_reason().is_some()
    }

    pub fn recovery_state(&self) -> RecoveryState {
        *self.recovery.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn read_chunk(&self, container_id: u64, chunk: &str) -> Option<Bytes> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .read_chunk(container_id, chunk)
    }

    pub fn container(&self, container_id: u64) -> Option<ContainerMeta> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(container_id)
            .map(|c| c.meta.clone())
    }

    pub fn container_ids(&self) -> Vec<u64> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).ids()
    }

    pub(crate) fn set_recovery_state(&self, state: RecoveryState) {
        *self.recovery.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub(crate) fn halt(&self, at: Option<TermIndex>, last_applied: TermIndex, message: String) {
        let reason = HaltReason {
            at,
            last_applied,
            message,
        };
        log::error!("replica {} halted: {}", self.label, reason);
        metrics::HALTED_GAUGE_VEC
            .with_label_values(&[&self.label])
            .set(1);
        let mut halted = self.halted.write().unwrap_or_else(|e| e.into_inner());
        if halted.is_none() {
            *halted = Some(reason);
        }
    }

    /// Records a finished capture unless a newer snapshot was installed
    /// while it ran.
    fn note_captured(&self, stats: CaptureStats) {
        let mut progress = lock(&self.progress);
        progress.last_stats = Some(stats);
        if progress
            .last_snapshot
            .map_or(true, |last| last < stats.term_index)
        {
            progress.last_snapshot = Some(stats.term_index);
            progress.since = Instant::now();
        }
    }

    fn snapshot_progress(&self) -> SnapshotProgress {
        let last_applied = self.last_applied();
        let progress = lock(&self.progress);
        let from = progress
            .last_snapshot
            .map_or(progress.base_index, |s| s.index);
        SnapshotProgress {
            last_applied,
            last_snapshot: progress.last_snapshot,
            applied_since: last_applied.index.saturating_sub(from),
            since: progress.since,
        }
    }

    fn reset_progress(&self, installed: Option<TermIndex>) {
        let mut progress = lock(&self.progress);
        progress.last_snapshot = installed;
        progress.base_index = installed.map_or(0, |t| t.index);
        progress.since = Instant::now();
        metrics::LAST_APPLIED_GAUGE_VEC
            .with_label_values(&[&self.label])
            .set(progress.base_index as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::operation::Operation;
    use crate::container::storage::MemContainerStorage;
    use crate::recovery::RecoveryCoordinator;
    use crate::snapshot::EntryCountTrigger;
    use std::thread;
    use tempfile::TempDir;

    fn ready_state_machine(dir: &TempDir) -> ContainerStateMachine<MemContainerStorage> {
        let snapshots = SnapshotStore::open(dir.path().join("sm")).unwrap();
        let sm = ContainerStateMachine::new(
            StateMachineConfig::new(1),
            Arc::new(MemContainerStorage::new()),
            snapshots,
        );
        let mut recovery = RecoveryCoordinator::new();
        recovery.load_snapshot(&sm).unwrap();
        recovery.set_replay_target(&sm, 0);
        sm
    }

    fn entry(index: u64, op: &Operation) -> LogEntry {
        LogEntry::from_operation(TermIndex::new(1, index), op).unwrap()
    }

    #[test]
    fn test_entries_refused_before_recovery() {
        let dir = TempDir::new().unwrap();
        let sm = ContainerStateMachine::new(
            StateMachineConfig::new(1),
            Arc::new(MemContainerStorage::new()),
            SnapshotStore::open(dir.path()).unwrap(),
        );
        assert!(sm.apply_entry(&LogEntry::noop(TermIndex::new(1, 1))).is_err());
        assert!(sm.last_applied().is_zero());
    }

    #[test]
    fn test_snapshot_taken_only_when_due() {
        let dir = TempDir::new().unwrap();
        let sm = ready_state_machine(&dir);
        let trigger = EntryCountTrigger(3);
        assert!(sm.take_snapshot_if_due(&trigger).unwrap().is_none());

        sm.apply_entry(&entry(1, &Operation::create_container(1))).unwrap();
        sm.apply_entry(&entry(2, &Operation::write_chunk(1, "c", &b"data"[..])))
            .unwrap();
        assert!(sm.take_snapshot_if_due(&trigger).unwrap().is_none());

        sm.apply_entry(&entry(3, &Operation::Noop)).unwrap();
        let snapshot = sm.take_snapshot_if_due(&trigger).unwrap().unwrap();
        assert_eq!(snapshot.term_index, sm.last_applied());
        assert_eq!(snapshot.path, sm.snapshot_file_for(1, 3));
        assert_eq!(sm.last_capture_stats().unwrap().term_index, snapshot.term_index);

        // Nothing new since the last capture.
        assert!(sm.take_snapshot().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_entry_halts_replica() {
        let dir = TempDir::new().unwrap();
        let sm = ready_state_machine(&dir);
        sm.apply_entry(&entry(1, &Operation::create_container(1))).unwrap();

        let err = sm
            .apply_entry(&LogEntry::new(TermIndex::new(1, 2), vec![0xba, 0xd0]))
            .unwrap_err();
        assert!(matches!(err, ApplyError::Corrupt { .. }));

        let status = sm.status();
        assert_eq!(status.last_applied, TermIndex::new(1, 1));
        let reason = status.halted.unwrap();
        assert_eq!(reason.at, Some(TermIndex::new(1, 2)));
        assert_eq!(reason.last_applied, TermIndex::new(1, 1));

        let err = sm.apply_entry(&entry(2, &Operation::Noop)).unwrap_err();
        assert!(matches!(err, ApplyError::Halted(_)));
        assert_eq!(sm.last_applied(), TermIndex::new(1, 1));
        assert!(sm.take_snapshot().unwrap().is_none());
    }

    #[test]
    fn test_install_rejects_regression() {
        let dir = TempDir::new().unwrap();
        let sm = ready_state_machine(&dir);
        for i in 1..=2 {
            sm.apply_entry(&entry(i, &Operation::Noop)).unwrap();
        }
        let older = sm.take_snapshot().unwrap().unwrap();
        for i in 3..=5 {
            sm.apply_entry(&entry(i, &Operation::Noop)).unwrap();
        }
        let newer = sm.take_snapshot().unwrap().unwrap();

        let err = sm.install_snapshot(&older).unwrap_err();
        assert!(matches!(err, SnapshotError::Regression { .. }));
        assert_eq!(sm.last_applied(), newer.term_index);
        sm.install_snapshot(&newer).unwrap();
        assert_eq!(sm.last_applied(), newer.term_index);

        // A later term does not make up for a lower index.
        let leader_dir = TempDir::new().unwrap();
        let leader = ready_state_machine(&leader_dir);
        for i in 1..=3 {
            leader
                .apply_entry(&LogEntry::noop(TermIndex::new(2, i)))
                .unwrap();
        }
        let behind = leader.take_snapshot().unwrap().unwrap();
        assert_eq!(behind.term_index, TermIndex::new(2, 3));
        let raw = leader.snapshot_store().read_raw(&behind).unwrap();

        let err = sm.install_transferred(&raw).unwrap_err();
        assert!(matches!(err, SnapshotError::Regression { .. }));
        assert_eq!(sm.last_applied(), TermIndex::new(1, 5));
        assert_eq!(sm.latest_snapshot().unwrap().term_index, newer.term_index);
        assert!(!sm.snapshot_file_for(2, 3).exists());
    }

    #[test]
    fn test_finished_capture_keeps_newer_install() {
        let dir = TempDir::new().unwrap();
        let sm = ready_state_machine(&dir);
        for i in 1..=4 {
            sm.apply_entry(&entry(i, &Operation::Noop)).unwrap();
        }
        let snapshot = sm.take_snapshot().unwrap().unwrap();
        sm.install_snapshot(&snapshot).unwrap();

        // A capture of an older state finishing after the install.
        sm.note_captured(CaptureStats {
            term_index: TermIndex::new(1, 2),
            pause: Duration::ZERO,
            total: Duration::ZERO,
        });
        assert!(!sm.is_snapshot_due(&ExplicitTrigger));
        assert_eq!(sm.last_capture_stats().unwrap().term_index, TermIndex::new(1, 2));
    }

    #[test]
    fn test_new_instance_clears_halted_gauge() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemContainerStorage::new());
        let config = StateMachineConfig::new(9_001);
        let halted = || metrics::HALTED_GAUGE_VEC.with_label_values(&["9001"]).get();

        let sm = ContainerStateMachine::new(
            config.clone(),
            storage.clone(),
            SnapshotStore::open(dir.path()).unwrap(),
        );
        sm.halt(None, TermIndex::ZERO, "disk gone".to_string());
        assert_eq!(halted(), 1);

        let restarted = ContainerStateMachine::new(
            config,
            storage,
            SnapshotStore::open(dir.path()).unwrap(),
        );
        assert!(!restarted.is_halted());
        assert_eq!(halted(), 0);
    }

    #[test]
    fn test_transferred_snapshot_fast_forwards() {
        let leader_dir = TempDir::new().unwrap();
        let leader = ready_state_machine(&leader_dir);
        leader
            .apply_entry(&entry(1, &Operation::create_container(4)))
            .unwrap();
        leader
            .apply_entry(&entry(2, &Operation::write_chunk(4, "k", &b"v"[..])))
            .unwrap();
        let snapshot = leader.take_snapshot().unwrap().unwrap();
        let raw = leader.snapshot_store().read_raw(&snapshot).unwrap();

        let follower_dir = TempDir::new().unwrap();
        let follower = ready_state_machine(&follower_dir);
        let installed = follower.install_transferred(&raw).unwrap();
        assert_eq!(installed.term_index, TermIndex::new(1, 2));
        assert_eq!(follower.last_applied(), TermIndex::new(1, 2));
        assert_eq!(follower.read_chunk(4, "k").unwrap(), &b"v"[..]);
        assert_eq!(follower.latest_snapshot().unwrap().term_index, installed.term_index);

        follower.apply_entry(&entry(3, &Operation::Noop)).unwrap();
        assert_eq!(follower.last_applied().index, 3);
    }

    #[test]
    fn test_capture_runs_beside_apply_stream() {
        let dir = TempDir::new().unwrap();
        let sm = Arc::new(ready_state_machine(&dir));
        sm.apply_entry(&entry(1, &Operation::create_container(1))).unwrap();

        let writer = {
            let sm = sm.clone();
            thread::spawn(move || {
                for i in 2..=200u64 {
                    let op = Operation::write_chunk(1, format!("c{}", i), vec![i as u8; 64]);
                    sm.apply_entry(&entry(i, &op)).unwrap();
                }
            })
        };
        let mut captured = Vec::new();
        while !writer.is_finished() {
            if let Some(snapshot) = sm.take_snapshot().unwrap() {
                captured.push(snapshot);
            }
        }
        writer.join().unwrap();
        if let Some(snapshot) = sm.take_snapshot().unwrap() {
            captured.push(snapshot);
        }

        assert!(!captured.is_empty());
        for snapshot in captured.iter().filter(|s| s.path.exists()) {
            let set: ContainerSet = sm.snapshot_store().load(snapshot).unwrap();
            // Chunk c<i> was written by entry i: the payload holds exactly the
            // entries up to the captured index.
            assert_eq!(set.last_applied(), snapshot.term_index);
            let chunks = set.get(1).unwrap().chunks.len() as u64;
            assert_eq!(chunks, snapshot.term_index.index - 1);
        }
        assert_eq!(sm.last_applied().index, 200);
    }
}
