//! Transaction applier
//!
//! Applies one committed operation to container storage and advances the
//! watermark. The storage write happens first; the applied `ContainerSet` and
//! its watermark are then updated under a single write lock, so readers see
//! either the state before the entry or the state after it.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use crate::container::data::{ChunkInfo, Container, ContainerMeta, ContainerSet, ContainerState};
use crate::container::operation::{LogEntry, Operation};
use crate::container::storage::ContainerStorage;
use crate::error::ApplyError;
use crate::term_index::TermIndex;

/// Deterministic rejection reasons; every replica reaches the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerResult {
    ContainerExists,
    ContainerNotFound,
    ContainerClosed,
    ContainerOpen,
    ContainerNotEmpty,
    ChunkNotFound,
    InvalidChunkName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Rejected(ContainerResult),
    /// Redelivery of an entry older than the recorded outcome window
    AlreadyApplied,
}

impl ApplyOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::Rejected(_) => "rejected",
            ApplyOutcome::AlreadyApplied => "duplicate",
        }
    }
}

/// Bounded retry of storage writes before the replica gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Upper bound on the time one entry spends backing off, whatever the policy.
pub const MAX_TOTAL_BACKOFF: Duration = Duration::from_secs(1);

impl RetryPolicy {
    /// Pause before retrying after `attempt` failures, given `spent` so far.
    pub fn delay(&self, attempt: u32, spent: Duration) -> Duration {
        self.backoff
            .saturating_mul(attempt)
            .min(MAX_TOTAL_BACKOFF.saturating_sub(spent))
    }
}

enum Effect {
    None,
    Put(ContainerMeta),
    WriteChunk {
        meta: ContainerMeta,
        chunk: String,
        data: Bytes,
    },
    DeleteChunk {
        meta: ContainerMeta,
        chunk: String,
    },
    Remove(u64),
}

struct Plan {
    outcome: ApplyOutcome,
    effect: Effect,
}

impl Plan {
    fn applied(effect: Effect) -> Self {
        Plan {
            outcome: ApplyOutcome::Applied,
            effect,
        }
    }

    fn rejected(result: ContainerResult) -> Self {
        Plan {
            outcome: ApplyOutcome::Rejected(result),
            effect: Effect::None,
        }
    }
}

fn valid_chunk_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(|c: char| c == '/' || c == '\\' || c == '\0')
}

pub struct TransactionApplier<S: ContainerStorage> {
    storage: Arc<S>,
    state: Arc<RwLock<ContainerSet>>,
    retry: RetryPolicy,
    recent: VecDeque<(TermIndex, ApplyOutcome)>,
    recent_capacity: usize,
}

impl<S: ContainerStorage> TransactionApplier<S> {
    pub fn new(
        storage: Arc<S>,
        state: Arc<RwLock<ContainerSet>>,
        retry: RetryPolicy,
        recent_capacity: usize,
    ) -> Self {
        TransactionApplier {
            storage,
            state,
            retry,
            recent: VecDeque::with_capacity(recent_capacity.min(1024)),
            recent_capacity,
        }
    }

    pub fn last_applied(&self) -> TermIndex {
        self.read_state().last_applied()
    }

    /// Decodes and applies a committed entry.
    pub fn apply_entry(&mut self, entry: &LogEntry) -> Result<ApplyOutcome, ApplyError> {
        let term_index = entry.term_index;
        if term_index.index <= self.last_applied().index {
            return self.redelivered(term_index);
        }
        let op = Operation::decode(&entry.data).map_err(|e| ApplyError::Corrupt {
            term_index,
            reason: format!("undecodable operation: {}", e),
        })?;
        self.apply(&op, term_index)
    }

    /// Applies `op` as the entry at `term_index`.
    ///
    /// Re-applying an index at or below the watermark is a no-op that returns
    /// the outcome recorded the first time.
    pub fn apply(
        &mut self,
        op: &Operation,
        term_index: TermIndex,
    ) -> Result<ApplyOutcome, ApplyError> {
        let applied = self.last_applied();
        if term_index.index <= applied.index {
            return self.redelivered(term_index);
        }
        if term_index.index != applied.next_index() {
            return Err(ApplyError::OutOfOrder {
                expected: applied.next_index(),
                got: term_index,
            });
        }
        if term_index.term < applied.term {
            return Err(ApplyError::Corrupt {
                term_index,
                reason: format!("term went backwards from {}", applied),
            });
        }
        op.verify()
            .map_err(|reason| ApplyError::Corrupt { term_index, reason })?;

        let plan = Self::plan(&self.read_state(), op, term_index);
        self.persist(&plan.effect, term_index)?;

        {
            let mut state = self.write_state();
            Self::commit(&mut state, plan.effect);
            state.set_last_applied(term_index);
        }
        log::debug!(
            "applied {} at {}: {:?}",
            op.kind(),
            term_index,
            plan.outcome
        );
        self.record(term_index, plan.outcome.clone());
        Ok(plan.outcome)
    }

    /// Replaces storage and applied state with an installed snapshot.
    pub fn install(&mut self, set: ContainerSet) -> io::Result<()> {
        let term_index = set.last_applied();
        self.with_retry(term_index, |storage| storage.reset(&set))
            .map_err(|(_, e)| e)?;
        *self.write_state() = set;
        self.recent.clear();
        Ok(())
    }

    fn redelivered(&self, term_index: TermIndex) -> Result<ApplyOutcome, ApplyError> {
        match self
            .recent
            .iter()
            .rev()
            .find(|(recorded, _)| recorded.index == term_index.index)
        {
            Some((recorded, outcome)) if *recorded == term_index => {
                log::debug!("ignoring redelivered entry {}", term_index);
                Ok(outcome.clone())
            }
            Some((recorded, _)) => Err(ApplyError::Corrupt {
                term_index,
                reason: format!("index already applied as {}", recorded),
            }),
            None => Ok(ApplyOutcome::AlreadyApplied),
        }
    }

    fn record(&mut self, term_index: TermIndex, outcome: ApplyOutcome) {
        if self.recent_capacity == 0 {
            return;
        }
        if self.recent.len() == self.recent_capacity {
            self.recent.pop_front();
        }
        self.recent.push_back((term_index, outcome));
    }

    fn plan(state: &ContainerSet, op: &Operation, term_index: TermIndex) -> Plan {
        match op {
            Operation::Noop => Plan::applied(Effect::None),
            Operation::CreateContainer {
                container_id,
                metadata,
            } => {
                if state.get(*container_id).is_some() {
                    return Plan::rejected(ContainerResult::ContainerExists);
                }
                Plan::applied(Effect::Put(ContainerMeta::new(
                    *container_id,
                    metadata.clone(),
                    term_index,
                )))
            }
            Operation::WriteChunk {
                container_id,
                chunk,
                data,
                checksum,
            } => {
                let mut meta = match Self::open_container(state, *container_id) {
                    Ok(meta) => meta,
                    Err(result) => return Plan::rejected(result),
                };
                if !valid_chunk_name(chunk) {
                    return Plan::rejected(ContainerResult::InvalidChunkName);
                }
                meta.chunks.insert(
                    chunk.clone(),
                    ChunkInfo {
                        len: data.len() as u64,
                        checksum: checksum.clone(),
                        written_at: term_index,
                    },
                );
                meta.bcs_id = term_index;
                Plan::applied(Effect::WriteChunk {
                    meta,
                    chunk: chunk.clone(),
                    data: data.clone(),
                })
            }
            Operation::DeleteChunk {
                container_id,
                chunk,
            } => {
                let mut meta = match Self::open_container(state, *container_id) {
                    Ok(meta) => meta,
                    Err(result) => return Plan::rejected(result),
                };
                if meta.chunks.remove(chunk).is_none() {
                    return Plan::rejected(ContainerResult::ChunkNotFound);
                }
                meta.bcs_id = term_index;
                Plan::applied(Effect::DeleteChunk {
                    meta,
                    chunk: chunk.clone(),
                })
            }
            Operation::UpdateMetadata {
                container_id,
                set,
                remove,
            } => {
                let mut meta = match Self::open_container(state, *container_id) {
                    Ok(meta) => meta,
                    Err(result) => return Plan::rejected(result),
                };
                for key in remove {
                    meta.metadata.remove(key);
                }
                meta.metadata
                    .extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));
                meta.bcs_id = term_index;
                Plan::applied(Effect::Put(meta))
            }
            Operation::CloseContainer { container_id } => match state.get(*container_id) {
                None => Plan::rejected(ContainerResult::ContainerNotFound),
                Some(c) if !c.meta.is_open() => Plan::applied(Effect::None),
                Some(c) => {
                    let mut meta = c.meta.clone();
                    meta.state = ContainerState::Closed;
                    meta.bcs_id = term_index;
                    Plan::applied(Effect::Put(meta))
                }
            },
            Operation::DeleteContainer {
                container_id,
                force,
            } => match state.get(*container_id) {
                None => Plan::rejected(ContainerResult::ContainerNotFound),
                Some(c) if !force && c.meta.is_open() => {
                    Plan::rejected(ContainerResult::ContainerOpen)
                }
                Some(c) if !force && !c.meta.chunks.is_empty() => {
                    Plan::rejected(ContainerResult::ContainerNotEmpty)
                }
                Some(_) => Plan::applied(Effect::Remove(*container_id)),
            },
        }
    }

    fn open_container(state: &ContainerSet, id: u64) -> Result<ContainerMeta, ContainerResult> {
        match state.get(id) {
            None => Err(ContainerResult::ContainerNotFound),
            Some(c) if !c.meta.is_open() => Err(ContainerResult::ContainerClosed),
            Some(c) => Ok(c.meta.clone()),
        }
    }

    fn persist(&self, effect: &Effect, term_index: TermIndex) -> Result<(), ApplyError> {
        self.with_retry(term_index, |storage| match effect {
            Effect::None => Ok(()),
            Effect::Put(meta) => storage.put_container(meta),
            Effect::WriteChunk { meta, chunk, data } => {
                storage.write_chunk(meta.id, chunk, data)?;
                storage.put_container(meta)
            }
            Effect::DeleteChunk { meta, chunk } => {
                storage.put_container(meta)?;
                storage.delete_chunk(meta.id, chunk)
            }
            Effect::Remove(id) => storage.remove_container(*id),
        })
        .map_err(|(attempts, source)| ApplyError::IoFailure {
            term_index,
            attempts,
            source,
        })
    }

    fn with_retry<F>(&self, term_index: TermIndex, mut f: F) -> Result<(), (u32, io::Error)>
    where
        F: FnMut(&S) -> io::Result<()>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        let mut spent = Duration::ZERO;
        loop {
            attempt += 1;
            match f(&self.storage) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    log::warn!(
                        "storage write for {} failed (attempt {}/{}): {}",
                        term_index,
                        attempt,
                        attempts,
                        e
                    );
                    let delay = self.retry.delay(attempt, spent);
                    spent += delay;
                    thread::sleep(delay);
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }

    fn commit(state: &mut ContainerSet, effect: Effect) {
        match effect {
            Effect::None => {}
            Effect::Put(meta) => match state.get_mut(meta.id) {
                Some(container) => container.meta = meta,
                None => state.insert(Container::new(meta)),
            },
            Effect::WriteChunk { meta, chunk, data } => {
                if let Some(container) = state.get_mut(meta.id) {
                    container.meta = meta;
                    container.chunks.insert(chunk, data);
                }
            }
            Effect::DeleteChunk { meta, chunk } => {
                if let Some(container) = state.get_mut(meta.id) {
                    container.meta = meta;
                    container.chunks.remove(&chunk);
                }
            }
            Effect::Remove(id) => {
                state.remove(id);
            }
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ContainerSet> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ContainerSet> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::operation::checksum;
    use crate::container::storage::MemContainerStorage;
    use std::collections::BTreeMap;

    fn applier(
        retry: RetryPolicy,
    ) -> (
        TransactionApplier<MemContainerStorage>,
        Arc<MemContainerStorage>,
        Arc<RwLock<ContainerSet>>,
    ) {
        let storage = Arc::new(MemContainerStorage::new());
        let state = Arc::new(RwLock::new(ContainerSet::new()));
        let applier = TransactionApplier::new(storage.clone(), state.clone(), retry, 16);
        (applier, storage, state)
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_create_write_read() {
        let (mut applier, storage, state) = applier(fast_retry(1));
        let t = |i| TermIndex::new(1, i);
        assert_eq!(
            applier.apply(&Operation::create_container(1), t(1)).unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(
            applier
                .apply(&Operation::write_chunk(1, "c0", &b"abc"[..]), t(2))
                .unwrap(),
            ApplyOutcome::Applied
        );

        let state = state.read().unwrap();
        assert_eq!(state.last_applied(), t(2));
        assert_eq!(state.read_chunk(1, "c0").unwrap(), &b"abc"[..]);
        assert_eq!(state.get(1).unwrap().meta.bcs_id, t(2));
        assert_eq!(storage.chunk(1, "c0").unwrap(), &b"abc"[..]);
        assert_eq!(storage.meta(1).unwrap().chunks["c0"].checksum, checksum(b"abc"));
    }

    #[test]
    fn test_semantic_rejections_still_advance() {
        let (mut applier, _, _) = applier(fast_retry(1));
        let t = |i| TermIndex::new(2, i);
        let cases = vec![
            (
                Operation::write_chunk(5, "c", &b"x"[..]),
                ApplyOutcome::Rejected(ContainerResult::ContainerNotFound),
            ),
            (Operation::create_container(5), ApplyOutcome::Applied),
            (
                Operation::create_container(5),
                ApplyOutcome::Rejected(ContainerResult::ContainerExists),
            ),
            (
                Operation::write_chunk(5, "../escape", &b"x"[..]),
                ApplyOutcome::Rejected(ContainerResult::InvalidChunkName),
            ),
            (
                Operation::DeleteChunk {
                    container_id: 5,
                    chunk: "missing".to_string(),
                },
                ApplyOutcome::Rejected(ContainerResult::ChunkNotFound),
            ),
            (
                Operation::DeleteContainer {
                    container_id: 5,
                    force: false,
                },
                ApplyOutcome::Rejected(ContainerResult::ContainerOpen),
            ),
            (
                Operation::CloseContainer { container_id: 5 },
                ApplyOutcome::Applied,
            ),
            (
                Operation::CloseContainer { container_id: 5 },
                ApplyOutcome::Applied,
            ),
            (
                Operation::write_chunk(5, "c", &b"x"[..]),
                ApplyOutcome::Rejected(ContainerResult::ContainerClosed),
            ),
            (
                Operation::DeleteContainer {
                    container_id: 5,
                    force: false,
                },
                ApplyOutcome::Applied,
            ),
        ];
        for (i, (op, expected)) in cases.into_iter().enumerate() {
            let index = i as u64 + 1;
            assert_eq!(applier.apply(&op, t(index)).unwrap(), expected, "{:?}", op);
            assert_eq!(applier.last_applied(), t(index));
        }
    }

    #[test]
    fn test_update_metadata() {
        let (mut applier, storage, state) = applier(fast_retry(1));
        let mut metadata = BTreeMap::new();
        metadata.insert("owner".to_string(), "ozone".to_string());
        metadata.insert("tmp".to_string(), "1".to_string());
        applier
            .apply(
                &Operation::CreateContainer {
                    container_id: 3,
                    metadata,
                },
                TermIndex::new(1, 1),
            )
            .unwrap();
        let mut set = BTreeMap::new();
        set.insert("owner".to_string(), "hdds".to_string());
        applier
            .apply(
                &Operation::UpdateMetadata {
                    container_id: 3,
                    set,
                    remove: vec!["tmp".to_string()],
                },
                TermIndex::new(1, 2),
            )
            .unwrap();

        let meta = state.read().unwrap().get(3).unwrap().meta.clone();
        assert_eq!(meta.metadata.len(), 1);
        assert_eq!(meta.metadata["owner"], "hdds");
        assert_eq!(storage.meta(3).unwrap(), meta);
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let (mut applier, storage, state) = applier(fast_retry(1));
        let create = Operation::create_container(1);
        let first = applier.apply(&create, TermIndex::new(1, 1)).unwrap();
        let writes = storage.writes();
        let before = state.read().unwrap().clone();

        let second = applier.apply(&create, TermIndex::new(1, 1)).unwrap();
        assert_eq!(first, second);
        assert_eq!(storage.writes(), writes);
        assert_eq!(*state.read().unwrap(), before);

        let entry = LogEntry::from_operation(TermIndex::new(1, 1), &create).unwrap();
        assert_eq!(applier.apply_entry(&entry).unwrap(), first);
    }

    #[test]
    fn test_redelivery_with_other_term_is_corrupt() {
        let (mut applier, _, _) = applier(fast_retry(1));
        applier.apply(&Operation::Noop, TermIndex::new(1, 1)).unwrap();
        let err = applier.apply(&Operation::Noop, TermIndex::new(2, 1)).unwrap_err();
        assert!(matches!(err, ApplyError::Corrupt { .. }));
    }

    #[test]
    fn test_gap_is_rejected() {
        let (mut applier, _, _) = applier(fast_retry(1));
        let err = applier.apply(&Operation::Noop, TermIndex::new(1, 2)).unwrap_err();
        match err {
            ApplyError::OutOfOrder { expected, got } => {
                assert_eq!(expected, 1);
                assert_eq!(got, TermIndex::new(1, 2));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(applier.last_applied().is_zero());
    }

    #[test]
    fn test_corrupt_entry_does_not_advance() {
        let (mut applier, _, _) = applier(fast_retry(1));
        applier.apply(&Operation::Noop, TermIndex::new(1, 1)).unwrap();
        let entry = LogEntry::new(TermIndex::new(1, 2), vec![0xde, 0xad]);
        let err = applier.apply_entry(&entry).unwrap_err();
        assert!(matches!(err, ApplyError::Corrupt { .. }));
        assert_eq!(applier.last_applied(), TermIndex::new(1, 1));

        let tampered = Operation::WriteChunk {
            container_id: 1,
            chunk: "c".to_string(),
            data: Bytes::from_static(b"bad"),
            checksum: checksum(b"good"),
        };
        assert!(applier.apply(&tampered, TermIndex::new(1, 2)).is_err());
        assert_eq!(applier.last_applied(), TermIndex::new(1, 1));
    }

    #[test]
    fn test_transient_io_failure_is_retried() {
        let (mut applier, storage, _) = applier(fast_retry(3));
        storage.inject_failures(2);
        assert_eq!(
            applier
                .apply(&Operation::create_container(1), TermIndex::new(1, 1))
                .unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(storage.ids(), vec![1]);
    }

    #[test]
    fn test_exhausted_retries_fail_without_advancing() {
        let (mut applier, storage, state) = applier(fast_retry(2));
        storage.inject_failures(5);
        let err = applier
            .apply(&Operation::create_container(1), TermIndex::new(1, 1))
            .unwrap_err();
        match err {
            ApplyError::IoFailure { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(state.read().unwrap().is_empty());
        assert!(applier.last_applied().is_zero());
    }

    #[test]
    fn test_backoff_is_bounded_per_entry() {
        let policy = RetryPolicy {
            attempts: 1000,
            backoff: Duration::from_secs(30),
        };
        let mut spent = Duration::ZERO;
        for attempt in 1..policy.attempts {
            spent += policy.delay(attempt, spent);
        }
        assert_eq!(spent, MAX_TOTAL_BACKOFF);
        assert_eq!(policy.delay(1000, spent), Duration::ZERO);

        let small = fast_retry(3);
        assert_eq!(small.delay(2, Duration::ZERO), Duration::from_millis(2));
    }

    #[test]
    fn test_old_redelivery_outside_window() {
        let storage = Arc::new(MemContainerStorage::new());
        let state = Arc::new(RwLock::new(ContainerSet::new()));
        let mut applier = TransactionApplier::new(storage, state, fast_retry(1), 2);
        for i in 1..=4 {
            applier.apply(&Operation::Noop, TermIndex::new(1, i)).unwrap();
        }
        assert_eq!(
            applier.apply(&Operation::Noop, TermIndex::new(1, 1)).unwrap(),
            ApplyOutcome::AlreadyApplied
        );
    }
}
