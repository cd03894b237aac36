use crate::container::storage::write_atomic;
use crate::raft::segment::Segment;
use crate::snapshot::SnapshotStore;
use crate::term_index::TermIndex;
use protobuf::Message;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{storage::MemStorage, GetEntriesContext, RaftState, Result, Storage, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const META_FILE: &str = "raft.meta";
const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_SUFFIX: &str = ".log";
const SEGMENT_ENTRIES: u64 = 4096;

fn store_err<E>(e: E) -> raft::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    raft::Error::Store(StorageError::Other(e.into()))
}

/// Durable raft state besides the entries themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct RaftMeta {
    term: u64,
    vote: u64,
    commit: u64,
    voters: Vec<u64>,
    learners: Vec<u64>,
    /// Entries up to and including this index were dropped from the log
    compacted: u64,
}

impl RaftMeta {
    fn hard_state(&self) -> HardState {
        let mut hs = HardState::default();
        hs.term = self.term;
        hs.vote = self.vote;
        hs.commit = self.commit;
        hs
    }

    fn conf_state(&self) -> ConfState {
        let mut cs = ConfState::default();
        cs.voters = self.voters.clone();
        cs.learners = self.learners.clone();
        cs
    }
}

/// Raft log storage: `MemStorage` in front of segment files.
///
/// Snapshots handed to raft are the state machine's own snapshot files, so
/// the log is only compacted up to a published state machine snapshot.
pub struct LogStore {
    mem_storage: MemStorage,
    segments: BTreeMap<u64, Segment>,
    base_path: PathBuf,
    snapshots: SnapshotStore,
    meta: RaftMeta,
}

impl LogStore {
    /// Opens the log of a replica whose state machine installed `installed`.
    ///
    /// Entries at or below `installed` are already reflected in the state
    /// machine and are not loaded again.
    pub fn open<P: AsRef<Path>>(
        base_path: P,
        voters: &[u64],
        snapshots: SnapshotStore,
        installed: TermIndex,
    ) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        let meta_path = base_path.join(META_FILE);
        let mut meta = if meta_path.exists() {
            let bytes = fs::read(&meta_path)?;
            bincode::deserialize::<RaftMeta>(&bytes).map_err(store_err)?
        } else {
            RaftMeta {
                voters: voters.to_vec(),
                ..Default::default()
            }
        };
        if meta.compacted > installed.index {
            return Err(store_err(format!(
                "log compacted to {} but state machine restored only {}",
                meta.compacted, installed
            )));
        }

        let mem_storage = MemStorage::new();
        if installed.is_zero() {
            mem_storage.wl().set_conf_state(meta.conf_state());
        } else {
            let mut snapshot = Snapshot::default();
            snapshot.mut_metadata().index = installed.index;
            snapshot.mut_metadata().term = installed.term;
            snapshot.mut_metadata().set_conf_state(meta.conf_state());
            mem_storage.wl().apply_snapshot(snapshot)?;
        }

        let mut segments = BTreeMap::new();
        let mut entries = Vec::new();
        for (start_index, path) in Self::segment_files(&base_path)? {
            let mut segment = Segment::open(&path, start_index)?;
            if segment.is_empty() || segment.end_index() <= installed.index {
                segment.remove()?;
                continue;
            }
            for data in segment.read_all()? {
                let entry = Entry::parse_from_bytes(&data).map_err(store_err)?;
                if entry.index > installed.index {
                    entries.push(entry);
                }
            }
            segments.insert(start_index, segment);
        }

        if let Some(first) = entries.first() {
            if first.index != installed.index + 1 {
                return Err(store_err(format!(
                    "raft log resumes at {}, expected {}",
                    first.index,
                    installed.index + 1
                )));
            }
        }
        if !entries.is_empty() {
            mem_storage.wl().append(&entries)?;
        }

        let last_index = mem_storage.last_index()?;
        meta.term = meta.term.max(installed.term);
        meta.commit = meta.commit.max(installed.index).min(last_index);
        mem_storage.wl().set_hardstate(meta.hard_state());
        meta.compacted = installed.index;

        log::info!(
            "opened raft log at {:?}: entries ({}, {}], commit {}, term {}",
            base_path,
            installed.index,
            last_index,
            meta.commit,
            meta.term
        );

        let mut store = LogStore {
            mem_storage,
            segments,
            base_path,
            snapshots,
            meta,
        };
        store.persist_meta()?;
        Ok(store)
    }

    fn segment_files(base_path: &Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(base_path)? {
            let path = entry?.path();
            let start_index = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix(SEGMENT_PREFIX))
                .and_then(|name| name.strip_suffix(SEGMENT_SUFFIX))
                .and_then(|index| index.parse::<u64>().ok());
            match start_index {
                Some(start_index) => files.push((start_index, path)),
                None if path.is_file() && path.ends_with(META_FILE) => {}
                None => log::warn!("ignoring unexpected file {:?} in raft log", path),
            }
        }
        files.sort_by_key(|(start_index, _)| *start_index);
        Ok(files)
    }

    fn get_segment_path(&self, start_index: u64) -> PathBuf {
        self.base_path
            .join(format!("{}{}{}", SEGMENT_PREFIX, start_index, SEGMENT_SUFFIX))
    }

    fn persist_meta(&mut self) -> Result<()> {
        let bytes = bincode::serialize(&self.meta).map_err(store_err)?;
        write_atomic(&self.base_path.join(META_FILE), &bytes)?;
        Ok(())
    }

    /// Last committed index as persisted.
    pub fn commit(&self) -> u64 {
        self.meta.commit
    }

    /// Drops every persisted entry at `index` or later.
    fn truncate_from(&mut self, index: u64) -> Result<()> {
        let doomed: Vec<u64> = self.segments.range(index..).map(|(s, _)| *s).collect();
        for start_index in doomed {
            if let Some(segment) = self.segments.remove(&start_index) {
                segment.remove()?;
            }
        }
        if let Some((_, segment)) = self.segments.range_mut(..index).next_back() {
            segment.truncate_from(index)?;
        }
        Ok(())
    }

    /// Persists entries, replacing any conflicting suffix.
    pub fn append_entries(&mut self, entries: &[Entry]) -> Result<()> {
        let first = match entries.first() {
            Some(entry) => entry.index,
            None => return Ok(()),
        };
        self.truncate_from(first)?;

        let mut touched = Vec::new();
        let mut pending = entries.iter().peekable();
        while pending.peek().is_some() {
            let next = first_of(&mut pending);
            let tail = self
                .segments
                .iter()
                .next_back()
                .map(|(start, segment)| (*start, segment.len(), segment.end_index()));
            let start_index = match tail {
                Some((start, len, end)) if len < SEGMENT_ENTRIES && end + 1 == next => start,
                _ => {
                    let start_index = next;
                    let segment = Segment::open(self.get_segment_path(start_index), start_index)?;
                    self.segments.insert(start_index, segment);
                    start_index
                }
            };
            let segment = match self.segments.get_mut(&start_index) {
                Some(segment) => segment,
                None => return Err(store_err("segment vanished while appending")),
            };
            let room = SEGMENT_ENTRIES - segment.len();
            let mut batch = Vec::new();
            while (batch.len() as u64) < room {
                match pending.next() {
                    Some(entry) => batch.push(entry.write_to_bytes().map_err(store_err)?),
                    None => break,
                }
            }
            segment.append(&batch)?;
            touched.push(start_index);
        }
        for start_index in touched {
            if let Some(segment) = self.segments.get(&start_index) {
                segment.sync()?;
            }
        }

        self.mem_storage.wl().append(entries)?;
        Ok(())
    }

    pub fn set_hardstate(&mut self, hs: HardState) -> Result<()> {
        self.meta.term = hs.term;
        self.meta.vote = hs.vote;
        self.meta.commit = hs.commit;
        self.mem_storage.wl().set_hardstate(hs);
        self.persist_meta()
    }

    pub fn set_commit(&mut self, commit: u64) -> Result<()> {
        self.mem_storage.wl().mut_hard_state().commit = commit;
        self.meta.commit = commit;
        self.persist_meta()
    }

    pub fn set_conf_state(&mut self, conf_state: ConfState) -> Result<()> {
        self.meta.voters = conf_state.voters.clone();
        self.meta.learners = conf_state.learners.clone();
        self.mem_storage.wl().set_conf_state(conf_state);
        self.persist_meta()
    }

    /// Replaces the whole log with a snapshot received from the leader.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let metadata = snapshot.get_metadata();
        self.mem_storage.wl().apply_snapshot(snapshot.clone())?;
        for (_, segment) in std::mem::take(&mut self.segments) {
            segment.remove()?;
        }
        let hs = self.mem_storage.initial_state()?.hard_state;
        self.meta.term = hs.term;
        self.meta.vote = hs.vote;
        self.meta.commit = hs.commit;
        self.meta.voters = metadata.get_conf_state().voters.clone();
        self.meta.learners = metadata.get_conf_state().learners.clone();
        self.meta.compacted = metadata.index;
        self.persist_meta()
    }

    /// Discards entries before `index`, which must be covered by a published
    /// state machine snapshot.
    pub fn compact(&mut self, index: u64) -> Result<()> {
        let covered = self.snapshots.latest().map_or(0, |s| s.term_index.index);
        let index = index.min(covered).min(self.mem_storage.last_index()?);
        if index <= self.mem_storage.first_index()? {
            return Ok(());
        }
        self.mem_storage.wl().compact(index)?;

        let obsolete: Vec<u64> = self
            .segments
            .iter()
            .filter(|(_, segment)| segment.end_index() < index)
            .map(|(start, _)| *start)
            .collect();
        for start_index in obsolete {
            if let Some(segment) = self.segments.remove(&start_index) {
                segment.remove()?;
            }
        }
        self.meta.compacted = index - 1;
        self.persist_meta()?;
        log::debug!("compacted raft log before {}", index);
        Ok(())
    }
}

fn first_of<'a, I>(pending: &mut std::iter::Peekable<I>) -> u64
where
    I: Iterator<Item = &'a Entry>,
{
    pending.peek().map_or(0, |entry| entry.index)
}

impl Storage for LogStore {
    fn initial_state(&self) -> Result<RaftState> {
        self.mem_storage.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> Result<Vec<Entry>> {
        self.mem_storage.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> Result<u64> {
        self.mem_storage.term(idx)
    }

    fn first_index(&self) -> Result<u64> {
        self.mem_storage.first_index()
    }

    fn last_index(&self) -> Result<u64> {
        self.mem_storage.last_index()
    }

    /// Ships the latest state machine snapshot file.
    fn snapshot(&self, request_index: u64, _to: u64) -> Result<Snapshot> {
        let latest = match self.snapshots.latest() {
            Some(latest) if latest.term_index.index >= request_index => latest,
            _ => return Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable)),
        };
        let data = self.snapshots.read_raw(&latest).map_err(store_err)?;

        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = latest.term_index.index;
        snapshot.mut_metadata().term = latest.term_index.term;
        snapshot
            .mut_metadata()
            .set_conf_state(self.mem_storage.initial_state()?.conf_state);
        snapshot.set_data(data.into());
        Ok(snapshot)
    }
}
