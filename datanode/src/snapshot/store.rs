//! Durable state machine snapshots
//!
//! Every snapshot lives in its own file named after the TermIndex it captures,
//! `snapshot.<term>_<index>`. A snapshot is written to a `.tmp` sibling, synced
//! and renamed into place, so the rename is the publication point and the
//! latest snapshot is simply the highest published name.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::container::data::ContainerSet;
use crate::container::storage::write_atomic;
use crate::error::SnapshotError;
use crate::term_index::TermIndex;

const SNAPSHOT_PREFIX: &str = "snapshot.";
const TMP_SUFFIX: &str = ".tmp";
const MAGIC: u32 = 0x534e_4150;
const FORMAT_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotHeader {
    magic: u32,
    version: u16,
    term_index: TermIndex,
    payload_len: u64,
    digest: [u8; 32],
}

/// A published snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub term_index: TermIndex,
    pub path: PathBuf,
    /// File size in bytes, header included
    pub size: u64,
}

/// State that can be serialized into a snapshot payload.
pub trait SnapshotSource {
    fn encode_payload(&self) -> Result<Vec<u8>, String>;
}

impl SnapshotSource for ContainerSet {
    fn encode_payload(&self) -> Result<Vec<u8>, String> {
        bincode::serialize(self).map_err(|e| e.to_string())
    }
}

/// Which superseded snapshots `prune` may delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Newest snapshots always kept, the latest included
    pub keep_last: usize,
    /// Snapshots at or above this index are still needed by log retention
    pub min_index: Option<u64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            keep_last: 2,
            min_index: None,
        }
    }
}

struct Inner {
    dir: PathBuf,
    latest: RwLock<Option<Snapshot>>,
    pins: Mutex<HashMap<TermIndex, usize>>,
    // Single writer for capture, import and prune.
    publish: Mutex<()>,
}

/// Keeps a snapshot from being pruned while it is held.
pub struct SnapshotPin {
    inner: Arc<Inner>,
    term_index: TermIndex,
}

impl Drop for SnapshotPin {
    fn drop(&mut self) {
        let mut pins = lock(&self.inner.pins);
        if let Some(count) = pins.get_mut(&self.term_index) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.term_index);
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn parse_file_name(name: &str) -> Option<TermIndex> {
    let (term, index) = name.strip_prefix(SNAPSHOT_PREFIX)?.split_once('_')?;
    Some(TermIndex::new(term.parse().ok()?, index.parse().ok()?))
}

fn digest(payload: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha3_256::digest(payload));
    out
}

fn encode_file(term_index: TermIndex, payload: &[u8]) -> Result<Vec<u8>, String> {
    let header = SnapshotHeader {
        magic: MAGIC,
        version: FORMAT_VERSION,
        term_index,
        payload_len: payload.len() as u64,
        digest: digest(payload),
    };
    let mut raw = bincode::serialize(&header).map_err(|e| e.to_string())?;
    raw.extend_from_slice(payload);
    Ok(raw)
}

/// Validates a whole snapshot file and returns its TermIndex and payload.
fn decode_file<'a>(path: &Path, raw: &'a [u8]) -> Result<(TermIndex, &'a [u8]), SnapshotError> {
    let corrupt = |reason: String| SnapshotError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    let mut cursor = Cursor::new(raw);
    let header: SnapshotHeader = bincode::deserialize_from(&mut cursor)
        .map_err(|e| corrupt(format!("unreadable header: {}", e)))?;
    if header.magic != MAGIC {
        return Err(corrupt(format!("bad magic {:#x}", header.magic)));
    }
    if header.version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported version {}", header.version)));
    }
    let payload = &raw[cursor.position() as usize..];
    if payload.len() as u64 != header.payload_len {
        return Err(corrupt(format!(
            "payload is {} bytes, header says {}",
            payload.len(),
            header.payload_len
        )));
    }
    if digest(payload) != header.digest {
        return Err(corrupt("payload digest mismatch".to_string()));
    }
    Ok((header.term_index, payload))
}

#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<Inner>,
}

impl SnapshotStore {
    /// Opens the snapshot directory, discarding captures that never published.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, SnapshotError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| SnapshotError::WriteFailure {
            path: dir.clone(),
            source,
        })?;
        let store = SnapshotStore {
            inner: Arc::new(Inner {
                dir,
                latest: RwLock::new(None),
                pins: Mutex::new(HashMap::new()),
                publish: Mutex::new(()),
            }),
        };
        store.remove_temp_files()?;
        let latest = store.list()?.into_iter().last();
        if let Some(snapshot) = &latest {
            log::info!(
                "found latest snapshot {} at {:?}",
                snapshot.term_index,
                snapshot.path
            );
        }
        *store.inner.latest.write().unwrap_or_else(|e| e.into_inner()) = latest;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Path at which the snapshot for `(term, index)` is published.
    pub fn snapshot_file_for(&self, term: u64, index: u64) -> PathBuf {
        self.inner
            .dir
            .join(format!("{}{}_{}", SNAPSHOT_PREFIX, term, index))
    }

    /// The most recently published snapshot, if any.
    pub fn latest(&self) -> Option<Snapshot> {
        self.inner
            .latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Published snapshots, oldest first.
    pub fn list(&self) -> Result<Vec<Snapshot>, SnapshotError> {
        let read_err = |source: io::Error| SnapshotError::Read {
            path: self.inner.dir.clone(),
            source,
        };
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.inner.dir).map_err(read_err)? {
            let entry = entry.map_err(read_err)?;
            let term_index = match entry.file_name().to_str().and_then(parse_file_name) {
                Some(term_index) => term_index,
                None => continue,
            };
            let size = entry.metadata().map_err(read_err)?.len();
            snapshots.push(Snapshot {
                term_index,
                path: entry.path(),
                size,
            });
        }
        snapshots.sort_by_key(|s| s.term_index);
        Ok(snapshots)
    }

    /// Serializes `source` as the state at `term_index` and publishes it.
    ///
    /// On failure nothing is published and the previous latest stays valid.
    pub fn capture<S: SnapshotSource + ?Sized>(
        &self,
        source: &S,
        term_index: TermIndex,
    ) -> Result<Snapshot, SnapshotError> {
        let path = self.snapshot_file_for(term_index.term, term_index.index);
        let _writer = lock(&self.inner.publish);
        if let Some(existing) = self.existing(&path, term_index)? {
            return Ok(existing);
        }
        let raw = source
            .encode_payload()
            .and_then(|payload| encode_file(term_index, &payload))
            .map_err(|e| SnapshotError::WriteFailure {
                path: path.clone(),
                source: io::Error::new(io::ErrorKind::Other, e),
            })?;
        self.publish(path, term_index, &raw)
    }

    /// Verifies a snapshot file received from another replica and returns
    /// its TermIndex without storing it.
    pub fn verify_transferred(raw: &[u8]) -> Result<TermIndex, SnapshotError> {
        decode_file(Path::new("<transferred>"), raw).map(|(term_index, _)| term_index)
    }

    /// Publishes a snapshot file received from another replica.
    pub fn import(&self, raw: &[u8]) -> Result<Snapshot, SnapshotError> {
        let term_index = Self::verify_transferred(raw)?;
        let path = self.snapshot_file_for(term_index.term, term_index.index);
        let _writer = lock(&self.inner.publish);
        if let Some(existing) = self.existing(&path, term_index)? {
            return Ok(existing);
        }
        self.publish(path, term_index, raw)
    }

    /// Reads and verifies the payload of a snapshot.
    pub fn read_payload(&self, snapshot: &Snapshot) -> Result<Vec<u8>, SnapshotError> {
        let raw = self.read_raw(snapshot)?;
        let (term_index, payload) = decode_file(&snapshot.path, &raw)?;
        if term_index != snapshot.term_index {
            return Err(SnapshotError::Corrupt {
                path: snapshot.path.clone(),
                reason: format!("file holds {}, name says {}", term_index, snapshot.term_index),
            });
        }
        Ok(payload.to_vec())
    }

    /// Reads and decodes the payload of a snapshot.
    pub fn load<T: DeserializeOwned>(&self, snapshot: &Snapshot) -> Result<T, SnapshotError> {
        let payload = self.read_payload(snapshot)?;
        bincode::deserialize(&payload).map_err(|e| SnapshotError::Corrupt {
            path: snapshot.path.clone(),
            reason: format!("undecodable payload: {}", e),
        })
    }

    /// The snapshot file as stored, for transfer to another replica.
    pub fn read_raw(&self, snapshot: &Snapshot) -> Result<Vec<u8>, SnapshotError> {
        let _pin = self.pin(snapshot);
        fs::read(&snapshot.path).map_err(|source| SnapshotError::Read {
            path: snapshot.path.clone(),
            source,
        })
    }

    pub fn pin(&self, snapshot: &Snapshot) -> SnapshotPin {
        *lock(&self.inner.pins).entry(snapshot.term_index).or_insert(0) += 1;
        SnapshotPin {
            inner: self.inner.clone(),
            term_index: snapshot.term_index,
        }
    }

    /// Deletes superseded snapshots that `policy` no longer requires.
    ///
    /// The latest snapshot and pinned snapshots are never deleted.
    pub fn prune(&self, policy: &RetentionPolicy) -> Result<Vec<Snapshot>, SnapshotError> {
        let _writer = lock(&self.inner.publish);
        let latest = self.latest().map(|s| s.term_index);
        let pinned: Vec<TermIndex> = lock(&self.inner.pins).keys().copied().collect();

        let mut removed = Vec::new();
        let mut snapshots = self.list()?;
        snapshots.reverse();
        for (i, snapshot) in snapshots.into_iter().enumerate() {
            let keep = i < policy.keep_last.max(1)
                || Some(snapshot.term_index) == latest
                || pinned.contains(&snapshot.term_index)
                || policy
                    .min_index
                    .map_or(false, |min| snapshot.term_index.index >= min);
            if keep {
                continue;
            }
            match fs::remove_file(&snapshot.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(SnapshotError::WriteFailure {
                        path: snapshot.path,
                        source,
                    })
                }
            }
            log::info!("pruned snapshot {}", snapshot.term_index);
            removed.push(snapshot);
        }
        Ok(removed)
    }

    fn existing(
        &self,
        path: &Path,
        term_index: TermIndex,
    ) -> Result<Option<Snapshot>, SnapshotError> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(Snapshot {
                term_index,
                path: path.to_path_buf(),
                size: meta.len(),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SnapshotError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn publish(
        &self,
        path: PathBuf,
        term_index: TermIndex,
        raw: &[u8],
    ) -> Result<Snapshot, SnapshotError> {
        if let Err(source) = write_atomic(&path, raw) {
            let _ = fs::remove_file(tmp_path(&path));
            return Err(SnapshotError::WriteFailure { path, source });
        }
        let snapshot = Snapshot {
            term_index,
            path,
            size: raw.len() as u64,
        };
        let mut latest = self.inner.latest.write().unwrap_or_else(|e| e.into_inner());
        if latest
            .as_ref()
            .map_or(true, |current| current.term_index < term_index)
        {
            *latest = Some(snapshot.clone());
        }
        log::info!(
            "published snapshot {} ({} bytes) at {:?}",
            term_index,
            snapshot.size,
            snapshot.path
        );
        Ok(snapshot)
    }

    fn remove_temp_files(&self) -> Result<(), SnapshotError> {
        let entries = fs::read_dir(&self.inner.dir).map_err(|source| SnapshotError::Read {
            path: self.inner.dir.clone(),
            source,
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(SNAPSHOT_PREFIX) && name.ends_with(TMP_SUFFIX) {
                log::warn!("removing unpublished snapshot {}", name);
                fs::remove_file(entry.path()).map_err(|source| SnapshotError::WriteFailure {
                    path: entry.path(),
                    source,
                })?;
            }
        }
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TMP_SUFFIX);
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::data::{Container, ContainerMeta};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn state_at(term_index: TermIndex, containers: u64) -> ContainerSet {
        let mut set = ContainerSet::new();
        for id in 1..=containers {
            set.insert(Container::new(ContainerMeta::new(
                id,
                BTreeMap::new(),
                term_index,
            )));
        }
        set.set_last_applied(term_index);
        set
    }

    struct FailingSource;

    impl SnapshotSource for FailingSource {
        fn encode_payload(&self) -> Result<Vec<u8>, String> {
            Err("disk full".to_string())
        }
    }

    #[test]
    fn test_capture_publishes_latest() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(store.latest().is_none());

        let ti = TermIndex::new(2, 10);
        let snapshot = store.capture(&state_at(ti, 3), ti).unwrap();
        assert_eq!(snapshot.path, store.snapshot_file_for(2, 10));
        assert_eq!(snapshot.path.file_name().unwrap(), "snapshot.2_10");
        assert_eq!(store.latest(), Some(snapshot.clone()));

        let loaded: ContainerSet = store.load(&snapshot).unwrap();
        assert_eq!(loaded, state_at(ti, 3));
    }

    #[test]
    fn test_reopen_finds_same_latest_and_drops_temp_files() {
        let dir = TempDir::new().unwrap();
        let before = {
            let store = SnapshotStore::open(dir.path()).unwrap();
            let old = TermIndex::new(1, 4);
            store.capture(&state_at(old, 1), old).unwrap();
            let ti = TermIndex::new(1, 9);
            store.capture(&state_at(ti, 2), ti).unwrap()
        };
        let stray = dir.path().join("snapshot.1_12.tmp");
        fs::write(&stray, b"half written").unwrap();

        let store = SnapshotStore::open(dir.path()).unwrap();
        assert_eq!(store.latest(), Some(before));
        assert!(!stray.exists());
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_corruption_is_detected() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let ti = TermIndex::new(1, 3);
        let snapshot = store.capture(&state_at(ti, 2), ti).unwrap();

        let mut raw = fs::read(&snapshot.path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&snapshot.path, &raw).unwrap();
        let err = store.read_payload(&snapshot).unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt { .. }), "{:?}", err);

        raw.truncate(20);
        fs::write(&snapshot.path, &raw).unwrap();
        assert!(store.read_payload(&snapshot).unwrap_err().is_corruption());
    }

    #[test]
    fn test_failed_capture_keeps_previous_latest() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let ti = TermIndex::new(1, 5);
        let good = store.capture(&state_at(ti, 1), ti).unwrap();

        let err = store.capture(&FailingSource, TermIndex::new(1, 8)).unwrap_err();
        assert!(matches!(err, SnapshotError::WriteFailure { .. }));
        assert_eq!(store.latest(), Some(good.clone()));
        assert_eq!(store.list().unwrap(), vec![good]);
    }

    #[test]
    fn test_capture_is_idempotent_per_term_index() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let ti = TermIndex::new(3, 30);
        let first = store.capture(&state_at(ti, 1), ti).unwrap();
        let second = store.capture(&FailingSource, ti).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_prune_respects_policy_and_pins() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let snapshots: Vec<Snapshot> = (1..=6)
            .map(|i| {
                let ti = TermIndex::new(1, i * 10);
                store.capture(&state_at(ti, 1), ti).unwrap()
            })
            .collect();
        let _pin = store.pin(&snapshots[0]);

        let removed = store
            .prune(&RetentionPolicy {
                keep_last: 2,
                min_index: Some(40),
            })
            .unwrap();
        let removed: Vec<u64> = removed.iter().map(|s| s.term_index.index).collect();
        assert_eq!(removed, vec![30, 20]);

        let left: Vec<u64> = store
            .list()
            .unwrap()
            .iter()
            .map(|s| s.term_index.index)
            .collect();
        assert_eq!(left, vec![10, 40, 50, 60]);
        assert_eq!(store.latest().unwrap().term_index.index, 60);
    }

    #[test]
    fn test_prune_never_removes_latest() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let ti = TermIndex::new(1, 1);
        store.capture(&state_at(ti, 1), ti).unwrap();
        let removed = store
            .prune(&RetentionPolicy {
                keep_last: 0,
                min_index: None,
            })
            .unwrap();
        assert!(removed.is_empty());
        assert!(store.latest().unwrap().path.exists());
    }

    #[test]
    fn test_import_transferred_snapshot() {
        let leader_dir = TempDir::new().unwrap();
        let follower_dir = TempDir::new().unwrap();
        let leader = SnapshotStore::open(leader_dir.path()).unwrap();
        let follower = SnapshotStore::open(follower_dir.path()).unwrap();

        let ti = TermIndex::new(4, 44);
        let sent = leader.capture(&state_at(ti, 2), ti).unwrap();
        let raw = leader.read_raw(&sent).unwrap();
        let received = follower.import(&raw).unwrap();
        assert_eq!(received.term_index, ti);
        assert_eq!(received.path, follower.snapshot_file_for(4, 44));
        assert_eq!(
            follower.read_payload(&received).unwrap(),
            leader.read_payload(&sent).unwrap()
        );

        let mut tampered = raw.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        let other = TempDir::new().unwrap();
        let other = SnapshotStore::open(other.path()).unwrap();
        assert!(other.import(&tampered).unwrap_err().is_corruption());
        assert!(other.latest().is_none());
    }

    #[test]
    fn test_file_names() {
        assert_eq!(parse_file_name("snapshot.3_17"), Some(TermIndex::new(3, 17)));
        assert_eq!(parse_file_name("snapshot.3_17.tmp"), None);
        assert_eq!(parse_file_name("raft.meta"), None);
    }
}
