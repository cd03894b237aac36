//! Durable container storage
//!
//! Storage is write-through: the applier persists each mutation here before
//! publishing it in the applied `ContainerSet`. On restart the storage is reset
//! to the installed snapshot instead of being trusted.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;

use crate::container::data::{ContainerMeta, ContainerSet};

const CONTAINERS_DIR: &str = "containers";
const META_FILE: &str = "container.meta";
const CHUNKS_DIR: &str = "chunks";

/// Storage backend exclusively owned by one state machine instance.
///
/// Every method must be idempotent: a retried or replayed call leaves the
/// same state as a single call.
pub trait ContainerStorage: Send + Sync {
    fn put_container(&self, meta: &ContainerMeta) -> io::Result<()>;
    fn remove_container(&self, id: u64) -> io::Result<()>;
    fn write_chunk(&self, container_id: u64, chunk: &str, data: &[u8]) -> io::Result<()>;
    fn delete_chunk(&self, container_id: u64, chunk: &str) -> io::Result<()>;
    /// Replaces the whole storage with the contents of `set`.
    fn reset(&self, set: &ContainerSet) -> io::Result<()>;
}

/// Container storage on the local filesystem.
///
/// Layout: `<root>/containers/<id>/container.meta` plus
/// `<root>/containers/<id>/chunks/<chunk>`.
pub struct FileContainerStorage {
    root: PathBuf,
}

impl FileContainerStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> io::Result<Self> {
        let root = base_path.as_ref().join(CONTAINERS_DIR);
        fs::create_dir_all(&root)?;
        Ok(FileContainerStorage { root })
    }

    fn container_dir(&self, id: u64) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn chunk_path(&self, container_id: u64, chunk: &str) -> PathBuf {
        self.container_dir(container_id).join(CHUNKS_DIR).join(chunk)
    }

    /// Loads every container metadata file, ordered by id.
    pub fn load_metas(&self) -> io::Result<Vec<ContainerMeta>> {
        let mut metas = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path().join(META_FILE);
            if !path.is_file() {
                continue;
            }
            let bytes = fs::read(&path)?;
            let meta: ContainerMeta = bincode::deserialize(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            metas.push(meta);
        }
        metas.sort_by_key(|m| m.id);
        Ok(metas)
    }

    pub fn read_chunk(&self, container_id: u64, chunk: &str) -> io::Result<Vec<u8>> {
        fs::read(self.chunk_path(container_id, chunk))
    }
}

/// Writes `data` to a sibling temp file and renames it over `path`.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent);
    }
    Ok(())
}

pub(crate) fn sync_dir(dir: &Path) {
    // Not every platform can open a directory for syncing.
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl ContainerStorage for FileContainerStorage {
    fn put_container(&self, meta: &ContainerMeta) -> io::Result<()> {
        let dir = self.container_dir(meta.id);
        fs::create_dir_all(dir.join(CHUNKS_DIR))?;
        let bytes =
            bincode::serialize(meta).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        write_atomic(&dir.join(META_FILE), &bytes)
    }

    fn remove_container(&self, id: u64) -> io::Result<()> {
        match fs::remove_dir_all(self.container_dir(id)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn write_chunk(&self, container_id: u64, chunk: &str, data: &[u8]) -> io::Result<()> {
        let path = self.chunk_path(container_id, chunk);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, data)
    }

    fn delete_chunk(&self, container_id: u64, chunk: &str) -> io::Result<()> {
        remove_if_exists(&self.chunk_path(container_id, chunk))
    }

    fn reset(&self, set: &ContainerSet) -> io::Result<()> {
        match fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        fs::create_dir_all(&self.root)?;
        for container in set.iter() {
            for (name, data) in &container.chunks {
                self.write_chunk(container.meta.id, name, data)?;
            }
            self.put_container(&container.meta)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemInner {
    containers: BTreeMap<u64, (ContainerMeta, BTreeMap<String, Bytes>)>,
    failures: u32,
    writes: u64,
}

/// In-memory container storage with fault injection.
#[derive(Default)]
pub struct MemContainerStorage {
    inner: Mutex<MemInner>,
}

impl MemContainerStorage {
    pub fn new() -> Self {
        MemContainerStorage::default()
    }

    /// Makes the next `n` storage calls fail with an I/O error.
    pub fn inject_failures(&self, n: u32) {
        self.lock().failures = n;
    }

    /// Number of storage calls that succeeded.
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    pub fn meta(&self, id: u64) -> Option<ContainerMeta> {
        self.lock().containers.get(&id).map(|(m, _)| m.clone())
    }

    pub fn chunk(&self, id: u64, chunk: &str) -> Option<Bytes> {
        self.lock()
            .containers
            .get(&id)
            .and_then(|(_, chunks)| chunks.get(chunk).cloned())
    }

    pub fn ids(&self) -> Vec<u64> {
        self.lock().containers.keys().copied().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemInner> {
        // A panicking test thread must not wedge every later storage call.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mutate<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce(&mut MemInner),
    {
        let mut inner = self.lock();
        if inner.failures > 0 {
            inner.failures -= 1;
            return Err(io::Error::new(io::ErrorKind::Other, "injected storage failure"));
        }
        f(&mut inner);
        inner.writes += 1;
        Ok(())
    }
}

impl ContainerStorage for MemContainerStorage {
    fn put_container(&self, meta: &ContainerMeta) -> io::Result<()> {
        self.mutate(|inner| {
            inner
                .containers
                .entry(meta.id)
                .or_insert_with(|| (meta.clone(), BTreeMap::new()))
                .0 = meta.clone();
        })
    }

    fn remove_container(&self, id: u64) -> io::Result<()> {
        self.mutate(|inner| {
            inner.containers.remove(&id);
        })
    }

    fn write_chunk(&self, container_id: u64, chunk: &str, data: &[u8]) -> io::Result<()> {
        self.mutate(|inner| {
            if let Some((_, chunks)) = inner.containers.get_mut(&container_id) {
                chunks.insert(chunk.to_string(), Bytes::copy_from_slice(data));
            }
        })
    }

    fn delete_chunk(&self, container_id: u64, chunk: &str) -> io::Result<()> {
        self.mutate(|inner| {
            if let Some((_, chunks)) = inner.containers.get_mut(&container_id) {
                chunks.remove(chunk);
            }
        })
    }

    fn reset(&self, set: &ContainerSet) -> io::Result<()> {
        self.mutate(|inner| {
            inner.containers = set
                .iter()
                .map(|c| (c.meta.id, (c.meta.clone(), c.chunks.clone())))
                .collect();
        })
    }
}
