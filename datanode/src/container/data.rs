//! Applied container state
//!
//! `ContainerSet` is everything the state machine has applied, together with
//! the watermark of the last entry reflected in it. The two always move
//! together, so a clone of the set is a consistent snapshot source.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::term_index::TermIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ContainerState {
    #[default]
    Open,
    Closed,
}

/// Per chunk bookkeeping kept in the container metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub len: u64,
    pub checksum: String,
    pub written_at: TermIndex,
}

/// Durable description of a container, without chunk payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMeta {
    pub id: u64,
    pub state: ContainerState,
    pub metadata: BTreeMap<String, String>,
    pub chunks: BTreeMap<String, ChunkInfo>,
    /// Last entry that mutated this container
    pub bcs_id: TermIndex,
}

impl ContainerMeta {
    pub fn new(id: u64, metadata: BTreeMap<String, String>, created_at: TermIndex) -> Self {
        ContainerMeta {
            id,
            state: ContainerState::Open,
            metadata,
            chunks: BTreeMap::new(),
            bcs_id: created_at,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == ContainerState::Open
    }

    pub fn used_bytes(&self) -> u64 {
        self.chunks.values().map(|c| c.len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub meta: ContainerMeta,
    pub chunks: BTreeMap<String, Bytes>,
}

impl Container {
    pub fn new(meta: ContainerMeta) -> Self {
        Container {
            meta,
            chunks: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSet {
    containers: BTreeMap<u64, Container>,
    last_applied: TermIndex,
}

impl ContainerSet {
    pub fn new() -> Self {
        ContainerSet::default()
    }

    pub fn last_applied(&self) -> TermIndex {
        self.last_applied
    }

    pub(crate) fn set_last_applied(&mut self, term_index: TermIndex) {
        self.last_applied = term_index;
    }

    pub fn get(&self, id: u64) -> Option<&Container> {
        self.containers.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut Container> {
        self.containers.get_mut(&id)
    }

    pub(crate) fn insert(&mut self, container: Container) {
        self.containers.insert(container.meta.id, container);
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<Container> {
        self.containers.remove(&id)
    }

    pub fn ids(&self) -> Vec<u64> {
        self.containers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Container> {
        self.containers.values()
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn read_chunk(&self, container_id: u64, chunk: &str) -> Option<Bytes> {
        self.containers
            .get(&container_id)
            .and_then(|c| c.chunks.get(chunk))
            .cloned()
    }
}
