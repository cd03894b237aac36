//! Replicated container operations
//!
//! Operations travel through the consensus log as bincode payloads. An empty
//! payload is the consensus layer's own no-op entry.

use std::collections::BTreeMap;

use bincode::Options;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::term_index::TermIndex;

// Fixed-width integers like `bincode::serialize`, but a payload must be
// consumed exactly.
fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// A mutation of container storage carried by one log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Advances the watermark without touching storage
    Noop,
    CreateContainer {
        container_id: u64,
        metadata: BTreeMap<String, String>,
    },
    WriteChunk {
        container_id: u64,
        chunk: String,
        data: Bytes,
        /// Hex SHA3-256 of `data`, computed by the proposer
        checksum: String,
    },
    DeleteChunk {
        container_id: u64,
        chunk: String,
    },
    UpdateMetadata {
        container_id: u64,
        set: BTreeMap<String, String>,
        remove: Vec<String>,
    },
    CloseContainer {
        container_id: u64,
    },
    DeleteContainer {
        container_id: u64,
        force: bool,
    },
}

impl Operation {
    pub fn create_container(container_id: u64) -> Self {
        Operation::CreateContainer {
            container_id,
            metadata: BTreeMap::new(),
        }
    }

    /// Builds a chunk write whose checksum matches `data`.
    pub fn write_chunk(container_id: u64, chunk: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Operation::WriteChunk {
            container_id,
            chunk: chunk.into(),
            checksum: checksum(&data),
            data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        codec().serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        if data.is_empty() {
            return Ok(Operation::Noop);
        }
        codec().deserialize(data)
    }

    /// Checks the integrity of the payload itself, independent of storage state.
    pub fn verify(&self) -> Result<(), String> {
        match self {
            Operation::WriteChunk {
                data, checksum: expected, ..
            } => {
                let actual = checksum(data);
                if actual != *expected {
                    return Err(format!(
                        "chunk checksum mismatch: expected {}, computed {}",
                        expected, actual
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn container_id(&self) -> Option<u64> {
        match self {
            Operation::Noop => None,
            Operation::CreateContainer { container_id, .. }
            | Operation::WriteChunk { container_id, .. }
            | Operation::DeleteChunk { container_id, .. }
            | Operation::UpdateMetadata { container_id, .. }
            | Operation::CloseContainer { container_id }
            | Operation::DeleteContainer { container_id, .. } => Some(*container_id),
        }
    }

    /// Short name used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Noop => "noop",
            Operation::CreateContainer { .. } => "create_container",
            Operation::WriteChunk { .. } => "write_chunk",
            Operation::DeleteChunk { .. } => "delete_chunk",
            Operation::UpdateMetadata { .. } => "update_metadata",
            Operation::CloseContainer { .. } => "close_container",
            Operation::DeleteContainer { .. } => "delete_container",
        }
    }
}

/// Hex encoded SHA3-256 digest of a chunk payload.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha3_256::digest(data))
}

/// A committed entry as delivered by the consensus layer.
///
/// The payload is still encoded; decoding failures are the applier's to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term_index: TermIndex,
    pub data: Bytes,
}

impl LogEntry {
    pub fn new(term_index: TermIndex, data: impl Into<Bytes>) -> Self {
        LogEntry {
            term_index,
            data: data.into(),
        }
    }

    pub fn noop(term_index: TermIndex) -> Self {
        LogEntry::new(term_index, Bytes::new())
    }

    pub fn from_operation(term_index: TermIndex, op: &Operation) -> Result<Self, bincode::Error> {
        Ok(LogEntry::new(term_index, op.encode()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payload_is_noop() {
        assert_eq!(Operation::decode(&[]).unwrap(), Operation::Noop);
    }

    #[test]
    fn test_garbage_payload_fails_to_decode() {
        assert!(Operation::decode(&[0xde, 0xad]).is_err());
        assert!(Operation::decode(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }

    #[test]
    fn test_trailing_bytes_fail_to_decode() {
        let op = Operation::create_container(1);
        let mut data = op.encode().unwrap();
        assert_eq!(data, bincode::serialize(&op).unwrap());
        data.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(Operation::decode(&data).is_err());
    }

    #[test]
    fn test_write_chunk_survives_the_log() {
        let op = Operation::write_chunk(7, "chunk_1", &b"payload"[..]);
        let decoded = Operation::decode(&op.encode().unwrap()).unwrap();
        assert_eq!(decoded, op);
        assert!(decoded.verify().is_ok());
        assert_eq!(decoded.container_id(), Some(7));
        assert_eq!(decoded.kind(), "write_chunk");
    }

    #[test]
    fn test_checksum_mismatch_fails_verification() {
        let op = Operation::WriteChunk {
            container_id: 1,
            chunk: "c".to_string(),
            data: Bytes::from_static(b"tampered"),
            checksum: checksum(b"original"),
        };
        let err = op.verify().unwrap_err();
        assert!(err.contains("checksum mismatch"));
    }
}
