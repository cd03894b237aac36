//! Error taxonomy of the container state machine

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::recovery::RecoveryState;
use crate::term_index::TermIndex;

/// Failure to apply a committed entry.
///
/// Every variant except a retried `IoFailure` stops the replica: skipping an
/// entry would silently diverge from the rest of the group.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("corrupt entry at {term_index}: {reason}")]
    Corrupt {
        term_index: TermIndex,
        reason: String,
    },
    #[error("storage failure at {term_index} after {attempts} attempts: {source}")]
    IoFailure {
        term_index: TermIndex,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("entry {got} delivered out of order, expected index {expected}")]
    OutOfOrder { expected: u64, got: TermIndex },
    #[error("replica halted: {0}")]
    Halted(HaltReason),
    #[error("not accepting entries while {0:?}")]
    NotReady(RecoveryState),
}

impl ApplyError {
    /// TermIndex of the entry that failed, if the error names one.
    pub fn term_index(&self) -> Option<TermIndex> {
        match self {
            ApplyError::Corrupt { term_index, .. } => Some(*term_index),
            ApplyError::IoFailure { term_index, .. } => Some(*term_index),
            ApplyError::OutOfOrder { got, .. } => Some(*got),
            ApplyError::Halted(_) | ApplyError::NotReady(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to write snapshot {path:?}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read snapshot {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt snapshot {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("refusing to install snapshot {offered} over applied state {installed}")]
    Regression {
        installed: TermIndex,
        offered: TermIndex,
    },
    #[error("failed to install snapshot {term_index} into container storage: {source}")]
    Install {
        term_index: TermIndex,
        #[source]
        source: io::Error,
    },
}

impl SnapshotError {
    /// Unreadable or damaged payloads; recovery must not fall back to replay.
    pub fn is_corruption(&self) -> bool {
        matches!(self, SnapshotError::Corrupt { .. } | SnapshotError::Read { .. })
    }
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("latest snapshot is unusable: {0}")]
    SnapshotCorrupt(#[source] SnapshotError),
    #[error("snapshot install failed: {0}")]
    InstallFailure(#[source] SnapshotError),
    #[error("recovery is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: RecoveryState,
        actual: RecoveryState,
    },
    #[error("replay stopped: {0}")]
    Replay(#[source] ApplyError),
    #[error("raft log: {0}")]
    Log(#[from] raft::Error),
    #[error("container storage: {0}")]
    Storage(#[from] io::Error),
}

impl From<SnapshotError> for RecoveryError {
    fn from(e: SnapshotError) -> Self {
        if e.is_corruption() {
            RecoveryError::SnapshotCorrupt(e)
        } else {
            RecoveryError::InstallFailure(e)
        }
    }
}

/// Fatal failure of a replica's consensus loop.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("raft: {0}")]
    Raft(#[from] raft::Error),
    #[error("apply: {0}")]
    Apply(#[from] ApplyError),
}

/// Failure reported to the client that proposed an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProposeError {
    #[error("replica is not the leader")]
    NotLeader,
    #[error("proposal was dropped before it was applied")]
    Dropped,
    #[error("replica halted")]
    Halted,
    #[error("failed to encode operation: {0}")]
    Encode(String),
}

/// Why a replica stopped applying entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaltReason {
    /// Entry that could not be applied
    pub at: Option<TermIndex>,
    /// Last entry whose effects are in the applied state
    pub last_applied: TermIndex,
    pub message: String,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.at {
            Some(at) => write!(
                f,
                "{} (failed entry {}, last applied {})",
                self.message, at, self.last_applied
            ),
            None => write!(f, "{} (last applied {})", self.message, self.last_applied),
        }
    }
}
