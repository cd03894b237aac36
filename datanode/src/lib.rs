//! Replicated container state machine
//!
//! Each replica applies a raft log of container operations, captures
//! snapshots tagged with the `TermIndex` of the last applied entry and, on
//! restart, resumes from its latest snapshot plus the log after it.

pub mod cluster;
pub mod config;
pub mod container;
pub mod error;
pub mod metrics;
pub mod raft;
pub mod recovery;
pub mod server;
pub mod snapshot;
pub mod state_machine;
pub mod term_index;

pub use crate::cluster::LocalCluster;
pub use crate::container::applier::{ApplyOutcome, ContainerResult};
pub use crate::container::operation::{LogEntry, Operation};
pub use crate::error::{ApplyError, ProposeError, RecoveryError, SnapshotError};
pub use crate::recovery::{RecoveryCoordinator, RecoveryState};
pub use crate::snapshot::{Snapshot, SnapshotStore};
pub use crate::state_machine::ContainerStateMachine;
pub use crate::term_index::TermIndex;
