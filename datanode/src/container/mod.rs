//! Container storage and the transactions that mutate it

pub mod applier;
pub mod data;
pub mod operation;
pub mod storage;

pub use applier::{ApplyOutcome, ContainerResult, RetryPolicy, TransactionApplier};
pub use data::{ChunkInfo, Container, ContainerMeta, ContainerSet, ContainerState};
pub use operation::{checksum, LogEntry, Operation};
pub use storage::{ContainerStorage, FileContainerStorage, MemContainerStorage};
