//! Consensus layer: raft-rs driving the container state machine

pub mod node;
pub mod proposal;
pub mod router;
mod segment;
pub mod storage;

pub use node::{Node, NodeHandle};
pub use proposal::{Proposal, ProposeResult};
pub use router::Router;
pub use storage::LogStore;
