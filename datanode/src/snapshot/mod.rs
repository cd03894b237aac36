//! Snapshot persistence and capture policy

pub mod store;
pub mod trigger;

pub use store::{RetentionPolicy, Snapshot, SnapshotPin, SnapshotSource, SnapshotStore};
pub use trigger::{
    AnyTrigger, EntryCountTrigger, ExplicitTrigger, IntervalTrigger, NeverTrigger,
    SnapshotProgress, SnapshotTrigger,
};
