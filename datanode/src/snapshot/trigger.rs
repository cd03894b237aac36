//! Snapshot capture policies
//!
//! When to snapshot is policy, not correctness: any trigger can be plugged
//! into the state machine without affecting what a snapshot contains.

use std::time::{Duration, Instant};

use crate::term_index::TermIndex;

/// What a trigger gets to look at when deciding.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotProgress {
    pub last_applied: TermIndex,
    pub last_snapshot: Option<TermIndex>,
    /// Entries applied since the last snapshot (or since start)
    pub applied_since: u64,
    /// When the last snapshot was taken (or when the replica started)
    pub since: Instant,
}

pub trait SnapshotTrigger: Send + Sync {
    fn is_due(&self, progress: &SnapshotProgress) -> bool;
}

/// Due after a fixed number of applied entries.
pub struct EntryCountTrigger(pub u64);

impl SnapshotTrigger for EntryCountTrigger {
    fn is_due(&self, progress: &SnapshotProgress) -> bool {
        self.0 > 0 && progress.applied_since >= self.0
    }
}

/// Due once an interval has passed and something was applied.
pub struct IntervalTrigger(pub Duration);

impl SnapshotTrigger for IntervalTrigger {
    fn is_due(&self, progress: &SnapshotProgress) -> bool {
        progress.applied_since > 0 && progress.since.elapsed() >= self.0
    }
}

/// Always due; used on shutdown and on operator request.
pub struct ExplicitTrigger;

impl SnapshotTrigger for ExplicitTrigger {
    fn is_due(&self, _progress: &SnapshotProgress) -> bool {
        true
    }
}

/// Never due; disables periodic capture.
pub struct NeverTrigger;

impl SnapshotTrigger for NeverTrigger {
    fn is_due(&self, _progress: &SnapshotProgress) -> bool {
        false
    }
}

/// Due when any of the inner triggers is.
pub struct AnyTrigger(pub Vec<Box<dyn SnapshotTrigger>>);

impl SnapshotTrigger for AnyTrigger {
    fn is_due(&self, progress: &SnapshotProgress) -> bool {
        self.0.iter().any(|t| t.is_due(progress))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(applied_since: u64, age: Duration) -> SnapshotProgress {
        let now = Instant::now();
        SnapshotProgress {
            last_applied: TermIndex::new(1, applied_since),
            last_snapshot: None,
            applied_since,
            since: now.checked_sub(age).unwrap_or(now),
        }
    }

    #[test]
    fn test_entry_count() {
        let trigger = EntryCountTrigger(10);
        assert!(!trigger.is_due(&progress(9, Duration::ZERO)));
        assert!(trigger.is_due(&progress(10, Duration::ZERO)));
        assert!(!EntryCountTrigger(0).is_due(&progress(100, Duration::ZERO)));
    }

    #[test]
    fn test_interval_needs_new_entries() {
        let trigger = IntervalTrigger(Duration::from_millis(10));
        assert!(!trigger.is_due(&progress(0, Duration::from_secs(1))));
        assert!(trigger.is_due(&progress(1, Duration::from_secs(1))));
        assert!(!trigger.is_due(&progress(1, Duration::ZERO)));
    }

    #[test]
    fn test_any() {
        let trigger = AnyTrigger(vec![
            Box::new(EntryCountTrigger(100)),
            Box::new(IntervalTrigger(Duration::from_millis(10))),
        ]);
        assert!(trigger.is_due(&progress(1, Duration::from_secs(1))));
        assert!(!trigger.is_due(&progress(1, Duration::ZERO)));
        assert!(!AnyTrigger(vec![Box::new(NeverTrigger)]).is_due(&progress(5, Duration::ZERO)));
        assert!(ExplicitTrigger.is_due(&progress(0, Duration::ZERO)));
    }
}
