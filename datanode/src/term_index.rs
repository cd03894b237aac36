//! Term/index bookkeeping for applied log entries
//!
//! A `TermIndex` names one committed entry of the replicated log. The pair is
//! ordered by term first and index second, which is the order in which a
//! replica observes entries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Composite identifier of a committed log entry.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TermIndex {
    /// Leadership epoch in which the entry was appended
    pub term: u64,
    /// Position of the entry in the replicated log
    pub index: u64,
}

impl TermIndex {
    /// Watermark of a replica that has never applied anything.
    pub const ZERO: TermIndex = TermIndex { term: 0, index: 0 };

    pub fn new(term: u64, index: u64) -> Self {
        TermIndex { term, index }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Index of the entry that must follow this one in application order.
    pub fn next_index(&self) -> u64 {
        self.index + 1
    }
}

impl fmt::Display for TermIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(t:{}, i:{})", self.term, self.index)
    }
}

impl From<(u64, u64)> for TermIndex {
    fn from((term, index): (u64, u64)) -> Self {
        TermIndex::new(term, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_is_term_then_index() {
        assert!(TermIndex::new(1, 9) < TermIndex::new(2, 1));
        assert!(TermIndex::new(2, 1) < TermIndex::new(2, 2));
        assert_eq!(TermIndex::new(3, 3), TermIndex::from((3, 3)));
        assert!(TermIndex::ZERO < TermIndex::new(0, 1));
    }

    #[test]
    fn test_display() {
        assert_eq!(TermIndex::new(4, 17).to_string(), "(t:4, i:17)");
        assert!(TermIndex::default().is_zero());
        assert_eq!(TermIndex::new(4, 17).next_index(), 18);
    }
}
