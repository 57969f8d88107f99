//! Internal invariant breach types.

use thiserror::Error;

/// A cache bookkeeping invariant does not hold. This is a programming error,
/// never shown to users.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CapacityViolation {
    #[error("tracked cost {tracked} differs from summed cost {actual}")]
    CostMismatch { tracked: usize, actual: usize },

    #[error("tracked count {tracked} differs from entry count {actual}")]
    CountMismatch { tracked: usize, actual: usize },

    #[error("total cost {total} exceeds limit {limit}")]
    OverCost { total: usize, limit: usize },

    #[error("total count {total} exceeds limit {limit}")]
    OverCount { total: usize, limit: usize },
}
