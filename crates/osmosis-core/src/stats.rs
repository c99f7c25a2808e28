//! Per-item progress counters.

use serde::{Deserialize, Serialize};
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// Outcome counters for one processed item, or the running sum of many.
///
/// A fresh value counts one unit of progress. Steps whose items stand for
/// several units override `progress` while processing. Summation is
/// commutative and associative, so results from concurrent workers can be
/// aggregated in any completion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStats {
    pub progress: u64,
    pub warning_count: u64,
    pub error_count: u64,
}

impl Default for ProgressStats {
    fn default() -> Self {
        Self {
            progress: 1,
            warning_count: 0,
            error_count: 0,
        }
    }
}

impl ProgressStats {
    /// A zeroed accumulator (unlike `default()`, which counts one item).
    pub fn zero() -> Self {
        Self {
            progress: 0,
            warning_count: 0,
            error_count: 0,
        }
    }

    /// Restore the per-item starting state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Add another outcome into this one.
    pub fn absorb(&mut self, other: &ProgressStats) {
        self.progress += other.progress;
        self.warning_count += other.warning_count;
        self.error_count += other.error_count;
    }

    pub fn has_problems(&self) -> bool {
        self.warning_count > 0 || self.error_count > 0
    }
}

impl Add for ProgressStats {
    type Output = ProgressStats;

    fn add(mut self, rhs: ProgressStats) -> ProgressStats {
        self.absorb(&rhs);
        self
    }
}

impl AddAssign for ProgressStats {
    fn add_assign(&mut self, rhs: ProgressStats) {
        self.absorb(&rhs);
    }
}

impl Sum for ProgressStats {
    fn sum<I: Iterator<Item = ProgressStats>>(iter: I) -> Self {
        iter.fold(ProgressStats::zero(), Add::add)
    }
}
