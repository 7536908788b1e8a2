//! Course progress computation.
//!
//! `progress = floor(completed / total * 100)`, computed in integer arithmetic
//! so replays always produce the same value.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Completion percentage of a course, always within `0..=100`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Progress(u8);

impl Progress {
    pub const ZERO: Progress = Progress(0);
    pub const COMPLETE: Progress = Progress(100);

    pub fn new(value: u8) -> DomainResult<Self> {
        if value > 100 {
            return Err(DomainError::invariant(format!(
                "progress must be within 0..=100 (got {value})"
            )));
        }
        Ok(Self(value))
    }

    pub const fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Progress {
    type Error = DomainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Progress> for u8 {
    fn from(value: Progress) -> Self {
        value.0
    }
}

impl core::fmt::Display for Progress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Compute course progress from distinct completed materials and the course's
/// material count.
///
/// Fails with `InvariantViolation` when `total == 0` or when the result would
/// fall outside `0..=100` (more completions than materials).
pub fn compute_progress(completed: u64, total: u64) -> DomainResult<Progress> {
    if total == 0 {
        return Err(DomainError::invariant(
            "cannot compute progress: course has no materials",
        ));
    }

    let percent = u128::from(completed) * 100 / u128::from(total);
    if percent > 100 {
        return Err(DomainError::invariant(format!(
            "progress out of range: {completed} completed of {total} materials"
        )));
    }

    // percent <= 100 checked above
    Ok(Progress(percent as u8))
}
