//! Optimistic concurrency primitives for aggregate streams.

use crate::error::{DomainError, DomainResult};

/// Optimistic concurrency expectation for an aggregate stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Let the store derive the next version (`max(version) + 1`).
    Any,
    /// Require the stream to be at an exact version before appending.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }

    /// Version the next appended event will carry, given the current stream version.
    pub fn next_version(self, actual: u64) -> u64 {
        match self {
            ExpectedVersion::Any => actual + 1,
            ExpectedVersion::Exact(v) => v + 1,
        }
    }
}
