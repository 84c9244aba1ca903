//! Pairwise file-conflict rules.
//!
//! The operation table is the only authority the wave planner consults when
//! deciding whether two tasks may share a wave.

use crate::config::{ConflictConfig, LowConfidencePolicy};
use crate::types::{FileImpact, FileOperation, Task};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConflictError {
    /// CREATE and UPDATE on one path cannot both be true of the same file.
    #[error("invalid impact pair on {path}: CREATE and UPDATE of the same path")]
    InvalidPair { path: String },
}

/// The raw rule table. Unordered; `None` marks the invalid same-path
/// CREATE x UPDATE pairing.
pub fn operations_conflict(a: FileOperation, b: FileOperation) -> Option<bool> {
    use FileOperation::*;
    let conflict = match (a, b) {
        (Create, Create) => true,
        (Create, Delete) | (Delete, Create) => true,
        (Create, Read) | (Read, Create) => false,
        (Create, Update) | (Update, Create) => return None,
        (Update, Update) => true,
        (Update, Delete) | (Delete, Update) => true,
        (Update, Read) | (Read, Update) => false,
        (Delete, Delete) => true,
        (Delete, Read) | (Read, Delete) => true,
        (Read, Read) => false,
    };
    Some(conflict)
}

/// A conflict found between two tasks, for logging and diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictReason {
    pub path: String,
    pub left: FileOperation,
    pub right: FileOperation,
}

#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    config: ConflictConfig,
}

impl ConflictDetector {
    pub fn new(config: ConflictConfig) -> Self {
        Self { config }
    }

    fn is_low_confidence(&self, impact: &FileImpact) -> bool {
        impact.confidence < self.config.confidence_threshold
    }

    /// Decide whether two impacts conflict. Impacts on different paths never
    /// conflict.
    pub fn impacts_conflict(&self, a: &FileImpact, b: &FileImpact) -> Result<bool, ConflictError> {
        let path = a.normalized_path();
        if path != b.normalized_path() {
            return Ok(false);
        }

        let low = self.is_low_confidence(a) || self.is_low_confidence(b);
        if low {
            match self.config.low_confidence {
                LowConfidencePolicy::Ignore => return Ok(false),
                LowConfidencePolicy::Conservative => return Ok(true),
            }
        }

        operations_conflict(a.operation, b.operation).ok_or(ConflictError::InvalidPair { path })
    }

    /// First conflicting impact pair between two tasks, if any.
    pub fn tasks_conflict(&self, a: &Task, b: &Task) -> Result<Option<ConflictReason>, ConflictError> {
        for left in &a.file_impacts {
            for right in &b.file_impacts {
                if self.impacts_conflict(left, right)? {
                    return Ok(Some(ConflictReason {
                        path: left.normalized_path(),
                        left: left.operation,
                        right: right.operation,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Every impact pair between two tasks is a legal combination. Unlike
    /// [`tasks_conflict`](Self::tasks_conflict) this does not stop at the
    /// first conflict.
    pub fn check_compatible(&self, a: &Task, b: &Task) -> Result<(), ConflictError> {
        for left in &a.file_impacts {
            for right in &b.file_impacts {
                self.impacts_conflict(left, right)?;
            }
        }
        Ok(())
    }
}
