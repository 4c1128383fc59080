//! Scheduler errors.

use jobwheel_protocols::JobId;
use thiserror::Error;

/// Errors surfaced to administrative callers.
///
/// Execution-time failures never appear here: they are captured in the
/// execution log and must not destabilize scheduling.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed trigger expression, rejected at save/update time.
    #[error("invalid trigger expression '{expr}': {reason}")]
    InvalidTrigger { expr: String, reason: String },

    /// The job's target name has no registered handler.
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    /// Another job already uses this label.
    #[error("duplicate job label: {0}")]
    DuplicateLabel(String),

    /// The referenced job does not exist.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A target name is already registered.
    #[error("target already registered: {0}")]
    TargetExists(String),

    /// Page or page size was not positive.
    #[error("page and page size must be positive")]
    InvalidPage,

    /// Job store failure.
    #[error("job store error: {0}")]
    Store(String),
}

impl SchedulerError {
    /// True if this is a per-id `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SchedulerError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedulerError::InvalidTrigger {
            expr: "bogus".to_string(),
            reason: "expected 6 fields".to_string(),
        };
        assert!(err.to_string().contains("bogus"));

        assert!(SchedulerError::NotFound(42).is_not_found());
        assert!(!SchedulerError::InvalidPage.is_not_found());
    }
}
