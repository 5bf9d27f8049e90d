//! Best-effort execution of compensating steps.

use crate::error::{HostingError, Result};
use std::fmt;

/// Records the outcome of every cleanup step without stopping at failures.
///
/// The last failure wins; [`finish`](Self::finish) reports it once every
/// step has been attempted.
#[derive(Debug)]
pub struct CleanupPlan {
    scope: String,
    last_error: Option<HostingError>,
    failed_steps: Vec<&'static str>,
}

impl CleanupPlan {
    pub fn new(scope: impl fmt::Display) -> Self {
        Self {
            scope: scope.to_string(),
            last_error: None,
            failed_steps: Vec::new(),
        }
    }

    /// Record the outcome of `step`.
    pub fn record(&mut self, step: &'static str, result: Result<()>) {
        match result {
            Ok(()) => tracing::debug!(scope = %self.scope, step, "Cleanup step done"),
            Err(e) => {
                tracing::warn!(scope = %self.scope, step, error = %e, "Cleanup step failed, continuing");
                self.failed_steps.push(step);
                self.last_error = Some(e);
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.last_error.is_none()
    }

    pub fn failed_steps(&self) -> &[&'static str] {
        &self.failed_steps
    }

    pub fn finish(self) -> Result<()> {
        match self.last_error {
            None => Ok(()),
            Some(e) => {
                tracing::warn!(scope = %self.scope, failed = ?self.failed_steps, "Cleanup finished with errors");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_error_wins() {
        let mut plan = CleanupPlan::new("Calc_App1");
        plan.record("first", Err(HostingError::NotFound("a".into())));
        plan.record("second", Ok(()));
        plan.record("third", Err(HostingError::OperationFailed("b".into())));

        assert!(!plan.is_clean());
        assert_eq!(plan.failed_steps(), &["first", "third"]);
        assert!(matches!(plan.finish(), Err(HostingError::OperationFailed(_))));
    }

    #[test]
    fn test_clean_plan() {
        let mut plan = CleanupPlan::new("x");
        plan.record("only", Ok(()));
        assert!(plan.is_clean());
        assert!(plan.finish().is_ok());
    }
}
