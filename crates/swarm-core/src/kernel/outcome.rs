//! Test reports and failure classification.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwarmError};

/// Counts a tester reports for one run. Counts are always required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    pub passed: bool,
    pub total: u32,
    pub passed_count: u32,
    pub failed_count: u32,
    #[serde(default)]
    pub error_output: Option<String>,
}

impl TestReport {
    pub fn validate(&self) -> Result<()> {
        let counted = self.passed_count.checked_add(self.failed_count);
        if counted.is_none_or(|n| n > self.total) {
            return Err(SwarmError::InvalidInput(format!(
                "passed ({}) + failed ({}) exceeds total ({})",
                self.passed_count, self.failed_count, self.total
            )));
        }
        Ok(())
    }

    /// A run only counts as passing when the flag and the counts agree.
    pub fn succeeded(&self) -> bool {
        self.passed && self.failed_count == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{}/{} passed, {} failed",
            self.passed_count, self.total, self.failed_count
        )
    }
}

/// Whether a failure is the code's fault or the environment's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Tests ran and failed; retrying after a fix can help.
    Domain,
    /// Missing dependency or broken environment; retrying will not.
    Infrastructure,
}

const INFRASTRUCTURE_SIGNATURES: &[&str] = &[
    "cannot find module",
    "module not found",
    "modulenotfounderror",
    "command not found",
    "enoent",
    "permission denied",
    "eacces",
    "connection refused",
    "econnrefused",
    "address already in use",
    "eaddrinuse",
    "could not resolve",
    "missing dependency",
    "failed to install",
    "no space left on device",
];

impl FailureClass {
    pub fn classify(output: &str) -> Self {
        let lower = output.to_lowercase();
        if INFRASTRUCTURE_SIGNATURES.iter().any(|sig| lower.contains(sig)) {
            Self::Infrastructure
        } else {
            Self::Domain
        }
    }
}

/// What happened to a story after a completion report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Passed,
    /// Failed and went back to the backlog.
    Requeued { retry_count: u32 },
    /// Retries exhausted; a remediation story was created.
    Parked {
        retry_count: u32,
        remediation_id: String,
    },
    /// Environment failure; failed without consuming a retry.
    SetupFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(passed: bool, total: u32, ok: u32, failed: u32) -> TestReport {
        TestReport {
            passed,
            total,
            passed_count: ok,
            failed_count: failed,
            error_output: None,
        }
    }

    #[test]
    fn overflowing_counts_are_rejected() {
        let huge = report(false, 10, u32::MAX, 1);
        assert!(matches!(huge.validate(), Err(SwarmError::InvalidInput(_))));
        assert!(report(false, 10, 7, 3).validate().is_ok());
    }

    #[test]
    fn counts_must_fit_total() {
        assert!(report(false, 5, 3, 2).validate().is_ok());
        assert!(report(false, 3, 3, 2).validate().is_err());
    }

    #[test]
    fn passing_flag_with_failures_is_a_failure() {
        assert!(report(true, 5, 5, 0).succeeded());
        assert!(!report(true, 5, 4, 1).succeeded());
    }

    #[test]
    fn environment_errors_are_infrastructure() {
        assert_eq!(
            FailureClass::classify("Error: Cannot find module 'express'"),
            FailureClass::Infrastructure
        );
        assert_eq!(
            FailureClass::classify("sh: jest: command not found"),
            FailureClass::Infrastructure
        );
        assert_eq!(
            FailureClass::classify("expected 2, received 3"),
            FailureClass::Domain
        );
    }
}
