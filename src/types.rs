//! Shared enums for step lifecycle tracking.
//!
//! These are persisted in the per-host state file, so their serde names are
//! part of the on-disk format.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Lifecycle status of a step on one host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Returns true if the status satisfies a dependent's requirement
    #[inline]
    pub const fn satisfies_dependents(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    /// Marker used in status tables
    pub const fn marker(self) -> &'static str {
        match self {
            Self::Pending => "·",
            Self::Running => "…",
            Self::Succeeded => "✓",
            Self::Failed => "✗",
            Self::Skipped => "-",
        }
    }
}

/// Why a step ended up `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FailureKind {
    /// Action exited with a code outside its accepted set, or could not start
    Action,
    /// Action exceeded its deadline and was killed
    Timeout,
    /// Action succeeded but its postcondition check did not
    Verification,
    /// Previous process died while the step was running
    Interrupted,
}

impl FailureKind {
    /// Whether the executor spends retries on this kind of failure
    #[inline]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Action | Self::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_status_display_matches_serde() {
        for status in StepStatus::iter() {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
            assert_eq!(StepStatus::from_str(&status.to_string()).unwrap(), status);
        }
    }

    #[test]
    fn test_only_succeeded_and_skipped_satisfy_dependents() {
        let satisfying: Vec<StepStatus> = StepStatus::iter()
            .filter(|s| s.satisfies_dependents())
            .collect();
        assert_eq!(satisfying, vec![StepStatus::Succeeded, StepStatus::Skipped]);
    }

    #[test]
    fn test_verification_failures_are_not_retried() {
        assert!(FailureKind::Action.is_retryable());
        assert!(FailureKind::Timeout.is_retryable());
        assert!(!FailureKind::Verification.is_retryable());
        assert!(!FailureKind::Interrupted.is_retryable());
    }
}
