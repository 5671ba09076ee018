//! Stage and pipeline status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle state of a stage within one pipeline run.
///
/// `Pending -> Running -> {Succeeded | Failed}`; a failed attempt goes back to
/// `Running` while attempts remain and ends in `Aborted` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage has not started.
    #[default]
    Pending,
    /// An attempt is in progress.
    Running,
    /// Stage completed successfully.
    Succeeded,
    /// The latest attempt failed and another attempt is scheduled.
    Failed,
    /// Retries are exhausted.
    Aborted,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

impl StageStatus {
    /// Returns the state reached after an attempt finishes.
    #[must_use]
    pub fn after_attempt(outcome: AttemptOutcome, attempt: u32, max_attempts: u32) -> Self {
        match outcome {
            AttemptOutcome::Success => Self::Succeeded,
            AttemptOutcome::Failure if attempt < max_attempts => Self::Failed,
            AttemptOutcome::Failure => Self::Aborted,
        }
    }

    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Aborted)
    }
}

/// Exit outcome of a single stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The attempt succeeded.
    Success,
    /// The attempt failed.
    Failure,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// The status of a whole pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Stages are still executing.
    Running,
    /// Every stage succeeded.
    Succeeded,
    /// A stage aborted and the run stopped.
    Failed,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_display() {
        assert_eq!(StageStatus::Pending.to_string(), "pending");
        assert_eq!(StageStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(StageStatus::Aborted.to_string(), "aborted");
    }

    #[test]
    fn test_after_attempt_transitions() {
        assert_eq!(
            StageStatus::after_attempt(AttemptOutcome::Success, 1, 1),
            StageStatus::Succeeded
        );
        assert_eq!(
            StageStatus::after_attempt(AttemptOutcome::Failure, 1, 2),
            StageStatus::Failed
        );
        assert_eq!(
            StageStatus::after_attempt(AttemptOutcome::Failure, 2, 2),
            StageStatus::Aborted
        );
    }

    #[test]
    fn test_stage_status_is_terminal() {
        assert!(StageStatus::Succeeded.is_terminal());
        assert!(StageStatus::Aborted.is_terminal());
        assert!(!StageStatus::Failed.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&StageStatus::Aborted).unwrap();
        assert_eq!(json, r#""aborted""#);

        let json = serde_json::to_string(&PipelineStatus::Failed).unwrap();
        assert_eq!(json, r#""failed""#);
    }
}
