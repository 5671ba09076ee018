//! Outcome of one stage attempt.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Exit result of executing a stage once.
///
/// Only the exit status decides success. Warnings and metadata are carried
/// into the materialization of a successful attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitResult {
    /// Process exit code, if the process ran to completion.
    pub exit_code: Option<i32>,
    /// True if the attempt was stopped by its timeout.
    pub timed_out: bool,
    /// Failure to launch or run the attempt.
    pub error: Option<String>,
    /// Bounded tail of the captured output.
    pub output_tail: String,
    /// Non-fatal problems reported by the attempt.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Extra metadata for the materialization.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ExitResult {
    /// A successful attempt.
    #[must_use]
    pub fn success(output_tail: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            output_tail: output_tail.into(),
            ..Self::default()
        }
    }

    /// An attempt that exited with `code`.
    #[must_use]
    pub fn exited(code: i32, output_tail: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            output_tail: output_tail.into(),
            ..Self::default()
        }
    }

    /// An attempt that could not run.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// An attempt stopped by its timeout.
    #[must_use]
    pub fn timeout(output_tail: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            output_tail: output_tail.into(),
            ..Self::default()
        }
    }

    /// Adds a warning.
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns true if the attempt exited with status zero.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.timed_out && self.error.is_none() && self.exit_code == Some(0)
    }

    /// Describes why the attempt failed, or `None` if it succeeded.
    #[must_use]
    pub fn failure_reason(&self) -> Option<String> {
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        if self.timed_out {
            return Some("timed out".to_string());
        }
        match self.exit_code {
            Some(0) => None,
            Some(code) => Some(format!("exit status {code}")),
            None => Some("terminated by signal".to_string()),
        }
    }
}
