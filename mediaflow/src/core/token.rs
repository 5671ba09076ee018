//! Opaque completion tokens passed from one stage to the next.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Marker proving that a stage succeeded within a run.
///
/// Tokens carry no data; records flow through the batch store and the
/// warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionToken {
    /// The pipeline run this token belongs to.
    pub run_id: Uuid,
    /// The stage that produced the token.
    pub stage: String,
    /// When the stage succeeded.
    pub completed_at: DateTime<Utc>,
}

impl CompletionToken {
    /// Creates a token for a stage that just succeeded.
    #[must_use]
    pub fn new(run_id: Uuid, stage: impl Into<String>) -> Self {
        Self {
            run_id,
            stage: stage.into(),
            completed_at: Utc::now(),
        }
    }
}

impl fmt::Display for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_success", self.stage)
    }
}
