//! Stage specifications.

use super::RetryPolicy;
use crate::errors::PipelineValidationError;
use crate::stages::Stage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a stage records when it succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializationSpec {
    /// Stable asset identifier.
    pub asset_key: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Static metadata merged into every materialization.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl MaterializationSpec {
    /// Creates a descriptor for `asset_key`.
    #[must_use]
    pub fn new(asset_key: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            asset_key: asset_key.into(),
            description: description.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Adds a static metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Specification for a single stage in the chain.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// The stage implementation.
    pub stage: Arc<dyn Stage>,
    /// Retry policy applied by the runner.
    pub retry: RetryPolicy,
    /// Materialization emitted on success.
    pub materialization: MaterializationSpec,
}

impl StageSpec {
    /// Creates a spec with the default retry policy and an asset key equal to
    /// the stage name.
    #[must_use]
    pub fn new(name: impl Into<String>, stage: Arc<dyn Stage>) -> Self {
        let name = name.into();
        Self {
            materialization: MaterializationSpec::new(name.clone(), String::new()),
            name,
            stage,
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the materialization descriptor.
    #[must_use]
    pub fn with_materialization(mut self, materialization: MaterializationSpec) -> Self {
        self.materialization = materialization;
        self
    }

    /// Validates the stage specification.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or the policy allows no attempt.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new(
                "Stage name cannot be empty or whitespace-only",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' must allow at least one attempt",
                self.name
            ))
            .with_stages(vec![self.name.clone()]));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedStage;

    #[test]
    fn test_stage_spec_defaults() {
        let spec = StageSpec::new("extract", Arc::new(ScriptedStage::succeeding("extract")));

        assert_eq!(spec.materialization.asset_key, "extract");
        assert_eq!(spec.retry, RetryPolicy::default());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let spec = StageSpec::new("extract", Arc::new(ScriptedStage::succeeding("extract")))
            .with_retry(RetryPolicy::new().with_max_attempts(0));

        let err = spec.validate().unwrap_err();
        assert_eq!(err.stages, vec!["extract".to_string()]);
    }

    #[test]
    fn test_blank_name_rejected() {
        let spec = StageSpec::new("  ", Arc::new(ScriptedStage::succeeding("x")));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_materialization_builder() {
        let m = MaterializationSpec::new("raw_records", "Rows in the warehouse")
            .with_metadata("table", "raw_records");

        assert_eq!(m.metadata["table"], "raw_records");
    }
}
