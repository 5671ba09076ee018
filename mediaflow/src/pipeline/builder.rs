//! Pipeline builder with validation.

use super::{Pipeline, StageRunner, StageSpec};
use crate::errors::PipelineValidationError;
use crate::events::{EventSink, NoOpEventSink};
use crate::stages::DEFAULT_TAIL_LIMIT;
use std::collections::HashSet;
use std::sync::Arc;

/// Builder for creating validated linear pipelines.
#[derive(Clone)]
pub struct PipelineBuilder {
    name: String,
    stages: Vec<StageSpec>,
    names: HashSet<String>,
    sink: Arc<dyn EventSink>,
    tail_limit: usize,
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("name", &self.name)
            .field("stages", &self.stage_names())
            .finish_non_exhaustive()
    }
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            names: HashSet::new(),
            sink: Arc::new(NoOpEventSink),
            tail_limit: DEFAULT_TAIL_LIMIT,
        }
    }

    /// Appends a stage to the chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the spec is invalid or the name is already used.
    pub fn stage(mut self, spec: StageSpec) -> Result<Self, PipelineValidationError> {
        spec.validate()?;
        if !self.names.insert(spec.name.clone()) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' is defined more than once",
                spec.name
            ))
            .with_stages(vec![spec.name]));
        }
        self.stages.push(spec);
        Ok(self)
    }

    /// Sets the event sink used for stage and pipeline events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the captured output limit.
    #[must_use]
    pub fn with_tail_limit(mut self, limit: usize) -> Self {
        self.tail_limit = limit;
        self
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if no stage was added.
    pub fn build(self) -> Result<Pipeline, PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new(format!(
                "Pipeline '{}' has no stages",
                self.name
            )));
        }
        let runner = StageRunner::new(self.sink).with_tail_limit(self.tail_limit);
        Ok(Pipeline::new(self.name, self.stages, runner))
    }
}
