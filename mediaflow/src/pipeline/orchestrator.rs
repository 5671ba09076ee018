//! Sequential execution of the stage chain.

use super::{StageRun, StageRunner, StageSpec};
use crate::core::{CompletionToken, Materialization, PipelineStatus, StageEvent};
use crate::errors::StageFailure;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    /// Unique id of the run.
    pub run_id: Uuid,
    /// The pipeline name.
    pub pipeline: String,
    /// Final status.
    pub status: PipelineStatus,
    /// Every stage attempt in execution order.
    pub runs: Vec<StageRun>,
    /// Materializations of the stages that succeeded.
    pub materializations: Vec<Materialization>,
    /// The stage that aborted the run, if any.
    pub failed_stage: Option<String>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl PipelineResult {
    /// Returns the names of the stages that succeeded, in order.
    #[must_use]
    pub fn succeeded_stages(&self) -> Vec<&str> {
        self.materializations
            .iter()
            .map(|m| m.stage.as_str())
            .collect()
    }

    /// Returns the attempts made by one stage.
    #[must_use]
    pub fn runs_for(&self, stage: &str) -> Vec<&StageRun> {
        self.runs.iter().filter(|r| r.stage_name == stage).collect()
    }
}

/// A run that stopped on an aborted stage.
#[derive(Debug, Clone, Error)]
#[error("Pipeline '{}' failed: {failure}", .result.pipeline)]
pub struct PipelineFailure {
    /// The terminal stage failure.
    pub failure: StageFailure,
    /// The partial run record.
    pub result: Box<PipelineResult>,
}

/// A validated linear chain of stages.
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    stages: Vec<StageSpec>,
    runner: StageRunner,
}

impl Pipeline {
    pub(crate) fn new(name: String, stages: Vec<StageSpec>, runner: StageRunner) -> Self {
        Self {
            name,
            stages,
            runner,
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stage specs in execution order.
    #[must_use]
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Runs every stage in order.
    ///
    /// Each stage receives the completion token of the previous one. The run
    /// stops at the first stage that exhausts its attempts; stages already
    /// succeeded are left as they are.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineFailure`] carrying the aborted stage's error and the
    /// partial run record.
    pub async fn run(&self) -> Result<PipelineResult, PipelineFailure> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        let sink = self.runner.sink();

        info!(pipeline = %self.name, %run_id, stages = self.stages.len(), "Pipeline started");
        sink.emit(
            &StageEvent::new("pipeline.started")
                .add_data("pipeline", serde_json::json!(self.name))
                .add_data("run_id", serde_json::json!(run_id.to_string())),
        )
        .await;

        let mut result = PipelineResult {
            run_id,
            pipeline: self.name.clone(),
            status: PipelineStatus::Running,
            runs: Vec::new(),
            materializations: Vec::new(),
            failed_stage: None,
            started_at,
            duration: Duration::ZERO,
        };
        let mut token: Option<CompletionToken> = None;

        for spec in &self.stages {
            match self.runner.run(run_id, spec, token.as_ref()).await {
                Ok(success) => {
                    result.runs.extend(success.runs);
                    result.materializations.push(success.materialization);
                    token = Some(success.token);
                }
                Err(abort) => {
                    result.runs.extend(abort.runs);
                    result.status = PipelineStatus::Failed;
                    result.failed_stage = Some(spec.name.clone());
                    result.duration = clock.elapsed();

                    error!(
                        pipeline = %self.name,
                        %run_id,
                        stage = %spec.name,
                        error = %abort.failure,
                        "Pipeline failed"
                    );
                    sink.emit(
                        &StageEvent::new("pipeline.failed")
                            .add_data("pipeline", serde_json::json!(self.name))
                            .add_data("run_id", serde_json::json!(run_id.to_string()))
                            .add_data("stage", serde_json::json!(spec.name))
                            .add_data("error", serde_json::json!(abort.failure.to_string()))
                            .add_data(
                                "output_tail",
                                serde_json::json!(abort.failure.output_tail()),
                            ),
                    )
                    .await;

                    return Err(PipelineFailure {
                        failure: abort.failure,
                        result: Box::new(result),
                    });
                }
            }
        }

        result.status = PipelineStatus::Succeeded;
        result.duration = clock.elapsed();
        info!(
            pipeline = %self.name,
            %run_id,
            duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            "Pipeline completed"
        );
        sink.emit(
            &StageEvent::new("pipeline.completed")
                .add_data("pipeline", serde_json::json!(self.name))
                .add_data("run_id", serde_json::json!(run_id.to_string()))
                .add_data("stages", serde_json::json!(result.succeeded_stages())),
        )
        .await;

        Ok(result)
    }
}
