//! Retry-aware execution of a single stage.

use super::{RetryState, StageSpec};
use crate::core::{
    AttemptOutcome, CompletionToken, Materialization, StageEvent, StageStatus,
};
use crate::errors::StageFailure;
use crate::events::{EventSink, NoOpEventSink};
use crate::stages::{tail_chars, DEFAULT_TAIL_LIMIT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Record of one stage attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRun {
    /// The stage name.
    pub stage_name: String,
    /// Attempt number, starting at 1.
    pub attempt_number: u32,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// How the attempt ended.
    pub exit_status: AttemptOutcome,
    /// Bounded tail of the attempt's output.
    pub captured_output_tail: String,
}

/// A stage that reached `Succeeded`.
#[derive(Debug, Clone)]
pub struct StageSuccess {
    /// Token handed to the next stage.
    pub token: CompletionToken,
    /// The emitted materialization.
    pub materialization: Materialization,
    /// Every attempt made.
    pub runs: Vec<StageRun>,
    /// Non-fatal warnings from the successful attempt.
    pub warnings: Vec<String>,
}

/// A stage that reached `Aborted`.
#[derive(Debug, Clone)]
pub struct StageAbort {
    /// The terminal failure.
    pub failure: StageFailure,
    /// Every attempt made.
    pub runs: Vec<StageRun>,
}

/// Runs stages with their retry policy and reports lifecycle events.
#[derive(Clone)]
pub struct StageRunner {
    sink: Arc<dyn EventSink>,
    tail_limit: usize,
}

impl Default for StageRunner {
    fn default() -> Self {
        Self::new(Arc::new(NoOpEventSink))
    }
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("tail_limit", &self.tail_limit)
            .finish_non_exhaustive()
    }
}

impl StageRunner {
    /// Creates a runner reporting to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            tail_limit: DEFAULT_TAIL_LIMIT,
        }
    }

    /// Sets the captured output limit in characters.
    #[must_use]
    pub fn with_tail_limit(mut self, limit: usize) -> Self {
        self.tail_limit = limit;
        self
    }

    /// Returns the event sink.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Runs `spec` until it succeeds or its attempts are exhausted.
    ///
    /// Failed attempts are followed by the policy's backoff delay. The
    /// returned token marks success for the next stage.
    pub async fn run(
        &self,
        run_id: Uuid,
        spec: &StageSpec,
        input: Option<&CompletionToken>,
    ) -> Result<StageSuccess, StageAbort> {
        let max_attempts = spec.retry.max_attempts.max(1);
        let mut retry_state = RetryState::new();
        let mut runs = Vec::new();
        let mut attempt = 1;

        loop {
            info!(stage = %spec.name, attempt, max_attempts, "Stage attempt started");
            self.sink.emit(&StageEvent::started(&spec.name, attempt)).await;

            let started_at = Utc::now();
            let result = spec.stage.execute(input).await;
            let tail = tail_chars(&result.output_tail, self.tail_limit).to_string();
            let outcome = if result.is_success() {
                AttemptOutcome::Success
            } else {
                AttemptOutcome::Failure
            };
            runs.push(StageRun {
                stage_name: spec.name.clone(),
                attempt_number: attempt,
                started_at,
                exit_status: outcome,
                captured_output_tail: tail.clone(),
            });

            let reason = result
                .failure_reason()
                .unwrap_or_else(|| "unknown failure".to_string());

            match StageStatus::after_attempt(outcome, attempt, max_attempts) {
                StageStatus::Succeeded => {
                    for warning in &result.warnings {
                        warn!(stage = %spec.name, warning = %warning, "Stage reported a warning");
                    }

                    let mut metadata = spec.materialization.metadata.clone();
                    metadata.extend(result.metadata.clone());
                    metadata.insert("attempts".to_string(), attempt.to_string());
                    metadata.insert("output_tail".to_string(), tail);
                    if !result.warnings.is_empty() {
                        metadata.insert("warnings".to_string(), result.warnings.join("; "));
                    }

                    let materialization = Materialization {
                        stage: spec.name.clone(),
                        asset_key: spec.materialization.asset_key.clone(),
                        description: spec.materialization.description.clone(),
                        metadata,
                    };
                    self.sink
                        .emit(&StageEvent::materialized(&materialization))
                        .await;
                    info!(stage = %spec.name, attempt, asset = %materialization.asset_key, "Stage succeeded");

                    return Ok(StageSuccess {
                        token: CompletionToken::new(run_id, spec.name.clone()),
                        materialization,
                        runs,
                        warnings: result.warnings,
                    });
                }
                StageStatus::Failed => {
                    let failure = StageFailure::Transient {
                        stage: spec.name.clone(),
                        attempt,
                        reason,
                        output_tail: tail,
                    };
                    warn!(stage = %spec.name, attempt, error = %failure, "Stage attempt failed");
                    self.sink
                        .emit(&StageEvent::attempt_failed(
                            &spec.name,
                            attempt,
                            &failure.to_string(),
                            failure.output_tail(),
                        ))
                        .await;

                    let delay = retry_state.next_delay(&spec.retry, attempt);
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    info!(stage = %spec.name, next_attempt = attempt + 1, delay_ms, "Retry scheduled");
                    self.sink
                        .emit(&StageEvent::retry_scheduled(&spec.name, attempt + 1, delay_ms))
                        .await;

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                _ => {
                    let failure = StageFailure::Fatal {
                        stage: spec.name.clone(),
                        attempts: attempt,
                        reason,
                        output_tail: tail,
                    };
                    self.sink
                        .emit(&StageEvent::attempt_failed(
                            &spec.name,
                            attempt,
                            &failure.to_string(),
                            failure.output_tail(),
                        ))
                        .await;
                    self.sink
                        .emit(&StageEvent::aborted(&spec.name, attempt, &failure.to_string()))
                        .await;
                    error!(
                        stage = %spec.name,
                        attempts = attempt,
                        output_tail = %failure.output_tail(),
                        "Stage aborted"
                    );

                    return Err(StageAbort { failure, runs });
                }
            }
        }
    }
}
