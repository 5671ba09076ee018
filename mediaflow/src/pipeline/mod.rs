//! Pipeline building and execution.
//!
//! This module provides:
//! - Stage specifications with retry policies and asset descriptions
//! - A retry-aware stage runner
//! - The sequential orchestrator and its builder
//! - The standard five-stage ELT chain

mod builder;
mod orchestrator;
mod retry;
mod runner;
mod spec;
mod standard;

#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use orchestrator::{Pipeline, PipelineFailure, PipelineResult};
pub use retry::{BackoffStrategy, JitterStrategy, RetryPolicy, RetryState};
pub use runner::{StageAbort, StageRun, StageRunner, StageSuccess};
pub use spec::{MaterializationSpec, StageSpec};
pub use standard::{ENRICH, EXTRACT, LOAD_ENRICHMENT, LOAD_RAW, TRANSFORM};
