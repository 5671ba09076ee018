//! Core domain model types for mediaflow.
//!
//! This module contains the types shared by the stage runner and the
//! orchestrator:
//! - Stage and pipeline status enums
//! - Stage lifecycle events and materializations
//! - Completion tokens passed between stages

mod event;
mod status;
mod token;

pub use event::{Materialization, StageEvent};
pub use status::{AttemptOutcome, PipelineStatus, StageStatus};
pub use token::CompletionToken;
