//! Testing utilities for mediaflow pipelines.
//!
//! This module provides:
//! - Scripted and recording stages for runner and orchestrator tests
//! - A table-driven detector for enrichment tests

mod mocks;

pub use mocks::{RecordingStage, ScriptedStage, StaticDetector};
