//! # Mediaflow
//!
//! A scheduled ELT pipeline that moves social-media records from upstream
//! sources into a warehouse and enriches their image attachments with
//! object-detection results.
//!
//! The pipeline is a fixed chain of stages:
//!
//! - **extract**: an external collaborator writes record batches to the
//!   date-partitioned batch store
//! - **load_raw**: batches are upserted into the raw table by natural key
//! - **transform**: an external collaborator builds the warehouse models
//! - **enrich**: attachment images are run through a detector and classified
//! - **load_enrichment**: the detection snapshot replaces the detection table
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mediaflow::prelude::*;
//!
//! let config = Config::load(Path::new("mediaflow.yaml"))?;
//! let pipeline = Pipeline::standard(&config, &std::env::current_exe()?, config_path)?;
//! let result = pipeline.run().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod classify;
pub mod config;
pub mod core;
pub mod enrich;
pub mod errors;
pub mod events;
pub mod jobs;
pub mod pipeline;
pub mod records;
pub mod stages;
pub mod testing;
pub mod utils;
pub mod warehouse;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::classify::{Classification, Classifier, ClassifierConfig};
    pub use crate::config::Config;
    pub use crate::core::{
        CompletionToken, Materialization, PipelineStatus, StageEvent, StageStatus,
    };
    pub use crate::errors::{
        LoaderError, MediaflowError, PipelineValidationError, StageFailure,
    };
    pub use crate::events::{
        CollectingEventSink, EventSink, FanoutEventSink, JsonlEventSink, LoggingEventSink,
        NoOpEventSink,
    };
    pub use crate::pipeline::{
        MaterializationSpec, Pipeline, PipelineBuilder, PipelineFailure, PipelineResult,
        RetryPolicy, StageRunner, StageSpec,
    };
    pub use crate::records::{Category, Detection, DetectionResult, Record};
    pub use crate::stages::{CommandSpec, CommandStage, ExitResult, Stage};
    pub use crate::warehouse::{DetectionLoader, LoadReport, UpsertLoader, Warehouse};
}
