//! Error types for the mediaflow pipeline.
//!
//! Stage-level and batch-level failures are raised; record-level problems
//! are collected as warnings and never abort a load.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for mediaflow operations.
#[derive(Debug, Error)]
pub enum MediaflowError {
    /// The pipeline definition is invalid.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A stage failed.
    #[error("{0}")]
    Stage(#[from] StageFailure),

    /// A warehouse loader failed.
    #[error("{0}")]
    Loader(#[from] LoaderError),

    /// The record batch store failed.
    #[error("{0}")]
    BatchStore(#[from] BatchStoreError),

    /// The detection-model collaborator failed.
    #[error("{0}")]
    Detector(#[from] DetectorError),

    /// Configuration could not be loaded or is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// Detection failed for some images; no snapshot was written.
    #[error("Detection failed for {failed} of {images} image(s); snapshot not written")]
    DetectionIncomplete {
        /// Images whose detection failed.
        failed: usize,
        /// Images found.
        images: usize,
    },

    /// A raw load left records unloaded.
    #[error(
        "Raw load incomplete: {unreadable_files} unreadable file(s), \
         {failed_batches} rolled-back batch(es); {committed} of {attempted} records committed"
    )]
    RawLoadIncomplete {
        /// Batch files that could not be read.
        unreadable_files: usize,
        /// Batches whose transaction rolled back.
        failed_batches: usize,
        /// Records committed.
        committed: usize,
        /// Records attempted.
        attempted: usize,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for MediaflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Error raised when a pipeline definition fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}

/// Failure of a single pipeline stage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageFailure {
    /// One attempt failed; the stage may still be retried.
    #[error("Stage '{stage}' attempt {attempt} failed: {reason}")]
    Transient {
        /// The stage name.
        stage: String,
        /// The failed attempt (1-based).
        attempt: u32,
        /// Why the attempt failed.
        reason: String,
        /// Bounded tail of the captured output.
        output_tail: String,
    },

    /// Retries are exhausted; the pipeline run must stop.
    #[error("Stage '{stage}' aborted after {attempts} attempt(s): {reason}")]
    Fatal {
        /// The stage name.
        stage: String,
        /// Number of attempts made.
        attempts: u32,
        /// Why the last attempt failed.
        reason: String,
        /// Bounded tail of the last attempt's captured output.
        output_tail: String,
    },
}

impl StageFailure {
    /// Returns the name of the failing stage.
    #[must_use]
    pub fn stage(&self) -> &str {
        match self {
            Self::Transient { stage, .. } | Self::Fatal { stage, .. } => stage,
        }
    }

    /// Returns the captured output tail attached to the failure.
    #[must_use]
    pub fn output_tail(&self) -> &str {
        match self {
            Self::Transient { output_tail, .. } | Self::Fatal { output_tail, .. } => output_tail,
        }
    }

    /// Returns true if retries are exhausted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

/// Errors raised by the warehouse loaders.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// The warehouse could not be opened.
    #[error("Warehouse connection failed for {path}: {source}")]
    Connection {
        /// The warehouse path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// Schema creation failed.
    #[error("Warehouse schema setup failed: {0}")]
    Schema(#[source] rusqlite::Error),

    /// The table is not part of the warehouse schema.
    #[error("Unknown warehouse table '{0}'")]
    UnknownTable(String),

    /// A natural key column is not part of the target table.
    #[error("Unknown natural key column '{column}' for table '{table}'")]
    UnknownKeyColumn {
        /// The target table.
        table: String,
        /// The offending column.
        column: String,
    },

    /// The detection snapshot could not be swapped in.
    #[error("Detection snapshot swap failed after {rows} row(s): {reason}")]
    SnapshotSwap {
        /// Rows written before the failure.
        rows: usize,
        /// The underlying failure.
        reason: String,
    },

    /// Any other warehouse query failure.
    #[error("Warehouse query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// A batch whose transaction rolled back during an upsert load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderTransactionFailure {
    /// Zero-based index of the batch within the load.
    pub batch_index: usize,
    /// Number of rows in the rolled-back batch.
    pub rows: usize,
    /// Why the batch failed.
    pub reason: String,
}

impl std::fmt::Display for LoaderTransactionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "batch {} ({} rows) rolled back: {}",
            self.batch_index, self.rows, self.reason
        )
    }
}

/// A record-level problem that was recovered by degrading the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordValidationWarning {
    /// The record id, if known.
    pub record_id: Option<i64>,
    /// The record's source.
    pub source_name: String,
    /// The offending field.
    pub field: String,
    /// What was wrong and how it was handled.
    pub message: String,
}

impl RecordValidationWarning {
    /// Creates a new warning.
    #[must_use]
    pub fn new(
        record_id: Option<i64>,
        source_name: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            record_id,
            source_name: source_name.into(),
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RecordValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.record_id {
            Some(id) => write!(
                f,
                "record ({id}, {}) field '{}': {}",
                self.source_name, self.field, self.message
            ),
            None => write!(
                f,
                "record (?, {}) field '{}': {}",
                self.source_name, self.field, self.message
            ),
        }
    }
}

/// Errors raised by the record batch store.
#[derive(Debug, Error)]
pub enum BatchStoreError {
    /// Reading or writing a batch file failed.
    #[error("Batch file {path}: {source}")]
    Io {
        /// The batch file path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A batch file is not valid JSON.
    #[error("Batch file {path} is not valid JSON: {source}")]
    Parse {
        /// The batch file path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A source name cannot be used as a partition file name.
    #[error("Invalid source name for partition: '{0}'")]
    InvalidSource(String),
}

/// Errors raised by the detection-model collaborator.
#[derive(Debug, Error)]
pub enum DetectorError {
    /// The detection command could not be started.
    #[error("Failed to start detector '{program}': {source}")]
    Spawn {
        /// The program name.
        program: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The detection command exited with a failure status.
    #[error("Detector exited with {status}: {stderr_tail}")]
    Exited {
        /// Exit status description.
        status: String,
        /// Bounded tail of stderr.
        stderr_tail: String,
    },

    /// The detection output could not be parsed.
    #[error("Detector output is not a detection list: {0}")]
    Parse(String),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// The config path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// A configuration value is invalid.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failure_accessors() {
        let err = StageFailure::Fatal {
            stage: "extract".to_string(),
            attempts: 3,
            reason: "exit status 1".to_string(),
            output_tail: "boom".to_string(),
        };

        assert_eq!(err.stage(), "extract");
        assert_eq!(err.output_tail(), "boom");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("aborted after 3 attempt(s)"));
    }

    #[test]
    fn test_transient_failure_is_not_fatal() {
        let err = StageFailure::Transient {
            stage: "enrich".to_string(),
            attempt: 1,
            reason: "timed out".to_string(),
            output_tail: String::new(),
        };

        assert!(!err.is_fatal());
        assert!(err.to_string().contains("attempt 1"));
    }

    #[test]
    fn test_pipeline_validation_error() {
        let err = PipelineValidationError::new("Duplicate stage")
            .with_stages(vec!["a".to_string()]);

        assert_eq!(err.to_string(), "Duplicate stage");
        assert_eq!(err.stages, vec!["a".to_string()]);
    }

    #[test]
    fn test_record_warning_display() {
        let warning = RecordValidationWarning::new(Some(7), "chan", "occurred_at", "unparsable");
        assert_eq!(
            warning.to_string(),
            "record (7, chan) field 'occurred_at': unparsable"
        );
    }

    #[test]
    fn test_transaction_failure_display() {
        let failure = LoaderTransactionFailure {
            batch_index: 2,
            rows: 10,
            reason: "constraint".to_string(),
        };
        assert!(failure.to_string().contains("batch 2 (10 rows)"));
    }
}
