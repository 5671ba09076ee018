//! The object-detection collaborator.

use crate::errors::DetectorError;
use crate::records::Detection;
use crate::stages::{tail_chars, CommandSpec};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Runs object detection on one image.
///
/// Implementations pre-filter detections below their confidence threshold;
/// the classifier sees only what the detector returns.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Detector: Send + Sync {
    /// Detects objects in the image at `image`.
    async fn detect(&self, image: &Path) -> Result<Vec<Detection>, DetectorError>;
}

/// Detector backed by an external command.
///
/// The command is invoked as `<program> <args> --conf <threshold> <image>`
/// and must print a JSON array of `{class_id, class_name, confidence}`
/// objects on stdout.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    command: CommandSpec,
    confidence_threshold: f64,
    timeout: Option<Duration>,
}

impl CommandDetector {
    /// Creates a detector running `command`.
    #[must_use]
    pub fn new(command: CommandSpec, confidence_threshold: f64) -> Self {
        Self {
            command,
            confidence_threshold,
            timeout: None,
        }
    }

    /// Sets the per-image timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Parses the detector's stdout.
    pub fn parse_output(stdout: &[u8]) -> Result<Vec<Detection>, DetectorError> {
        serde_json::from_slice(stdout).map_err(|e| DetectorError::Parse(e.to_string()))
    }
}

#[async_trait]
impl Detector for CommandDetector {
    async fn detect(&self, image: &Path) -> Result<Vec<Detection>, DetectorError> {
        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .arg("--conf")
            .arg(self.confidence_threshold.to_string())
            .arg(image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.command.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|source| DetectorError::Spawn {
            program: self.command.program.clone(),
            source,
        })?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| DetectorError::Exited {
                    status: format!("timeout after {}s", limit.as_secs()),
                    stderr_tail: String::new(),
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|source| DetectorError::Spawn {
            program: self.command.program.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DetectorError::Exited {
                status: output.status.to_string(),
                stderr_tail: tail_chars(&stderr, 500).to_string(),
            });
        }
        Self::parse_output(&output.stdout)
    }
}
