//! Mock stages and collaborators for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::CompletionToken;
use crate::enrich::Detector;
use crate::errors::DetectorError;
use crate::records::Detection;
use crate::stages::{ExitResult, Stage};

/// A stage that replays a script of attempt results.
///
/// Attempt `n` returns the `n`-th scripted result; once the script is used
/// up the last result repeats.
#[derive(Debug)]
pub struct ScriptedStage {
    name: String,
    script: Vec<ExitResult>,
    call_count: Mutex<usize>,
}

impl ScriptedStage {
    /// Creates a stage replaying `script`.
    #[must_use]
    pub fn new(name: impl Into<String>, script: Vec<ExitResult>) -> Self {
        Self {
            name: name.into(),
            script,
            call_count: Mutex::new(0),
        }
    }

    /// A stage that always succeeds.
    #[must_use]
    pub fn succeeding(name: impl Into<String>) -> Self {
        Self::new(name, vec![ExitResult::success("ok")])
    }

    /// A stage that always exits with status 1.
    #[must_use]
    pub fn failing(name: impl Into<String>) -> Self {
        Self::new(name, vec![ExitResult::exited(1, "boom")])
    }

    /// A stage that fails `failures` times, then succeeds.
    #[must_use]
    pub fn fail_then_succeed(name: impl Into<String>, failures: usize) -> Self {
        let mut script: Vec<_> = (1..=failures)
            .map(|n| ExitResult::exited(1, format!("failure {n}")))
            .collect();
        script.push(ExitResult::success("recovered"));
        Self::new(name, script)
    }

    /// Returns the number of attempts made.
    #[must_use]
    pub fn calls(&self) -> usize {
        *self.call_count.lock()
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _input: Option<&CompletionToken>) -> ExitResult {
        let index = {
            let mut calls = self.call_count.lock();
            *calls += 1;
            *calls - 1
        };
        self.script
            .get(index)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or_else(|| ExitResult::success(""))
    }
}

/// A stage that records the order of execution and the tokens it received.
#[derive(Debug)]
pub struct RecordingStage {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    inputs: Mutex<Vec<Option<String>>>,
}

impl RecordingStage {
    /// Creates a stage appending its name to the shared `log`.
    #[must_use]
    pub fn new(name: impl Into<String>, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.into(),
            log,
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Returns the stage names of the tokens received, per call.
    #[must_use]
    pub fn inputs(&self) -> Vec<Option<String>> {
        self.inputs.lock().clone()
    }
}

#[async_trait]
impl Stage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: Option<&CompletionToken>) -> ExitResult {
        self.log.lock().push(self.name.clone());
        self.inputs.lock().push(input.map(|t| t.stage.clone()));
        ExitResult::success(format!("{} done", self.name))
    }
}

/// A detector answering from a fixed table keyed by file name.
#[derive(Debug, Default)]
pub struct StaticDetector {
    answers: HashMap<String, Vec<Detection>>,
    failures: Vec<String>,
    seen: Mutex<Vec<PathBuf>>,
}

impl StaticDetector {
    /// Creates a detector with no answers; unknown images yield no detections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the detections for images named `file_name`.
    #[must_use]
    pub fn with_answer(mut self, file_name: impl Into<String>, detections: Vec<Detection>) -> Self {
        self.answers.insert(file_name.into(), detections);
        self
    }

    /// Makes detection fail for images named `file_name`.
    #[must_use]
    pub fn with_failure(mut self, file_name: impl Into<String>) -> Self {
        self.failures.push(file_name.into());
        self
    }

    /// Returns the images seen so far.
    #[must_use]
    pub fn seen(&self) -> Vec<PathBuf> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Detector for StaticDetector {
    async fn detect(&self, image: &Path) -> Result<Vec<Detection>, DetectorError> {
        self.seen.lock().push(image.to_path_buf());
        let name = image
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if self.failures.iter().any(|f| f == name) {
            return Err(DetectorError::Parse(format!("scripted failure for {name}")));
        }
        Ok(self.answers.get(name).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_stage_repeats_last() {
        let stage = ScriptedStage::fail_then_succeed("s", 1);

        assert!(!stage.execute(None).await.is_success());
        assert!(stage.execute(None).await.is_success());
        assert!(stage.execute(None).await.is_success());
        assert_eq!(stage.calls(), 3);
    }

    #[tokio::test]
    async fn test_recording_stage() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stage = RecordingStage::new("r", log.clone());
        stage.execute(None).await;

        assert_eq!(*log.lock(), vec!["r".to_string()]);
        assert_eq!(stage.inputs(), vec![None]);
    }

    #[tokio::test]
    async fn test_static_detector() {
        let detector = StaticDetector::new()
            .with_answer("1.jpg", vec![Detection::new(0, "person", 0.8)])
            .with_failure("2.jpg");

        assert_eq!(detector.detect(Path::new("a/1.jpg")).await.unwrap().len(), 1);
        assert!(detector.detect(Path::new("a/2.jpg")).await.is_err());
        assert!(detector.detect(Path::new("a/3.jpg")).await.unwrap().is_empty());
        assert_eq!(detector.seen().len(), 3);
    }
}
