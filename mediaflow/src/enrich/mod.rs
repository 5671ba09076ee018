//! Image enrichment: detect, classify and snapshot every attachment.
//!
//! Each run processes the full current attachment set and writes a complete
//! snapshot. Images are independent, so detection runs with bounded
//! concurrency and result order is normalised afterwards.

mod attachments;
mod detector;

pub use attachments::{scan_attachments, Attachment};
#[cfg(test)]
pub use detector::MockDetector;
pub use detector::{CommandDetector, Detector};

use crate::classify::Classifier;
use crate::errors::MediaflowError;
use crate::records::{Category, Detection, DetectionResult};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Summary of one enrichment run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentReport {
    /// Attachment images found.
    pub images_found: usize,
    /// Images with a detection result.
    pub processed: usize,
    /// Results per category.
    pub categories: BTreeMap<Category, usize>,
    /// Results per source.
    pub per_source: BTreeMap<String, usize>,
    /// Where the snapshot was written.
    pub snapshot_path: PathBuf,
    /// SHA-256 of the snapshot file.
    pub snapshot_digest: String,
}

/// Runs detection and classification over attachment images.
#[derive(Clone)]
pub struct Enricher {
    detector: Arc<dyn Detector>,
    classifier: Classifier,
    concurrency: usize,
}

impl std::fmt::Debug for Enricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enricher")
            .field("classifier", &self.classifier)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl Enricher {
    /// Creates an enricher; concurrency is at least one.
    #[must_use]
    pub fn new(detector: Arc<dyn Detector>, classifier: Classifier, concurrency: usize) -> Self {
        Self {
            detector,
            classifier,
            concurrency: concurrency.max(1),
        }
    }

    /// Detects and classifies every attachment.
    ///
    /// Results are sorted by `(source_name, record_id)`. Images whose
    /// detection fails are logged and left out; their count is returned
    /// alongside.
    pub async fn process(
        &self,
        attachments: Vec<Attachment>,
        base_dir: &Path,
    ) -> (Vec<DetectionResult>, usize) {
        let outcomes: Vec<_> = stream::iter(attachments)
            .map(|attachment| {
                let detector = Arc::clone(&self.detector);
                async move {
                    let detections = detector.detect(&attachment.path).await;
                    (attachment, detections)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut results = Vec::with_capacity(outcomes.len());
        let mut failed = 0;
        for (attachment, detections) in outcomes {
            match detections {
                Ok(detections) => results.push(self.build_result(&attachment, base_dir, &detections)),
                Err(e) => {
                    failed += 1;
                    warn!(path = %attachment.path.display(), error = %e, "Detection failed");
                }
            }
        }

        results.sort_by(|a, b| {
            (a.source_name.as_str(), a.record_id, a.attachment_ref.as_str()).cmp(&(
                b.source_name.as_str(),
                b.record_id,
                b.attachment_ref.as_str(),
            ))
        });
        (results, failed)
    }

    fn build_result(
        &self,
        attachment: &Attachment,
        base_dir: &Path,
        detections: &[Detection],
    ) -> DetectionResult {
        let classification = self.classifier.classify(detections);
        let attachment_ref = attachment
            .path
            .strip_prefix(base_dir)
            .unwrap_or(&attachment.path)
            .to_string_lossy()
            .into_owned();

        DetectionResult {
            record_id: attachment.record_id,
            source_name: attachment.source_name.clone(),
            attachment_ref,
            detected_count: u32::try_from(detections.len()).unwrap_or(u32::MAX),
            detected_class_ids: detections.iter().map(|d| d.class_id).collect(),
            top_class_name: classification.top_class_name().map(str::to_string),
            top_confidence: classification.top_confidence(),
            category: classification.category,
            confidence_map: classification.confidence_map,
        }
    }

    /// Scans `images_dir`, processes every image and writes the snapshot.
    ///
    /// # Errors
    ///
    /// Fails without touching `snapshot_path` if detection failed for any
    /// image, so the previous snapshot stays in place.
    pub async fn run(
        &self,
        images_dir: &Path,
        base_dir: &Path,
        snapshot_path: &Path,
    ) -> Result<EnrichmentReport, MediaflowError> {
        let attachments = scan_attachments(images_dir)?;
        let images_found = attachments.len();
        info!(images = images_found, root = %images_dir.display(), "Found attachment images");

        let (results, failed) = self.process(attachments, base_dir).await;
        if failed > 0 {
            return Err(MediaflowError::DetectionIncomplete {
                failed,
                images: images_found,
            });
        }
        let snapshot_digest = write_snapshot(snapshot_path, &results)?;

        let mut report = EnrichmentReport {
            images_found,
            processed: results.len(),
            snapshot_path: snapshot_path.to_path_buf(),
            snapshot_digest,
            ..EnrichmentReport::default()
        };
        for result in &results {
            *report.categories.entry(result.category).or_default() += 1;
            *report.per_source.entry(result.source_name.clone()).or_default() += 1;
        }
        log_distribution(&report);
        Ok(report)
    }
}

fn log_distribution(report: &EnrichmentReport) {
    info!(
        processed = report.processed,
        snapshot = %report.snapshot_path.display(),
        digest = %report.snapshot_digest,
        "Enrichment finished"
    );
    #[allow(clippy::cast_precision_loss)]
    let total = report.processed.max(1) as f64;
    for (category, count) in &report.categories {
        #[allow(clippy::cast_precision_loss)]
        let share = *count as f64 * 100.0 / total;
        info!(category = %category, count, share = format!("{share:.1}%"), "Category distribution");
    }
    for (source, count) in &report.per_source {
        info!(source = %source, count, "Images per source");
    }
}

/// Writes a snapshot as pretty JSON and returns its SHA-256 digest.
pub fn write_snapshot(path: &Path, results: &[DetectionResult]) -> Result<String, MediaflowError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let body = serde_json::to_vec_pretty(results)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &body)?;
    std::fs::rename(&tmp, path)?;
    Ok(hex::encode(Sha256::digest(&body)))
}

/// Reads a snapshot written by [`write_snapshot`].
pub fn read_snapshot(path: &Path) -> Result<Vec<DetectionResult>, MediaflowError> {
    let body = std::fs::read(path)?;
    Ok(serde_json::from_slice(&body)?)
}
