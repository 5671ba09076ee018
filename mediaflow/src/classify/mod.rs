//! Deterministic image categorisation from object-detection output.
//!
//! The classifier is a pure function of its configuration and the detection
//! list: no I/O, no state. Identical input always yields identical output,
//! which keeps re-runs of the enrichment stage idempotent.

use crate::records::{Category, ConfidenceMap, Detection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// COCO class id for "person".
pub const DEFAULT_SUBJECT_CLASS: u32 = 0;

/// COCO class ids for bottle, cup and bowl.
pub const DEFAULT_OBJECT_CLASSES: [u32; 3] = [39, 41, 46];

/// Default minimum confidence forwarded to the detection model.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.25;

/// Class ids and thresholds used for categorisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Class id meaning "a person is present".
    #[serde(default = "default_subject_class")]
    pub subject_class: u32,
    /// Class ids meaning "a held or displayed item is present".
    #[serde(default = "default_object_classes")]
    pub object_classes: BTreeSet<u32>,
    /// Minimum detection confidence. Applied by the detection model, not here.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            subject_class: default_subject_class(),
            object_classes: default_object_classes(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

fn default_subject_class() -> u32 {
    DEFAULT_SUBJECT_CLASS
}

fn default_object_classes() -> BTreeSet<u32> {
    DEFAULT_OBJECT_CLASSES.into_iter().collect()
}

fn default_confidence_threshold() -> f64 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

/// Result of classifying one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Assigned category.
    pub category: Category,
    /// Highest confidence per class id.
    pub confidence_map: ConfidenceMap,
    /// The most confident detection, first one wins on ties.
    pub top: Option<Detection>,
}

impl Classification {
    /// Confidence of the top detection, 0.0 when there are none.
    #[must_use]
    pub fn top_confidence(&self) -> f64 {
        self.top.as_ref().map_or(0.0, |d| d.confidence)
    }

    /// Class name of the top detection.
    #[must_use]
    pub fn top_class_name(&self) -> Option<&str> {
        self.top.as_ref().map(|d| d.class_name.as_str())
    }
}

/// Maps detection lists to categories.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    /// Creates a classifier with the given configuration.
    #[must_use]
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classifies one image's detections.
    ///
    /// | subject | object | category          |
    /// |---------|--------|-------------------|
    /// | yes     | yes    | `promotional`     |
    /// | no      | yes    | `product_display` |
    /// | yes     | no     | `lifestyle`       |
    /// | no      | no     | `other`           |
    #[must_use]
    pub fn classify(&self, detections: &[Detection]) -> Classification {
        let has_subject = detections
            .iter()
            .any(|d| d.class_id == self.config.subject_class);
        let has_object = detections
            .iter()
            .any(|d| self.config.object_classes.contains(&d.class_id));

        let category = match (has_subject, has_object) {
            (true, true) => Category::Promotional,
            (false, true) => Category::ProductDisplay,
            (true, false) => Category::Lifestyle,
            (false, false) => Category::Other,
        };

        let mut confidence_map = ConfidenceMap::new();
        for detection in detections {
            confidence_map
                .entry(detection.class_id)
                .and_modify(|c| *c = c.max(detection.confidence))
                .or_insert(detection.confidence);
        }

        let top = detections
            .iter()
            .fold(None::<&Detection>, |best, d| match best {
                Some(b) if b.confidence >= d.confidence => Some(b),
                _ => Some(d),
            })
            .cloned();

        Classification {
            category,
            confidence_map,
            top,
        }
    }
}
