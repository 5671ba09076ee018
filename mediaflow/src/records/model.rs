//! Typed records flowing through the pipeline.

use crate::errors::RecordValidationWarning;
use crate::utils::{parse_timestamp, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// One content record extracted from a source.
///
/// `(record_id, source_name)` is the natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Source-assigned id, unique only within the source.
    pub record_id: i64,
    /// Name of the source the record came from.
    pub source_name: String,
    /// When the record was published.
    pub occurred_at: Option<Timestamp>,
    /// Text body.
    pub text: Option<String>,
    /// Whether the record carries an attachment.
    pub has_attachment: bool,
    /// Relative path to the downloaded attachment.
    pub attachment_ref: Option<String>,
    /// View/engagement counter.
    pub engagement_count: Option<i64>,
    /// Share/forward counter.
    pub share_count: Option<i64>,
}

impl Record {
    /// Creates a record with only its natural key set.
    #[must_use]
    pub fn new(record_id: i64, source_name: impl Into<String>) -> Self {
        Self {
            record_id,
            source_name: source_name.into(),
            occurred_at: None,
            text: None,
            has_attachment: false,
            attachment_ref: None,
            engagement_count: None,
            share_count: None,
        }
    }

    /// Sets the text body.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Sets the attachment reference and flags the record as having one.
    #[must_use]
    pub fn with_attachment(mut self, attachment_ref: impl Into<String>) -> Self {
        self.has_attachment = true;
        self.attachment_ref = Some(attachment_ref.into());
        self
    }

    /// Returns the natural key.
    #[must_use]
    pub fn key(&self) -> (i64, &str) {
        (self.record_id, &self.source_name)
    }
}

/// A record as written by the extraction collaborator.
///
/// Everything is optional and timestamps are unparsed; [`RawRecord::normalize`]
/// turns it into a [`Record`]. The extractor's legacy field names are
/// accepted as aliases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Source-assigned id.
    #[serde(default, alias = "message_id")]
    pub record_id: Option<i64>,
    /// Source name; falls back to the batch's source.
    #[serde(default, alias = "channel_name")]
    pub source_name: Option<String>,
    /// Unparsed publication timestamp.
    #[serde(default, alias = "message_date")]
    pub occurred_at: Option<String>,
    /// Text body.
    #[serde(default, alias = "message_text")]
    pub text: Option<String>,
    /// Attachment flag.
    #[serde(default, alias = "has_media")]
    pub has_attachment: Option<bool>,
    /// Attachment path.
    #[serde(default, alias = "image_path")]
    pub attachment_ref: Option<String>,
    /// View counter.
    #[serde(default, alias = "views")]
    pub engagement_count: Option<i64>,
    /// Forward counter.
    #[serde(default, alias = "forwards")]
    pub share_count: Option<i64>,
}

impl RawRecord {
    /// Reads one element of a batch file.
    ///
    /// Fields are looked up by name, then by legacy alias. A field holding
    /// the wrong JSON type is dropped with a warning instead of rejecting
    /// the record. An element that is not an object, or whose id is not an
    /// integer, yields `None` plus a warning.
    #[must_use]
    pub fn from_value(
        value: Value,
        fallback_source: &str,
    ) -> (Option<Self>, Vec<RecordValidationWarning>) {
        let fields = match value {
            Value::Object(fields) => fields,
            other => {
                let warning = RecordValidationWarning::new(
                    None,
                    fallback_source,
                    "record",
                    format!("expected an object, found {}; record skipped", json_type(&other)),
                );
                return (None, vec![warning]);
            }
        };

        let mut reader = FieldReader {
            fields: &fields,
            record_id: None,
            source_name: fallback_source.to_string(),
            warnings: Vec::new(),
        };
        let source_name = reader.string("source_name", "channel_name");
        if let Some(name) = source_name.as_deref().filter(|s| !s.trim().is_empty()) {
            reader.source_name = name.to_string();
        }

        let record_id = match reader.lookup("record_id", "message_id") {
            None => None,
            Some(value) => match as_integer(value) {
                Some(id) => Some(id),
                None => {
                    let warning = RecordValidationWarning::new(
                        None,
                        &reader.source_name,
                        "record_id",
                        format!("expected an integer, found {}; record skipped", json_type(value)),
                    );
                    reader.warnings.push(warning);
                    return (None, reader.warnings);
                }
            },
        };
        reader.record_id = record_id;

        let raw = Self {
            record_id,
            source_name,
            occurred_at: reader.string("occurred_at", "message_date"),
            text: reader.string("text", "message_text"),
            has_attachment: reader.boolean("has_attachment", "has_media"),
            attachment_ref: reader.string("attachment_ref", "image_path"),
            engagement_count: reader.integer("engagement_count", "views"),
            share_count: reader.integer("share_count", "forwards"),
        };
        (Some(raw), reader.warnings)
    }

    /// Converts the raw record into a typed record.
    ///
    /// Malformed timestamps degrade to `None` with a warning. A record without
    /// an id cannot be keyed and yields `None` plus a warning.
    #[must_use]
    pub fn normalize(
        self,
        fallback_source: &str,
    ) -> (Option<Record>, Vec<RecordValidationWarning>) {
        let source_name = self
            .source_name
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| fallback_source.to_string());
        let mut warnings = Vec::new();

        let Some(record_id) = self.record_id else {
            warnings.push(RecordValidationWarning::new(
                None,
                &source_name,
                "record_id",
                "missing record id; record skipped",
            ));
            return (None, warnings);
        };

        let occurred_at = match self.occurred_at.as_deref() {
            None => None,
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => match parse_timestamp(raw) {
                Ok(ts) => Some(ts),
                Err(e) => {
                    warnings.push(RecordValidationWarning::new(
                        Some(record_id),
                        &source_name,
                        "occurred_at",
                        format!("{e}; stored as null"),
                    ));
                    None
                }
            },
        };

        let record = Record {
            record_id,
            source_name,
            occurred_at,
            text: self.text,
            has_attachment: self.has_attachment.unwrap_or(false),
            attachment_ref: self.attachment_ref,
            engagement_count: self.engagement_count,
            share_count: self.share_count,
        };

        (Some(record), warnings)
    }
}

/// Typed field access over one JSON record, collecting degradations.
struct FieldReader<'a> {
    fields: &'a Map<String, Value>,
    record_id: Option<i64>,
    source_name: String,
    warnings: Vec<RecordValidationWarning>,
}

impl<'a> FieldReader<'a> {
    fn lookup(&self, name: &str, alias: &str) -> Option<&'a Value> {
        self.fields
            .get(name)
            .or_else(|| self.fields.get(alias))
            .filter(|v| !v.is_null())
    }

    fn degrade(&mut self, field: &str, value: &Value, expected: &str) {
        self.warnings.push(RecordValidationWarning::new(
            self.record_id,
            &self.source_name,
            field,
            format!("expected {expected}, found {}; stored as null", json_type(value)),
        ));
    }

    fn string(&mut self, name: &str, alias: &str) -> Option<String> {
        match self.lookup(name, alias)? {
            Value::String(s) => Some(s.clone()),
            other => {
                self.degrade(name, other, "a string");
                None
            }
        }
    }

    fn integer(&mut self, name: &str, alias: &str) -> Option<i64> {
        let value = self.lookup(name, alias)?;
        let parsed = as_integer(value);
        if parsed.is_none() {
            self.degrade(name, value, "an integer");
        }
        parsed
    }

    fn boolean(&mut self, name: &str, alias: &str) -> Option<bool> {
        match self.lookup(name, alias)? {
            Value::Bool(b) => Some(*b),
            other => {
                self.degrade(name, other, "a boolean");
                None
            }
        }
    }
}

/// Integers may arrive as JSON numbers or as digit strings.
fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// One detection reported by the object-detection model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Model class id.
    #[serde(alias = "class")]
    pub class_id: u32,
    /// Model class name.
    #[serde(default)]
    pub class_name: String,
    /// Detection confidence in [0, 1].
    pub confidence: f64,
}

impl Detection {
    /// Creates a new detection.
    #[must_use]
    pub fn new(class_id: u32, class_name: impl Into<String>, confidence: f64) -> Self {
        Self {
            class_id,
            class_name: class_name.into(),
            confidence,
        }
    }
}

/// Highest observed confidence per class id.
pub type ConfidenceMap = BTreeMap<u32, f64>;

/// Business-facing image category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// A subject holding or presenting an item.
    Promotional,
    /// An item shown without a subject.
    ProductDisplay,
    /// A subject without an item.
    Lifestyle,
    /// Neither.
    Other,
}

impl Category {
    /// All categories in declaration order.
    pub const ALL: [Self; 4] = [
        Self::Promotional,
        Self::ProductDisplay,
        Self::Lifestyle,
        Self::Other,
    ];

    /// Returns the stored label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Promotional => "promotional",
            Self::ProductDisplay => "product_display",
            Self::Lifestyle => "lifestyle",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier output for one attachment.
///
/// `(record_id, source_name)` is the natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Id of the record owning the attachment.
    pub record_id: i64,
    /// Source of the record.
    pub source_name: String,
    /// Relative path of the processed attachment.
    pub attachment_ref: String,
    /// Number of detections.
    pub detected_count: u32,
    /// Class ids in detection order.
    pub detected_class_ids: Vec<u32>,
    /// Name of the most confident detection.
    pub top_class_name: Option<String>,
    /// Confidence of the most confident detection, 0.0 when none.
    pub top_confidence: f64,
    /// Assigned category.
    pub category: Category,
    /// Highest confidence per class.
    pub confidence_map: ConfidenceMap,
}

impl DetectionResult {
    /// Returns the natural key.
    #[must_use]
    pub fn key(&self) -> (i64, &str) {
        (self.record_id, &self.source_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_raw_record_accepts_legacy_names() {
        let raw: RawRecord = serde_json::from_str(
            r#"{"message_id": 5, "channel_name": "pharma", "message_text": "hi",
                "has_media": true, "image_path": "data/raw/images/pharma/5.jpg",
                "views": 10, "forwards": 2, "message_date": "2024-01-15T10:30:00Z"}"#,
        )
        .unwrap();

        let (record, warnings) = raw.normalize("ignored");
        let record = record.unwrap();

        assert!(warnings.is_empty());
        assert_eq!(record.key(), (5, "pharma"));
        assert_eq!(record.text.as_deref(), Some("hi"));
        assert!(record.has_attachment);
        assert_eq!(record.engagement_count, Some(10));
        assert_eq!(record.share_count, Some(2));
        assert!(record.occurred_at.is_some());
    }

    #[test]
    fn test_from_value_degrades_mistyped_fields() {
        let value = serde_json::json!({
            "message_id": 7,
            "channel_name": "lobelia",
            "message_date": 1_700_000_000,
            "message_text": "new stock",
            "has_media": "yes",
            "views": "1200",
            "forwards": [1]
        });

        let (raw, warnings) = RawRecord::from_value(value, "fallback");
        let raw = raw.unwrap();

        assert_eq!(raw.record_id, Some(7));
        assert_eq!(raw.source_name.as_deref(), Some("lobelia"));
        assert_eq!(raw.occurred_at, None);
        assert_eq!(raw.text.as_deref(), Some("new stock"));
        assert_eq!(raw.has_attachment, None);
        assert_eq!(raw.engagement_count, Some(1200));
        assert_eq!(raw.share_count, None);

        let fields: Vec<&str> = warnings.iter().map(|w| w.field.as_str()).collect();
        assert_eq!(fields, vec!["occurred_at", "has_attachment", "share_count"]);
        assert!(warnings
            .iter()
            .all(|w| w.record_id == Some(7) && w.source_name == "lobelia"));
    }

    #[test]
    fn test_from_value_skips_unkeyable_elements() {
        let (raw, warnings) =
            RawRecord::from_value(serde_json::json!({"record_id": "abc"}), "chan");
        assert_eq!(raw, None);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "record_id");
        assert_eq!(warnings[0].source_name, "chan");

        let (raw, warnings) = RawRecord::from_value(serde_json::json!("just text"), "chan");
        assert_eq!(raw, None);
        assert_eq!(warnings[0].field, "record");
    }

    #[test]
    fn test_from_value_keeps_missing_id_for_normalize() {
        let (raw, warnings) =
            RawRecord::from_value(serde_json::json!({"text": "orphan"}), "chan");

        assert!(warnings.is_empty());
        let (record, warnings) = raw.unwrap().normalize("chan");
        assert_eq!(record, None);
        assert_eq!(warnings[0].field, "record_id");
    }

    #[test]
    fn test_malformed_timestamp_degrades_to_null() {
        let raw = RawRecord {
            record_id: Some(1),
            source_name: Some("x".to_string()),
            occurred_at: Some("yesterday-ish".to_string()),
            ..RawRecord::default()
        };

        let (record, warnings) = raw.normalize("x");

        assert_eq!(record.unwrap().occurred_at, None);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "occurred_at");
        assert_eq!(warnings[0].record_id, Some(1));
    }

    #[test]
    fn test_missing_source_uses_fallback() {
        let raw = RawRecord {
            record_id: Some(3),
            ..RawRecord::default()
        };

        let (record, _) = raw.normalize("from_file");
        assert_eq!(record.unwrap().source_name, "from_file");
    }

    #[test]
    fn test_missing_record_id_is_skipped() {
        let (record, warnings) = RawRecord::default().normalize("x");

        assert!(record.is_none());
        assert_eq!(warnings[0].field, "record_id");
    }

    #[test]
    fn test_category_labels() {
        assert_eq!(Category::ProductDisplay.to_string(), "product_display");
        let json = serde_json::to_string(&Category::Promotional).unwrap();
        assert_eq!(json, r#""promotional""#);
    }

    #[test]
    fn test_detection_accepts_class_alias() {
        let detection: Detection =
            serde_json::from_str(r#"{"class": 39, "class_name": "bottle", "confidence": 0.5}"#)
                .unwrap();
        assert_eq!(detection.class_id, 39);
    }
}
