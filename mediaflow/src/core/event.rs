//! Stage lifecycle events and materialization records.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// An event emitted during a pipeline run.
///
/// Events are used for observability and can be consumed by
/// event sinks for logging or the materialization log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    /// The event type (e.g., "stage.started", "stage.materialized").
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event occurred (ISO 8601).
    pub timestamp: String,

    /// The event payload data.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl StageEvent {
    /// Creates a new stage event.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: crate::utils::iso_timestamp(),
            data: HashMap::new(),
        }
    }

    /// Creates an event from a type and an optional JSON object payload.
    #[must_use]
    pub fn from_parts(event_type: &str, data: Option<serde_json::Value>) -> Self {
        let data = match data {
            Some(serde_json::Value::Object(map)) => map.into_iter().collect(),
            Some(other) => HashMap::from([("value".to_string(), other)]),
            None => HashMap::new(),
        };
        Self {
            event_type: event_type.to_string(),
            timestamp: crate::utils::iso_timestamp(),
            data,
        }
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Returns the payload as a JSON object.
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        serde_json::Value::Object(self.data.clone().into_iter().collect())
    }

    /// Creates a "stage.started" event.
    #[must_use]
    pub fn started(stage_name: &str, attempt: u32) -> Self {
        Self::new("stage.started")
            .add_data("stage", serde_json::json!(stage_name))
            .add_data("attempt", serde_json::json!(attempt))
    }

    /// Creates a "stage.attempt_failed" event.
    #[must_use]
    pub fn attempt_failed(stage_name: &str, attempt: u32, error: &str, output_tail: &str) -> Self {
        Self::new("stage.attempt_failed")
            .add_data("stage", serde_json::json!(stage_name))
            .add_data("attempt", serde_json::json!(attempt))
            .add_data("error", serde_json::json!(error))
            .add_data("output_tail", serde_json::json!(output_tail))
    }

    /// Creates a "stage.retry_scheduled" event.
    #[must_use]
    pub fn retry_scheduled(stage_name: &str, next_attempt: u32, delay_ms: u64) -> Self {
        Self::new("stage.retry_scheduled")
            .add_data("stage", serde_json::json!(stage_name))
            .add_data("next_attempt", serde_json::json!(next_attempt))
            .add_data("delay_ms", serde_json::json!(delay_ms))
    }

    /// Creates a "stage.aborted" event.
    #[must_use]
    pub fn aborted(stage_name: &str, attempts: u32, error: &str) -> Self {
        Self::new("stage.aborted")
            .add_data("stage", serde_json::json!(stage_name))
            .add_data("attempts", serde_json::json!(attempts))
            .add_data("error", serde_json::json!(error))
    }

    /// Creates a "stage.materialized" event.
    #[must_use]
    pub fn materialized(materialization: &Materialization) -> Self {
        Self::new("stage.materialized")
            .add_data("stage", serde_json::json!(materialization.stage))
            .add_data("asset_key", serde_json::json!(materialization.asset_key))
            .add_data("description", serde_json::json!(materialization.description))
            .add_data("metadata", serde_json::json!(materialization.metadata))
    }
}

/// Record of an asset produced by a successful stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Materialization {
    /// The stage that produced the asset.
    pub stage: String,
    /// Stable asset identifier.
    pub asset_key: String,
    /// Human-readable description.
    pub description: String,
    /// Metadata attached to the asset, including the output tail.
    pub metadata: BTreeMap<String, String>,
}
