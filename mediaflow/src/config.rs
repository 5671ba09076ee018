//! Configuration for the mediaflow pipeline.
//!
//! Loaded once at process start from YAML or JSON, then passed by reference
//! into each component. Every field has a default, so an empty file is a
//! valid configuration.

use crate::classify::ClassifierConfig;
use crate::errors::ConfigError;
use crate::pipeline::RetryPolicy;
use crate::stages::{AuxiliaryCommand, CommandSpec, DEFAULT_TAIL_LIMIT};
use crate::warehouse::UpsertLoader;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable overriding [`Config::base_dir`].
pub const ENV_BASE_DIR: &str = "MEDIAFLOW_BASE_DIR";
/// Environment variable overriding [`WarehouseConfig::path`].
pub const ENV_WAREHOUSE_PATH: &str = "MEDIAFLOW_WAREHOUSE_PATH";
/// Environment variable overriding [`EnrichmentConfig::concurrency`].
pub const ENV_CONCURRENCY: &str = "MEDIAFLOW_CONCURRENCY";
/// Environment variable overriding [`ClassifierConfig::confidence_threshold`].
pub const ENV_CONFIDENCE_THRESHOLD: &str = "MEDIAFLOW_CONFIDENCE_THRESHOLD";

/// Main configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory relative paths are resolved against.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Data lake locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Warehouse connection and load settings
    #[serde(default)]
    pub warehouse: WarehouseConfig,

    /// Image categorisation rules
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Enrichment stage settings
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    /// Stage chain settings
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            storage: StorageConfig::default(),
            warehouse: WarehouseConfig::default(),
            classifier: ClassifierConfig::default(),
            enrichment: EnrichmentConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Data lake locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the partitioned record batch store
    #[serde(default = "default_raw_dir")]
    pub raw_dir: PathBuf,

    /// Root of the attachment images, one directory per source
    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,

    /// Where the enrichment stage writes its detection snapshot
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,

    /// JSON-lines materialization log; disabled when unset
    #[serde(default = "default_event_log")]
    pub event_log: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            raw_dir: default_raw_dir(),
            images_dir: default_images_dir(),
            snapshot_path: default_snapshot_path(),
            event_log: default_event_log(),
        }
    }
}

/// Warehouse settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// Path of the warehouse database file
    #[serde(default = "default_warehouse_path")]
    pub path: PathBuf,

    /// Rows per upsert transaction (1..=1000)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            path: default_warehouse_path(),
            batch_size: default_batch_size(),
        }
    }
}

/// Enrichment stage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Images processed concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Detection command; receives `--conf <threshold> <image>`
    #[serde(default = "default_detector")]
    pub detector: Vec<String>,

    /// Per-image detection timeout in seconds
    #[serde(default)]
    pub detector_timeout_secs: Option<u64>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            detector: default_detector(),
            detector_timeout_secs: None,
        }
    }
}

/// Stage chain settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name used in logs and events
    #[serde(default = "default_pipeline_name")]
    pub name: String,

    /// Characters of stage output kept for events
    #[serde(default = "default_tail_limit")]
    pub tail_limit: usize,

    /// Per-stage settings
    #[serde(default)]
    pub stages: StagesConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            tail_limit: default_tail_limit(),
            stages: StagesConfig::default(),
        }
    }
}

/// Settings for the five stages of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Extraction collaborator
    #[serde(default = "default_extract_stage")]
    pub extract: StageConfig,

    /// Raw batch load; runs the built-in loader when `command` is empty
    #[serde(default = "StageConfig::builtin")]
    pub load_raw: StageConfig,

    /// Transformation collaborator
    #[serde(default = "default_transform_stage")]
    pub transform: StageConfig,

    /// Image enrichment; runs the built-in enricher when `command` is empty
    #[serde(default = "default_enrich_stage")]
    pub enrich: StageConfig,

    /// Detection snapshot load; runs the built-in loader when `command` is empty
    #[serde(default = "default_load_enrichment_stage")]
    pub load_enrichment: StageConfig,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            extract: default_extract_stage(),
            load_raw: StageConfig::builtin(),
            transform: default_transform_stage(),
            enrich: default_enrich_stage(),
            load_enrichment: default_load_enrichment_stage(),
        }
    }
}

/// Settings for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Command line; empty selects the built-in body where one exists
    #[serde(default)]
    pub command: Vec<String>,

    /// Working directory for the command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Retry policy
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-attempt timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Checks run after a successful attempt; failures are warnings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auxiliary: Vec<AuxiliaryCommand>,
}

impl StageConfig {
    /// A stage backed by a built-in body with the default policy.
    #[must_use]
    pub fn builtin() -> Self {
        Self::default()
    }

    /// A stage running `argv`.
    #[must_use]
    pub fn command<S: Into<String>>(argv: impl IntoIterator<Item = S>) -> Self {
        Self {
            command: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_raw_dir() -> PathBuf {
    PathBuf::from("data/raw/records")
}
fn default_images_dir() -> PathBuf {
    PathBuf::from("data/raw/images")
}
fn default_snapshot_path() -> PathBuf {
    PathBuf::from("data/processed/detection_results.json")
}
fn default_event_log() -> Option<PathBuf> {
    Some(PathBuf::from("logs/materializations.jsonl"))
}
fn default_warehouse_path() -> PathBuf {
    PathBuf::from("data/warehouse.db")
}
fn default_batch_size() -> usize {
    UpsertLoader::MAX_BATCH_SIZE
}
fn default_concurrency() -> usize {
    4
}
fn default_detector() -> Vec<String> {
    vec!["yolo-detect".to_string()]
}
fn default_pipeline_name() -> String {
    "media_elt".to_string()
}
fn default_tail_limit() -> usize {
    DEFAULT_TAIL_LIMIT
}

fn default_extract_stage() -> StageConfig {
    StageConfig::command(["python", "scripts/extract.py"])
}

fn default_transform_stage() -> StageConfig {
    let mut stage = StageConfig::command(["dbt", "run"]);
    stage.working_dir = Some(PathBuf::from("transform"));
    stage.auxiliary = vec![AuxiliaryCommand::new(
        "test",
        CommandSpec::new("dbt").arg("test").with_working_dir("transform"),
    )];
    stage
}

fn default_enrich_stage() -> StageConfig {
    let mut stage = StageConfig::builtin();
    stage.retry = RetryPolicy::default().with_max_attempts(2);
    stage
}

fn default_load_enrichment_stage() -> StageConfig {
    let mut stage = StageConfig::builtin();
    stage.auxiliary = vec![AuxiliaryCommand::new(
        "refresh",
        CommandSpec::new("dbt")
            .args(["run", "--select", "fct_image_detections"])
            .with_working_dir("transform"),
    )];
    stage
}

impl Config {
    /// Loads a file, applies environment overrides and validates.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides_from(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML or JSON file.
    ///
    /// Format is detected from the extension; anything other than `.json`
    /// is read as YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    /// Parses configuration from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parses configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serializes configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Applies `MEDIAFLOW_*` overrides from `vars`.
    pub fn apply_overrides_from<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                ENV_BASE_DIR => self.base_dir = PathBuf::from(value),
                ENV_WAREHOUSE_PATH => self.warehouse.path = PathBuf::from(value),
                ENV_CONCURRENCY => {
                    self.enrichment.concurrency = value.parse().map_err(|_| {
                        ConfigError::Invalid(format!("{ENV_CONCURRENCY} must be an integer, got '{value}'"))
                    })?;
                }
                ENV_CONFIDENCE_THRESHOLD => {
                    self.classifier.confidence_threshold = value.parse().map_err(|_| {
                        ConfigError::Invalid(format!(
                            "{ENV_CONFIDENCE_THRESHOLD} must be a number, got '{value}'"
                        ))
                    })?;
                }
                _ => continue,
            }
            debug!(variable = %key, "Applied configuration override");
        }
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let batch_size = self.warehouse.batch_size;
        if batch_size == 0 || batch_size > UpsertLoader::MAX_BATCH_SIZE {
            return Err(ConfigError::Invalid(format!(
                "warehouse.batch_size must be between 1 and {}, got {batch_size}",
                UpsertLoader::MAX_BATCH_SIZE
            )));
        }
        if self.enrichment.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "enrichment.concurrency must be > 0".to_string(),
            ));
        }
        if self.enrichment.detector.is_empty() {
            return Err(ConfigError::Invalid(
                "enrichment.detector must name a command".to_string(),
            ));
        }
        let threshold = self.classifier.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "classifier.confidence_threshold must be within [0, 1], got {threshold}"
            )));
        }

        let stages = &self.pipeline.stages;
        for (name, stage) in [
            ("extract", &stages.extract),
            ("load_raw", &stages.load_raw),
            ("transform", &stages.transform),
            ("enrich", &stages.enrich),
            ("load_enrichment", &stages.load_enrichment),
        ] {
            if stage.retry.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "pipeline.stages.{name}.retry.max_attempts must be > 0"
                )));
            }
        }
        if stages.extract.command.is_empty() {
            return Err(ConfigError::Invalid(
                "pipeline.stages.extract.command must not be empty".to_string(),
            ));
        }
        if stages.transform.command.is_empty() {
            return Err(ConfigError::Invalid(
                "pipeline.stages.transform.command must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves `path` against the base directory.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Absolute-or-base-relative record batch store root.
    #[must_use]
    pub fn raw_dir(&self) -> PathBuf {
        self.resolve(&self.storage.raw_dir)
    }

    /// Resolved images root.
    #[must_use]
    pub fn images_dir(&self) -> PathBuf {
        self.resolve(&self.storage.images_dir)
    }

    /// Resolved detection snapshot path.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.resolve(&self.storage.snapshot_path)
    }

    /// Resolved materialization log path, if enabled.
    #[must_use]
    pub fn event_log_path(&self) -> Option<PathBuf> {
        self.storage.event_log.as_deref().map(|p| self.resolve(p))
    }

    /// Resolved warehouse path.
    #[must_use]
    pub fn warehouse_path(&self) -> PathBuf {
        self.resolve(&self.warehouse.path)
    }
}
