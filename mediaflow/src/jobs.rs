//! Bodies of the built-in stages.
//!
//! Each job opens the warehouse for its own invocation only and closes it
//! on every exit path.

use crate::classify::Classifier;
use crate::config::Config;
use crate::enrich::{read_snapshot, CommandDetector, EnrichmentReport, Enricher};
use crate::errors::MediaflowError;
use crate::records::BatchStore;
use crate::stages::CommandSpec;
use crate::warehouse::{
    DetectionLoader, LoadReport, UpsertLoader, Warehouse, DETECTION_RESULTS_TABLE,
    RAW_RECORDS_TABLE,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Summary of a raw load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RawLoadSummary {
    /// Batch files found.
    pub files: usize,
    /// Batch files that could not be read.
    pub unreadable_files: usize,
    /// Loader outcome.
    pub load: LoadReport,
    /// Rows in the raw table after loading.
    pub table_rows: u64,
}

impl RawLoadSummary {
    /// Checks that every discovered record reached the warehouse.
    ///
    /// # Errors
    ///
    /// Returns [`MediaflowError::RawLoadIncomplete`] if any batch file was
    /// unreadable or any batch rolled back. Degraded records do not count.
    pub fn ensure_complete(&self) -> Result<(), MediaflowError> {
        if self.unreadable_files == 0 && self.load.is_complete() {
            return Ok(());
        }
        Err(MediaflowError::RawLoadIncomplete {
            unreadable_files: self.unreadable_files,
            failed_batches: self.load.failed_batches.len(),
            committed: self.load.committed,
            attempted: self.load.attempted,
        })
    }
}

/// Summary of a detection snapshot load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionLoadSummary {
    /// Rows in the new snapshot.
    pub loaded: usize,
    /// Rows in the detection table after loading.
    pub table_rows: u64,
}

fn open_warehouse(config: &Config) -> Result<Warehouse, MediaflowError> {
    let path = config.warehouse_path();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    Ok(Warehouse::open(&path)?)
}

/// Loads every record batch into the raw table.
///
/// Unreadable batch files are logged and skipped. Record-level problems are
/// returned as warnings; rolled-back batches are listed in the load report.
pub fn load_raw(config: &Config) -> Result<RawLoadSummary, MediaflowError> {
    let store = BatchStore::new(config.raw_dir());
    let files = store.discover()?;
    if files.is_empty() {
        warn!(root = %store.root().display(), "No record batches found");
    }

    let mut summary = RawLoadSummary {
        files: files.len(),
        ..RawLoadSummary::default()
    };
    let mut records = Vec::new();
    let mut warnings = Vec::new();

    for file in &files {
        let batch = match store.read(file) {
            Ok(batch) => batch,
            Err(e) => {
                error!(path = %file.path.display(), error = %e, "Skipping unreadable batch file");
                summary.unreadable_files += 1;
                continue;
            }
        };
        let before = records.len();
        warnings.extend(batch.warnings);
        for raw in batch.records {
            let (record, record_warnings) = raw.normalize(&batch.source_name);
            warnings.extend(record_warnings);
            records.extend(record);
        }
        info!(
            source = %batch.source_name,
            path = %file.path.display(),
            records = records.len() - before,
            "Read record batch"
        );
    }

    for warning in &warnings {
        warn!(%warning, "Record degraded");
    }

    let mut warehouse = open_warehouse(config)?;
    let mut load = UpsertLoader::new(&mut warehouse, config.warehouse.batch_size).load(&records)?;
    load.warnings.extend(warnings);
    summary.load = load;
    summary.table_rows = warehouse.row_count(RAW_RECORDS_TABLE)?;

    info!(
        files = summary.files,
        unreadable = summary.unreadable_files,
        attempted = summary.load.attempted,
        committed = summary.load.committed,
        warnings = summary.load.warnings.len(),
        table_rows = summary.table_rows,
        "Raw load finished"
    );
    Ok(summary)
}

/// Runs detection over every attachment image and writes the snapshot.
pub async fn enrich(config: &Config) -> Result<EnrichmentReport, MediaflowError> {
    let command = CommandSpec::from_argv(&config.enrichment.detector).ok_or_else(|| {
        crate::errors::ConfigError::Invalid("enrichment.detector must name a command".to_string())
    })?;
    let mut detector =
        CommandDetector::new(command, config.classifier.confidence_threshold);
    if let Some(secs) = config.enrichment.detector_timeout_secs {
        detector = detector.with_timeout(Duration::from_secs(secs));
    }

    let enricher = Enricher::new(
        Arc::new(detector),
        Classifier::new(config.classifier.clone()),
        config.enrichment.concurrency,
    );
    enricher
        .run(&config.images_dir(), &config.base_dir, &config.snapshot_path())
        .await
}

/// Replaces the detection table with the snapshot at `snapshot_path`.
pub fn load_detections_from(
    config: &Config,
    snapshot_path: &Path,
) -> Result<DetectionLoadSummary, MediaflowError> {
    let results = read_snapshot(snapshot_path)?;
    let mut warehouse = open_warehouse(config)?;
    let loaded = DetectionLoader::new(&mut warehouse).load_snapshot(&results)?;
    let table_rows = warehouse.row_count(DETECTION_RESULTS_TABLE)?;

    info!(loaded, table_rows, snapshot = %snapshot_path.display(), "Detection load finished");
    Ok(DetectionLoadSummary { loaded, table_rows })
}

/// Replaces the detection table with the configured snapshot.
pub fn load_detections(config: &Config) -> Result<DetectionLoadSummary, MediaflowError> {
    load_detections_from(config, &config.snapshot_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::write_snapshot;
    use crate::errors::LoaderTransactionFailure;
    use crate::records::{Category, ConfidenceMap, DetectionResult, RawRecord};
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn config_in(dir: &Path) -> Config {
        Config {
            base_dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    fn raw(id: i64, text: &str) -> RawRecord {
        RawRecord {
            record_id: Some(id),
            text: Some(text.to_string()),
            ..RawRecord::default()
        }
    }

    #[test]
    fn test_reload_overwrites_by_natural_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let store = BatchStore::new(config.raw_dir());
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        store.write("x", day, &[raw(1, "hello")]).unwrap();
        let first = load_raw(&config).unwrap();
        assert_eq!(first.table_rows, 1);

        store.write("x", day, &[raw(1, "hello world")]).unwrap();
        let second = load_raw(&config).unwrap();
        assert_eq!(second.table_rows, 1);

        let warehouse = Warehouse::open(&config.warehouse_path()).unwrap();
        let row = warehouse.fetch_record(1, "x").unwrap().unwrap();
        assert_eq!(row.text.as_deref(), Some("hello world"));
    }

    #[test]
    fn test_load_raw_degrades_bad_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let store = BatchStore::new(config.raw_dir());
        let day = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();

        let mut bad_date = raw(2, "b");
        bad_date.occurred_at = Some("yesterday-ish".to_string());
        let no_id = RawRecord {
            text: Some("orphan".to_string()),
            ..RawRecord::default()
        };
        store.write("y", day, &[raw(1, "a"), bad_date, no_id]).unwrap();

        let partition = config.raw_dir().join("2024-03-02");
        std::fs::write(partition.join("broken.json"), "[{").unwrap();

        let summary = load_raw(&config).unwrap();

        assert_eq!(summary.files, 2);
        assert_eq!(summary.unreadable_files, 1);
        assert!(matches!(
            summary.ensure_complete(),
            Err(MediaflowError::RawLoadIncomplete { unreadable_files: 1, .. })
        ));
        assert_eq!(summary.load.attempted, 2);
        assert_eq!(summary.load.committed, 2);
        assert_eq!(summary.load.warnings.len(), 2);

        let warehouse = Warehouse::open(&config.warehouse_path()).unwrap();
        let row = warehouse.fetch_record(2, "y").unwrap().unwrap();
        assert_eq!(row.occurred_at, None);
    }

    #[test]
    fn test_load_raw_keeps_file_with_mistyped_field() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let partition = config.raw_dir().join("2024-03-03");
        std::fs::create_dir_all(&partition).unwrap();
        std::fs::write(
            partition.join("z.json"),
            r#"[{"record_id": 1, "text": "ok"}, {"record_id": 2, "occurred_at": 1700000000}]"#,
        )
        .unwrap();

        let summary = load_raw(&config).unwrap();

        assert_eq!(summary.unreadable_files, 0);
        assert_eq!(summary.load.attempted, 2);
        assert_eq!(summary.load.committed, 2);
        assert_eq!(summary.load.warnings.len(), 1);
        assert_eq!(summary.load.warnings[0].field, "occurred_at");
        assert!(summary.ensure_complete().is_ok());

        let warehouse = Warehouse::open(&config.warehouse_path()).unwrap();
        let row = warehouse.fetch_record(2, "z").unwrap().unwrap();
        assert_eq!(row.occurred_at, None);
    }

    #[test]
    fn test_rolled_back_batch_is_incomplete() {
        let mut summary = RawLoadSummary {
            files: 1,
            ..RawLoadSummary::default()
        };
        summary.load.attempted = 20;
        summary.load.committed = 10;
        summary.load.failed_batches.push(LoaderTransactionFailure {
            batch_index: 1,
            rows: 10,
            reason: "database is locked".to_string(),
        });

        let err = summary.ensure_complete().unwrap_err();
        assert!(matches!(
            err,
            MediaflowError::RawLoadIncomplete {
                unreadable_files: 0,
                failed_batches: 1,
                committed: 10,
                attempted: 20,
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_enrich_fails_when_detector_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.enrichment.detector = vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()];
        let image_dir = config.images_dir().join("x");
        std::fs::create_dir_all(&image_dir).unwrap();
        std::fs::write(image_dir.join("1.jpg"), b"img").unwrap();

        let err = enrich(&config).await.unwrap_err();

        assert!(matches!(err, MediaflowError::DetectionIncomplete { failed: 1, images: 1 }));
        assert!(!config.snapshot_path().exists());
    }

    #[test]
    fn test_load_raw_without_batches() {
        let dir = tempfile::tempdir().unwrap();
        let summary = load_raw(&config_in(dir.path())).unwrap();

        assert_eq!(summary.files, 0);
        assert_eq!(summary.table_rows, 0);
        assert!(summary.ensure_complete().is_ok());
    }

    #[test]
    fn test_load_detections_replaces_table() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let result = |id: i64| DetectionResult {
            record_id: id,
            source_name: "x".to_string(),
            attachment_ref: format!("data/raw/images/x/{id}.jpg"),
            detected_count: 0,
            detected_class_ids: Vec::new(),
            top_class_name: None,
            top_confidence: 0.0,
            category: Category::Other,
            confidence_map: ConfidenceMap::new(),
        };

        write_snapshot(&config.snapshot_path(), &[result(1), result(2)]).unwrap();
        assert_eq!(load_detections(&config).unwrap().table_rows, 2);

        write_snapshot(&config.snapshot_path(), &[result(3)]).unwrap();
        let summary = load_detections(&config).unwrap();
        assert_eq!(summary.loaded, 1);
        assert_eq!(summary.table_rows, 1);
    }

    #[test]
    fn test_load_detections_requires_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_detections(&config_in(dir.path())).is_err());
    }
}
