//! Partitioned on-disk storage of record batches.
//!
//! Layout: `{root}/{YYYY-MM-DD}/{source}.json`, each file a JSON array of
//! records. Writing a partition replaces the previous file for that
//! `(source, date)` pair.

use super::RawRecord;
use crate::errors::{BatchStoreError, RecordValidationWarning};
use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const BATCH_EXTENSION: &str = "json";

/// Records for one source from one extraction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    /// Source the batch belongs to.
    pub source_name: String,
    /// Partition date, if the file lives in a dated directory.
    pub partition: Option<NaiveDate>,
    /// Records in file order.
    pub records: Vec<RawRecord>,
    /// Problems found while reading individual records.
    pub warnings: Vec<RecordValidationWarning>,
}

/// A batch file found in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    /// Full path of the file.
    pub path: PathBuf,
    /// Source name taken from the file stem.
    pub source_name: String,
    /// Partition date taken from the parent directory name.
    pub partition: Option<NaiveDate>,
}

/// Durable store of record batches keyed by `(source, partition date)`.
#[derive(Debug, Clone)]
pub struct BatchStore {
    root: PathBuf,
}

impl BatchStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the file path for a `(source, date)` partition.
    pub fn partition_path(
        &self,
        source_name: &str,
        partition: NaiveDate,
    ) -> Result<PathBuf, BatchStoreError> {
        if source_name.is_empty()
            || source_name.starts_with('.')
            || source_name.contains(['/', '\\'])
        {
            return Err(BatchStoreError::InvalidSource(source_name.to_string()));
        }
        Ok(self
            .root
            .join(partition.format("%Y-%m-%d").to_string())
            .join(format!("{source_name}.{BATCH_EXTENSION}")))
    }

    /// Writes a batch, replacing any previous batch for the same partition.
    ///
    /// The file is written next to its destination and renamed into place,
    /// so readers never observe a half-written batch.
    pub fn write(
        &self,
        source_name: &str,
        partition: NaiveDate,
        records: &[RawRecord],
    ) -> Result<PathBuf, BatchStoreError> {
        let path = self.partition_path(source_name, partition)?;
        let io_err = |source| BatchStoreError::Io {
            path: path.clone(),
            source,
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }

        let body = serde_json::to_vec_pretty(records).map_err(|source| BatchStoreError::Parse {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;

        debug!(path = %path.display(), records = records.len(), "Wrote record batch");
        Ok(path)
    }

    /// Lists every batch file under the root, sorted by path.
    ///
    /// A missing root yields an empty list.
    pub fn discover(&self) -> Result<Vec<BatchFile>, BatchStoreError> {
        if !self.root.exists() {
            warn!(root = %self.root.display(), "Batch store root does not exist");
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let entries = fs::read_dir(&dir).map_err(|source| BatchStoreError::Io {
                path: dir.clone(),
                source,
            })?;
            for entry in entries {
                let path = entry
                    .map_err(|source| BatchStoreError::Io {
                        path: dir.clone(),
                        source,
                    })?
                    .path();
                if path.is_dir() {
                    pending.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some(BATCH_EXTENSION) {
                    if let Some(file) = Self::describe(&path) {
                        files.push(file);
                    }
                }
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Reads one batch file.
    ///
    /// Each array element is read on its own, so one malformed record
    /// degrades or drops only itself. A file holding valid JSON that is not
    /// an array yields an empty batch and a warning.
    pub fn read(&self, file: &BatchFile) -> Result<RecordBatch, BatchStoreError> {
        let body = fs::read(&file.path).map_err(|source| BatchStoreError::Io {
            path: file.path.clone(),
            source,
        })?;
        let value: serde_json::Value =
            serde_json::from_slice(&body).map_err(|source| BatchStoreError::Parse {
                path: file.path.clone(),
                source,
            })?;

        let mut batch = RecordBatch {
            source_name: file.source_name.clone(),
            partition: file.partition,
            records: Vec::new(),
            warnings: Vec::new(),
        };
        match value {
            serde_json::Value::Array(items) => {
                for item in items {
                    let (record, warnings) = RawRecord::from_value(item, &file.source_name);
                    batch.records.extend(record);
                    batch.warnings.extend(warnings);
                }
            }
            _ => warn!(path = %file.path.display(), "Batch file does not contain a list"),
        }
        Ok(batch)
    }

    fn describe(path: &Path) -> Option<BatchFile> {
        let source_name = path.file_stem()?.to_str()?.to_string();
        let partition = path
            .parent()
            .and_then(Path::file_name)
            .and_then(|name| name.to_str())
            .and_then(|name| NaiveDate::parse_from_str(name, "%Y-%m-%d").ok());
        Some(BatchFile {
            path: path.to_path_buf(),
            source_name,
            partition,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn raw(id: i64, text: &str) -> RawRecord {
        RawRecord {
            record_id: Some(id),
            text: Some(text.to_string()),
            ..RawRecord::default()
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[test]
    fn test_partition_layout() {
        let store = BatchStore::new("/data/raw");
        let path = store.partition_path("pharma", day(15)).unwrap();
        assert_eq!(path, PathBuf::from("/data/raw/2024-01-15/pharma.json"));
    }

    #[test]
    fn test_invalid_source_rejected() {
        let store = BatchStore::new("/data/raw");
        assert!(store.partition_path("../etc", day(1)).is_err());
        assert!(store.partition_path("", day(1)).is_err());
    }

    #[test]
    fn test_write_then_discover_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = BatchStore::new(dir.path());

        store.write("beta", day(2), &[raw(2, "b")]).unwrap();
        store.write("alpha", day(1), &[raw(1, "a"), raw(3, "c")]).unwrap();

        let files = store.discover().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].source_name, "alpha");
        assert_eq!(files[0].partition, Some(day(1)));

        let batch = store.read(&files[0]).unwrap();
        assert_eq!(batch.records, vec![raw(1, "a"), raw(3, "c")]);
    }

    #[test]
    fn test_write_overwrites_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = BatchStore::new(dir.path());

        store.write("alpha", day(1), &[raw(1, "old")]).unwrap();
        store.write("alpha", day(1), &[raw(1, "new")]).unwrap();

        let files = store.discover().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(store.read(&files[0]).unwrap().records, vec![raw(1, "new")]);
    }

    #[test]
    fn test_non_list_file_is_empty_batch() {
        let dir = tempfile::tempdir().unwrap();
        let partition = dir.path().join("2024-01-01");
        fs::create_dir_all(&partition).unwrap();
        fs::write(partition.join("odd.json"), r#"{"not": "a list"}"#).unwrap();

        let store = BatchStore::new(dir.path());
        let files = store.discover().unwrap();
        let batch = store.read(&files[0]).unwrap();

        assert!(batch.records.is_empty());
        assert_eq!(batch.source_name, "odd");
    }

    #[test]
    fn test_mistyped_record_does_not_drop_file() {
        let dir = tempfile::tempdir().unwrap();
        let partition = dir.path().join("2024-01-03");
        fs::create_dir_all(&partition).unwrap();
        fs::write(
            partition.join("mixed.json"),
            r#"[{"record_id": 1, "text": "ok"},
                {"record_id": 2, "occurred_at": 1700000000},
                {"record_id": "abc", "text": "no key"}]"#,
        )
        .unwrap();

        let store = BatchStore::new(dir.path());
        let files = store.discover().unwrap();
        let batch = store.read(&files[0]).unwrap();

        let ids: Vec<Option<i64>> = batch.records.iter().map(|r| r.record_id).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);
        assert_eq!(batch.records[1].occurred_at, None);
        let fields: Vec<&str> = batch.warnings.iter().map(|w| w.field.as_str()).collect();
        assert_eq!(fields, vec!["occurred_at", "record_id"]);
    }

    #[test]
    fn test_invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.json"), "[{").unwrap();

        let store = BatchStore::new(dir.path());
        let files = store.discover().unwrap();
        assert_eq!(files[0].partition, None);
        assert!(matches!(
            store.read(&files[0]),
            Err(BatchStoreError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_root_is_empty() {
        let store = BatchStore::new("/definitely/not/here");
        assert!(store.discover().unwrap().is_empty());
    }
}
