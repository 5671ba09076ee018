//! Idempotent batched insert-or-overwrite loader.

use super::{upsert_sql, TableRow, Warehouse};
use crate::errors::{LoaderError, LoaderTransactionFailure, RecordValidationWarning};
use crate::utils::iso_timestamp;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Outcome of one upsert load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Rows handed to the loader.
    pub attempted: usize,
    /// Rows in batches that committed.
    pub committed: usize,
    /// Batches that rolled back.
    pub failed_batches: Vec<LoaderTransactionFailure>,
    /// Record-level problems recovered before loading.
    pub warnings: Vec<RecordValidationWarning>,
}

impl LoadReport {
    /// Returns true if every batch committed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_batches.is_empty()
    }

    /// Folds another report into this one.
    pub fn merge(&mut self, other: Self) {
        self.attempted += other.attempted;
        self.committed += other.committed;
        self.failed_batches.extend(other.failed_batches);
        self.warnings.extend(other.warnings);
    }
}

/// Loads typed rows with "last write wins" semantics on the natural key.
///
/// Rows are applied in fixed-size batches, one transaction per batch. A
/// failing batch rolls back alone; batches already committed stay.
#[derive(Debug)]
pub struct UpsertLoader<'a> {
    warehouse: &'a mut Warehouse,
    batch_size: usize,
}

impl<'a> UpsertLoader<'a> {
    /// Largest allowed batch.
    pub const MAX_BATCH_SIZE: usize = 1000;

    /// Creates a loader; the batch size is clamped to `1..=MAX_BATCH_SIZE`.
    pub fn new(warehouse: &'a mut Warehouse, batch_size: usize) -> Self {
        Self {
            warehouse,
            batch_size: batch_size.clamp(1, Self::MAX_BATCH_SIZE),
        }
    }

    /// Returns the effective batch size.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Loads rows keyed on the table's natural key.
    pub fn load<T: TableRow>(&mut self, rows: &[T]) -> Result<LoadReport, LoaderError> {
        self.load_keyed(rows, T::NATURAL_KEY)
    }

    /// Loads rows keyed on `natural_key`.
    ///
    /// The key must be backed by a primary key or unique index on the
    /// table; otherwise every batch fails.
    pub fn load_keyed<T: TableRow>(
        &mut self,
        rows: &[T],
        natural_key: &[&str],
    ) -> Result<LoadReport, LoaderError> {
        if let Some(column) = natural_key.iter().find(|c| !T::COLUMNS.contains(*c)) {
            return Err(LoaderError::UnknownKeyColumn {
                table: T::TABLE.to_string(),
                column: (*column).to_string(),
            });
        }

        let sql = upsert_sql::<T>(natural_key);
        let loaded_at = iso_timestamp();
        let batch_size = self.batch_size;
        let conn = self.warehouse.connection_mut();
        let mut report = LoadReport {
            attempted: rows.len(),
            ..LoadReport::default()
        };

        for (batch_index, batch) in rows.chunks(batch_size).enumerate() {
            match apply_batch(conn, &sql, batch, &loaded_at) {
                Ok(()) => {
                    debug!(table = T::TABLE, batch = batch_index, rows = batch.len(), "Batch committed");
                    report.committed += batch.len();
                }
                Err(e) => {
                    warn!(
                        table = T::TABLE,
                        batch = batch_index,
                        rows = batch.len(),
                        error = %e,
                        "Batch rolled back"
                    );
                    report.failed_batches.push(LoaderTransactionFailure {
                        batch_index,
                        rows: batch.len(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            table = T::TABLE,
            attempted = report.attempted,
            committed = report.committed,
            failed_batches = report.failed_batches.len(),
            "Upsert load finished"
        );
        Ok(report)
    }
}

fn apply_batch<T: TableRow>(
    conn: &mut Connection,
    sql: &str,
    batch: &[T],
    loaded_at: &str,
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(sql)?;
        for row in batch {
            let mut values = row.values();
            values.push(Value::Text(loaded_at.to_string()));
            stmt.execute(params_from_iter(values))?;
        }
    }
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Record;
    use crate::warehouse::RAW_RECORDS_TABLE;
    use pretty_assertions::assert_eq;

    fn batch() -> Vec<Record> {
        vec![
            Record::new(1, "x").with_text("hello"),
            Record::new(2, "x").with_attachment("images/x/2.jpg"),
            Record::new(1, "y").with_text("other source"),
        ]
    }

    #[test]
    fn test_load_inserts_rows() {
        let mut warehouse = Warehouse::open_in_memory().unwrap();
        let report = UpsertLoader::new(&mut warehouse, 1000).load(&batch()).unwrap();

        assert_eq!(report.attempted, 3);
        assert_eq!(report.committed, 3);
        assert!(report.is_complete());
        assert_eq!(warehouse.row_count(RAW_RECORDS_TABLE).unwrap(), 3);
    }

    #[test]
    fn test_load_is_idempotent() {
        let mut warehouse = Warehouse::open_in_memory().unwrap();
        UpsertLoader::new(&mut warehouse, 2).load(&batch()).unwrap();
        let first = warehouse.fetch_record(2, "x").unwrap();

        UpsertLoader::new(&mut warehouse, 2).load(&batch()).unwrap();

        assert_eq!(warehouse.row_count(RAW_RECORDS_TABLE).unwrap(), 3);
        assert_eq!(warehouse.fetch_record(2, "x").unwrap(), first);
    }

    #[test]
    fn test_overwrite_last_write_wins() {
        let mut warehouse = Warehouse::open_in_memory().unwrap();
        let mut loader = UpsertLoader::new(&mut warehouse, 1000);
        loader.load(&[Record::new(1, "x").with_text("A")]).unwrap();
        loader.load(&[Record::new(1, "x").with_text("B")]).unwrap();

        assert_eq!(warehouse.row_count(RAW_RECORDS_TABLE).unwrap(), 1);
        let row = warehouse.fetch_record(1, "x").unwrap().unwrap();
        assert_eq!(row.text.as_deref(), Some("B"));
    }

    #[test]
    fn test_null_overwrites_existing_value() {
        let mut warehouse = Warehouse::open_in_memory().unwrap();
        let mut loader = UpsertLoader::new(&mut warehouse, 1000);
        loader.load(&[Record::new(1, "x").with_text("A")]).unwrap();
        loader.load(&[Record::new(1, "x")]).unwrap();

        let row = warehouse.fetch_record(1, "x").unwrap().unwrap();
        assert_eq!(row.text, None);
    }

    #[test]
    fn test_duplicates_within_batch_last_wins() {
        let mut warehouse = Warehouse::open_in_memory().unwrap();
        UpsertLoader::new(&mut warehouse, 1000)
            .load(&[
                Record::new(1, "x").with_text("first"),
                Record::new(1, "x").with_text("second"),
            ])
            .unwrap();

        assert_eq!(warehouse.row_count(RAW_RECORDS_TABLE).unwrap(), 1);
        let row = warehouse.fetch_record(1, "x").unwrap().unwrap();
        assert_eq!(row.text.as_deref(), Some("second"));
    }

    #[test]
    fn test_failed_batch_rolls_back_alone() {
        let mut warehouse = Warehouse::open_in_memory().unwrap();
        let rows = vec![
            Record::new(1, "x"),
            Record::new(2, "x"),
            Record::new(3, "x"),
            // Empty source violates the table's check constraint.
            Record::new(4, ""),
            Record::new(5, "x"),
        ];

        let report = UpsertLoader::new(&mut warehouse, 2).load(&rows).unwrap();

        assert_eq!(report.attempted, 5);
        assert_eq!(report.committed, 3);
        assert_eq!(report.failed_batches.len(), 1);
        assert_eq!(report.failed_batches[0].batch_index, 1);
        assert_eq!(report.failed_batches[0].rows, 2);
        assert!(!report.is_complete());

        assert!(warehouse.fetch_record(3, "x").unwrap().is_none());
        assert!(warehouse.fetch_record(5, "x").unwrap().is_some());
        assert_eq!(warehouse.row_count(RAW_RECORDS_TABLE).unwrap(), 3);
    }

    #[test]
    fn test_unknown_key_column_rejected() {
        let mut warehouse = Warehouse::open_in_memory().unwrap();
        let err = UpsertLoader::new(&mut warehouse, 10)
            .load_keyed(&batch(), &["record_id", "channel"])
            .unwrap_err();

        assert!(matches!(err, LoaderError::UnknownKeyColumn { column, .. } if column == "channel"));
    }

    #[test]
    fn test_batch_size_is_clamped() {
        let mut warehouse = Warehouse::open_in_memory().unwrap();
        assert_eq!(UpsertLoader::new(&mut warehouse, 0).batch_size(), 1);
        assert_eq!(UpsertLoader::new(&mut warehouse, 50_000).batch_size(), 1000);
    }

    #[test]
    fn test_report_merge() {
        let mut total = LoadReport {
            attempted: 2,
            committed: 2,
            ..LoadReport::default()
        };
        total.merge(LoadReport {
            attempted: 3,
            committed: 1,
            failed_batches: vec![LoaderTransactionFailure {
                batch_index: 0,
                rows: 2,
                reason: "x".to_string(),
            }],
            warnings: Vec::new(),
        });

        assert_eq!(total.attempted, 5);
        assert_eq!(total.committed, 3);
        assert!(!total.is_complete());
    }
}
