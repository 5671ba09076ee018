//! Whole-table replacement of the detection results.

use super::{upsert_sql, TableRow, Warehouse};
use crate::errors::LoaderError;
use crate::records::DetectionResult;
use crate::utils::iso_timestamp;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use tracing::{info, warn};

/// Replaces the detection table with a new snapshot.
///
/// The delete and every insert share one transaction: readers see either
/// the previous snapshot or the new one, and a failed swap leaves the
/// previous snapshot in place.
#[derive(Debug)]
pub struct DetectionLoader<'a> {
    warehouse: &'a mut Warehouse,
}

impl<'a> DetectionLoader<'a> {
    /// Creates a loader over `warehouse`.
    pub fn new(warehouse: &'a mut Warehouse) -> Self {
        Self { warehouse }
    }

    /// Swaps in `results` as the complete detection table.
    ///
    /// Returns the number of rows in the table after the swap. Duplicate keys
    /// within the snapshot collapse to the last occurrence.
    pub fn load_snapshot(&mut self, results: &[DetectionResult]) -> Result<usize, LoaderError> {
        let loaded_at = iso_timestamp();
        let conn = self.warehouse.connection_mut();

        let mut written = 0;
        match swap(conn, results, &loaded_at, &mut written) {
            Ok(rows) => {
                info!(
                    table = DetectionResult::TABLE,
                    rows,
                    duplicates = results.len().saturating_sub(rows),
                    "Detection snapshot replaced"
                );
                Ok(rows)
            }
            Err(e) => {
                warn!(
                    table = DetectionResult::TABLE,
                    written,
                    error = %e,
                    "Detection snapshot swap rolled back"
                );
                Err(LoaderError::SnapshotSwap {
                    rows: written,
                    reason: e.to_string(),
                })
            }
        }
    }
}

fn swap(
    conn: &mut Connection,
    results: &[DetectionResult],
    loaded_at: &str,
    written: &mut usize,
) -> rusqlite::Result<usize> {
    let sql = upsert_sql::<DetectionResult>(DetectionResult::NATURAL_KEY);
    let tx = conn.transaction()?;
    tx.execute(&format!("DELETE FROM {}", DetectionResult::TABLE), [])?;
    {
        let mut stmt = tx.prepare_cached(&sql)?;
        for result in results {
            let mut values = result.values();
            values.push(Value::Text(loaded_at.to_string()));
            stmt.execute(params_from_iter(values))?;
            *written += 1;
        }
    }
    let rows: i64 = tx.query_row(
        &format!("SELECT COUNT(*) FROM {}", DetectionResult::TABLE),
        [],
        |row| row.get(0),
    )?;
    tx.commit()?;
    Ok(usize::try_from(rows).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Category, ConfidenceMap};
    use crate::warehouse::DETECTION_RESULTS_TABLE;
    use pretty_assertions::assert_eq;

    fn result(id: i64, source: &str, category: Category) -> DetectionResult {
        DetectionResult {
            record_id: id,
            source_name: source.to_string(),
            attachment_ref: format!("images/{source}/{id}.jpg"),
            detected_count: 2,
            detected_class_ids: vec![0, 39],
            top_class_name: Some("person".to_string()),
            top_confidence: 0.9,
            category,
            confidence_map: ConfidenceMap::from([(0, 0.9), (39, 0.5)]),
        }
    }

    #[test]
    fn test_snapshot_replaces_previous() {
        let mut warehouse = Warehouse::open_in_memory().unwrap();
        let first = vec![
            result(1, "a", Category::Promotional),
            result(2, "a", Category::Lifestyle),
        ];
        let second = vec![result(9, "b", Category::Other)];

        let mut loader = DetectionLoader::new(&mut warehouse);
        assert_eq!(loader.load_snapshot(&first).unwrap(), 2);
        assert_eq!(loader.load_snapshot(&second).unwrap(), 1);

        let rows = warehouse.fetch_detections().unwrap();
        assert_eq!(rows, second);
    }

    #[test]
    fn test_snapshot_round_trips_columns() {
        let mut warehouse = Warehouse::open_in_memory().unwrap();
        let snapshot = vec![result(1, "a", Category::Promotional)];

        DetectionLoader::new(&mut warehouse)
            .load_snapshot(&snapshot)
            .unwrap();

        let rows = warehouse.fetch_detections().unwrap();
        assert_eq!(rows[0].detected_class_ids, vec![0, 39]);
        assert_eq!(rows[0].confidence_map, ConfidenceMap::from([(0, 0.9), (39, 0.5)]));
        assert_eq!(rows[0].category, Category::Promotional);
    }

    #[test]
    fn test_duplicate_keys_count_once() {
        let mut warehouse = Warehouse::open_in_memory().unwrap();
        let mut later = result(1, "a", Category::Lifestyle);
        later.top_class_name = None;
        let snapshot = vec![
            result(1, "a", Category::Promotional),
            result(2, "a", Category::Other),
            later.clone(),
        ];

        let loaded = DetectionLoader::new(&mut warehouse)
            .load_snapshot(&snapshot)
            .unwrap();

        assert_eq!(loaded, 2);
        assert_eq!(warehouse.row_count(DETECTION_RESULTS_TABLE).unwrap(), 2);
        assert_eq!(warehouse.fetch_detections().unwrap()[0], later);
    }

    #[test]
    fn test_empty_snapshot_clears_table() {
        let mut warehouse = Warehouse::open_in_memory().unwrap();
        let mut loader = DetectionLoader::new(&mut warehouse);
        loader
            .load_snapshot(&[result(1, "a", Category::Other)])
            .unwrap();
        loader.load_snapshot(&[]).unwrap();

        assert_eq!(warehouse.row_count(DETECTION_RESULTS_TABLE).unwrap(), 0);
    }

    #[test]
    fn test_failed_swap_keeps_previous_snapshot() {
        let mut warehouse = Warehouse::open_in_memory().unwrap();
        let first = vec![result(1, "a", Category::Promotional)];

        let mut bad = result(2, "a", Category::Other);
        bad.top_confidence = 1.5;
        let second = vec![result(3, "a", Category::Other), bad];

        let mut loader = DetectionLoader::new(&mut warehouse);
        loader.load_snapshot(&first).unwrap();
        let err = loader.load_snapshot(&second).unwrap_err();

        assert!(matches!(err, LoaderError::SnapshotSwap { rows: 1, .. }));
        assert_eq!(warehouse.fetch_detections().unwrap(), first);
    }
}
