//! Embedded relational warehouse and its idempotent loaders.
//!
//! Two tables are populated:
//! - `raw_records`, merged by natural key on every raw load
//! - `detection_results`, replaced wholesale by every enrichment load
//!
//! Each loader borrows a [`Warehouse`] for the duration of one invocation;
//! the connection closes when the warehouse is dropped.

mod snapshot;
mod upsert;

pub use snapshot::DetectionLoader;
pub use upsert::{LoadReport, UpsertLoader};

use crate::errors::LoaderError;
use crate::records::{Category, ConfidenceMap, DetectionResult, Record};
use crate::utils::{format_iso8601, parse_timestamp};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Table holding raw records.
pub const RAW_RECORDS_TABLE: &str = "raw_records";

/// Table holding the current detection snapshot.
pub const DETECTION_RESULTS_TABLE: &str = "detection_results";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS raw_records (
    record_id        INTEGER NOT NULL,
    source_name      TEXT    NOT NULL CHECK (length(source_name) > 0),
    occurred_at      TEXT,
    text             TEXT,
    has_attachment   INTEGER NOT NULL DEFAULT 0,
    attachment_ref   TEXT,
    engagement_count INTEGER,
    share_count      INTEGER,
    loaded_at        TEXT    NOT NULL,
    PRIMARY KEY (record_id, source_name)
);
CREATE INDEX IF NOT EXISTS idx_raw_records_source ON raw_records (source_name);
CREATE INDEX IF NOT EXISTS idx_raw_records_occurred ON raw_records (occurred_at);

CREATE TABLE IF NOT EXISTS detection_results (
    record_id          INTEGER NOT NULL,
    source_name        TEXT    NOT NULL CHECK (length(source_name) > 0),
    attachment_ref     TEXT    NOT NULL,
    detected_count     INTEGER NOT NULL CHECK (detected_count >= 0),
    detected_class_ids TEXT    NOT NULL,
    top_class_name     TEXT,
    top_confidence     REAL    NOT NULL CHECK (top_confidence >= 0.0 AND top_confidence <= 1.0),
    category           TEXT    NOT NULL
        CHECK (category IN ('promotional', 'product_display', 'lifestyle', 'other')),
    confidence_map     TEXT    NOT NULL,
    loaded_at          TEXT    NOT NULL,
    PRIMARY KEY (record_id, source_name)
);
CREATE INDEX IF NOT EXISTS idx_detection_results_category ON detection_results (category);
";

/// A typed row that maps onto one warehouse table.
pub trait TableRow {
    /// Destination table.
    const TABLE: &'static str;
    /// Column names in the order of [`TableRow::values`].
    const COLUMNS: &'static [&'static str];
    /// Columns forming the natural key.
    const NATURAL_KEY: &'static [&'static str];

    /// Column values for this row.
    fn values(&self) -> Vec<Value>;
}

impl TableRow for Record {
    const TABLE: &'static str = RAW_RECORDS_TABLE;
    const COLUMNS: &'static [&'static str] = &[
        "record_id",
        "source_name",
        "occurred_at",
        "text",
        "has_attachment",
        "attachment_ref",
        "engagement_count",
        "share_count",
    ];
    const NATURAL_KEY: &'static [&'static str] = &["record_id", "source_name"];

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.record_id),
            Value::Text(self.source_name.clone()),
            opt_text(self.occurred_at.as_ref().map(format_iso8601)),
            opt_text(self.text.clone()),
            Value::Integer(i64::from(self.has_attachment)),
            opt_text(self.attachment_ref.clone()),
            self.engagement_count.map_or(Value::Null, Value::Integer),
            self.share_count.map_or(Value::Null, Value::Integer),
        ]
    }
}

impl TableRow for DetectionResult {
    const TABLE: &'static str = DETECTION_RESULTS_TABLE;
    const COLUMNS: &'static [&'static str] = &[
        "record_id",
        "source_name",
        "attachment_ref",
        "detected_count",
        "detected_class_ids",
        "top_class_name",
        "top_confidence",
        "category",
        "confidence_map",
    ];
    const NATURAL_KEY: &'static [&'static str] = &["record_id", "source_name"];

    fn values(&self) -> Vec<Value> {
        let class_ids = self
            .detected_class_ids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let confidence_map =
            serde_json::to_string(&self.confidence_map).unwrap_or_else(|_| "{}".to_string());

        vec![
            Value::Integer(self.record_id),
            Value::Text(self.source_name.clone()),
            Value::Text(self.attachment_ref.clone()),
            Value::Integer(i64::from(self.detected_count)),
            Value::Text(class_ids),
            opt_text(self.top_class_name.clone()),
            Value::Real(self.top_confidence),
            Value::Text(self.category.as_str().to_string()),
            Value::Text(confidence_map),
        ]
    }
}

fn opt_text(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}

/// Builds an insert-or-overwrite statement for `T` keyed on `natural_key`.
///
/// Every non-key column, `loaded_at` included, is replaced on conflict.
pub(crate) fn upsert_sql<T: TableRow>(natural_key: &[&str]) -> String {
    let mut columns: Vec<&str> = T::COLUMNS.to_vec();
    columns.push("loaded_at");

    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = columns
        .iter()
        .filter(|c| !natural_key.contains(*c))
        .map(|c| format!("{c} = excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {} ({}) VALUES ({placeholders}) ON CONFLICT ({}) DO UPDATE SET {updates}",
        T::TABLE,
        columns.join(", "),
        natural_key.join(", "),
    )
}

/// Connection to the warehouse database.
#[derive(Debug)]
pub struct Warehouse {
    conn: Connection,
}

impl Warehouse {
    /// Opens (or creates) the warehouse file and ensures the schema exists.
    pub fn open(path: &Path) -> Result<Self, LoaderError> {
        let conn = Connection::open(path).map_err(|source| LoaderError::Connection {
            path: path.to_path_buf(),
            source,
        })?;
        conn.busy_timeout(Duration::from_secs(5))
            .and_then(|()| conn.execute_batch("PRAGMA journal_mode=WAL;"))
            .map_err(|source| LoaderError::Connection {
                path: path.to_path_buf(),
                source,
            })?;

        let warehouse = Self { conn };
        warehouse.ensure_schema()?;
        debug!(path = %path.display(), "Opened warehouse");
        Ok(warehouse)
    }

    /// Opens a private in-memory warehouse with the schema applied.
    pub fn open_in_memory() -> Result<Self, LoaderError> {
        let conn = Connection::open_in_memory().map_err(|source| LoaderError::Connection {
            path: ":memory:".into(),
            source,
        })?;
        let warehouse = Self { conn };
        warehouse.ensure_schema()?;
        Ok(warehouse)
    }

    /// Creates tables and indexes if they do not exist.
    pub fn ensure_schema(&self) -> Result<(), LoaderError> {
        self.conn.execute_batch(SCHEMA).map_err(LoaderError::Schema)
    }

    /// Counts rows in one of the warehouse tables.
    pub fn row_count(&self, table: &str) -> Result<u64, LoaderError> {
        if table != RAW_RECORDS_TABLE && table != DETECTION_RESULTS_TABLE {
            return Err(LoaderError::UnknownTable(table.to_string()));
        }
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Reads one raw record by natural key.
    pub fn fetch_record(
        &self,
        record_id: i64,
        source_name: &str,
    ) -> Result<Option<Record>, LoaderError> {
        let record = self
            .conn
            .query_row(
                "SELECT record_id, source_name, occurred_at, text, has_attachment,
                        attachment_ref, engagement_count, share_count
                 FROM raw_records WHERE record_id = ?1 AND source_name = ?2",
                params![record_id, source_name],
                |row| {
                    let occurred_at: Option<String> = row.get(2)?;
                    Ok(Record {
                        record_id: row.get(0)?,
                        source_name: row.get(1)?,
                        occurred_at: occurred_at.and_then(|s| parse_timestamp(&s).ok()),
                        text: row.get(3)?,
                        has_attachment: row.get::<_, i64>(4)? != 0,
                        attachment_ref: row.get(5)?,
                        engagement_count: row.get(6)?,
                        share_count: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Reads every detection result ordered by natural key.
    ///
    /// A stored category, class id list or confidence map that cannot be
    /// decoded is an error, not a default.
    pub fn fetch_detections(&self) -> Result<Vec<DetectionResult>, LoaderError> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, source_name, attachment_ref, detected_count, detected_class_ids,
                    top_class_name, top_confidence, category, confidence_map
             FROM detection_results ORDER BY source_name, record_id",
        )?;
        let rows = stmt.query_map([], |row| {
            let class_ids: String = row.get(4)?;
            let category: String = row.get(7)?;
            let confidence_map: String = row.get(8)?;
            Ok(DetectionResult {
                record_id: row.get(0)?,
                source_name: row.get(1)?,
                attachment_ref: row.get(2)?,
                detected_count: row.get(3)?,
                detected_class_ids: class_ids
                    .split(',')
                    .filter(|id| !id.is_empty())
                    .map(str::parse)
                    .collect::<Result<_, _>>()
                    .map_err(|e| conversion_error(4, e))?,
                top_class_name: row.get(5)?,
                top_confidence: row.get(6)?,
                category: Category::ALL
                    .into_iter()
                    .find(|c| c.as_str() == category)
                    .ok_or_else(|| conversion_error(7, format!("unknown category '{category}'")))?,
                confidence_map: serde_json::from_str::<ConfidenceMap>(&confidence_map)
                    .map_err(|e| conversion_error(8, e))?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

fn conversion_error(
    column: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, err.into())
}
