//! SQLite-backed [`DataSource`]
//!
//! Expected columns: `barcode TEXT, weight REAL, length REAL, width REAL,
//! height REAL, item_count INTEGER, out_of_spec INTEGER, sent INTEGER,
//! scanned_at INTEGER` where `scanned_at` is milliseconds since the Unix epoch.

use super::aggregator::{DataSource, DataSourceError, ItemRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, params};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SqliteDataSource {
    path: PathBuf,
    table: String,
    query_timeout: Duration,
}

impl SqliteDataSource {
    /// `table` must already be validated as a plain identifier
    pub fn new(
        path: impl Into<PathBuf>,
        table: impl Into<String>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            table: table.into(),
            query_timeout,
        }
    }

    fn query_blocking(
        path: PathBuf,
        table: String,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<ItemRecord>, DataSourceError> {
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| DataSourceError::Unavailable(format!("{}: {e}", path.display())))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| DataSourceError::Unavailable(e.to_string()))?;

        let sql = format!(
            "SELECT barcode, weight, length, width, height, item_count, out_of_spec, sent \
             FROM {table} WHERE scanned_at >= ?1 AND scanned_at < ?2 ORDER BY scanned_at"
        );
        let mut stmt = conn.prepare(&sql).map_err(map_query_error)?;
        let rows = stmt
            .query_map(params![start_ms, end_ms], |row| {
                Ok(ItemRecord {
                    identifier: row.get(0)?,
                    weight: row.get(1)?,
                    length: row.get(2)?,
                    width: row.get(3)?,
                    height: row.get(4)?,
                    item_count: row.get(5)?,
                    out_of_spec: row.get::<_, Option<bool>>(6)?.unwrap_or(false),
                    sent: row.get(7)?,
                })
            })
            .map_err(map_query_error)?;

        rows.collect::<Result<Vec<_>, _>>().map_err(map_query_error)
    }
}

fn map_query_error(err: rusqlite::Error) -> DataSourceError {
    match err {
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => {
            DataSourceError::MalformedRow(err.to_string())
        }
        other => DataSourceError::Query(other.to_string()),
    }
}

#[async_trait]
impl DataSource for SqliteDataSource {
    async fn run_aggregation_query(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<ItemRecord>, DataSourceError> {
        let path = self.path.clone();
        let table = self.table.clone();
        let start_ms = window_start.timestamp_millis();
        let end_ms = window_end.timestamp_millis();

        let task = tokio::task::spawn_blocking(move || {
            Self::query_blocking(path, table, start_ms, end_ms)
        });

        let records = tokio::time::timeout(self.query_timeout, task)
            .await
            .map_err(|_| DataSourceError::Timeout(self.query_timeout))?
            .map_err(|e| DataSourceError::Query(format!("query task failed: {e}")))??;

        debug!(
            table = %self.table,
            rows = records.len(),
            start_ms,
            end_ms,
            "Loaded scan records"
        );
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn seed(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("scans.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE scans (
                barcode TEXT, weight REAL, length REAL, width REAL, height REAL,
                item_count INTEGER, out_of_spec INTEGER, sent INTEGER, scanned_at INTEGER
            );",
        )
        .unwrap();
        let rows: [(Option<&str>, Option<f64>, i64, Option<i64>, i64); 4] = [
            (Some("4006381333931"), Some(1.5), 0, Some(1), 1_000),
            (Some("NoRead"), None, 0, Some(0), 1_500),
            (None, Some(2.0), 1, None, 1_999),
            (Some("outside"), Some(1.0), 0, Some(1), 2_000),
        ];
        for (barcode, weight, out_of_spec, sent, ts) in rows {
            conn.execute(
                "INSERT INTO scans VALUES (?1, ?2, 10.0, 10.0, 10.0, 1, ?3, ?4, ?5)",
                params![barcode, weight, out_of_spec, sent, ts],
            )
            .unwrap();
        }
        path
    }

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[tokio::test]
    async fn test_query_is_half_open() {
        let dir = TempDir::new().unwrap();
        let source = SqliteDataSource::new(seed(&dir), "scans", Duration::from_secs(5));

        let records = source.run_aggregation_query(at(1_000), at(2_000)).await.unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].identifier.as_deref(), Some("4006381333931"));
        assert_eq!(records[0].sent, Some(true));
        assert_eq!(records[1].weight, None);
        assert!(records[2].out_of_spec);
        assert_eq!(records[2].sent, None);
    }

    #[tokio::test]
    async fn test_missing_database_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let source = SqliteDataSource::new(
            dir.path().join("missing.db"),
            "scans",
            Duration::from_secs(5),
        );

        let err = source
            .run_aggregation_query(at(0), at(1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, DataSourceError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_missing_table_is_query_error() {
        let dir = TempDir::new().unwrap();
        let source = SqliteDataSource::new(seed(&dir), "parcels", Duration::from_secs(5));

        let err = source
            .run_aggregation_query(at(0), at(1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, DataSourceError::Query(_)));
    }

    #[tokio::test]
    async fn test_text_in_numeric_column_is_malformed() {
        let dir = TempDir::new().unwrap();
        let path = seed(&dir);
        Connection::open(&path)
            .unwrap()
            .execute(
                "INSERT INTO scans VALUES ('x', 'heavy', 1, 1, 1, 1, 0, 1, 1200)",
                [],
            )
            .unwrap();
        let source = SqliteDataSource::new(path, "scans", Duration::from_secs(5));

        let err = source
            .run_aggregation_query(at(1_000), at(2_000))
            .await
            .unwrap_err();
        assert!(matches!(err, DataSourceError::MalformedRow(_)));
    }
}
