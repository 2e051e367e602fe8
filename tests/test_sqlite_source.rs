//! SQLite data source through the aggregator

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use stationpulse::stats::{
    AggregationPolicy, Aggregator, DataSource, DataSourceError, SqliteDataSource,
};
use stationpulse::testing::FixedClock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const NOW_MS: i64 = 1_700_000_000_000;

fn now() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(NOW_MS).unwrap()
}

fn seed(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("station.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE item_scans (
            barcode TEXT, weight REAL, length REAL, width REAL, height REAL,
            item_count INTEGER, out_of_spec INTEGER, sent INTEGER, scanned_at INTEGER
        );",
    )
    .unwrap();

    let minute = 60_000;
    // barcode, weight, item_count, out_of_spec, sent, age
    let rows: [(&str, Option<f64>, i64, i64, Option<i64>, i64); 5] = [
        ("A1", Some(2.0), 1, 0, Some(1), minute),
        ("A2", Some(2.0), 1, 1, Some(1), 2 * minute),
        ("A3", None, 1, 0, Some(0), 3 * minute),
        ("NoRead", Some(2.0), 1, 0, None, 4 * minute),
        ("A4", Some(2.0), 1, 0, Some(1), 20 * minute),
    ];
    for (barcode, weight, item_count, out_of_spec, sent, age) in rows {
        conn.execute(
            "INSERT INTO item_scans VALUES (?1, ?2, 10.0, 10.0, 10.0, ?3, ?4, ?5, ?6)",
            params![barcode, weight, item_count, out_of_spec, sent, NOW_MS - age],
        )
        .unwrap();
    }
    path
}

fn aggregator(path: PathBuf, policy: AggregationPolicy) -> Aggregator {
    Aggregator::new(
        Arc::new(SqliteDataSource::new(path, "item_scans", Duration::from_secs(5))),
        policy,
        "NoRead",
        Arc::new(FixedClock::new(now())),
    )
}

#[tokio::test]
async fn test_direct_flags_over_sqlite() {
    let dir = TempDir::new().unwrap();
    let aggregator = aggregator(seed(&dir), AggregationPolicy::DirectFlags);

    let snapshot = aggregator.aggregate(Duration::from_secs(15 * 60)).await.unwrap();

    assert_eq!(snapshot.total_items, 4);
    assert_eq!(snapshot.good_reads, 3);
    assert_eq!(snapshot.no_reads, 1);
    assert_eq!(snapshot.no_weight, 1);
    assert_eq!(snapshot.out_of_spec, 1);
    assert_eq!(snapshot.success, 1);
    assert_eq!(snapshot.sent, 2);
    assert_eq!(snapshot.not_sent, 1);
    // Unknown transmission state is counted in neither
    assert!(!snapshot.transmission_balanced());
}

#[tokio::test]
async fn test_completeness_derived_over_sqlite() {
    let dir = TempDir::new().unwrap();
    let aggregator = aggregator(seed(&dir), AggregationPolicy::CompletenessDerived);

    let snapshot = aggregator.aggregate(Duration::from_secs(15 * 60)).await.unwrap();

    // A1 and A2 are complete; out_of_spec is everything else
    assert_eq!(snapshot.success, 2);
    assert_eq!(snapshot.out_of_spec, 2);
}

#[tokio::test]
async fn test_wider_window_includes_older_rows() {
    let dir = TempDir::new().unwrap();
    let aggregator = aggregator(seed(&dir), AggregationPolicy::DirectFlags);

    let snapshot = aggregator.aggregate(Duration::from_secs(30 * 60)).await.unwrap();
    assert_eq!(snapshot.total_items, 5);
}

#[tokio::test]
async fn test_unknown_table_is_query_error() {
    let dir = TempDir::new().unwrap();
    let source = SqliteDataSource::new(seed(&dir), "missing", Duration::from_secs(5));

    let result = source
        .run_aggregation_query(now() - chrono::Duration::minutes(15), now())
        .await;
    assert!(matches!(result, Err(DataSourceError::Query(_))));
}
