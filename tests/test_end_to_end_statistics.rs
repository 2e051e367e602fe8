//! End-to-end: SQLite rows -> aggregation -> payload -> connection manager
//!
//! Everything is real except the broker link, which records what would have
//! been sent.

use rusqlite::{Connection, params};
use serde_json::{Value, json};
use stationpulse::config::TopicsSection;
use stationpulse::protocol::{DeviceIdentity, PayloadBuilder, SystemClock, TopicSet};
use stationpulse::scheduler::{ScheduleSettings, Scheduler, TickOutcome};
use stationpulse::stats::{AggregationPolicy, Aggregator, SqliteDataSource};
use stationpulse::testing::{MockBrokerLink, MockHealthProbe};
use stationpulse::transport::mqtt::{ConnectionManager, PublishPolicy, ReconnectConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

const STATISTICS_TOPIC: &str = "telemetry/acme/berlin/dock-3/statistics";
const STORAGE_TOPIC: &str = "telemetry/acme/berlin/dock-3/storage";

struct Row {
    barcode: &'static str,
    weight: Option<f64>,
    length: Option<f64>,
    item_count: i64,
    out_of_spec: bool,
}

impl Row {
    fn good() -> Self {
        Self {
            barcode: "4006381333931",
            weight: Some(1.25),
            length: Some(30.0),
            item_count: 1,
            out_of_spec: false,
        }
    }
}

/// 15 no-reads and 249 good reads, of which 4 lack weight, 1 lacks
/// dimensions, 1 is out of spec and 10 carry more than one item
fn scenario_rows() -> Vec<Row> {
    let mut rows = Vec::new();
    rows.extend((0..15).map(|_| Row {
        barcode: "NoRead",
        ..Row::good()
    }));
    rows.extend((0..4).map(|_| Row {
        weight: None,
        ..Row::good()
    }));
    rows.push(Row {
        length: None,
        ..Row::good()
    });
    rows.push(Row {
        out_of_spec: true,
        ..Row::good()
    });
    rows.extend((0..10).map(|_| Row {
        item_count: 2,
        ..Row::good()
    }));
    rows.extend((0..233).map(|_| Row::good()));
    rows
}

fn seed_database(dir: &TempDir, rows: &[Row]) -> PathBuf {
    let path = dir.path().join("scans.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE scans (
            barcode TEXT, weight REAL, length REAL, width REAL, height REAL,
            item_count INTEGER, out_of_spec INTEGER, sent INTEGER, scanned_at INTEGER
        );",
    )
    .unwrap();

    // All rows one minute ago, well inside a 15 minute window
    let scanned_at = chrono::Utc::now().timestamp_millis() - 60_000;
    for row in rows {
        conn.execute(
            "INSERT INTO scans VALUES (?1, ?2, ?3, 20.0, 10.0, ?4, ?5, 1, ?6)",
            params![
                row.barcode,
                row.weight,
                row.length,
                row.item_count,
                row.out_of_spec,
                scanned_at
            ],
        )
        .unwrap();
    }

    // Outside the window; must not be counted
    conn.execute(
        "INSERT INTO scans VALUES ('stale', 1.0, 1.0, 1.0, 1.0, 1, 0, 0, ?1)",
        params![scanned_at - 3_600_000],
    )
    .unwrap();
    path
}

fn identity() -> DeviceIdentity {
    DeviceIdentity {
        client_name: "acme".to_string(),
        location: "berlin".to_string(),
        station: "dock-3".to_string(),
        serial_number: "SN-0042".to_string(),
        os_version: "Linux 6.1".to_string(),
    }
}

fn station(
    db_path: &Path,
    link: MockBrokerLink,
) -> (Scheduler, Arc<ConnectionManager<MockBrokerLink>>) {
    let clock = Arc::new(SystemClock);
    let identity = identity();
    let builder = PayloadBuilder::new(
        TopicSet::new(&identity, &TopicsSection::default()),
        clock.clone(),
    );

    let manager = Arc::new(ConnectionManager::new(
        link,
        identity.clone(),
        builder.clone(),
        PublishPolicy::default(),
        ReconnectConfig::default(),
    ));

    let source = SqliteDataSource::new(db_path, "scans", Duration::from_secs(10));
    let scheduler = Scheduler::new(
        Aggregator::new(
            Arc::new(source),
            AggregationPolicy::DirectFlags,
            "NoRead",
            clock,
        ),
        Arc::new(MockHealthProbe::with_root_volume()),
        manager.clone(),
        identity,
        builder,
        PublishPolicy::default(),
        ScheduleSettings {
            window: Duration::from_secs(15 * 60),
            ..ScheduleSettings::default()
        },
    );
    (scheduler, manager)
}

#[tokio::test]
async fn test_statistics_scenario_published_exactly() {
    let dir = TempDir::new().unwrap();
    let db_path = seed_database(&dir, &scenario_rows());
    let link = MockBrokerLink::new();
    let (scheduler, manager) = station(&db_path, link.clone());
    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let before = chrono::Utc::now().timestamp_millis();
    let outcome = scheduler.tick(&mut shutdown_rx).await.unwrap();
    let after = chrono::Utc::now().timestamp_millis();
    assert_eq!(outcome, TickOutcome::Published);

    let published = link.published_to(STATISTICS_TOPIC).await;
    assert_eq!(published.len(), 1);
    assert!(!published[0].retain);

    let payload = published[0].payload_json();
    assert_eq!(payload["device_id"], "SN-0042");
    assert_eq!(
        payload["statistics"],
        json!({
            "total_items": 264,
            "no_weight": 4,
            "good_reads": 249,
            "no_reads": 15,
            "no_dimensions": 1,
            "success": 233,
            "out_of_spec": 1,
            "more_than_one_item": 10,
            "not_sent": 0,
            "sent": 264
        })
    );

    let ts = payload["ts"].as_i64().unwrap();
    assert!((before..=after).contains(&ts), "ts {ts} outside [{before}, {after}]");

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_tick_publishes_online_then_statistics_then_storage() {
    let dir = TempDir::new().unwrap();
    let db_path = seed_database(&dir, &[Row::good()]);
    let link = MockBrokerLink::new();
    let (scheduler, _manager) = station(&db_path, link.clone());
    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

    scheduler.tick(&mut shutdown_rx).await.unwrap();

    let published = link.published().await;
    let topics: Vec<&str> = published.iter().map(|p| p.topic.as_str()).collect();
    assert_eq!(
        topics,
        vec![
            "telemetry/acme/berlin/dock-3/status",
            STATISTICS_TOPIC,
            STORAGE_TOPIC
        ]
    );

    let storage = published[2].payload_json();
    let root: &Value = &storage["storage"]["root"];
    assert_eq!(root["total_gb"], 100.0);
    assert_eq!(root["free_gb"], 40.0);
    assert_eq!(root["used_gb"], 60.0);
    assert_eq!(root["used_pct"], 60.0);
}

#[tokio::test]
async fn test_missing_database_fails_tick_without_publishing() {
    let dir = TempDir::new().unwrap();
    let link = MockBrokerLink::new();
    let (scheduler, _manager) = station(&dir.path().join("absent.db"), link.clone());
    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let error = scheduler.tick(&mut shutdown_rx).await.unwrap_err();

    assert_eq!(error.kind(), "data_source");
    assert!(link.published().await.is_empty());
    assert_eq!(link.open_calls(), 0);
}
