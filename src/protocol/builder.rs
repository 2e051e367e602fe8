//! Payload construction: snapshots in, `(topic, payload)` pairs out
//!
//! The builder holds no mutable state. Given the same identity, the same
//! snapshot and a clock returning the same instant, it produces byte-identical
//! payloads.

use super::messages::{
    DeviceStatus, StatisticsBody, StatisticsPayload, StatusPayload, StoragePayload, VolumeUsage,
    volume_key,
};
use super::topics::{DeviceIdentity, TopicSet};
use crate::stats::{HealthSnapshot, StatisticsSnapshot};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// A topic together with its serialized payload
pub type TopicPayload = (String, Vec<u8>);

/// Source of the current time for timestamps and aggregation windows
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Milliseconds since the Unix epoch, UTC
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Clone)]
pub struct PayloadBuilder {
    topics: TopicSet,
    clock: Arc<dyn Clock>,
}

impl PayloadBuilder {
    pub fn new(topics: TopicSet, clock: Arc<dyn Clock>) -> Self {
        Self { topics, clock }
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    pub fn build_status_message(
        &self,
        identity: &DeviceIdentity,
        status: DeviceStatus,
    ) -> Result<TopicPayload, serde_json::Error> {
        let payload = StatusPayload {
            device_id: identity.device_id().to_string(),
            ts: self.clock.now_millis(),
            device_status: status,
            device_os_version: identity.os_version.clone(),
        };
        Ok((self.topics.status.clone(), serde_json::to_vec(&payload)?))
    }

    pub fn build_statistics_message(
        &self,
        identity: &DeviceIdentity,
        snapshot: &StatisticsSnapshot,
    ) -> Result<TopicPayload, serde_json::Error> {
        let payload = StatisticsPayload {
            device_id: identity.device_id().to_string(),
            ts: self.clock.now_millis(),
            statistics: StatisticsBody::from(snapshot),
        };
        Ok((self.topics.statistics.clone(), serde_json::to_vec(&payload)?))
    }

    /// Only ready volumes are published. Colliding keys get a `_2`, `_3`, ... suffix.
    pub fn build_storage_message(
        &self,
        identity: &DeviceIdentity,
        health: &HealthSnapshot,
    ) -> Result<TopicPayload, serde_json::Error> {
        let mut storage: BTreeMap<String, VolumeUsage> = BTreeMap::new();
        for volume in health.ready_volumes() {
            let key = volume_key(&volume.volume_id);
            let mut unique = key.clone();
            let mut n = 2;
            while storage.contains_key(&unique) {
                unique = format!("{key}_{n}");
                n += 1;
            }
            if unique != key {
                warn!(
                    volume = %volume.volume_id,
                    key = %key,
                    published_as = %unique,
                    "Volume key already taken"
                );
            }
            storage.insert(unique, VolumeUsage::from(volume));
        }

        let payload = StoragePayload {
            device_id: identity.device_id().to_string(),
            ts: self.clock.now_millis(),
            storage,
        };
        Ok((self.topics.storage.clone(), serde_json::to_vec(&payload)?))
    }
}

impl std::fmt::Debug for PayloadBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadBuilder")
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicsSection;
    use crate::stats::VolumeStatus;
    use crate::testing::FixedClock;
    use chrono::TimeZone;
    use serde_json::Value;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            client_name: "acme".to_string(),
            location: "berlin".to_string(),
            station: "dock-3".to_string(),
            serial_number: "SN-0042".to_string(),
            os_version: "Microsoft Windows 10 Pro".to_string(),
        }
    }

    fn builder_at(millis: i64) -> PayloadBuilder {
        let topics = TopicSet::new(&identity(), &TopicsSection::default());
        let instant = Utc.timestamp_millis_opt(millis).unwrap();
        PayloadBuilder::new(topics, Arc::new(FixedClock::new(instant)))
    }

    fn snapshot() -> StatisticsSnapshot {
        let end = Utc.timestamp_millis_opt(1_700_000_900_000).unwrap();
        StatisticsSnapshot {
            total_items: 10,
            no_weight: 1,
            no_dimensions: 2,
            good_reads: 9,
            no_reads: 1,
            out_of_spec: 0,
            more_than_one_item: 1,
            sent: 10,
            not_sent: 0,
            success: 6,
            window_start: end - chrono::Duration::minutes(15),
            window_end: end,
        }
    }

    fn volume(id: &str, ready: bool, total: u64, free: u64) -> VolumeStatus {
        VolumeStatus::from_info(crate::stats::VolumeInfo {
            id: id.to_string(),
            ready,
            total_bytes: total,
            free_bytes: free,
            filesystem: "NTFS".to_string(),
            label: String::new(),
        })
    }

    #[test]
    fn test_status_payload_shape() {
        let builder = builder_at(1_700_000_000_123);
        let (topic, payload) = builder
            .build_status_message(&identity(), DeviceStatus::Online)
            .unwrap();

        assert_eq!(topic, "telemetry/acme/berlin/dock-3/status");
        let json: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["device_id"], "SN-0042");
        assert_eq!(json["ts"], 1_700_000_000_123_i64);
        assert_eq!(json["device_status"], "online");
        assert_eq!(json["device_os_version"], "Microsoft Windows 10 Pro");
        assert_eq!(json.as_object().unwrap().len(), 4);
    }

    #[test]
    fn test_builder_is_deterministic_with_fixed_clock() {
        let builder = builder_at(1_700_000_000_000);
        let health = HealthSnapshot::new(
            vec![volume("C:\\", true, 500, 200), volume("D:\\", true, 1000, 10)],
            4096,
        );

        let first = builder
            .build_statistics_message(&identity(), &snapshot())
            .unwrap();
        let second = builder
            .build_statistics_message(&identity(), &snapshot())
            .unwrap();
        assert_eq!(first, second);

        let first = builder.build_storage_message(&identity(), &health).unwrap();
        let second = builder.build_storage_message(&identity(), &health).unwrap();
        assert_eq!(first, second);

        let first = builder
            .build_status_message(&identity(), DeviceStatus::Offline)
            .unwrap();
        let second = builder
            .build_status_message(&identity(), DeviceStatus::Offline)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_statistics_payload_contains_all_fields() {
        let builder = builder_at(1_700_000_000_000);
        let (topic, payload) = builder
            .build_statistics_message(&identity(), &snapshot())
            .unwrap();

        assert_eq!(topic, "telemetry/acme/berlin/dock-3/statistics");
        let json: Value = serde_json::from_slice(&payload).unwrap();
        let statistics = json["statistics"].as_object().unwrap();
        assert_eq!(statistics.len(), 10);
        assert_eq!(statistics["total_items"], 10);
        assert_eq!(statistics["success"], 6);
        assert_eq!(statistics["more_than_one_item"], 1);
        assert!(json.get("window_start").is_none());
    }

    #[test]
    fn test_storage_payload_skips_unready_volumes() {
        let builder = builder_at(1_700_000_000_000);
        let gb = 1024 * 1024 * 1024;
        let health = HealthSnapshot::new(
            vec![
                volume("C:\\", true, 200 * gb, 50 * gb),
                volume("E:\\", false, 0, 0),
            ],
            0,
        );

        let (topic, payload) = builder.build_storage_message(&identity(), &health).unwrap();
        assert_eq!(topic, "telemetry/acme/berlin/dock-3/storage");

        let json: Value = serde_json::from_slice(&payload).unwrap();
        let storage = json["storage"].as_object().unwrap();
        assert_eq!(storage.len(), 1);
        assert_eq!(storage["C"]["total_gb"], 200.0);
        assert_eq!(storage["C"]["free_gb"], 50.0);
        assert_eq!(storage["C"]["used_gb"], 150.0);
        assert_eq!(storage["C"]["used_pct"], 75.0);
    }

    #[test]
    fn test_colliding_volume_keys_are_all_published() {
        let builder = builder_at(1_700_000_000_000);
        let gb = 1024 * 1024 * 1024;
        let health = HealthSnapshot::new(
            vec![
                volume("/var/log", true, 10 * gb, 5 * gb),
                volume("/varlog", true, 20 * gb, 5 * gb),
                volume("/var/log/", true, 30 * gb, 5 * gb),
            ],
            0,
        );

        let (_, payload) = builder.build_storage_message(&identity(), &health).unwrap();

        let json: Value = serde_json::from_slice(&payload).unwrap();
        let storage = json["storage"].as_object().unwrap();
        assert_eq!(storage.len(), 3);
        // Suffixes follow volume id order
        assert_eq!(storage["varlog"]["total_gb"], 10.0);
        assert_eq!(storage["varlog_2"]["total_gb"], 30.0);
        assert_eq!(storage["varlog_3"]["total_gb"], 20.0);
    }
}
