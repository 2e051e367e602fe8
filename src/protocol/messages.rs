//! Wire-format payloads published by the station
//!
//! Field names here are the published contract and are intentionally decoupled
//! from the internal snapshot types; the `From` impls below are the only place
//! where the two are mapped onto each other.

use crate::stats::{StatisticsSnapshot, VolumeStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Presence of the station as seen by subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// Status (presence) payload, also used as the last-will message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub device_id: String,
    /// Milliseconds since the Unix epoch, UTC
    pub ts: i64,
    pub device_status: DeviceStatus,
    pub device_os_version: String,
}

/// Statistics payload for one aggregation window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsPayload {
    pub device_id: String,
    pub ts: i64,
    pub statistics: StatisticsBody,
}

/// The `statistics` object of [`StatisticsPayload`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsBody {
    pub total_items: u64,
    pub no_weight: u64,
    pub good_reads: u64,
    pub no_reads: u64,
    pub no_dimensions: u64,
    pub success: u64,
    pub out_of_spec: u64,
    pub more_than_one_item: u64,
    pub not_sent: u64,
    pub sent: u64,
}

impl From<&StatisticsSnapshot> for StatisticsBody {
    fn from(snapshot: &StatisticsSnapshot) -> Self {
        Self {
            total_items: snapshot.total_items,
            no_weight: snapshot.no_weight,
            good_reads: snapshot.good_reads,
            no_reads: snapshot.no_reads,
            no_dimensions: snapshot.no_dimensions,
            success: snapshot.success,
            out_of_spec: snapshot.out_of_spec,
            more_than_one_item: snapshot.more_than_one_item,
            not_sent: snapshot.not_sent,
            sent: snapshot.sent,
        }
    }
}

/// Storage payload: one entry per ready volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePayload {
    pub device_id: String,
    pub ts: i64,
    /// Keyed by [`volume_key`]; sorted so output is stable
    pub storage: BTreeMap<String, VolumeUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeUsage {
    pub free_gb: f64,
    pub used_gb: f64,
    pub total_gb: f64,
    pub used_pct: f64,
}

impl From<&VolumeStatus> for VolumeUsage {
    fn from(volume: &VolumeStatus) -> Self {
        Self {
            free_gb: bytes_to_gb(volume.free_bytes),
            used_gb: bytes_to_gb(volume.used_bytes),
            total_gb: bytes_to_gb(volume.total_bytes),
            used_pct: volume.used_percent,
        }
    }
}

/// Strip separator characters from a volume identifier.
///
/// `C:\` becomes `C`, `/var/log` becomes `varlog`. The root mount `/` strips to
/// nothing and is published as `root`.
pub fn volume_key(volume_id: &str) -> String {
    let key: String = volume_id
        .chars()
        .filter(|c| !matches!(c, ':' | '\\' | '/'))
        .collect();

    if key.is_empty() {
        "root".to_string()
    } else {
        key
    }
}

/// Round to two decimal places
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn bytes_to_gb(bytes: u64) -> f64 {
    round2(bytes as f64 / BYTES_PER_GB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&DeviceStatus::Online).unwrap(),
            "\"online\""
        );
        assert_eq!(
            serde_json::to_string(&DeviceStatus::Offline).unwrap(),
            "\"offline\""
        );
    }

    #[test]
    fn test_volume_key_strips_separators() {
        assert_eq!(volume_key("C:\\"), "C");
        assert_eq!(volume_key("D:"), "D");
        assert_eq!(volume_key("/var/log"), "varlog");
        assert_eq!(volume_key("/"), "root");
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(12.345_6), 12.35);
        assert_eq!(round2(0.004), 0.0);
        assert_eq!(round2(100.0), 100.0);
    }

    #[test]
    fn test_volume_usage_conversion() {
        let volume = VolumeStatus {
            volume_id: "C:\\".to_string(),
            is_ready: true,
            total_bytes: 100 * 1024 * 1024 * 1024,
            used_bytes: 25 * 1024 * 1024 * 1024,
            free_bytes: 75 * 1024 * 1024 * 1024,
            used_percent: 25.0,
            filesystem: "NTFS".to_string(),
            label: "System".to_string(),
        };

        let usage = VolumeUsage::from(&volume);
        assert_eq!(usage.total_gb, 100.0);
        assert_eq!(usage.used_gb, 25.0);
        assert_eq!(usage.free_gb, 75.0);
        assert_eq!(usage.used_pct, 25.0);
    }

    #[test]
    fn test_statistics_body_field_order() {
        let body = StatisticsBody {
            total_items: 1,
            no_weight: 2,
            good_reads: 3,
            no_reads: 4,
            no_dimensions: 5,
            success: 6,
            out_of_spec: 7,
            more_than_one_item: 8,
            not_sent: 9,
            sent: 10,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(
            json,
            r#"{"total_items":1,"no_weight":2,"good_reads":3,"no_reads":4,"no_dimensions":5,"success":6,"out_of_spec":7,"more_than_one_item":8,"not_sent":9,"sent":10}"#
        );
    }
}
