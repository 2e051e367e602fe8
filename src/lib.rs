//! stationpulse - station telemetry over MQTT
//!
//! A long-running agent for scanning stations. Every interval it aggregates
//! the scan records of the last window, samples host storage, and publishes
//! both to an MQTT broker under an identity-derived topic tree. A retained
//! status topic carries `online`/`offline`, with the broker's last-will as the
//! fallback when the process dies.
//!
//! # Overview
//!
//! - [`stats`] - Aggregation of scan records and host health snapshots
//! - [`protocol`] - Identity, topics and wire payloads
//! - [`transport`] - MQTT connection manager with bounded reconnects
//! - [`scheduler`] - The periodic tick loop
//! - [`config`] - TOML configuration with lenient value parsing
//!
//! # Quick Start
//!
//! ```rust
//! use stationpulse::protocol::{DeviceIdentity, PayloadBuilder, TopicSet, SystemClock};
//! use stationpulse::config::TopicsSection;
//! use stationpulse::stats::{AggregationPolicy, StatisticsSnapshot};
//! use std::sync::Arc;
//!
//! let identity = DeviceIdentity {
//!     client_name: "acme".to_string(),
//!     location: "berlin".to_string(),
//!     station: "dock-3".to_string(),
//!     serial_number: "SN-0042".to_string(),
//!     os_version: "Linux 6.1".to_string(),
//! };
//! let builder = PayloadBuilder::new(
//!     TopicSet::new(&identity, &TopicsSection::default()),
//!     Arc::new(SystemClock),
//! );
//!
//! let now = chrono::Utc::now();
//! let snapshot = StatisticsSnapshot::from_records(
//!     &[],
//!     AggregationPolicy::DirectFlags,
//!     "NoRead",
//!     now - chrono::Duration::minutes(15),
//!     now,
//! );
//! let (topic, payload) = builder.build_statistics_message(&identity, &snapshot).unwrap();
//! assert_eq!(topic, "telemetry/acme/berlin/dock-3/statistics");
//! assert!(!payload.is_empty());
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod stats;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, ConfigParseError, StationConfig};
pub use error::{TelemetryError, TelemetryResult};
pub use protocol::*;
pub use scheduler::{ScheduleSettings, Scheduler, TickOutcome};
pub use transport::mqtt::{ConnectionManager, ConnectionState, MqttLink};
