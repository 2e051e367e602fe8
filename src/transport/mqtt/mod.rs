//! MQTT transport for station telemetry
//!
//! The module separates pure logic from I/O:
//!
//! - [`connection`] - Connection types, delivery options and `rumqttc` option mapping
//! - [`state_machine`] - Pure connection state transitions
//! - [`link`] - The broker session itself, behind the [`BrokerLink`] trait
//! - [`manager`] - The [`ConnectionManager`] that owns state, last-will and reconnects
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stationpulse::protocol::{DeviceIdentity, PayloadBuilder, SystemClock, TopicSet};
//! use stationpulse::config::TopicsSection;
//! use stationpulse::transport::mqtt::{
//!     ConnectionManager, DeliveryGuarantee, LinkSettings, MqttLink, PublishPolicy,
//!     ReconnectConfig,
//! };
//!
//! # tokio_test::block_on(async {
//! let identity = DeviceIdentity {
//!     client_name: "acme".to_string(),
//!     location: "berlin".to_string(),
//!     station: "dock-3".to_string(),
//!     serial_number: "SN-0042".to_string(),
//!     os_version: "Linux".to_string(),
//! };
//! let builder = PayloadBuilder::new(
//!     TopicSet::new(&identity, &TopicsSection::default()),
//!     Arc::new(SystemClock),
//! );
//! let (link, events) = MqttLink::new(LinkSettings::default(), &identity.serial_number);
//! let manager = Arc::new(ConnectionManager::new(
//!     link,
//!     identity,
//!     builder,
//!     PublishPolicy::default(),
//!     ReconnectConfig::default(),
//! ));
//! manager.spawn_event_pump(events);
//!
//! let topic = "telemetry/acme/berlin/dock-3/statistics";
//! manager
//!     .publish(topic, b"{}".to_vec(), DeliveryGuarantee::AtLeastOnce, false)
//!     .await?;
//! manager.shutdown().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod connection;
pub mod link;
pub mod manager;
pub mod state_machine;

pub use connection::{
    ConnectionState, Credentials, DeliveryGuarantee, LinkSettings, MessageOptions, MqttError,
    PublishPolicy, ReconnectConfig, TransportKind, WillMessage, build_client_id,
    configure_mqtt_options,
};
pub use link::{BrokerLink, LinkEvent, MqttLink, verify_reachable};
pub use manager::ConnectionManager;
pub use state_machine::{ConnectionEvent, StateMachine};
