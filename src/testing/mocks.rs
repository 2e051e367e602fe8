//! Mock implementations for testing
//!
//! Every mock records what it was asked to do behind `Arc`-shared state, so a
//! clone handed to the code under test can be inspected afterwards.

use crate::protocol::Clock;
use crate::stats::{DataSource, DataSourceError, HealthProbe, ItemRecord, ProbeError, VolumeInfo};
use crate::transport::mqtt::{
    BrokerLink, ConnectionState, DeliveryGuarantee, MqttError, WillMessage,
};
use crate::transport::{OutboundMessage, Publisher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// A publish seen by [`MockBrokerLink`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: DeliveryGuarantee,
    pub retain: bool,
}

impl RecordedPublish {
    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// Broker link that never touches the network
#[derive(Debug, Clone, Default)]
pub struct MockBrokerLink {
    fail_open: Arc<AtomicBool>,
    failing_opens: Arc<AtomicU32>,
    publish_closed: Arc<AtomicBool>,
    publish_rejected: Arc<AtomicBool>,
    open_calls: Arc<AtomicUsize>,
    close_calls: Arc<AtomicUsize>,
    published: Arc<Mutex<Vec<RecordedPublish>>>,
    wills: Arc<Mutex<Vec<WillMessage>>>,
}

impl MockBrokerLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every open while set
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` opens, then succeed
    pub fn fail_next_opens(&self, count: u32) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Report the session as gone on publish
    pub fn set_publish_closed(&self, closed: bool) {
        self.publish_closed.store(closed, Ordering::SeqCst);
    }

    /// Reject publishes without losing the session
    pub fn set_publish_rejected(&self, rejected: bool) {
        self.publish_rejected.store(rejected, Ordering::SeqCst);
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub async fn published(&self) -> Vec<RecordedPublish> {
        self.published.lock().await.clone()
    }

    pub async fn published_to(&self, topic: &str) -> Vec<RecordedPublish> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn wills(&self) -> Vec<WillMessage> {
        self.wills.lock().await.clone()
    }
}

#[async_trait]
impl BrokerLink for MockBrokerLink {
    async fn open(&self, will: Option<&WillMessage>) -> Result<(), MqttError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);

        let scripted_failure = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if scripted_failure || self.fail_open.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectionRefused(
                "mock broker unavailable".to_string(),
            ));
        }

        if let Some(will) = will {
            self.wills.lock().await.push(will.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: DeliveryGuarantee,
        retain: bool,
    ) -> Result<(), MqttError> {
        if self.publish_closed.load(Ordering::SeqCst) {
            return Err(MqttError::LinkClosed);
        }
        if self.publish_rejected.load(Ordering::SeqCst) {
            return Err(MqttError::PublishFailed("mock broker rejected publish".into()));
        }

        self.published.lock().await.push(RecordedPublish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), MqttError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Data source serving a fixed record set
#[derive(Debug, Clone, Default)]
pub struct MockDataSource {
    records: Arc<Vec<ItemRecord>>,
    failures_left: Arc<AtomicU32>,
    always_fail: bool,
    latency: Duration,
    calls: Arc<AtomicUsize>,
    windows: Arc<Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>>,
}

impl MockDataSource {
    pub fn with_records(records: Vec<ItemRecord>) -> Self {
        Self {
            records: Arc::new(records),
            ..Default::default()
        }
    }

    /// Fail the first `count` queries with `Unavailable`, then serve `records`
    pub fn failing_first(count: u32, records: Vec<ItemRecord>) -> Self {
        Self {
            records: Arc::new(records),
            failures_left: Arc::new(AtomicU32::new(count)),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Default::default()
        }
    }

    /// Delay every query by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every `[start, end)` window queried so far
    pub async fn windows(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        self.windows.lock().await.clone()
    }
}

#[async_trait]
impl DataSource for MockDataSource {
    async fn run_aggregation_query(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<ItemRecord>, DataSourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.windows.lock().await.push((window_start, window_end));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted_failure = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if self.always_fail || scripted_failure {
            return Err(DataSourceError::Unavailable(
                "mock data source offline".to_string(),
            ));
        }

        Ok(self.records.as_ref().clone())
    }
}

/// Health probe with canned answers
#[derive(Debug, Clone, Default)]
pub struct MockHealthProbe {
    volumes: Vec<VolumeInfo>,
    process_memory: u64,
    fail: bool,
}

impl MockHealthProbe {
    pub fn new(volumes: Vec<VolumeInfo>, process_memory: u64) -> Self {
        Self {
            volumes,
            process_memory,
            fail: false,
        }
    }

    /// One ready 100 GB root volume, 40 GB free
    pub fn with_root_volume() -> Self {
        Self::new(vec![volume("/", 100 * GB, 40 * GB)], 64 * 1024 * 1024)
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

impl HealthProbe for MockHealthProbe {
    fn enumerate_volumes(&self) -> Result<Vec<VolumeInfo>, ProbeError> {
        if self.fail {
            return Err(ProbeError::Unavailable("mock probe failure".to_string()));
        }
        Ok(self.volumes.clone())
    }

    fn current_process_memory(&self) -> Result<u64, ProbeError> {
        if self.fail {
            return Err(ProbeError::Unavailable("mock probe failure".to_string()));
        }
        Ok(self.process_memory)
    }
}

/// Publisher that records outbound messages
#[derive(Debug, Clone, Default)]
pub struct MockPublisher {
    messages: Arc<Mutex<Vec<OutboundMessage>>>,
    fail: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every publish with `NotConnected` while set
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().await.clone()
    }

    pub async fn topics(&self) -> Vec<String> {
        self.messages
            .lock()
            .await
            .iter()
            .map(|message| message.topic.clone())
            .collect()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, message: OutboundMessage) -> Result<(), MqttError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(MqttError::NotConnected {
                state: ConnectionState::Disconnected,
            });
        }
        self.messages.lock().await.push(message);
        Ok(())
    }
}

/// Clock frozen at an instant that only moves when advanced
#[derive(Debug, Default)]
pub struct FixedClock {
    millis: AtomicI64,
}

impl FixedClock {
    pub fn new(instant: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(instant.timestamp_millis()),
        }
    }

    /// 1970-01-01T00:00:00Z
    pub fn epoch() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.millis
            .fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

const GB: u64 = 1024 * 1024 * 1024;

/// A ready volume
pub fn volume(id: &str, total_bytes: u64, free_bytes: u64) -> VolumeInfo {
    VolumeInfo {
        id: id.to_string(),
        ready: true,
        total_bytes,
        free_bytes,
        filesystem: "ext4".to_string(),
        label: String::new(),
    }
}

/// A complete, in-spec, single-item scan that was forwarded upstream
pub fn good_read(barcode: &str) -> ItemRecord {
    ItemRecord {
        identifier: Some(barcode.to_string()),
        weight: Some(1.25),
        length: Some(30.0),
        width: Some(20.0),
        height: Some(10.0),
        item_count: Some(1),
        out_of_spec: false,
        sent: Some(true),
    }
}

/// A failed scan carrying the no-read sentinel
pub fn no_read(sentinel: &str) -> ItemRecord {
    ItemRecord {
        identifier: Some(sentinel.to_string()),
        sent: Some(true),
        ..good_read(sentinel)
    }
}
