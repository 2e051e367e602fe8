//! Thread-safe metrics collection system
//!
//! Atomic counters for scheduler ticks and the MQTT transport. A snapshot is
//! logged at shutdown; there is no scrape endpoint.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Keep at most this many tick durations for percentile estimates
const MAX_TICK_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    ticks_started: AtomicU64,
    ticks_succeeded: AtomicU64,
    ticks_failed: AtomicU64,
    ticks_cancelled: AtomicU64,
    tick_durations: Mutex<Vec<u64>>, // in milliseconds

    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    reconnect_give_ups: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    connection_start_time: AtomicU64,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            ticks_started: AtomicU64::new(0),
            ticks_succeeded: AtomicU64::new(0),
            ticks_failed: AtomicU64::new(0),
            ticks_cancelled: AtomicU64::new(0),
            tick_durations: Mutex::new(Vec::new()),
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            reconnect_give_ups: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Scheduler metrics
    pub fn tick_started(&self) {
        self.ticks_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_succeeded(&self, duration: Duration) {
        self.ticks_succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_tick_duration(duration);
    }

    pub fn tick_failed(&self, duration: Duration) {
        self.ticks_failed.fetch_add(1, Ordering::Relaxed);
        self.record_tick_duration(duration);
    }

    pub fn tick_cancelled(&self) {
        self.ticks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    fn record_tick_duration(&self, duration: Duration) {
        if let Ok(mut durations) = self.tick_durations.lock() {
            if durations.len() >= MAX_TICK_SAMPLES {
                durations.remove(0);
            }
            durations.push(duration.as_millis() as u64);
        }
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_reconnect_given_up(&self) {
        self.reconnect_give_ups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_disconnected(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();

        let mut durations = self
            .tick_durations
            .lock()
            .map(|durations| durations.clone())
            .unwrap_or_default();
        durations.sort_unstable();
        let avg_tick_duration_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        let connection_start = self.connection_start_time.load(Ordering::Relaxed);
        let connection_duration_seconds = if connection_start == 0 {
            0
        } else {
            now.saturating_sub(connection_start)
        };

        MetricsSnapshot {
            scheduler: SchedulerMetrics {
                ticks_started: self.ticks_started.load(Ordering::Relaxed),
                ticks_succeeded: self.ticks_succeeded.load(Ordering::Relaxed),
                ticks_failed: self.ticks_failed.load(Ordering::Relaxed),
                ticks_cancelled: self.ticks_cancelled.load(Ordering::Relaxed),
                avg_tick_duration_ms,
                tick_duration_p95_ms: percentile(&durations, 95.0),
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                reconnect_give_ups: self.reconnect_give_ups.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                connection_duration_seconds,
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub scheduler: SchedulerMetrics,
    pub mqtt: MqttMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetrics {
    pub ticks_started: u64,
    pub ticks_succeeded: u64,
    pub ticks_failed: u64,
    pub ticks_cancelled: u64,
    pub avg_tick_duration_ms: f64,
    pub tick_duration_p95_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub reconnect_give_ups: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub connection_duration_seconds: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;
    lower + (upper - lower) * index.fract()
}
