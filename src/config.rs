//! Station configuration
//!
//! Loaded from a TOML file. Only `[device]` is mandatory; every other section
//! falls back to defaults. Credentials never live in the file: `username_env`
//! and `password_env` name environment variables read at connect time.
//!
//! Enumerated values (QoS, transport, aggregation policy) and the
//! `STATIONPULSE_*` schedule overrides are parsed leniently: a malformed value
//! is logged and replaced by its default instead of aborting startup.

use crate::protocol::{DeviceIdentity, validate_topic_segment};
use crate::scheduler::ScheduleSettings;
use crate::stats::{AggregationPolicy, SysinfoProbe};
use crate::transport::mqtt::{
    Credentials, DeliveryGuarantee, LinkSettings, MessageOptions, PublishPolicy, ReconnectConfig,
    TransportKind,
};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Searched in order when no config file is given
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["stationpulse.toml", "config/stationpulse.toml"];

/// Lower bound applied to `mqtt.keep_alive_secs`
pub const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Environment overrides for schedule durations
pub const ENV_INTERVAL_SECS: &str = "STATIONPULSE_INTERVAL_SECS";
pub const ENV_INITIAL_DELAY_SECS: &str = "STATIONPULSE_INITIAL_DELAY_SECS";
pub const ENV_RECOVERY_DELAY_SECS: &str = "STATIONPULSE_RECOVERY_DELAY_SECS";
pub const ENV_WINDOW_MINUTES: &str = "STATIONPULSE_WINDOW_MINUTES";

/// Main station configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StationConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub topics: TopicsSection,
    #[serde(default)]
    pub publish: PublishSection,
    #[serde(default)]
    pub schedule: ScheduleSection,
    #[serde(default)]
    pub datasource: DataSourceSection,
}

/// Station identity; each value becomes a topic segment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    pub client_name: String,
    pub location: String,
    pub station: String,
    pub serial_number: String,
    /// OS descriptor for status payloads; detected from the host when absent
    pub os_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    /// WebSocket path
    pub path: String,
    /// `tcp` or `websocket`
    pub transport: String,
    pub tls: bool,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    pub client_id_prefix: String,
    pub clean_session: bool,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    /// Constant delay before every reconnect attempt
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            path: "/mqtt".to_string(),
            transport: "tcp".to_string(),
            tls: false,
            username_env: None,
            password_env: None,
            client_id_prefix: "stationpulse".to_string(),
            clean_session: true,
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            reconnect_delay_ms: 5000,
            max_reconnect_attempts: 5,
        }
    }
}

/// Topic layout: `{base}/{client}/{location}/{station}/{suffix}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopicsSection {
    pub base: String,
    pub status_suffix: String,
    pub statistics_suffix: String,
    pub storage_suffix: String,
}

impl Default for TopicsSection {
    fn default() -> Self {
        Self {
            base: "telemetry".to_string(),
            status_suffix: "status".to_string(),
            statistics_suffix: "statistics".to_string(),
            storage_suffix: "storage".to_string(),
        }
    }
}

/// QoS (`0|1|2` or names) and retain flag per message class
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublishSection {
    pub status_qos: String,
    pub status_retain: bool,
    pub statistics_qos: String,
    pub statistics_retain: bool,
    pub storage_qos: String,
    pub storage_retain: bool,
    pub will_qos: String,
    pub will_retain: bool,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            status_qos: "at_least_once".to_string(),
            status_retain: true,
            statistics_qos: "at_least_once".to_string(),
            statistics_retain: false,
            storage_qos: "at_least_once".to_string(),
            storage_retain: false,
            will_qos: "at_least_once".to_string(),
            will_retain: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleSection {
    /// Time between ticks after a successful tick (default: 900 = 15 minutes)
    pub interval_secs: u64,
    /// Wait before the first tick
    pub initial_delay_secs: u64,
    /// Wait before the next tick after a failed one
    pub recovery_delay_secs: u64,
    /// Length of the aggregation window
    pub window_minutes: u64,
}

impl ScheduleSection {
    /// Window length in seconds, `None` if it does not fit
    pub fn window_secs(&self) -> Option<u64> {
        self.window_minutes.checked_mul(60)
    }
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            interval_secs: 900,
            initial_delay_secs: 30,
            recovery_delay_secs: 60,
            window_minutes: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataSourceSection {
    /// SQLite database holding scan records
    pub path: PathBuf,
    pub table: String,
    /// Identifier stored for failed scans
    pub no_read_sentinel: String,
    /// `direct_flags` or `completeness_derived`
    pub policy: String,
    pub query_timeout_secs: u64,
}

impl Default for DataSourceSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("stationpulse.db"),
            table: "scans".to_string(),
            no_read_sentinel: "NoRead".to_string(),
            policy: "direct_flags".to_string(),
            query_timeout_secs: 30,
        }
    }
}

impl DataSourceSection {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs.max(1))
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("No config file found (searched: {0})")]
    NotFound(String),
    #[error("Invalid device identity: {0}")]
    InvalidIdentity(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A configuration value that could not be parsed. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid value '{value}' for {field}: expected {expected}")]
pub struct ConfigParseError {
    pub field: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl ConfigParseError {
    pub fn new(field: &'static str, value: impl Into<String>, expected: &'static str) -> Self {
        Self {
            field,
            value: value.into(),
            expected,
        }
    }
}

/// Parse `raw`, falling back to `default` with a warning
fn parse_or_default<T>(field: &'static str, raw: &str, default: T) -> T
where
    T: FromStr<Err = ConfigParseError> + Debug,
{
    match raw.parse::<T>() {
        Ok(value) => value,
        Err(e) => {
            warn!(
                field,
                value = %e.value,
                expected = e.expected,
                default = ?default,
                "Invalid configuration value, using default"
            );
            default
        }
    }
}

fn window_secs_or_default(schedule: &ScheduleSection) -> u64 {
    let default = ScheduleSection::default().window_minutes * 60;
    schedule.window_secs().unwrap_or_else(|| {
        let e = ConfigParseError::new(
            "schedule.window_minutes",
            schedule.window_minutes.to_string(),
            "a window that fits in u64 seconds",
        );
        warn!(
            field = e.field,
            value = %e.value,
            expected = e.expected,
            default_secs = default,
            "Invalid configuration value, using default"
        );
        default
    })
}

/// Parse an override of a whole number of seconds or minutes
fn parse_override(field: &'static str, raw: &str) -> Result<u64, ConfigParseError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| ConfigParseError::new(field, raw, "a non-negative integer"))
}

impl StationConfig {
    /// Load configuration from TOML file, then apply environment overrides
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse and structurally validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: StationConfig = toml::from_str(content)?;
        config.validate_identity()?;
        validate_table_name(&config.datasource.table)?;
        Ok(config)
    }

    /// Resolve the config file: the explicit path if given, else the first default that exists
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| ConfigError::NotFound(DEFAULT_CONFIG_PATHS.join(", ")))
    }

    fn validate_identity(&self) -> Result<(), ConfigError> {
        let device = &self.device;
        for (field, value) in [
            ("client_name", &device.client_name),
            ("location", &device.location),
            ("station", &device.station),
            ("serial_number", &device.serial_number),
        ] {
            validate_topic_segment(value).map_err(|e| {
                ConfigError::InvalidIdentity(format!("device.{field} = '{value}': {e}"))
            })?;
        }
        Ok(())
    }

    /// Apply `STATIONPULSE_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply schedule overrides from `lookup`; malformed values are logged and ignored
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let schedule = &mut self.schedule;
        for (name, target) in [
            (ENV_INTERVAL_SECS, &mut schedule.interval_secs),
            (ENV_INITIAL_DELAY_SECS, &mut schedule.initial_delay_secs),
            (ENV_RECOVERY_DELAY_SECS, &mut schedule.recovery_delay_secs),
            (ENV_WINDOW_MINUTES, &mut schedule.window_minutes),
        ] {
            let Some(raw) = lookup(name) else {
                continue;
            };
            match parse_override(name, &raw) {
                Ok(value) => *target = value,
                Err(e) => warn!(
                    field = e.field,
                    value = %e.value,
                    expected = e.expected,
                    kept = *target,
                    "Invalid environment override, keeping configured value"
                ),
            }
        }
    }

    /// Non-fatal findings for startup logs
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let schedule = &self.schedule;
        let mqtt = &self.mqtt;

        if schedule.interval_secs == 0 {
            warnings.push("schedule.interval_secs is 0: ticks run back to back".to_string());
        }
        if schedule.recovery_delay_secs >= schedule.interval_secs {
            warnings.push(format!(
                "schedule.recovery_delay_secs ({}) is not shorter than interval_secs ({})",
                schedule.recovery_delay_secs, schedule.interval_secs
            ));
        }
        if schedule.window_minutes == 0 {
            warnings.push("schedule.window_minutes is 0: every aggregation will fail".to_string());
        } else if let Some(window_secs) = schedule.window_secs() {
            if window_secs != schedule.interval_secs {
                warnings.push(format!(
                    "schedule.window_minutes ({}) does not match interval_secs ({}): \
                     windows overlap or leave gaps",
                    schedule.window_minutes, schedule.interval_secs
                ));
            }
        } else {
            warnings.push(format!(
                "schedule.window_minutes ({}) is too large: using default",
                schedule.window_minutes
            ));
        }
        if mqtt.max_reconnect_attempts == 0 {
            warnings.push(
                "mqtt.max_reconnect_attempts is 0: a lost session is never retried automatically"
                    .to_string(),
            );
        }
        if mqtt.reconnect_delay_ms == 0 {
            warnings.push("mqtt.reconnect_delay_ms is 0".to_string());
        }
        if mqtt.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            warnings.push(format!(
                "mqtt.keep_alive_secs ({}) raised to {MIN_KEEP_ALIVE_SECS}",
                mqtt.keep_alive_secs
            ));
        }
        if let Some(username_env) = &mqtt.username_env {
            if std::env::var(username_env).is_err() {
                warnings.push(format!(
                    "mqtt.username_env names {username_env}, which is not set: connecting anonymously"
                ));
            }
        }
        if mqtt.tls && mqtt.port == 1883 {
            warnings.push("mqtt.tls is enabled on port 1883".to_string());
        }

        let qos = |raw: &str| raw.parse::<DeliveryGuarantee>().map(drop);
        let publish = &self.publish;
        let enumerations: [(&str, &str, Result<(), ConfigParseError>); 6] = [
            (
                "mqtt.transport",
                &mqtt.transport,
                mqtt.transport.parse::<TransportKind>().map(drop),
            ),
            ("publish.status_qos", &publish.status_qos, qos(&publish.status_qos)),
            (
                "publish.statistics_qos",
                &publish.statistics_qos,
                qos(&publish.statistics_qos),
            ),
            ("publish.storage_qos", &publish.storage_qos, qos(&publish.storage_qos)),
            ("publish.will_qos", &publish.will_qos, qos(&publish.will_qos)),
            (
                "datasource.policy",
                &self.datasource.policy,
                self.datasource.policy.parse::<AggregationPolicy>().map(drop),
            ),
        ];
        for (field, value, result) in enumerations {
            if let Err(e) = result {
                warnings.push(format!(
                    "{field} = '{value}' is invalid (expected {}): using default",
                    e.expected
                ));
            }
        }

        warnings
    }

    pub fn device_identity(&self) -> DeviceIdentity {
        let device = &self.device;
        DeviceIdentity {
            client_name: device.client_name.clone(),
            location: device.location.clone(),
            station: device.station.clone(),
            serial_number: device.serial_number.clone(),
            os_version: device
                .os_version
                .clone()
                .unwrap_or_else(SysinfoProbe::os_descriptor),
        }
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        self.mqtt
            .username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        self.mqtt
            .password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    pub fn link_settings(&self) -> LinkSettings {
        let mqtt = &self.mqtt;
        let credentials = self.get_mqtt_username().map(|username| Credentials {
            username,
            password: self.get_mqtt_password().unwrap_or_default(),
        });

        LinkSettings {
            host: mqtt.host.clone(),
            port: mqtt.port,
            path: mqtt.path.clone(),
            transport: parse_or_default("mqtt.transport", &mqtt.transport, TransportKind::Tcp),
            tls: mqtt.tls,
            credentials,
            client_id_prefix: mqtt.client_id_prefix.clone(),
            clean_session: mqtt.clean_session,
            keep_alive: Duration::from_secs(mqtt.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS)),
            connect_timeout: Duration::from_secs(mqtt.connect_timeout_secs.max(1)),
        }
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: self.mqtt.max_reconnect_attempts,
            delay: Duration::from_millis(self.mqtt.reconnect_delay_ms),
        }
    }

    pub fn publish_policy(&self) -> PublishPolicy {
        let publish = &self.publish;
        let defaults = PublishPolicy::default();
        let options = |field, raw: &str, retain, default: MessageOptions| {
            MessageOptions::new(parse_or_default(field, raw, default.qos), retain)
        };

        PublishPolicy {
            status: options(
                "publish.status_qos",
                &publish.status_qos,
                publish.status_retain,
                defaults.status,
            ),
            statistics: options(
                "publish.statistics_qos",
                &publish.statistics_qos,
                publish.statistics_retain,
                defaults.statistics,
            ),
            storage: options(
                "publish.storage_qos",
                &publish.storage_qos,
                publish.storage_retain,
                defaults.storage,
            ),
            will: options(
                "publish.will_qos",
                &publish.will_qos,
                publish.will_retain,
                defaults.will,
            ),
        }
    }

    pub fn schedule_settings(&self) -> ScheduleSettings {
        let schedule = &self.schedule;
        ScheduleSettings {
            initial_delay: Duration::from_secs(schedule.initial_delay_secs),
            interval: Duration::from_secs(schedule.interval_secs),
            recovery_delay: Duration::from_secs(schedule.recovery_delay_secs),
            window: Duration::from_secs(window_secs_or_default(schedule)),
        }
    }

    pub fn aggregation_policy(&self) -> AggregationPolicy {
        parse_or_default(
            "datasource.policy",
            &self.datasource.policy,
            AggregationPolicy::default(),
        )
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
client_name = "acme"
location = "berlin"
station = "dock-3"
serial_number = "SN-0042"
os_version = "Linux 6.1"
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

/// Table names are interpolated into SQL, so only plain identifiers are accepted
fn validate_table_name(table: &str) -> Result<(), ConfigError> {
    let mut chars = table.chars();
    let valid = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid {
        return Err(ConfigError::InvalidConfig(format!(
            "datasource.table '{table}' must match [A-Za-z_][A-Za-z0-9_]*"
        )));
    }
    Ok(())
}
