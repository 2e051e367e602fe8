//! Pure connection types and broker option handling
//!
//! Nothing in this module performs I/O. It describes the connection state,
//! the delivery options for each message class and how link settings map onto
//! `rumqttc` options.

use rumqttc::Transport as RumqttcTransport;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::MqttOptions;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::ConfigParseError;

/// Connection state of the broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session; initial and post-shutdown state
    #[default]
    Disconnected,
    /// First connect in flight
    Connecting,
    /// Session established, publishes allowed
    Connected,
    /// Session lost; carries the 1-based attempt number
    Reconnecting(u32),
    /// Reconnect budget exhausted; only an explicit connect request leaves this state
    GivenUp,
}

impl ConnectionState {
    /// Current reconnect attempt, 0 outside of `Reconnecting`
    pub fn reconnect_attempt(&self) -> u32 {
        match self {
            ConnectionState::Reconnecting(attempt) => *attempt,
            _ => 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting({attempt})"),
            ConnectionState::GivenUp => write!(f, "given_up"),
        }
    }
}

/// Bounded reconnect with a constant delay before every attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(5),
        }
    }
}

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryGuarantee {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl DeliveryGuarantee {
    pub fn qos(self) -> QoS {
        match self {
            DeliveryGuarantee::AtMostOnce => QoS::AtMostOnce,
            DeliveryGuarantee::AtLeastOnce => QoS::AtLeastOnce,
            DeliveryGuarantee::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

impl FromStr for DeliveryGuarantee {
    type Err = ConfigParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "0" | "at_most_once" => Ok(Self::AtMostOnce),
            "1" | "at_least_once" => Ok(Self::AtLeastOnce),
            "2" | "exactly_once" => Ok(Self::ExactlyOnce),
            _ => Err(ConfigParseError::new(
                "qos",
                s,
                "0 | 1 | 2 | at_most_once | at_least_once | exactly_once",
            )),
        }
    }
}

/// Per-message delivery options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageOptions {
    pub qos: DeliveryGuarantee,
    pub retain: bool,
}

impl MessageOptions {
    pub fn new(qos: DeliveryGuarantee, retain: bool) -> Self {
        Self { qos, retain }
    }
}

/// Delivery options for each message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishPolicy {
    pub status: MessageOptions,
    pub statistics: MessageOptions,
    pub storage: MessageOptions,
    pub will: MessageOptions,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            status: MessageOptions::new(DeliveryGuarantee::AtLeastOnce, true),
            statistics: MessageOptions::new(DeliveryGuarantee::AtLeastOnce, false),
            storage: MessageOptions::new(DeliveryGuarantee::AtLeastOnce, false),
            will: MessageOptions::new(DeliveryGuarantee::AtLeastOnce, true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Tcp,
    WebSocket,
}

impl FromStr for TransportKind {
    type Err = ConfigParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tcp" | "mqtt" => Ok(Self::Tcp),
            "ws" | "websocket" | "websockets" => Ok(Self::WebSocket),
            _ => Err(ConfigParseError::new("mqtt.transport", s, "tcp | websocket")),
        }
    }
}

/// Broker credentials resolved from the environment
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything needed to open a broker session
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSettings {
    pub host: String,
    pub port: u16,
    /// WebSocket path; ignored for TCP
    pub path: String,
    pub transport: TransportKind,
    pub tls: bool,
    pub credentials: Option<Credentials>,
    pub client_id_prefix: String,
    pub clean_session: bool,
    pub keep_alive: Duration,
    /// Bound on ConnAck wait and on each publish hand-off
    pub connect_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            path: "/mqtt".to_string(),
            transport: TransportKind::Tcp,
            tls: false,
            credentials: None,
            client_id_prefix: "stationpulse".to_string(),
            clean_session: true,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl LinkSettings {
    /// Broker address for logs, e.g. `tcp://broker:1883` or `wss://broker:443/mqtt`
    pub fn endpoint(&self) -> String {
        match (self.transport, self.tls) {
            (TransportKind::Tcp, false) => format!("tcp://{}:{}", self.host, self.port),
            (TransportKind::Tcp, true) => format!("ssl://{}:{}", self.host, self.port),
            (TransportKind::WebSocket, false) => {
                format!("ws://{}:{}{}", self.host, self.port, self.path)
            }
            (TransportKind::WebSocket, true) => {
                format!("wss://{}:{}{}", self.host, self.port, self.path)
            }
        }
    }
}

/// Last-will registered with the broker when a session opens
#[derive(Debug, Clone, PartialEq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub options: MessageOptions,
}

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Broker handshake failed: {0}")]
    Handshake(String),
    #[error("Connection refused by broker: {0}")]
    ConnectionRefused(String),
    #[error("No ConnAck within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker address: {0}")]
    InvalidBrokerAddress(String),
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },
    #[error("Broker link closed")]
    LinkClosed,
    #[error("Serialization error")]
    Serialization(#[source] serde_json::Error),
}

impl MqttError {
    /// Errors raised while establishing a session, as opposed to using one
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            MqttError::ConnectionFailed(_)
                | MqttError::Handshake(_)
                | MqttError::ConnectionRefused(_)
                | MqttError::ConnectTimeout(_)
                | MqttError::InvalidBrokerAddress(_)
                | MqttError::NotConnected { .. }
        )
    }
}

/// `{prefix}-{serial}-{8 hex chars}`, unique per session
pub fn build_client_id(prefix: &str, serial_number: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{serial_number}-{}", &suffix[..8])
}

/// Map link settings and the will onto `rumqttc` options
pub fn configure_mqtt_options(
    settings: &LinkSettings,
    client_id: &str,
    will: Option<&WillMessage>,
) -> Result<MqttOptions, MqttError> {
    if settings.host.trim().is_empty() || settings.port == 0 {
        return Err(MqttError::InvalidBrokerAddress(settings.endpoint()));
    }

    let mut mqtt_options = match settings.transport {
        TransportKind::Tcp => {
            let mut options = MqttOptions::new(client_id, settings.host.clone(), settings.port);
            if settings.tls {
                options.set_transport(RumqttcTransport::tls_with_default_config());
            }
            options
        }
        TransportKind::WebSocket => {
            // rumqttc expects the full websocket URL as the host
            let url = Url::parse(&settings.endpoint())
                .map_err(|_| MqttError::InvalidBrokerAddress(settings.endpoint()))?;
            let mut options = MqttOptions::new(client_id, url.to_string(), settings.port);
            if settings.tls {
                options.set_transport(RumqttcTransport::wss_with_default_config());
            } else {
                options.set_transport(RumqttcTransport::Ws);
            }
            options
        }
    };

    mqtt_options.set_keep_alive(settings.keep_alive);
    mqtt_options.set_clean_start(settings.clean_session);

    if let Some(credentials) = &settings.credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    if let Some(will) = will {
        mqtt_options.set_last_will(LastWill::new(
            &will.topic,
            will.payload.clone(),
            will.options.qos.qos(),
            will.options.retain,
            None,
        ));
    }

    Ok(mqtt_options)
}
