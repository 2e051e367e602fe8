//! Crate-level error type for a single telemetry tick
//!
//! Every variant is caught at the tick boundary by the scheduler; none of them
//! stops the service.

use crate::stats::{DataSourceError, ProbeError};
use crate::transport::mqtt::MqttError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Data source error: {0}")]
    DataSource(#[from] DataSourceError),

    #[error("Connect error: {0}")]
    Connect(MqttError),

    #[error("Publish error: {0}")]
    Publish(MqttError),

    #[error("Health probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<MqttError> for TelemetryError {
    fn from(error: MqttError) -> Self {
        match error {
            MqttError::Serialization(e) => TelemetryError::Serialization(e),
            e if e.is_connect_error() => TelemetryError::Connect(e),
            e => TelemetryError::Publish(e),
        }
    }
}

impl TelemetryError {
    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryError::DataSource(_) => "data_source",
            TelemetryError::Connect(_) => "connect",
            TelemetryError::Publish(_) => "publish",
            TelemetryError::Probe(_) => "probe",
            TelemetryError::Serialization(_) => "serialization",
        }
    }
}

/// Result type for telemetry operations
pub type TelemetryResult<T> = Result<T, TelemetryError>;
