//! Device identity, topic construction and topic segment validation
//!
//! Every topic the agent publishes to is derived once at startup from the
//! [`DeviceIdentity`] and the configured base/suffix strings:
//!
//! ```text
//! {base}/{client}/{location}/{station}/{suffix}
//! ```

use crate::config::TopicsSection;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Static, process-wide identity of this station
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub client_name: String,
    pub location: String,
    pub station: String,
    pub serial_number: String,
    /// OS descriptor embedded in status payloads
    pub os_version: String,
}

impl DeviceIdentity {
    /// Identifier carried as `device_id` in every payload
    pub fn device_id(&self) -> &str {
        &self.serial_number
    }
}

/// Topics used by this station, computed once at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicSet {
    pub status: String,
    pub statistics: String,
    pub storage: String,
}

impl TopicSet {
    pub fn new(identity: &DeviceIdentity, layout: &TopicsSection) -> Self {
        let prefix = [
            layout.base.as_str(),
            identity.client_name.as_str(),
            identity.location.as_str(),
            identity.station.as_str(),
        ];
        let topic = |suffix: &str| {
            let mut segments = prefix.to_vec();
            segments.push(suffix);
            join_topic(&segments)
        };

        Self {
            status: topic(&layout.status_suffix),
            statistics: topic(&layout.statistics_suffix),
            storage: topic(&layout.storage_suffix),
        }
    }
}

/// Join topic segments with single slashes.
///
/// Leading and trailing slashes of each segment are dropped and empty segments
/// are skipped, so a base of `"telemetry/"` or `"/telemetry"` yields the same topic.
pub fn join_topic(segments: &[&str]) -> String {
    segments
        .iter()
        .flat_map(|segment| segment.split('/'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Validate a single identity segment used inside a topic
pub fn validate_topic_segment(segment: &str) -> Result<(), ValidationError> {
    if segment.trim().is_empty() {
        return Err(ValidationError::EmptySegment);
    }

    for ch in segment.chars() {
        if matches!(ch, '/' | '+' | '#' | '\0') {
            return Err(ValidationError::InvalidSegmentChar(ch));
        }
    }

    Ok(())
}

/// Validation errors for topic segments
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Topic segment cannot be empty")]
    EmptySegment,
    #[error("Topic segment contains reserved character: '{0}'")]
    InvalidSegmentChar(char),
}
