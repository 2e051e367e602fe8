//! Transport layer for station telemetry
//!
//! The scheduler only needs "publish this message"; [`Publisher`] is that
//! seam. The MQTT connection manager is the production implementation.

use crate::protocol::TopicPayload;

pub mod mqtt;

use mqtt::{BrokerLink, ConnectionManager, MessageOptions, MqttError};

/// A serialized message ready for the broker
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub options: MessageOptions,
}

impl OutboundMessage {
    pub fn new((topic, payload): TopicPayload, options: MessageOptions) -> Self {
        Self {
            topic,
            payload,
            options,
        }
    }
}

/// Publishing seam used by the scheduler
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: OutboundMessage) -> Result<(), MqttError>;
}

#[async_trait::async_trait]
impl<L: BrokerLink> Publisher for ConnectionManager<L> {
    async fn publish(&self, message: OutboundMessage) -> Result<(), MqttError> {
        ConnectionManager::publish(
            self,
            &message.topic,
            message.payload,
            message.options.qos,
            message.options.retain,
        )
        .await
    }
}
