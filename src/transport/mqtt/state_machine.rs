//! Pure connection state transitions
//!
//! Every state change of the connection manager goes through
//! [`StateMachine::next_state`]. A `None` result means the event is not valid
//! in the current state and must be ignored.

use super::connection::{ConnectionState, ReconnectConfig};
use tracing::{error, info, warn};

/// Events that drive the connection state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A caller asked for a session
    ConnectRequested,
    /// ConnAck received from broker
    ConnAckReceived,
    /// First connect failed
    ConnectFailed(String),
    /// Broker or network ended an established session
    DisconnectedByBroker(String),
    /// A reconnect attempt failed
    ReconnectFailed,
    /// Orderly shutdown
    ShutdownRequested,
}

pub struct StateMachine;

impl StateMachine {
    /// Determine the next state for `event`, or `None` if the transition is not allowed
    pub fn next_state(
        current: ConnectionState,
        event: &ConnectionEvent,
        config: &ReconnectConfig,
    ) -> Option<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (current, event) {
            (_, E::ShutdownRequested) => Some(S::Disconnected),
            (S::Disconnected | S::GivenUp, E::ConnectRequested) => Some(S::Connecting),
            (S::Connecting, E::ConnAckReceived) => Some(S::Connected),
            (S::Connecting, E::ConnectFailed(_)) => Some(S::Disconnected),
            (S::Connected, E::DisconnectedByBroker(_)) => {
                if config.max_attempts == 0 {
                    Some(S::GivenUp)
                } else {
                    Some(S::Reconnecting(1))
                }
            }
            (S::Reconnecting(_), E::ConnAckReceived) => Some(S::Connected),
            (S::Reconnecting(attempt), E::ReconnectFailed) => {
                if attempt < config.max_attempts {
                    Some(S::Reconnecting(attempt + 1))
                } else {
                    Some(S::GivenUp)
                }
            }
            _ => None,
        }
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(
        from: &ConnectionState,
        to: &ConnectionState,
        event: &ConnectionEvent,
    ) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!(from = %from, to = %to, "MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Reconnecting(attempt)) => {
                warn!(from = %from, to = %to, attempt, event = ?event, "MQTT connection lost");
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Reconnecting(attempt)) => {
                warn!(from = %from, to = %to, attempt, "Reconnect attempt failed");
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!(from = %from, to = %to, "Reconnection successful");
            }
            (_, ConnectionState::GivenUp) => {
                error!(from = %from, to = %to, "MQTT reconnect attempts exhausted");
            }
            _ => {
                info!(from = %from, to = %to, event = ?event, "MQTT connection state changed");
            }
        }
    }

    /// Validate reconnect configuration (pure function)
    pub fn validate_reconnect_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == 0 {
            return Err(
                "max_reconnect_attempts is 0: a lost session goes straight to given up"
                    .to_string(),
            );
        }
        if config.delay.is_zero() {
            return Err("reconnect_delay_ms is 0: reconnects will hammer the broker".to_string());
        }
        Ok(())
    }
}
