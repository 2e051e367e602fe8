//! Connection manager: the single owner of the broker session
//!
//! All state changes go through one `watch` channel and are applied
//! atomically with `send_if_modified`, so only one connect or reconnect can be
//! in flight. A connect request that races an in-flight one is rejected and the
//! caller sees `NotConnected`.

use super::connection::{
    ConnectionState, DeliveryGuarantee, MqttError, PublishPolicy, ReconnectConfig, WillMessage,
};
use super::link::{BrokerLink, LinkEvent};
use super::state_machine::{ConnectionEvent, StateMachine};
use crate::mqtt_span;
use crate::observability::metrics;
use crate::protocol::{DeviceIdentity, DeviceStatus, PayloadBuilder};
use crate::shutdown::{interruptible_sleep, wait_for_shutdown};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

pub struct ConnectionManager<L: BrokerLink> {
    link: L,
    identity: DeviceIdentity,
    builder: PayloadBuilder,
    policy: PublishPolicy,
    reconnect: ReconnectConfig,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
}

impl<L: BrokerLink> ConnectionManager<L> {
    pub fn new(
        link: L,
        identity: DeviceIdentity,
        builder: PayloadBuilder,
        policy: PublishPolicy,
        reconnect: ReconnectConfig,
    ) -> Self {
        if let Err(reason) = StateMachine::validate_reconnect_config(&reconnect) {
            warn!(reason = %reason, "Questionable reconnect configuration");
        }

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            link,
            identity,
            builder,
            policy,
            reconnect,
            state_tx,
            shutdown_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Observe state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Current reconnect attempt, 0 unless reconnecting
    pub fn reconnect_attempt(&self) -> u32 {
        self.state().reconnect_attempt()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Apply `event` atomically; returns the new state, or `None` if rejected
    fn apply(&self, event: ConnectionEvent) -> Option<ConnectionState> {
        let mut applied = None;
        self.state_tx.send_if_modified(|state| {
            match StateMachine::next_state(*state, &event, &self.reconnect) {
                Some(next) => {
                    StateMachine::log_state_transition(state, &next, &event);
                    *state = next;
                    applied = Some(next);
                    true
                }
                None => {
                    debug!(state = %state, event = ?event, "Ignoring connection event");
                    false
                }
            }
        });
        applied
    }

    fn will_message(&self) -> Result<WillMessage, MqttError> {
        let (topic, payload) = self
            .builder
            .build_status_message(&self.identity, DeviceStatus::Offline)
            .map_err(MqttError::Serialization)?;
        Ok(WillMessage {
            topic,
            payload,
            options: self.policy.will,
        })
    }

    async fn open_session(&self) -> Result<(), MqttError> {
        metrics().mqtt_connection_attempt();
        let will = self.will_message()?;
        match self.link.open(Some(&will)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                metrics().mqtt_connection_failed();
                Err(e)
            }
        }
    }

    /// Record a fresh session. If shutdown won the race, the session is closed again.
    async fn session_established(&self) -> Result<(), MqttError> {
        match self.apply(ConnectionEvent::ConnAckReceived) {
            Some(_) => {
                metrics().mqtt_connection_established();
                self.announce(DeviceStatus::Online).await;
                Ok(())
            }
            None => {
                let _ = self.link.close().await;
                Err(MqttError::NotConnected {
                    state: self.state(),
                })
            }
        }
    }

    /// Best-effort status publish; failures are logged only
    async fn announce(&self, status: DeviceStatus) {
        let message = self.builder.build_status_message(&self.identity, status);
        let (topic, payload) = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, ?status, "Failed to build status message");
                return;
            }
        };

        let options = self.policy.status;
        match self
            .link
            .publish(&topic, payload, options.qos, options.retain)
            .await
        {
            Ok(()) => {
                metrics().mqtt_message_published();
                info!(topic = %topic, ?status, "Published device status");
            }
            Err(e) => {
                metrics().mqtt_publish_failed();
                warn!(topic = %topic, ?status, error = %e, "Failed to publish device status");
            }
        }
    }

    /// Make sure a session exists, opening one if needed.
    ///
    /// Fails with `NotConnected` while another connect or reconnect is in
    /// flight, and after shutdown. A failed first connect is returned to the
    /// caller and not retried here.
    pub async fn ensure_connected(&self) -> Result<(), MqttError> {
        if self.state().is_connected() {
            return Ok(());
        }
        if self.is_shutting_down() {
            return Err(MqttError::NotConnected {
                state: self.state(),
            });
        }

        if self.apply(ConnectionEvent::ConnectRequested).is_none() {
            let state = self.state();
            if state.is_connected() {
                return Ok(());
            }
            return Err(MqttError::NotConnected { state });
        }

        let span = mqtt_span!(
            operation = "connect",
            client = %self.identity.client_name,
            serial = %self.identity.serial_number
        );
        async {
            match self.open_session().await {
                Ok(()) => self.session_established().await,
                Err(e) => {
                    warn!(error = %e, "MQTT connect failed");
                    self.apply(ConnectionEvent::ConnectFailed(e.to_string()));
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// React to an asynchronous session loss.
    ///
    /// Waits the configured delay before every attempt. Ends connected,
    /// given up, or on shutdown.
    pub async fn handle_disconnect(&self, reason: &str) {
        let next = self.apply(ConnectionEvent::DisconnectedByBroker(reason.to_string()));
        match next {
            Some(ConnectionState::Reconnecting(_)) => {
                metrics().mqtt_connection_lost();
            }
            Some(ConnectionState::GivenUp) => {
                metrics().mqtt_connection_lost();
                metrics().mqtt_reconnect_given_up();
                return;
            }
            _ => return,
        }

        let span = mqtt_span!(operation = "reconnect", reason = %reason);
        self.reconnect_loop().instrument(span).await;
    }

    async fn reconnect_loop(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        while let ConnectionState::Reconnecting(attempt) = self.state() {
            info!(
                attempt,
                max_attempts = self.reconnect.max_attempts,
                delay_ms = self.reconnect.delay.as_millis() as u64,
                "Attempting reconnection after delay"
            );
            if !interruptible_sleep(&mut shutdown_rx, self.reconnect.delay).await {
                info!("Shutdown signal received during reconnection delay, stopping");
                return;
            }

            match self.open_session().await {
                Ok(()) => {
                    if let Err(e) = self.session_established().await {
                        debug!(error = %e, "Reconnected session discarded");
                    }
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                    if let Some(ConnectionState::GivenUp) =
                        self.apply(ConnectionEvent::ReconnectFailed)
                    {
                        metrics().mqtt_reconnect_given_up();
                        return;
                    }
                }
            }
        }
    }

    /// Publish one message, connecting first if needed
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: DeliveryGuarantee,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.ensure_connected().await?;

        let size = payload.len();
        match self.link.publish(topic, payload, qos, retain).await {
            Ok(()) => {
                metrics().mqtt_message_published();
                debug!(topic = %topic, bytes = size, ?qos, retain, "Published message");
                Ok(())
            }
            Err(e) => {
                metrics().mqtt_publish_failed();
                // The link's disconnect notification drives the reconnect
                if matches!(e, MqttError::LinkClosed) {
                    warn!(topic = %topic, "Publish found the session closed");
                }
                Err(e)
            }
        }
    }

    /// Publish `offline`, disconnect, and refuse further connects.
    ///
    /// Stops any reconnect loop. Idempotent.
    pub async fn shutdown(&self) -> Result<(), MqttError> {
        let already = self.shutdown_tx.send_replace(true);
        if already {
            return Ok(());
        }

        if self.state().is_connected() {
            self.announce(DeviceStatus::Offline).await;
        }
        self.apply(ConnectionEvent::ShutdownRequested);
        metrics().mqtt_disconnected();
        self.link.close().await
    }
}

impl<L: BrokerLink + 'static> ConnectionManager<L> {
    /// Forward link notifications into the manager until shutdown
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut shutdown_rx = manager.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown_rx) => break,
                    event = events.recv() => match event {
                        Some(LinkEvent::Disconnected(reason)) => {
                            manager.handle_disconnect(&reason).await;
                        }
                        None => break,
                    },
                }
            }
            debug!("Connection event pump stopped");
        })
    }
}

impl<L: BrokerLink> std::fmt::Debug for ConnectionManager<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("reconnect", &self.reconnect)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
