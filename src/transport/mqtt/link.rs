//! Broker link: the I/O half of the MQTT transport
//!
//! A [`BrokerLink`] opens one session at a time and reports its asynchronous
//! loss through a [`LinkEvent`] channel. It never reconnects on its own; the
//! connection manager decides when a new session is opened.

use super::connection::{
    DeliveryGuarantee, LinkSettings, MqttError, WillMessage, build_client_id,
    configure_mqtt_options,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Asynchronous notifications from an open session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The session ended without a local close
    Disconnected(String),
}

#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Open a new session, registering `will` if given. Resolves once the broker acknowledged it.
    async fn open(&self, will: Option<&WillMessage>) -> Result<(), MqttError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: DeliveryGuarantee,
        retain: bool,
    ) -> Result<(), MqttError>;

    /// Disconnect cleanly and release the session. Closing a closed link is a no-op.
    async fn close(&self) -> Result<(), MqttError>;
}

/// Open and close a throwaway session with no will and no publishes.
///
/// The device's presence topic is left alone, so this is safe next to a
/// running agent.
pub async fn verify_reachable<L: BrokerLink + ?Sized>(link: &L) -> Result<(), MqttError> {
    link.open(None).await?;
    link.close().await
}

struct Session {
    client: AsyncClient,
    poller: JoinHandle<()>,
    closing: Arc<AtomicBool>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        self.poller.abort();
    }
}

/// [`BrokerLink`] over `rumqttc` v5
pub struct MqttLink {
    settings: LinkSettings,
    serial_number: String,
    session: Mutex<Option<Session>>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl MqttLink {
    pub fn new(
        settings: LinkSettings,
        serial_number: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let link = Self {
            settings,
            serial_number: serial_number.into(),
            session: Mutex::new(None),
            events,
        };
        (link, events_rx)
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Drive the event loop until the session ends.
    ///
    /// The first ConnAck (or the first error) resolves `ack`; after that every
    /// session loss is reported on `events` unless the link is closing.
    async fn poll_session(
        mut event_loop: EventLoop,
        ack: oneshot::Sender<Result<(), MqttError>>,
        events: mpsc::UnboundedSender<LinkEvent>,
        closing: Arc<AtomicBool>,
    ) {
        let mut ack = Some(ack);

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if let Some(ack) = ack.take() {
                        let _ = ack.send(Ok(()));
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect(_))) => {
                    Self::report_loss(&ack, &events, &closing, "broker sent DISCONNECT");
                    break;
                }
                Ok(event) => {
                    debug!(target: "mqtt_transport", ?event, "MQTT event");
                }
                Err(e) => {
                    match ack.take() {
                        Some(ack) => {
                            let _ = ack.send(Err(map_connect_error(e)));
                        }
                        None => Self::report_loss(&ack, &events, &closing, &e.to_string()),
                    }
                    break;
                }
            }
        }
    }

    fn report_loss(
        pending_ack: &Option<oneshot::Sender<Result<(), MqttError>>>,
        events: &mpsc::UnboundedSender<LinkEvent>,
        closing: &AtomicBool,
        reason: &str,
    ) {
        if pending_ack.is_some() || closing.load(Ordering::SeqCst) {
            return;
        }
        warn!(reason, "MQTT session lost");
        let _ = events.send(LinkEvent::Disconnected(reason.to_string()));
    }
}

fn map_connect_error(error: ConnectionError) -> MqttError {
    match error {
        ConnectionError::ConnectionRefused(code) => {
            MqttError::ConnectionRefused(format!("{code:?}"))
        }
        ConnectionError::NotConnAck(packet) => {
            MqttError::Handshake(format!("expected ConnAck, got {packet:?}"))
        }
        other => MqttError::ConnectionFailed(Box::new(other)),
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn open(&self, will: Option<&WillMessage>) -> Result<(), MqttError> {
        let mut session = self.session.lock().await;
        // Replace any stale session; its poller must not report a loss
        session.take();

        let client_id = build_client_id(&self.settings.client_id_prefix, &self.serial_number);
        let options = configure_mqtt_options(&self.settings, &client_id, will)?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        let (ack_tx, ack_rx) = oneshot::channel();
        let closing = Arc::new(AtomicBool::new(false));
        let poller = tokio::spawn(Self::poll_session(
            event_loop,
            ack_tx,
            self.events.clone(),
            closing.clone(),
        ));
        let pending = Session {
            client,
            poller,
            closing,
        };

        info!(
            client_id = %client_id,
            endpoint = %self.settings.endpoint(),
            "Opening MQTT session"
        );

        let timeout = self.settings.connect_timeout;
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => {
                *session = Some(pending);
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(MqttError::Handshake(
                "event loop ended before ConnAck".to_string(),
            )),
            Err(_) => Err(MqttError::ConnectTimeout(timeout)),
        }
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: DeliveryGuarantee,
        retain: bool,
    ) -> Result<(), MqttError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(MqttError::LinkClosed)?;
        if session.poller.is_finished() {
            return Err(MqttError::LinkClosed);
        }

        let timeout = self.settings.connect_timeout;
        tokio::time::timeout(
            timeout,
            session.client.publish(topic, qos.qos(), retain, payload),
        )
        .await
        .map_err(|e| MqttError::PublishFailed(Box::new(e)))?
        .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    async fn close(&self) -> Result<(), MqttError> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Ok(());
        };
        session.closing.store(true, Ordering::SeqCst);

        if let Err(e) = session.client.disconnect().await {
            debug!(error = %e, "MQTT disconnect request not delivered");
        }

        // Give the event loop time to flush the DISCONNECT
        match tokio::time::timeout(CLOSE_GRACE, &mut session.poller).await {
            Ok(_) => info!("MQTT session closed"),
            Err(_) => warn!("MQTT event loop didn't stop gracefully, forcing abort"),
        }
        Ok(())
    }
}
