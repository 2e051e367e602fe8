//! Connection manager lifecycle against a mock broker link
//!
//! Covers the reconnect path driven by link events, the bounded retry budget,
//! and recovery through an explicit connect after giving up.

use stationpulse::config::TopicsSection;
use stationpulse::protocol::{DeviceIdentity, PayloadBuilder, TopicSet};
use stationpulse::testing::{FixedClock, MockBrokerLink};
use stationpulse::transport::mqtt::{
    ConnectionManager, ConnectionState, DeliveryGuarantee, LinkEvent, MqttError, PublishPolicy,
    ReconnectConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const STATUS_TOPIC: &str = "telemetry/acme/berlin/dock-3/status";

fn identity() -> DeviceIdentity {
    DeviceIdentity {
        client_name: "acme".to_string(),
        location: "berlin".to_string(),
        station: "dock-3".to_string(),
        serial_number: "SN-0042".to_string(),
        os_version: "Linux 6.1".to_string(),
    }
}

fn manager(link: MockBrokerLink, max_attempts: u32) -> Arc<ConnectionManager<MockBrokerLink>> {
    let builder = PayloadBuilder::new(
        TopicSet::new(&identity(), &TopicsSection::default()),
        Arc::new(FixedClock::epoch()),
    );
    Arc::new(ConnectionManager::new(
        link,
        identity(),
        builder,
        PublishPolicy::default(),
        ReconnectConfig {
            max_attempts,
            delay: Duration::from_millis(10),
        },
    ))
}

async fn wait_for_state(
    manager: &ConnectionManager<MockBrokerLink>,
    predicate: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    let mut state_rx = manager.subscribe_state();
    let state = tokio::time::timeout(Duration::from_secs(5), state_rx.wait_for(|s| predicate(s)))
        .await
        .expect("state not reached in time")
        .expect("state channel closed");
    *state
}

#[tokio::test]
async fn test_disconnect_event_reconnects_and_resets_attempts() {
    let link = MockBrokerLink::new();
    let manager = manager(link.clone(), 3);
    manager.ensure_connected().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let pump = manager.spawn_event_pump(events_rx);
    let mut state_rx = manager.subscribe_state();

    events_tx
        .send(LinkEvent::Disconnected("keep-alive timeout".to_string()))
        .unwrap();

    let reconnecting = tokio::time::timeout(
        Duration::from_secs(5),
        state_rx.wait_for(|s| matches!(s, ConnectionState::Reconnecting(_))),
    )
    .await
    .unwrap()
    .map(|state| *state)
    .unwrap();
    assert_eq!(reconnecting, ConnectionState::Reconnecting(1));

    let connected = wait_for_state(&manager, ConnectionState::is_connected).await;
    assert_eq!(connected, ConnectionState::Connected);
    assert_eq!(manager.reconnect_attempt(), 0);
    assert_eq!(link.open_calls(), 2);

    // Each session announces itself
    tokio::time::timeout(Duration::from_secs(5), async {
        while link.published_to(STATUS_TOPIC).await.len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("second online status not published");

    manager.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), pump)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_gives_up_after_max_attempts_and_stays_given_up() {
    let link = MockBrokerLink::new();
    let manager = manager(link.clone(), 3);
    manager.ensure_connected().await.unwrap();

    link.set_fail_open(true);
    manager.handle_disconnect("broker restarted").await;

    assert_eq!(manager.state(), ConnectionState::GivenUp);
    // One initial open plus three reconnect attempts
    assert_eq!(link.open_calls(), 4);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(link.open_calls(), 4, "no automatic attempts after giving up");
}

#[tokio::test]
async fn test_explicit_connect_after_giving_up_starts_over() {
    let link = MockBrokerLink::new();
    let manager = manager(link.clone(), 1);
    manager.ensure_connected().await.unwrap();

    link.set_fail_open(true);
    manager.handle_disconnect("network down").await;
    assert_eq!(manager.state(), ConnectionState::GivenUp);

    link.set_fail_open(false);
    manager
        .publish(
            "telemetry/acme/berlin/dock-3/statistics",
            b"{}".to_vec(),
            DeliveryGuarantee::AtLeastOnce,
            false,
        )
        .await
        .unwrap();

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.reconnect_attempt(), 0);
}

#[tokio::test]
async fn test_reconnect_succeeds_after_transient_failures() {
    let link = MockBrokerLink::new();
    let manager = manager(link.clone(), 5);
    manager.ensure_connected().await.unwrap();

    link.fail_next_opens(2);
    manager.handle_disconnect("broker restarted").await;

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(link.open_calls(), 4);
}

#[tokio::test]
async fn test_shutdown_publishes_offline_and_closes() {
    let link = MockBrokerLink::new();
    let manager = manager(link.clone(), 3);
    manager.ensure_connected().await.unwrap();

    manager.shutdown().await.unwrap();

    let statuses = link.published_to(STATUS_TOPIC).await;
    let last = statuses.last().unwrap().payload_json();
    assert_eq!(last["device_status"], "offline");
    assert!(statuses.last().unwrap().retain);
    assert_eq!(link.close_calls(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_shutdown_interrupts_reconnect_delay() {
    let link = MockBrokerLink::new();
    let builder = PayloadBuilder::new(
        TopicSet::new(&identity(), &TopicsSection::default()),
        Arc::new(FixedClock::epoch()),
    );
    let manager = Arc::new(ConnectionManager::new(
        link.clone(),
        identity(),
        builder,
        PublishPolicy::default(),
        ReconnectConfig {
            max_attempts: 5,
            delay: Duration::from_secs(3600),
        },
    ));
    manager.ensure_connected().await.unwrap();

    let background = Arc::clone(&manager);
    let reconnect = tokio::spawn(async move { background.handle_disconnect("lost").await });
    wait_for_state(&manager, |s| matches!(s, ConnectionState::Reconnecting(_))).await;

    manager.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), reconnect)
        .await
        .expect("reconnect loop should stop on shutdown")
        .unwrap();

    assert_eq!(link.open_calls(), 1);
    assert!(matches!(
        manager.ensure_connected().await,
        Err(MqttError::NotConnected { .. })
    ));
}
