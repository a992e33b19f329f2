//! Integration Tests with Real MQTT Broker
//!
//! Tests the rumqttc-backed connection against a real Mosquitto broker using
//! testcontainers. These tests validate:
//! - Connection and retained availability publishing
//! - Command delivery from the broker into listeners
//! - Subscriptions recorded before connect
//! - Last-will delivery when a session drops without DISCONNECT
//! - Probe outcomes for reachable and unreachable brokers


use mqtt_integration_helpers::MqttTestHarness;
use notify_relay::config::RelayConfig;
use notify_relay::transport::mqtt::{
    probe_connection, BrokerConnection, ConnectOptions, ConnectionState, ListenerRegistry,
    QosLevel, RumqttcConnector,
};
use notify_relay::transport::{Connector, SessionEvent};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testcontainers::clients::Cli;
use tokio::time::sleep;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn connection(config: &RelayConfig) -> BrokerConnection {
    let connection =
        BrokerConnection::new(config, Arc::new(RumqttcConnector::new()), ListenerRegistry::new())
            .expect("Connection creation should succeed");
    connection.start();
    connection
}

async fn connected(connection: &BrokerConnection) {
    assert!(
        connection
            .wait_for_state(ConnectionState::Connected, CONNECT_TIMEOUT)
            .await,
        "Should connect to real broker"
    );
}

/// Record every payload arriving on topics matching `pattern`
fn record(connection: &BrokerConnection, pattern: &str) -> Arc<Mutex<Vec<String>>> {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    connection.registry().add_listener(
        pattern,
        Arc::new(move |_: &str, payload: &str| sink.lock().unwrap().push(payload.to_string())),
    );
    received
}

async fn wait_for_payloads(received: &Arc<Mutex<Vec<String>>>, expected: &[&str]) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while received.lock().unwrap().as_slice() != expected {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "Expected {expected:?}, got {:?}",
        received.lock().unwrap()
    );
}

#[tokio::test]
async fn test_connect_to_real_broker() {
    // Arrange: Start real Mosquitto broker
    let docker = Cli::default();
    let harness = MqttTestHarness::new(&docker).await;
    let connection = connection(&harness.relay_config("connect"));

    // Act
    connection.connect().await;

    // Assert
    connected(&connection).await;
    assert_eq!(connection.reconnect_attempt(), 0);

    // Cleanup
    connection.stop().await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_retained_availability_follows_connection() {
    // Arrange: relay connects first, watcher joins later and sees the retained value
    let docker = Cli::default();
    let harness = MqttTestHarness::new(&docker).await;
    let relay = connection(&harness.relay_config("avail"));
    relay.connect().await;
    connected(&relay).await;

    let watcher = connection(&harness.relay_config_with("watcher", "it-avail/availability"));
    let availability = record(&watcher, "it-avail/availability");
    watcher.connect().await;
    connected(&watcher).await;
    wait_for_payloads(&availability, &["online"]).await;

    // Act
    relay.disconnect().await;

    // Assert
    wait_for_payloads(&availability, &["online", "offline"]).await;

    // Cleanup
    watcher.stop().await;
    relay.stop().await;
}

#[tokio::test]
async fn test_message_round_trip_through_listeners() {
    // Arrange: one connection listens, another publishes
    let docker = Cli::default();
    let harness = MqttTestHarness::new(&docker).await;
    let listener = connection(&harness.relay_config("listen"));
    let received = record(&listener, "it-listen/+/tv");
    let publisher = connection(&harness.relay_config("publish"));

    listener.connect().await;
    publisher.connect().await;
    connected(&listener).await;
    connected(&publisher).await;
    // Give the subscription time to settle on the broker
    sleep(Duration::from_millis(200)).await;

    // Act
    publisher
        .publish("it-listen/show_notification/tv", r#"{"title":"hi"}"#, false)
        .await;

    // Assert
    wait_for_payloads(&received, &[r#"{"title":"hi"}"#]).await;
    assert_eq!(
        listener.last_message().unwrap().topic,
        "it-listen/show_notification/tv"
    );

    // Cleanup
    publisher.stop().await;
    listener.stop().await;
}

#[tokio::test]
async fn test_subscription_recorded_before_connect_is_issued() {
    // Arrange
    let docker = Cli::default();
    let harness = MqttTestHarness::new(&docker).await;
    let listener = connection(&harness.relay_config("late-sub"));
    listener.subscribe("it-extra/#", QosLevel::AtLeastOnce).await;
    let received = record(&listener, "it-extra/#");
    let publisher = connection(&harness.relay_config("late-pub"));

    listener.connect().await;
    publisher.connect().await;
    connected(&listener).await;
    connected(&publisher).await;
    sleep(Duration::from_millis(200)).await;

    // Act
    publisher.publish("it-extra/ping", "pong", false).await;

    // Assert
    wait_for_payloads(&received, &["pong"]).await;

    // Cleanup
    publisher.stop().await;
    listener.stop().await;
}

#[tokio::test]
async fn test_last_will_published_when_session_drops() {
    // Arrange: a watcher on the availability topic and a raw session with a last-will
    let docker = Cli::default();
    let harness = MqttTestHarness::new(&docker).await;
    let watcher = connection(&harness.relay_config_with("will-watch", "it-will/availability"));
    let availability = record(&watcher, "it-will/availability");
    watcher.connect().await;
    connected(&watcher).await;

    let options = ConnectOptions::from_config(&harness.relay_config("will")).unwrap();
    let mut session = RumqttcConnector::new()
        .open(&options)
        .expect("Session should open");
    let first = tokio::time::timeout(CONNECT_TIMEOUT, session.events.recv())
        .await
        .expect("Broker should answer");
    assert_eq!(first, Some(SessionEvent::Connected));

    // Act: drop the socket without DISCONNECT
    drop(session);

    // Assert
    wait_for_payloads(&availability, &["offline"]).await;

    // Cleanup
    watcher.stop().await;
}

#[tokio::test]
async fn test_probe_reachable_broker() {
    // Arrange
    let docker = Cli::default();
    let harness = MqttTestHarness::new(&docker).await;
    let options = ConnectOptions::from_config(&harness.relay_config("probe")).unwrap();

    // Act
    let outcome = probe_connection(&RumqttcConnector::new(), &options, CONNECT_TIMEOUT).await;

    // Assert
    assert!(outcome.success, "Probe failed: {}", outcome.message);
    assert_eq!(outcome.message, "Connection successful");
}

#[tokio::test]
async fn test_probe_unreachable_broker_fails() {
    // Arrange: nothing listens on port 1
    let config = RelayConfig::from_toml_str(
        r#"
[relay]
id = "probe-down"

[mqtt]
broker_url = "mqtt://127.0.0.1:1"
"#,
    )
    .unwrap();
    let options = ConnectOptions::from_config(&config).unwrap();

    // Act
    let outcome = probe_connection(&RumqttcConnector::new(), &options, Duration::from_secs(5)).await;

    // Assert
    assert!(!outcome.success);
}
