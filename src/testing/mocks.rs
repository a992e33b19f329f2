//! Mock implementations for testing
//!
//! An in-memory [`Connector`] whose sessions are driven by the test, a
//! recording [`BrokerClient`], and a configurable [`CommandHandler`], so the
//! broker lifecycle and the router can be exercised without a live broker.

use crate::command::{Command, CommandHandler, CommandResult};
use crate::transport::mqtt::{ConnectOptions, MqttError, QosLevel};
use crate::transport::{BrokerClient, BrokerSession, Connector, SessionEvent};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};

/// A message recorded by [`MockBrokerClient`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: String,
    pub qos: QosLevel,
    pub retain: bool,
}

/// Mock broker client for one session
#[derive(Debug, Default)]
pub struct MockBrokerClient {
    pub published: Arc<Mutex<Vec<PublishedMessage>>>,
    pub subscriptions: Arc<Mutex<Vec<(String, QosLevel)>>>,
    pub unsubscriptions: Arc<Mutex<Vec<String>>>,
    pub disconnects: AtomicUsize,
    pub fail_publish: AtomicBool,
    /// When set, the next publish is recorded and then waits on the gate
    gate: std::sync::Mutex<Option<Arc<Notify>>>,
}

impl MockBrokerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            fail_publish: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    /// Publishes to `topic` with the given payload
    pub async fn published_to(&self, topic: &str, payload: &str) -> usize {
        self.published
            .lock()
            .await
            .iter()
            .filter(|message| message.topic == topic && message.payload == payload)
            .count()
    }

    pub async fn subscription_topics(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .await
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub async fn unsubscriptions(&self) -> Vec<String> {
        self.unsubscriptions.lock().await.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Hold the next publish open until `gate` is notified
    pub fn gate_next_publish(&self, gate: Arc<Notify>) {
        *self
            .gate
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(gate);
    }
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), MqttError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(MqttError::PublishFailed {
                topic: topic.to_string(),
                reason: "Mock publish failure".to_string(),
            });
        }

        self.published.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(&payload).into_owned(),
            qos,
            retain,
        });

        let gate = self
            .gate
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), MqttError> {
        self.subscriptions
            .lock()
            .await
            .push((topic.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.unsubscriptions.lock().await.push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What [`MockConnector::open`] does with a new session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MockBehavior {
    /// Report `Connected` straight away
    #[default]
    Accept,
    /// Report `ConnectFailed` with the reason
    Reject(String),
    /// Fail synchronously from `open`
    FailOpen(String),
    /// Report nothing; the test drives the session with `emit`
    Silent,
}

#[derive(Debug)]
struct MockSession {
    client: Arc<MockBrokerClient>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

#[derive(Debug, Default)]
struct ConnectorState {
    behavior: MockBehavior,
    publish_gate: Option<Arc<Notify>>,
    opened: Vec<ConnectOptions>,
    sessions: Vec<MockSession>,
}

/// Mock connector. Clones share state, so a test can keep one clone and hand
/// the other to a `BrokerConnection`.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<std::sync::Mutex<ConnectorState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        let connector = Self::default();
        connector.set_behavior(behavior);
        connector
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ConnectorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies to sessions opened from now on
    pub fn set_behavior(&self, behavior: MockBehavior) {
        self.state().behavior = behavior;
    }

    /// Gate the first publish of the next opened session. Returns the gate
    /// to release it.
    pub fn gate_first_publish(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state().publish_gate = Some(Arc::clone(&gate));
        gate
    }

    pub fn open_count(&self) -> usize {
        self.state().opened.len()
    }

    pub fn opened_options(&self) -> Vec<ConnectOptions> {
        self.state().opened.clone()
    }

    pub fn latest_client(&self) -> Option<Arc<MockBrokerClient>> {
        self.state()
            .sessions
            .last()
            .map(|session| Arc::clone(&session.client))
    }

    pub fn clients(&self) -> Vec<Arc<MockBrokerClient>> {
        self.state()
            .sessions
            .iter()
            .map(|session| Arc::clone(&session.client))
            .collect()
    }

    /// Every publish across every session, in session order
    pub async fn all_publishes(&self) -> Vec<PublishedMessage> {
        let mut all = Vec::new();
        for client in self.clients() {
            all.extend(client.published().await);
        }
        all
    }

    /// Count of publishes of `payload` to `topic` across every session
    pub async fn count_published(&self, topic: &str, payload: &str) -> usize {
        let mut count = 0;
        for client in self.clients() {
            count += client.published_to(topic, payload).await;
        }
        count
    }

    /// Send an event on the latest session. False when nobody is listening.
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.state()
            .sessions
            .last()
            .is_some_and(|session| session.events.send(event).is_ok())
    }

    pub fn emit_message(&self, topic: &str, payload: &str) -> bool {
        self.emit(SessionEvent::Message {
            topic: topic.to_string(),
            payload: Bytes::from(payload.to_string()),
            retain: false,
        })
    }

    pub fn lose_connection(&self, reason: &str) -> bool {
        self.emit(SessionEvent::ConnectionLost(reason.to_string()))
    }
}

impl Connector for MockConnector {
    fn open(&self, options: &ConnectOptions) -> Result<BrokerSession, MqttError> {
        let mut state = self.state();
        state.opened.push(options.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        match &state.behavior {
            MockBehavior::FailOpen(reason) => {
                return Err(MqttError::ConnectionFailed(reason.clone()));
            }
            MockBehavior::Accept => {
                let _ = events_tx.send(SessionEvent::Connected);
            }
            MockBehavior::Reject(reason) => {
                let _ = events_tx.send(SessionEvent::ConnectFailed(reason.clone()));
            }
            MockBehavior::Silent => {}
        }

        let client = Arc::new(MockBrokerClient::new());
        if let Some(gate) = state.publish_gate.take() {
            client.gate_next_publish(gate);
        }
        state.sessions.push(MockSession {
            client: Arc::clone(&client),
            events: events_tx,
        });

        Ok(BrokerSession {
            client,
            events: events_rx,
        })
    }
}

/// How a [`RecordingHandler`] responds
#[derive(Debug, Clone)]
pub enum HandlerBehavior {
    Succeed(Option<Value>),
    Fail(String),
    Panic,
}

/// Handler that records every command it receives
#[derive(Debug)]
pub struct RecordingHandler {
    pattern: String,
    action: String,
    behavior: HandlerBehavior,
    pub calls: Arc<Mutex<Vec<Command>>>,
}

impl RecordingHandler {
    /// Accepts exactly `action`, succeeding without data
    pub fn for_action(action: &str) -> Self {
        Self {
            pattern: action.to_string(),
            action: action.to_string(),
            behavior: HandlerBehavior::Succeed(None),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_behavior(mut self, behavior: HandlerBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_pattern(mut self, pattern: &str) -> Self {
        self.pattern = pattern.to_string();
        self
    }

    pub async fn calls(&self) -> Vec<Command> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl CommandHandler for RecordingHandler {
    fn action_pattern(&self) -> &str {
        &self.pattern
    }

    fn can_handle(&self, command: &Command) -> bool {
        command.action() == self.action
    }

    async fn handle(&self, command: &Command) -> CommandResult {
        self.calls.lock().await.push(command.clone());

        match &self.behavior {
            HandlerBehavior::Succeed(data) => CommandResult::Success(data.clone()),
            HandlerBehavior::Fail(message) => CommandResult::error(message.clone()),
            HandlerBehavior::Panic => panic!("RecordingHandler {} panicked", self.action),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandSource, Payload};

    fn options() -> ConnectOptions {
        ConnectOptions::from_config(&crate::config::RelayConfig::test_config()).unwrap()
    }

    #[tokio::test]
    async fn test_mock_connector_accept() {
        let connector = MockConnector::new();
        let mut session = connector.open(&options()).unwrap();

        assert_eq!(session.events.recv().await, Some(SessionEvent::Connected));
        assert_eq!(connector.open_count(), 1);

        session
            .client
            .publish("t", b"p".to_vec(), QosLevel::AtLeastOnce, true)
            .await
            .unwrap();
        assert_eq!(connector.count_published("t", "p").await, 1);
    }

    #[tokio::test]
    async fn test_mock_connector_fail_open() {
        let connector = MockConnector::with_behavior(MockBehavior::FailOpen("nope".to_string()));
        assert!(connector.open(&options()).is_err());
        assert!(connector.latest_client().is_none());
        assert!(!connector.emit(SessionEvent::Connected));
    }

    #[tokio::test]
    async fn test_mock_client_failure() {
        let client = MockBrokerClient::with_failure();
        assert!(client
            .publish("t", Vec::new(), QosLevel::AtMostOnce, false)
            .await
            .is_err());
        assert!(client.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_recording_handler() {
        let handler = RecordingHandler::for_action("ping").with_pattern("p.*");
        let command = Command::new(CommandSource::Internal, "ping", Payload::new()).unwrap();

        assert_eq!(handler.action_pattern(), "p.*");
        assert!(handler.can_handle(&command));
        assert!(handler.handle(&command).await.is_success());
        assert_eq!(handler.call_count().await, 1);
    }
}
