//! Broker connection lifecycle
//!
//! `BrokerConnection` owns at most one live broker session at a time and
//! drives the state machine
//! `Disconnected -> Connecting -> Connected -> Disconnected`.
//!
//! Every session gets a generation number. Events from a session whose
//! generation is no longer current are ignored, which is how an explicit
//! `disconnect()` wins over a late ConnAck or connection error from the
//! session it closed. Reconnects are scheduled on a single pending task with
//! cancel-and-replace semantics; a ticket number invalidates a retry that has
//! already woken up but lost a race with `disconnect()`.
//!
//! Inbound messages and connection changes are handed to a delivery task so
//! listener callbacks never run on the session event task.

use super::connection::{
    classify_connection_failure, ConnectOptions, ConnectionState, MqttError, QosLevel,
    ReconnectConfig,
};
use super::health_monitor::{BackoffState, HealthMonitor, ReconnectionDecision};
use super::listeners::ListenerRegistry;
use super::message_handler::MessageHandler;
use crate::config::RelayConfig;
use crate::mqtt_span;
use crate::observability::metrics;
use crate::transport::{BrokerClient, BrokerSession, Connector, SessionEvent};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// How long `stop()` waits for queued deliveries to drain
const DELIVERY_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A subscription re-issued on every successful connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub pattern: String,
    pub qos: QosLevel,
}

/// Most recent inbound message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastMessage {
    pub topic: String,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

/// Result of a one-shot connection test
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub success: bool,
    pub message: String,
}

impl ProbeOutcome {
    fn succeeded() -> Self {
        Self {
            success: true,
            message: "Connection successful".to_string(),
        }
    }

    fn failed(message: String) -> Self {
        Self {
            success: false,
            message,
        }
    }
}

/// Settings copied out of the configuration at construction
#[derive(Debug, Clone)]
struct BrokerSettings {
    enabled: bool,
    subscribe_topic: String,
    publish_topic: String,
    availability_topic: String,
    online_payload: String,
    offline_payload: String,
    qos: QosLevel,
    auto_reconnect: bool,
}

impl BrokerSettings {
    fn from_config(config: &RelayConfig) -> Self {
        let mqtt = &config.mqtt;
        Self {
            enabled: mqtt.enabled,
            subscribe_topic: mqtt.subscribe_topic.clone(),
            publish_topic: mqtt.publish_topic.clone(),
            availability_topic: mqtt.availability_topic.clone(),
            online_payload: mqtt.online_payload.clone(),
            offline_payload: mqtt.offline_payload.clone(),
            qos: mqtt.qos,
            auto_reconnect: mqtt.auto_reconnect,
        }
    }
}

enum Delivery {
    Message { topic: String, payload: String },
    Connection(bool),
    Close,
}

struct ActiveSession {
    generation: u64,
    client: Arc<dyn BrokerClient>,
    events_task: JoinHandle<()>,
    /// Set before the online payload is handed to the client
    announced: Arc<AtomicBool>,
}

struct PendingReconnect {
    ticket: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    settings: BrokerSettings,
    options: ConnectOptions,
    reconnect: ReconnectConfig,
    connector: Arc<dyn Connector>,
    registry: ListenerRegistry,
    state_tx: watch::Sender<ConnectionState>,
    session: tokio::sync::Mutex<Option<ActiveSession>>,
    generation: AtomicU64,
    reconnect_ticket: AtomicU64,
    pending_reconnect: Mutex<Option<PendingReconnect>>,
    backoff: Mutex<BackoffState>,
    subscriptions: Mutex<Vec<Subscription>>,
    last_message: Mutex<Option<LastMessage>>,
    delivery_tx: mpsc::UnboundedSender<Delivery>,
    delivery_rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    delivery_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(pending) = lock(&self.pending_reconnect).take() {
            pending.handle.abort();
        }
        if let Some(task) = lock(&self.delivery_task).take() {
            task.abort();
        }
        if let Some(session) = self.session.get_mut().take() {
            session.events_task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resilient broker connection
#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<Inner>,
}

impl BrokerConnection {
    pub fn new(
        config: &RelayConfig,
        connector: Arc<dyn Connector>,
        registry: ListenerRegistry,
    ) -> Result<Self, MqttError> {
        let options = ConnectOptions::from_config(config)?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(Inner {
                settings: BrokerSettings::from_config(config),
                options,
                reconnect: ReconnectConfig::from_config(config),
                connector,
                registry,
                state_tx,
                session: tokio::sync::Mutex::new(None),
                generation: AtomicU64::new(0),
                reconnect_ticket: AtomicU64::new(0),
                pending_reconnect: Mutex::new(None),
                backoff: Mutex::new(BackoffState::default()),
                subscriptions: Mutex::new(Vec::new()),
                last_message: Mutex::new(None),
                delivery_tx,
                delivery_rx: Mutex::new(Some(delivery_rx)),
                delivery_task: Mutex::new(None),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Start the delivery task that runs listener callbacks. Idempotent.
    pub fn start(&self) {
        let Some(mut deliveries) = lock(&self.inner.delivery_rx).take() else {
            debug!("MQTT delivery task already started");
            return;
        };

        let registry = self.inner.registry.clone();
        let task = tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                match delivery {
                    Delivery::Message { topic, payload } => registry.notify(&topic, &payload),
                    Delivery::Connection(connected) => registry.notify_connection(connected),
                    Delivery::Close => break,
                }
            }
            debug!("MQTT delivery task stopped");
        });
        *lock(&self.inner.delivery_task) = Some(task);
    }

    /// Stop for good: disconnect, cancel the reconnect timer and drain the
    /// delivery task. Later `connect()` calls are ignored.
    pub async fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.disconnect().await;

        let _ = self.inner.delivery_tx.send(Delivery::Close);
        let task = lock(&self.inner.delivery_task).take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(DELIVERY_DRAIN_TIMEOUT, task).await.is_err() {
                warn!("MQTT delivery task did not drain in time, aborting");
                abort.abort();
            }
        }
    }

    /// Begin connecting. No-op while connecting or connected, after `stop()`,
    /// or when MQTT is disabled. The outcome is reported asynchronously.
    pub async fn connect(&self) {
        self.connect_inner(None).await;
    }

    async fn connect_inner(&self, reconnect_ticket: Option<u64>) {
        let inner = &self.inner;
        if !inner.settings.enabled {
            info!("MQTT disabled in configuration, not connecting");
            return;
        }

        let generation = {
            let _active = inner.session.lock().await;

            if inner.shutdown.load(Ordering::SeqCst) {
                debug!("Ignoring connect after stop");
                return;
            }
            if let Some(ticket) = reconnect_ticket {
                if inner.reconnect_ticket.load(Ordering::SeqCst) != ticket {
                    debug!("Reconnect superseded before it started");
                    return;
                }
            }

            let started = inner.state_tx.send_if_modified(|state| {
                if *state == ConnectionState::Disconnected {
                    *state = ConnectionState::Connecting;
                    true
                } else {
                    false
                }
            });
            if !started {
                debug!(state = %self.state(), "Ignoring connect, connection already active");
                return;
            }

            inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        metrics().mqtt_connection_attempt();
        info!(
            host = %inner.options.host,
            port = inner.options.port,
            generation,
            "Connecting to MQTT broker"
        );

        match inner.connector.open(&inner.options) {
            Ok(session) => self.install_session(generation, session).await,
            Err(e) => self.handle_session_end(generation, e.to_string()).await,
        }
    }

    async fn install_session(&self, generation: u64, session: BrokerSession) {
        let BrokerSession { client, events } = session;
        let mut active = self.inner.session.lock().await;

        let current = self.inner.generation.load(Ordering::SeqCst) == generation
            && self.state() == ConnectionState::Connecting;
        if !current {
            debug!(generation, "Discarding superseded MQTT session");
            return;
        }

        let events_task = self.spawn_session_events(generation, events);
        let replaced = active.replace(ActiveSession {
            generation,
            client,
            events_task,
            announced: Arc::new(AtomicBool::new(false)),
        });
        if let Some(stale) = replaced {
            warn!(generation = stale.generation, "Replacing a stale MQTT session");
            stale.events_task.abort();
        }
    }

    fn spawn_session_events(
        &self,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        tokio::spawn(
            async move {
                while let Some(event) = events.recv().await {
                    let Some(inner) = weak.upgrade() else { break };
                    let connection = BrokerConnection { inner };

                    match event {
                        SessionEvent::Connected => connection.on_connected(generation).await,
                        SessionEvent::Message { topic, payload, .. } => {
                            connection.on_message(generation, topic, payload)
                        }
                        SessionEvent::ConnectFailed(reason)
                        | SessionEvent::ConnectionLost(reason) => {
                            connection.handle_session_end(generation, reason).await;
                            break;
                        }
                    }
                }
            }
            .instrument(mqtt_span!(generation)),
        )
    }

    async fn session_client(
        &self,
        generation: u64,
    ) -> Option<(Arc<dyn BrokerClient>, Arc<AtomicBool>)> {
        let active = self.inner.session.lock().await;
        active
            .as_ref()
            .filter(|session| session.generation == generation)
            .map(|session| (Arc::clone(&session.client), Arc::clone(&session.announced)))
    }

    async fn current_client(&self) -> Option<Arc<dyn BrokerClient>> {
        let active = self.inner.session.lock().await;
        active.as_ref().map(|session| Arc::clone(&session.client))
    }

    async fn on_connected(&self, generation: u64) {
        let inner = &self.inner;
        let Some((client, announced)) = self.session_client(generation).await else {
            return;
        };

        lock(&inner.backoff).reset();
        self.cancel_pending_reconnect();

        let default_topic = &inner.settings.subscribe_topic;
        if let Err(e) = client.subscribe(default_topic, inner.settings.qos).await {
            warn!(topic = %default_topic, error = %e, "Default subscription failed");
        }
        let registered = lock(&inner.subscriptions).clone();
        for subscription in registered
            .iter()
            .filter(|subscription| &subscription.pattern != default_topic)
        {
            if let Err(e) = client.subscribe(&subscription.pattern, subscription.qos).await {
                warn!(topic = %subscription.pattern, error = %e, "Resubscription failed");
            }
        }

        announced.store(true, Ordering::SeqCst);
        self.publish_availability(client.as_ref(), &inner.settings.online_payload)
            .await;

        let became_connected = {
            let active = inner.session.lock().await;
            let current = active
                .as_ref()
                .is_some_and(|session| session.generation == generation);
            if current {
                let previous = inner.state_tx.send_replace(ConnectionState::Connected);
                HealthMonitor::log_state_transition(previous, ConnectionState::Connected, None);
            }
            current
        };

        if !became_connected {
            return;
        }

        metrics().mqtt_connection_established();
        self.deliver(Delivery::Connection(true));

        // subscribe() calls made while the state was still Connecting were
        // recorded but not issued
        let late: Vec<Subscription> = lock(&inner.subscriptions)
            .iter()
            .filter(|subscription| {
                &subscription.pattern != default_topic && !registered.contains(subscription)
            })
            .cloned()
            .collect();
        for subscription in &late {
            if let Err(e) = client.subscribe(&subscription.pattern, subscription.qos).await {
                warn!(topic = %subscription.pattern, error = %e, "Late subscription failed");
            }
        }
    }

    fn on_message(&self, generation: u64, topic: String, payload: Bytes) {
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        let payload = MessageHandler::payload_text(&payload);
        metrics().mqtt_message_received();
        debug!(topic = %topic, bytes = payload.len(), "MQTT message received");

        *lock(&self.inner.last_message) = Some(LastMessage {
            topic: topic.clone(),
            payload: payload.clone(),
            received_at: Utc::now(),
        });
        self.deliver(Delivery::Message { topic, payload });
    }

    /// A session failed to open or dropped after connecting
    async fn handle_session_end(&self, generation: u64, reason: String) {
        let inner = &self.inner;
        let mut active = inner.session.lock().await;
        if inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        // May be running on the session's own event task, so detach, never abort
        drop(active.take());

        let previous = inner.state_tx.send_replace(ConnectionState::Disconnected);
        let diagnosis = classify_connection_failure(&reason);
        HealthMonitor::log_state_transition(
            previous,
            ConnectionState::Disconnected,
            Some(&diagnosis),
        );

        let backoff = {
            let mut backoff = lock(&inner.backoff);
            backoff.record_failure();
            *backoff
        };

        if previous.is_connected() {
            metrics().mqtt_connection_lost();
            self.deliver(Delivery::Connection(false));
        } else {
            metrics().mqtt_connection_failed();
        }

        match HealthMonitor::should_attempt_reconnection(
            &backoff,
            &inner.reconnect,
            inner.settings.auto_reconnect,
            inner.shutdown.load(Ordering::SeqCst),
        ) {
            ReconnectionDecision::Proceed { attempt, delay } => {
                self.schedule_reconnect(attempt, delay)
            }
            ReconnectionDecision::AbortAutoReconnectDisabled => {
                info!("Auto-reconnect disabled, staying disconnected");
            }
            ReconnectionDecision::AbortShutdownRequested => {
                debug!("Shutdown requested, not reconnecting");
            }
        }
    }

    /// Arm the single reconnect timer, replacing any pending one
    fn schedule_reconnect(&self, attempt: u32, delay: Duration) {
        let ticket = self.inner.reconnect_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(&self.inner);

        let mut pending = lock(&self.inner.pending_reconnect);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            let connection = BrokerConnection { inner };
            connection.release_reconnect_slot(ticket);
            connection.connect_inner(Some(ticket)).await;
        });

        if let Some(replaced) = pending.replace(PendingReconnect { ticket, handle }) {
            debug!(ticket = replaced.ticket, "Replacing pending reconnect");
            replaced.handle.abort();
        }

        metrics().mqtt_reconnect_scheduled();
        info!(
            attempt,
            delay_secs = delay.as_secs_f64(),
            "Scheduling MQTT reconnect"
        );
    }

    fn release_reconnect_slot(&self, ticket: u64) {
        let mut pending = lock(&self.inner.pending_reconnect);
        if pending.as_ref().is_some_and(|p| p.ticket == ticket) {
            pending.take();
        }
    }

    fn cancel_pending_reconnect(&self) {
        if let Some(pending) = lock(&self.inner.pending_reconnect).take() {
            debug!(ticket = pending.ticket, "Cancelling pending reconnect");
            pending.handle.abort();
        }
    }

    /// Explicit, non-retrying disconnect. Publishes the offline payload when
    /// the session was connected.
    pub async fn disconnect(&self) {
        let inner = &self.inner;

        let (session, was_connected, generation) = {
            let mut active = inner.session.lock().await;
            let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            inner.reconnect_ticket.fetch_add(1, Ordering::SeqCst);
            (
                active.take(),
                inner.state_tx.borrow().is_connected(),
                generation,
            )
        };

        self.cancel_pending_reconnect();
        lock(&inner.backoff).reset();

        if let Some(session) = session {
            session.events_task.abort();
            // The online payload may already be out even if CONNACK handling
            // was cut short, and a clean close suppresses the last-will
            if was_connected || session.announced.load(Ordering::SeqCst) {
                self.publish_availability(session.client.as_ref(), &inner.settings.offline_payload)
                    .await;
            }
            if let Err(e) = session.client.disconnect().await {
                debug!(error = %e, "MQTT client reported an error while closing");
            }
        }

        {
            let _active = inner.session.lock().await;
            if inner.generation.load(Ordering::SeqCst) == generation {
                let previous = inner.state_tx.send_replace(ConnectionState::Disconnected);
                if previous != ConnectionState::Disconnected {
                    HealthMonitor::log_state_transition(
                        previous,
                        ConnectionState::Disconnected,
                        None,
                    );
                    metrics().mqtt_disconnected();
                }
            }
        }

        if was_connected {
            self.deliver(Delivery::Connection(false));
        }
    }

    async fn publish_availability(&self, client: &dyn BrokerClient, payload: &str) {
        let settings = &self.inner.settings;
        if settings.availability_topic.is_empty() {
            return;
        }

        match client
            .publish(
                &settings.availability_topic,
                payload.as_bytes().to_vec(),
                settings.qos,
                true,
            )
            .await
        {
            Ok(()) => {
                metrics().mqtt_message_published();
                debug!(topic = %settings.availability_topic, payload, "Availability published");
            }
            Err(e) => {
                metrics().mqtt_publish_failed();
                warn!(error = %e, "Availability publish failed");
            }
        }
    }

    /// Publish while connected. Otherwise the message is logged and dropped.
    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>, retained: bool) {
        let state = self.state();
        let client = if HealthMonitor::can_publish(&state) {
            self.current_client().await
        } else {
            None
        };

        let Some(client) = client else {
            metrics().mqtt_publish_dropped();
            warn!(topic = %topic, state = %state, "MQTT not connected, dropping publish");
            return;
        };

        match client
            .publish(topic, payload.into(), self.inner.settings.qos, retained)
            .await
        {
            Ok(()) => {
                metrics().mqtt_message_published();
                debug!(topic = %topic, retained, "Message published");
            }
            Err(e) => {
                metrics().mqtt_publish_failed();
                warn!(topic = %topic, error = %e, "Publish failed");
            }
        }
    }

    /// Publish to the configured default topic
    pub async fn publish_default(&self, message: &str) {
        let topic = self.inner.settings.publish_topic.clone();
        self.publish(&topic, message, false).await;
    }

    /// Record a subscription and issue it now if connected. It is re-issued
    /// on every reconnect.
    pub async fn subscribe(&self, topic: &str, qos: QosLevel) {
        {
            let mut subscriptions = lock(&self.inner.subscriptions);
            match subscriptions.iter_mut().find(|s| s.pattern == topic) {
                Some(existing) => existing.qos = qos,
                None => subscriptions.push(Subscription {
                    pattern: topic.to_string(),
                    qos,
                }),
            }
        }

        if !self.is_connected() {
            debug!(topic = %topic, "Subscription recorded, will be issued on connect");
            return;
        }
        if let Some(client) = self.current_client().await {
            match client.subscribe(topic, qos).await {
                Ok(()) => debug!(topic = %topic, "Subscribed"),
                Err(e) => warn!(topic = %topic, error = %e, "Subscribe failed"),
            }
        }
    }

    pub async fn unsubscribe(&self, topic: &str) {
        lock(&self.inner.subscriptions).retain(|s| s.pattern != topic);

        if !self.is_connected() {
            return;
        }
        if let Some(client) = self.current_client().await {
            if let Err(e) = client.unsubscribe(topic).await {
                warn!(topic = %topic, error = %e, "Unsubscribe failed");
            }
        }
    }

    /// Subscriptions registered through `subscribe`
    pub fn subscriptions(&self) -> Vec<Subscription> {
        lock(&self.inner.subscriptions).clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Watch connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the state equals `target`; false on timeout
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut receiver = self.state_receiver();
        let reached = matches!(
            tokio::time::timeout(timeout, receiver.wait_for(|state| *state == target)).await,
            Ok(Ok(_))
        );
        reached
    }

    pub fn last_message(&self) -> Option<LastMessage> {
        lock(&self.inner.last_message).clone()
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.inner.registry
    }

    /// Current backoff attempt counter
    pub fn reconnect_attempt(&self) -> u32 {
        lock(&self.inner.backoff).attempt()
    }

    /// True while a reconnect timer is armed
    pub fn has_pending_reconnect(&self) -> bool {
        lock(&self.inner.pending_reconnect).is_some()
    }

    pub fn connect_options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    fn deliver(&self, delivery: Delivery) {
        if self.inner.delivery_tx.send(delivery).is_err() {
            debug!("MQTT delivery task gone, dropping delivery");
        }
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("state", &self.state())
            .field("client_id", &self.inner.options.client_id)
            .finish_non_exhaustive()
    }
}

/// One-shot connection test with a throwaway client id, closed right after
/// the handshake
pub async fn probe_connection(
    connector: &dyn Connector,
    options: &ConnectOptions,
    timeout: Duration,
) -> ProbeOutcome {
    let probe_options = options.for_probe();
    let BrokerSession { client, mut events } = match connector.open(&probe_options) {
        Ok(session) => session,
        Err(e) => return ProbeOutcome::failed(classify_connection_failure(&e.to_string())),
    };

    let handshake = async {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Message { .. } => continue,
                other => return Some(other),
            }
        }
        None
    };

    let outcome = match tokio::time::timeout(timeout, handshake).await {
        Ok(Some(SessionEvent::Connected)) => ProbeOutcome::succeeded(),
        Ok(Some(SessionEvent::ConnectFailed(reason) | SessionEvent::ConnectionLost(reason))) => {
            ProbeOutcome::failed(classify_connection_failure(&reason))
        }
        Ok(_) => ProbeOutcome::failed(classify_connection_failure(
            "session closed before the handshake completed",
        )),
        Err(_) => ProbeOutcome::failed(classify_connection_failure("probe timeout")),
    };

    if outcome.success {
        if let Err(e) = client.disconnect().await {
            debug!(error = %e, "Probe disconnect failed");
        }
    }
    info!(success = outcome.success, message = %outcome.message, "Connection probe finished");
    outcome
}
