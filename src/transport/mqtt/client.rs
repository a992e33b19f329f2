//! rumqttc-backed broker sessions (impure I/O)
//!
//! Each [`RumqttcConnector::open`] creates a fresh `AsyncClient` and spawns
//! a pump task that polls its event loop, translating rumqttc events into
//! [`SessionEvent`]s. The pump stops at the first connection error: retrying
//! is `BrokerConnection`'s job, never rumqttc's internal reconnect.

use super::connection::{configure_mqtt_options, ConnectOptions, MqttError, QosLevel};
use super::message_handler::{EventRoute, MessageHandler};
use crate::transport::{BrokerClient, BrokerSession, Connector, SessionEvent};
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Capacity of rumqttc's outbound request queue
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long a graceful disconnect waits for the pump to flush
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Opens sessions against a real broker
#[derive(Debug, Default, Clone)]
pub struct RumqttcConnector;

impl RumqttcConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for RumqttcConnector {
    fn open(&self, options: &ConnectOptions) -> Result<BrokerSession, MqttError> {
        let mqtt_options = configure_mqtt_options(options);
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!(
            host = %options.host,
            port = options.port,
            client_id = %options.client_id,
            "Opening MQTT session"
        );

        let pump = tokio::spawn(pump_events(event_loop, events_tx, options.connection_timeout));

        Ok(BrokerSession {
            client: Arc::new(RumqttcClient {
                client,
                pump: Mutex::new(Some(pump)),
            }),
            events: events_rx,
        })
    }
}

/// Poll the event loop until the session ends.
///
/// The handshake must complete within `connect_timeout`; afterwards the pump
/// runs until the broker or network drops the session, or the receiver goes
/// away.
async fn pump_events(
    mut event_loop: EventLoop,
    events: mpsc::UnboundedSender<SessionEvent>,
    connect_timeout: Duration,
) {
    let deadline = Instant::now() + connect_timeout;
    let mut connected = false;

    loop {
        let polled = if connected {
            Ok(event_loop.poll().await)
        } else {
            tokio::time::timeout_at(deadline, event_loop.poll()).await
        };

        let event = match polled {
            Err(_elapsed) => {
                let reason = format!("Connection timeout after {}s", connect_timeout.as_secs());
                let _ = events.send(SessionEvent::ConnectFailed(reason));
                break;
            }
            Ok(Err(e)) => {
                let reason = e.to_string();
                let terminal = if connected {
                    SessionEvent::ConnectionLost(reason)
                } else {
                    SessionEvent::ConnectFailed(reason)
                };
                let _ = events.send(terminal);
                break;
            }
            Ok(Ok(event)) => event,
        };

        let forwarded = match MessageHandler::route_mqtt_event(&event) {
            EventRoute::ConnectionAcknowledged => {
                connected = true;
                events.send(SessionEvent::Connected)
            }
            EventRoute::ConnectionRejected(code) => {
                let _ = events.send(SessionEvent::ConnectFailed(format!(
                    "Connection refused, return code: {code}"
                )));
                break;
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => events.send(SessionEvent::Message {
                topic,
                payload,
                retain,
            }),
            EventRoute::Disconnected(reason) => {
                let _ = events.send(SessionEvent::ConnectionLost(format!(
                    "Broker sent disconnect: {reason}"
                )));
                break;
            }
            EventRoute::SubscriptionAcknowledged {
                packet_id,
                failures,
            } => {
                if failures > 0 {
                    warn!(packet_id, failures, "Broker rejected subscription");
                } else {
                    debug!(packet_id, "Subscription acknowledged");
                }
                Ok(())
            }
            EventRoute::InfrastructureEvent(description) => {
                trace!(event = %description, "MQTT event");
                Ok(())
            }
            EventRoute::OutgoingEvent => Ok(()),
        };

        if forwarded.is_err() {
            debug!("Session receiver dropped, stopping MQTT pump");
            break;
        }
    }
}

/// Client handle for one rumqttc session
pub struct RumqttcClient {
    client: AsyncClient,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttcClient {
    fn take_pump(&self) -> Option<JoinHandle<()>> {
        self.pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[async_trait::async_trait]
impl BrokerClient for RumqttcClient {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.client
            .publish(topic, qos.into(), retain, payload)
            .await
            .map_err(|e| MqttError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), MqttError> {
        self.client
            .subscribe(topic, qos.into())
            .await
            .map_err(|e| MqttError::SubscriptionFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| MqttError::SubscriptionFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| MqttError::DisconnectFailed(e.to_string()));

        // Let the pump flush queued packets (offline status, DISCONNECT)
        if let Some(pump) = self.take_pump() {
            let abort = pump.abort_handle();
            if tokio::time::timeout(DISCONNECT_GRACE, pump).await.is_err() {
                warn!("MQTT pump did not stop after disconnect, aborting");
                abort.abort();
            }
        }

        result
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(pump) = self.take_pump() {
            pump.abort();
        }
    }
}
