//! Broker transport abstraction
//!
//! `BrokerConnection` never talks to rumqttc directly. It asks a
//! [`Connector`] for a [`BrokerSession`]: a client handle for outbound
//! operations plus a channel of [`SessionEvent`]s produced by whatever drives
//! the network I/O. Tests substitute the in-memory connector from
//! `testing::mocks`.

use crate::transport::mqtt::{ConnectOptions, MqttError, QosLevel};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod mqtt;

/// Outbound operations on one live broker session
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), MqttError>;

    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), MqttError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError>;

    /// Graceful close; the broker discards the last-will
    async fn disconnect(&self) -> Result<(), MqttError>;
}

/// Opens broker sessions
pub trait Connector: Send + Sync {
    /// Start a session. Returns immediately; the outcome of the handshake
    /// arrives as the first [`SessionEvent`].
    fn open(&self, options: &ConnectOptions) -> Result<BrokerSession, MqttError>;
}

/// Asynchronous notifications from a session's I/O driver.
///
/// A session emits at most one of `ConnectFailed` / `ConnectionLost` and
/// nothing after it.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    ConnectFailed(String),
    ConnectionLost(String),
    Message {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
}

/// A freshly opened session
pub struct BrokerSession {
    pub client: Arc<dyn BrokerClient>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession").finish_non_exhaustive()
    }
}
