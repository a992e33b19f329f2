//! Pure connection state management for the broker connection
//!
//! Connection options, QoS mapping, backoff arithmetic and failure
//! classification. Nothing in here performs I/O.

use crate::config::RelayConfig;
use crate::error::sanitize_error_message;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use url::Url;

/// Connection state, only ever changed by `BrokerConnection`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Broker quality of service level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QosLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(format!("QoS must be 0, 1 or 2, got {other}")),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

impl From<QosLevel> for QoS {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => QoS::AtMostOnce,
            QosLevel::AtLeastOnce => QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Broker transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Publishing to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },
    #[error("Subscription to {topic} failed: {reason}")]
    SubscriptionFailed { topic: String, reason: String },
    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },
}

/// Last-will registered with the broker at connect time
#[derive(Debug, Clone, PartialEq)]
pub struct LastWillOptions {
    pub topic: String,
    pub payload: String,
    pub qos: QosLevel,
}

/// Everything needed to open one broker session
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    pub connection_timeout: Duration,
    pub clean_session: bool,
    pub last_will: Option<LastWillOptions>,
}

impl ConnectOptions {
    /// Build options from the relay configuration, resolving credentials
    /// from the environment
    pub fn from_config(config: &RelayConfig) -> Result<Self, MqttError> {
        let mqtt = &config.mqtt;
        let (host, port, use_tls) = parse_broker_url(&mqtt.broker_url)?;

        let credentials = mqtt
            .username()
            .map(|username| (username, mqtt.password().unwrap_or_default()));

        let last_will = (!mqtt.availability_topic.is_empty()).then(|| LastWillOptions {
            topic: mqtt.availability_topic.clone(),
            payload: mqtt.offline_payload.clone(),
            qos: mqtt.qos,
        });

        Ok(Self {
            host,
            port,
            use_tls,
            client_id: config.client_id(),
            credentials,
            keep_alive: Duration::from_secs(mqtt.keep_alive_secs),
            connection_timeout: Duration::from_secs(mqtt.connection_timeout_secs),
            clean_session: mqtt.clean_session,
            last_will,
        })
    }

    /// Options for a throwaway diagnostic session that must not collide with
    /// the live client id or trigger its last-will
    pub fn for_probe(&self) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or(0);

        Self {
            client_id: format!("{}_test_{millis}", self.client_id),
            last_will: None,
            ..self.clone()
        }
    }
}

/// Split a `mqtt://` or `mqtts://` URL into host, port and TLS flag
pub fn parse_broker_url(broker_url: &str) -> Result<(String, u16, bool), MqttError> {
    let url =
        Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

    let use_tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(MqttError::InvalidBrokerUrl(broker_url.to_string())),
    };

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;
    let port = url.port().unwrap_or(if use_tls { 8883 } else { 1883 });

    Ok((host.to_string(), port, use_tls))
}

/// Translate connect options into rumqttc options
pub fn configure_mqtt_options(options: &ConnectOptions) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);

    if options.use_tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some((username, password)) = &options.credentials {
        mqtt_options.set_credentials(username, password);
    }

    // rumqttc rejects keep-alive intervals below one second
    mqtt_options.set_keep_alive(options.keep_alive.max(Duration::from_secs(1)));
    mqtt_options.set_clean_start(options.clean_session);
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    if let Some(will) = &options.last_will {
        let lwt = LastWill::new(&will.topic, will.payload.clone(), will.qos.into(), true, None);
        mqtt_options.set_last_will(lwt);
    }

    mqtt_options
}

/// Capped exponential backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub base_interval_secs: u64,
    pub max_interval_secs: u64,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: 2,
            max_interval_secs: 300,
            multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    pub fn from_config(config: &RelayConfig) -> Self {
        let reconnect = &config.mqtt.reconnect;
        Self {
            base_interval_secs: reconnect.base_interval_secs,
            max_interval_secs: reconnect.max_interval_secs,
            multiplier: reconnect.multiplier,
        }
    }

    /// `min(base * multiplier^(attempt - 1), max)`, with attempt 0 treated as 1
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(i32::MAX as u32) as i32;
        let max = self.max_interval_secs as f64;
        let raw = self.base_interval_secs as f64 * self.multiplier.powi(exponent);

        let secs = if raw.is_finite() { raw.min(max) } else { max };
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Human-readable diagnosis of a connection failure.
///
/// Best-effort text for operators; never branch on the result.
pub fn classify_connection_failure(reason: &str) -> String {
    let lowered = reason.to_lowercase();

    // rumqttc reports broker auth rejections as "Connection refused, return code: ..."
    if lowered.contains("not authorized") || lowered.contains("notauthorized") {
        "Not authorized - check credentials".to_string()
    } else if lowered.contains("authentication") || lowered.contains("badusernamepassword") {
        "Authentication failed - check username and password".to_string()
    } else if lowered.contains("connection refused") {
        "Connection refused - check server address and port".to_string()
    } else if lowered.contains("timeout") || lowered.contains("timed out") {
        "Connection timeout - server may be unreachable".to_string()
    } else {
        format!("Connection failed: {}", sanitize_error_message(reason))
    }
}
