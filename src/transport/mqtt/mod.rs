//! MQTT broker connectivity
//!
//! Pure modules hold the decisions, impure modules do the I/O:
//!
//! - [`topic`] - wildcard topic matching
//! - [`connection`] - connection options, QoS, backoff arithmetic, failure text
//! - [`health_monitor`] - backoff counter and reconnect decisions
//! - [`message_handler`] - rumqttc event routing
//! - [`listeners`] - listener registry and fan-out
//! - [`client`] - rumqttc-backed [`Connector`](crate::transport::Connector)
//! - [`broker`] - `BrokerConnection` lifecycle, reconnect scheduling, availability
//!
//! # Usage
//!
//! ```rust,no_run
//! use notify_relay::config::RelayConfig;
//! use notify_relay::transport::mqtt::{BrokerConnection, ListenerRegistry, RumqttcConnector};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = RelayConfig::load_default()?;
//! let registry = ListenerRegistry::new();
//! registry.add_listener(
//!     "command/#",
//!     Arc::new(|topic: &str, payload: &str| println!("{topic}: {payload}")),
//! );
//!
//! let connection = BrokerConnection::new(&config, Arc::new(RumqttcConnector::new()), registry)?;
//! connection.start();
//! connection.connect().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod broker;
pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod listeners;
pub mod message_handler;
pub mod topic;

pub use broker::{probe_connection, BrokerConnection, LastMessage, ProbeOutcome};
pub use client::{RumqttcClient, RumqttcConnector};
pub use connection::{
    classify_connection_failure, configure_mqtt_options, ConnectOptions, ConnectionState,
    LastWillOptions, MqttError, QosLevel, ReconnectConfig,
};
pub use health_monitor::{BackoffState, HealthMonitor, ReconnectionDecision};
pub use listeners::{ConnectionListener, ListenerRegistry, MessageListener};
pub use message_handler::{EventRoute, MessageHandler};
pub use topic::TopicMatcher;
