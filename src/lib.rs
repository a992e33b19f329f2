//! notify-relay
//!
//! Resilient MQTT connectivity and multi-source command routing.
//!
//! # Overview
//!
//! - [`transport::mqtt`]: topic matching, listener registry, and
//!   [`BrokerConnection`] with capped exponential reconnect backoff and
//!   retained availability publishing
//! - [`command`]: the [`Command`]/[`CommandResult`] model, [`CommandRouter`]
//!   and the broker, structured-call and endpoint adapters
//! - [`handlers`]: built-in handlers
//! - [`endpoint`]: HTTP ingress and probes
//! - [`service`]: [`RelayService`], which wires everything together
//!
//! # Quick Start
//!
//! ```rust
//! use notify_relay::command::{BrokerAdapter, CommandSource};
//! use notify_relay::transport::mqtt::TopicMatcher;
//!
//! assert!(TopicMatcher::matches("yan/show_notification/tv", "yan/+/tv"));
//!
//! let command = BrokerAdapter::normalize(
//!     "yan/show_notification/tv",
//!     br#"{"title": "Doorbell"}"#,
//! )
//! .unwrap();
//! assert_eq!(command.source(), CommandSource::Broker);
//! assert_eq!(command.action(), "show_notification");
//! assert_eq!(command.get_str("title"), Some("Doorbell"));
//! ```

pub mod command;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod handlers;
pub mod observability;
pub mod service;
pub mod testing;
pub mod transport;

pub use command::{Command, CommandHandler, CommandResult, CommandRouter, CommandSource};
pub use config::*;
pub use error::{RelayError, RelayResult};
pub use service::RelayService;
pub use transport::mqtt::{BrokerConnection, ListenerRegistry, TopicMatcher};
