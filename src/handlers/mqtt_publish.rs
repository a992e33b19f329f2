//! Broker publish handler
//!
//! The only handler that owns a `BrokerConnection`, which keeps the router
//! itself broker-agnostic. `CommandRouter::broadcast_update` relies on it.

use crate::command::{Command, CommandHandler, CommandResult, MQTT_PUBLISH_ACTION};
use crate::transport::mqtt::{BrokerConnection, MqttError};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Parsed `mqtt_publish` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub message: String,
    pub retain: bool,
}

/// Publishes `{topic, message, retain?}` commands to the broker
pub struct MqttPublishHandler {
    connection: BrokerConnection,
}

impl MqttPublishHandler {
    pub fn new(connection: BrokerConnection) -> Self {
        Self { connection }
    }

    /// Extract the publish request from a command (pure function)
    pub fn parse_request(command: &Command) -> Result<PublishRequest, String> {
        let topic = command
            .get_str("topic")
            .filter(|topic| !topic.is_empty())
            .ok_or_else(|| "Missing 'topic' in MQTT publish command".to_string())?;

        let message = match command.get("message") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) | None => {
                return Err("Missing 'message' in MQTT publish command".to_string())
            }
            Some(other) => other.to_string(),
        };

        Ok(PublishRequest {
            topic: topic.to_string(),
            message,
            retain: command.get_bool("retain").unwrap_or(false),
        })
    }
}

#[async_trait]
impl CommandHandler for MqttPublishHandler {
    fn action_pattern(&self) -> &str {
        "mqtt_.*"
    }

    fn can_handle(&self, command: &Command) -> bool {
        command.action() == MQTT_PUBLISH_ACTION
    }

    async fn handle(&self, command: &Command) -> CommandResult {
        if command.action() != MQTT_PUBLISH_ACTION {
            return CommandResult::error(format!(
                "Unsupported MQTT action: {}",
                command.action()
            ));
        }

        let request = match Self::parse_request(command) {
            Ok(request) => request,
            Err(message) => return CommandResult::error(message),
        };

        let state = self.connection.state();
        if !state.is_connected() {
            return CommandResult::error_with_cause(
                "MQTT service is not connected",
                MqttError::NotConnected { state },
            );
        }

        self.connection
            .publish(&request.topic, request.message, request.retain)
            .await;
        debug!(topic = %request.topic, "Published message");
        CommandResult::success()
    }
}
