//! Relay configuration
//!
//! Loaded from a TOML file. Broker credentials are never stored in the file;
//! the `[mqtt]` section names the environment variables that hold them.

use crate::transport::mqtt::{QosLevel, TopicMatcher};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Default locations searched when no config path is given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["relay.toml", "config/relay.toml"];

/// Main relay configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    pub relay: RelaySection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub endpoint: EndpointSection,
}

/// Identity of this relay instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaySection {
    /// Relay identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    #[serde(default)]
    pub description: String,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// When false, `connect()` is a no-op
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Broker URL, `mqtt://host:port` or `mqtts://host:port`
    pub broker_url: String,
    /// Client identifier; generated from the relay id when absent
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Default subscription, re-issued on every successful connect
    #[serde(default = "default_subscribe_topic")]
    pub subscribe_topic: String,
    /// Target of `publish_default`
    #[serde(default = "default_publish_topic")]
    pub publish_topic: String,
    /// Retained online/offline topic; empty disables availability publishing
    #[serde(default = "default_availability_topic")]
    pub availability_topic: String,
    #[serde(default = "default_online_payload")]
    pub online_payload: String,
    #[serde(default = "default_offline_payload")]
    pub offline_payload: String,
    #[serde(default)]
    pub qos: QosLevel,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Capped exponential backoff for reconnect attempts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_base_interval")]
    pub base_interval_secs: u64,
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_interval_secs: default_base_interval(),
            max_interval_secs: default_max_interval(),
            multiplier: default_multiplier(),
        }
    }
}

/// Command router settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterSection {
    /// Prefix for `broadcast_update` topics
    #[serde(default = "default_status_prefix")]
    pub status_prefix: String,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            status_prefix: default_status_prefix(),
        }
    }
}

/// HTTP endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_endpoint_port")]
    pub port: u16,
}

impl Default for EndpointSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_endpoint_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_subscribe_topic() -> String {
    "command/#".to_string()
}

fn default_publish_topic() -> String {
    "yan/status".to_string()
}

fn default_availability_topic() -> String {
    "yan/availability".to_string()
}

fn default_online_payload() -> String {
    "online".to_string()
}

fn default_offline_payload() -> String {
    "offline".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_base_interval() -> u64 {
    2
}

fn default_max_interval() -> u64 {
    300
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_status_prefix() -> String {
    "yan/status".to_string()
}

fn default_endpoint_port() -> u16 {
    8080
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid relay ID format: {0}")]
    InvalidRelayId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("No configuration file found (searched {0})")]
    NotFound(String),
}

impl RelayConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the first existing default location
    pub fn load_default() -> Result<Self, ConfigError> {
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(Self::load_from_file)
            .unwrap_or_else(|| Err(ConfigError::NotFound(DEFAULT_CONFIG_PATHS.join(", "))))
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_relay_id(&self.relay.id)?;
        self.mqtt.validate()?;

        if self.router.status_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "router.status_prefix must not be empty".to_string(),
            ));
        }
        if TopicMatcher::is_wildcard(&self.router.status_prefix) {
            return Err(ConfigError::InvalidConfig(
                "router.status_prefix must not contain wildcards".to_string(),
            ));
        }
        Ok(())
    }

    /// Client id used for the broker session
    pub fn client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("relay-{}", self.relay.id))
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[relay]
id = "test-relay"
description = "A test relay"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

impl MqttSection {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.subscribe_topic.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.subscribe_topic must not be empty".to_string(),
            ));
        }
        for (name, topic) in [
            ("mqtt.publish_topic", &self.publish_topic),
            ("mqtt.availability_topic", &self.availability_topic),
        ] {
            if TopicMatcher::is_wildcard(topic) {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must not contain wildcards: {topic}"
                )));
            }
        }
        if self.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.keep_alive_secs must be greater than 0".to_string(),
            ));
        }
        if self.connection_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.connection_timeout_secs must be greater than 0".to_string(),
            ));
        }
        self.reconnect.validate()
    }

    /// Get username from the configured environment variable
    pub fn username(&self) -> Option<String> {
        env_var_optional(self.username_env.as_deref())
    }

    /// Get password from the configured environment variable
    pub fn password(&self) -> Option<String> {
        env_var_optional(self.password_env.as_deref())
    }
}

impl ReconnectSection {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.base_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect.base_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.max_interval_secs < self.base_interval_secs {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.reconnect.max_interval_secs ({}) must be >= base_interval_secs ({})",
                self.max_interval_secs, self.base_interval_secs
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.reconnect.multiplier must be a finite value >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}

fn env_var_optional(name: Option<&str>) -> Option<String> {
    name.and_then(|name| std::env::var(name).ok())
}

/// Validate relay ID format
fn validate_relay_id(relay_id: &str) -> Result<(), ConfigError> {
    let valid_chars = relay_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if relay_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidRelayId(format!(
            "Relay ID '{relay_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config = RelayConfig::test_config();

        assert_eq!(config.relay.id, "test-relay");
        assert!(config.mqtt.enabled);
        assert_eq!(config.mqtt.subscribe_topic, "command/#");
        assert_eq!(config.mqtt.availability_topic, "yan/availability");
        assert_eq!(config.mqtt.online_payload, "online");
        assert_eq!(config.mqtt.offline_payload, "offline");
        assert_eq!(config.mqtt.qos, QosLevel::AtMostOnce);
        assert!(config.mqtt.auto_reconnect);
        assert_eq!(config.mqtt.reconnect, ReconnectSection::default());
        assert_eq!(config.router.status_prefix, "yan/status");
        assert_eq!(config.endpoint.port, 8080);
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[relay]
id = "living-room"
description = "Living room display"

[mqtt]
broker_url = "mqtts://broker.example.com"
client_id = "living-room-tv"
username_env = "RELAY_MQTT_USER"
password_env = "RELAY_MQTT_PASS"
subscribe_topic = "home/tv/#"
availability_topic = "home/tv/availability"
qos = 1
keep_alive_secs = 30
clean_session = false
auto_reconnect = false

[mqtt.reconnect]
base_interval_secs = 2
max_interval_secs = 60
multiplier = 2.0

[router]
status_prefix = "home/tv/status"

[endpoint]
enabled = false
port = 9090
"#;

        let config = RelayConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.client_id(), "living-room-tv");
        assert_eq!(config.mqtt.qos, QosLevel::AtLeastOnce);
        assert!(!config.mqtt.clean_session);
        assert!(!config.mqtt.auto_reconnect);
        assert_eq!(config.mqtt.reconnect.max_interval_secs, 60);
        assert_eq!(config.router.status_prefix, "home/tv/status");
        assert!(!config.endpoint.enabled);
    }

    #[test]
    fn test_generated_client_id() {
        let config = RelayConfig::test_config();
        assert_eq!(config.client_id(), "relay-test-relay");
    }

    #[test]
    fn test_invalid_relay_id() {
        assert!(validate_relay_id("invalid@relay").is_err());
        assert!(validate_relay_id("").is_err());
        assert!(validate_relay_id("valid-relay_123.test").is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_qos() {
        let toml_content = r#"
[relay]
id = "r"

[mqtt]
broker_url = "mqtt://localhost:1883"
qos = 3
"#;
        assert!(matches!(
            RelayConfig::from_toml_str(toml_content),
            Err(ConfigError::TomlParse(_))
        ));
    }

    #[test]
    fn test_rejects_wildcard_availability_topic() {
        let toml_content = r#"
[relay]
id = "r"

[mqtt]
broker_url = "mqtt://localhost:1883"
availability_topic = "yan/+/availability"
"#;
        assert!(matches!(
            RelayConfig::from_toml_str(toml_content),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_inverted_backoff_bounds() {
        let toml_content = r#"
[relay]
id = "r"

[mqtt]
broker_url = "mqtt://localhost:1883"

[mqtt.reconnect]
base_interval_secs = 120
max_interval_secs = 60
"#;
        assert!(matches!(
            RelayConfig::from_toml_str(toml_content),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_shrinking_multiplier() {
        let toml_content = r#"
[relay]
id = "r"

[mqtt]
broker_url = "mqtt://localhost:1883"

[mqtt.reconnect]
multiplier = 0.5
"#;
        assert!(RelayConfig::from_toml_str(toml_content).is_err());
    }
}
