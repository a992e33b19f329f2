//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.

use notify_relay::config::{ConfigError, RelayConfig};
use notify_relay::transport::mqtt::{ConnectOptions, QosLevel, ReconnectConfig};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[relay]
id = "living-room"
description = "Living room display"

[mqtt]
broker_url = "mqtt://broker.local:1884"
"#,
    );

    let config = RelayConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.relay.id, "living-room");
    assert_eq!(config.relay.description, "Living room display");
    assert_eq!(config.mqtt.broker_url, "mqtt://broker.local:1884");
    assert_eq!(config.mqtt.subscribe_topic, "command/#");
    assert_eq!(config.mqtt.availability_topic, "yan/availability");
    assert_eq!(config.router.status_prefix, "yan/status");
    assert!(config.endpoint.enabled);
    assert_eq!(config.client_id(), "relay-living-room");
}

#[test]
fn test_config_loads_with_optional_fields() {
    let temp_file = write_config(
        r#"
[relay]
id = "kitchen"

[mqtt]
broker_url = "mqtts://broker.example.com"
client_id = "kitchen-panel"
username_env = "RELAY_TEST_UNSET_USER"
password_env = "RELAY_TEST_UNSET_PASS"
qos = 1
keep_alive_secs = 15
auto_reconnect = false

[mqtt.reconnect]
base_interval_secs = 2
max_interval_secs = 60
multiplier = 2.0

[router]
status_prefix = "kitchen/status"

[endpoint]
enabled = false
port = 9090
"#,
    );

    let config = RelayConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.qos, QosLevel::AtLeastOnce);
    assert!(!config.mqtt.auto_reconnect);
    assert_eq!(config.client_id(), "kitchen-panel");
    assert_eq!(config.mqtt.username(), None);
    assert!(!config.endpoint.enabled);
    assert_eq!(config.endpoint.port, 9090);

    let options = ConnectOptions::from_config(&config).unwrap();
    assert_eq!(options.host, "broker.example.com");
    assert_eq!(options.port, 8883);
    assert!(options.use_tls);
    assert_eq!(options.keep_alive, Duration::from_secs(15));
    assert!(options.credentials.is_none());

    let reconnect = ReconnectConfig::from_config(&config);
    let delays: Vec<u64> = (1..=7)
        .map(|attempt| reconnect.delay_for_attempt(attempt).as_secs())
        .collect();
    assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60]);
}

#[test]
fn test_last_will_uses_availability_topic() {
    let config = RelayConfig::from_toml_str(
        r#"
[relay]
id = "hall"

[mqtt]
broker_url = "mqtt://localhost"
availability_topic = "hall/availability"
offline_payload = "gone"
"#,
    )
    .unwrap();

    let options = ConnectOptions::from_config(&config).unwrap();
    let will = options.last_will.expect("last-will should be configured");
    assert_eq!(will.topic, "hall/availability");
    assert_eq!(will.payload, "gone");
}

#[test]
fn test_config_missing_file_is_a_read_error() {
    let result = RelayConfig::load_from_file(std::path::Path::new("/nonexistent/relay.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_malformed_toml_is_a_parse_error() {
    let temp_file = write_config("[relay\nid = ");
    let result = RelayConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_missing_required_section() {
    let temp_file = write_config(
        r#"
[relay]
id = "no-mqtt"
"#,
    );
    assert!(RelayConfig::load_from_file(temp_file.path()).is_err());
}

#[test]
fn test_config_rejects_invalid_relay_id() {
    let result = RelayConfig::from_toml_str(
        r#"
[relay]
id = "bad id!"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
    );
    assert!(matches!(result, Err(ConfigError::InvalidRelayId(_))));
}

#[test]
fn test_config_rejects_wildcard_status_prefix() {
    let result = RelayConfig::from_toml_str(
        r#"
[relay]
id = "r"

[mqtt]
broker_url = "mqtt://localhost:1883"

[router]
status_prefix = "yan/+/status"
"#,
    );
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_unsupported_broker_scheme_fails_at_connect_options() {
    let config = RelayConfig::from_toml_str(
        r#"
[relay]
id = "r"

[mqtt]
broker_url = "http://localhost:1883"
"#,
    )
    .unwrap();

    assert!(ConnectOptions::from_config(&config).is_err());
}
