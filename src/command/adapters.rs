//! Source adapters: normalize raw input from each ingress into a [`Command`]

use super::model::{Command, CommandError, CommandSource, Payload};
use serde_json::Value;
use std::collections::BTreeMap;

/// Payload key holding unparseable input
pub const RAW_MESSAGE_KEY: &str = "rawMessage";

/// Payload key holding endpoint request headers
pub const HEADERS_KEY: &str = "_headers";

/// Parse a JSON object; anything else is `None`
fn parse_object(raw: &str) -> Option<Payload> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn raw_message(raw: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert(RAW_MESSAGE_KEY.to_string(), Value::String(raw.to_string()));
    payload
}

/// Inbound broker messages
pub struct BrokerAdapter;

impl BrokerAdapter {
    /// `root/show_notification/x` -> `show_notification`; topics with fewer
    /// than three levels are used whole
    pub fn action_for_topic(topic: &str) -> &str {
        let segments: Vec<&str> = topic.split('/').collect();
        if segments.len() >= 3 {
            segments[1]
        } else {
            topic
        }
    }

    pub fn normalize(topic: &str, payload: &[u8]) -> Result<Command, CommandError> {
        let text = String::from_utf8_lossy(payload);
        let payload = parse_object(&text).unwrap_or_else(|| raw_message(&text));
        Command::new(CommandSource::Broker, Self::action_for_topic(topic), payload)
    }
}

/// Calls from in-process collaborators that already hold structured data
pub struct StructuredCallAdapter;

impl StructuredCallAdapter {
    pub fn normalize(action: &str, payload: Payload) -> Result<Command, CommandError> {
        Command::new(CommandSource::StructuredCall, action, payload)
    }

    pub fn internal(action: &str, payload: Payload) -> Result<Command, CommandError> {
        Command::new(CommandSource::Internal, action, payload)
    }
}

/// HTTP-style endpoint requests
pub struct EndpointAdapter;

impl EndpointAdapter {
    /// `/notifications/show/` -> `notifications_show`
    pub fn action_for_path(path: &str) -> String {
        path.trim_matches('/').replace('/', "_").to_lowercase()
    }

    pub fn normalize(
        path: &str,
        body: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Command, CommandError> {
        let headers_value = || {
            Value::Object(
                headers
                    .iter()
                    .map(|(name, value)| (name.clone(), Value::String(value.clone())))
                    .collect(),
            )
        };

        let payload = match parse_object(body) {
            Some(mut payload) => {
                if !headers.is_empty() {
                    payload.insert(HEADERS_KEY.to_string(), headers_value());
                }
                payload
            }
            None => {
                let mut payload = raw_message(body);
                payload.insert(HEADERS_KEY.to_string(), headers_value());
                payload
            }
        };

        Command::new(CommandSource::Endpoint, Self::action_for_path(path), payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_broker_action_extraction() {
        assert_eq!(
            BrokerAdapter::action_for_topic("root/show_notification/x"),
            "show_notification"
        );
        assert_eq!(BrokerAdapter::action_for_topic("a/b/c/d"), "b");
        assert_eq!(BrokerAdapter::action_for_topic("root/ping"), "root/ping");
        assert_eq!(BrokerAdapter::action_for_topic("ping"), "ping");
    }

    #[test]
    fn test_broker_json_payload() {
        let command =
            BrokerAdapter::normalize("yan/show/now", br#"{"title":"hello","n":3}"#).unwrap();
        assert_eq!(command.source(), CommandSource::Broker);
        assert_eq!(command.action(), "show");
        assert_eq!(command.get_str("title"), Some("hello"));
        assert_eq!(command.get("n"), Some(&json!(3)));
    }

    #[test]
    fn test_broker_unparseable_payload_is_wrapped() {
        let command = BrokerAdapter::normalize("yan/show/now", b"not json").unwrap();
        assert_eq!(command.get_str(RAW_MESSAGE_KEY), Some("not json"));
        assert_eq!(command.payload().len(), 1);

        let array = BrokerAdapter::normalize("yan/show/now", b"[1,2]").unwrap();
        assert_eq!(array.get_str(RAW_MESSAGE_KEY), Some("[1,2]"));
    }

    #[test]
    fn test_broker_empty_topic_is_rejected() {
        assert_eq!(
            BrokerAdapter::normalize("", b"{}").unwrap_err(),
            CommandError::EmptyAction
        );
    }

    #[test]
    fn test_endpoint_action_from_path() {
        assert_eq!(
            EndpointAdapter::action_for_path("/Notifications/Show/"),
            "notifications_show"
        );
        assert_eq!(EndpointAdapter::action_for_path("status"), "status");
    }

    #[test]
    fn test_endpoint_headers_added_when_present() {
        let mut headers = BTreeMap::new();
        headers.insert("x-source".to_string(), "panel".to_string());

        let command =
            EndpointAdapter::normalize("/notifications/show", r#"{"title":"t"}"#, &headers)
                .unwrap();
        assert_eq!(command.source(), CommandSource::Endpoint);
        assert_eq!(command.get_str("title"), Some("t"));
        assert_eq!(command.get(HEADERS_KEY), Some(&json!({"x-source": "panel"})));

        let bare = EndpointAdapter::normalize("/x", r#"{"a":1}"#, &BTreeMap::new()).unwrap();
        assert!(bare.get(HEADERS_KEY).is_none());
    }

    #[test]
    fn test_endpoint_unparseable_body_always_carries_headers() {
        let command = EndpointAdapter::normalize("/x", "plain text", &BTreeMap::new()).unwrap();
        assert_eq!(command.get_str(RAW_MESSAGE_KEY), Some("plain text"));
        assert_eq!(command.get(HEADERS_KEY), Some(&json!({})));
    }

    #[test]
    fn test_structured_call_sources() {
        let call = StructuredCallAdapter::normalize("log_event", Payload::new()).unwrap();
        assert_eq!(call.source(), CommandSource::StructuredCall);

        let internal = StructuredCallAdapter::internal("mqtt_publish", Payload::new()).unwrap();
        assert_eq!(internal.source(), CommandSource::Internal);
    }
}
