//! Command and CommandResult value types

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Ordered string-keyed payload
pub type Payload = Map<String, Value>;

/// Where a command came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    Broker,
    StructuredCall,
    Endpoint,
    Internal,
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandSource::Broker => "broker",
            CommandSource::StructuredCall => "structured_call",
            CommandSource::Endpoint => "endpoint",
            CommandSource::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Command action must not be empty")]
    EmptyAction,

    #[error("Command router is stopped")]
    RouterStopped,
}

/// Normalized intent from any source. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Command {
    id: Uuid,
    source: CommandSource,
    action: String,
    payload: Arc<Payload>,
    received_at: DateTime<Utc>,
}

impl Command {
    pub fn new(
        source: CommandSource,
        action: impl Into<String>,
        payload: Payload,
    ) -> Result<Self, CommandError> {
        let action = action.into();
        if action.trim().is_empty() {
            return Err(CommandError::EmptyAction);
        }

        Ok(Self {
            id: Uuid::new_v4(),
            source,
            action,
            payload: Arc::new(payload),
            received_at: Utc::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> CommandSource {
        self.source
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(Value::as_bool)
    }

    /// Derive a new command from the same source with a different action and
    /// payload. The original is left untouched.
    pub fn derive(&self, action: impl Into<String>, payload: Payload) -> Result<Self, CommandError> {
        Self::new(self.source, action, payload)
    }
}

type Cause = Arc<dyn std::error::Error + Send + Sync>;

/// Outcome of one handler invocation
#[derive(Debug, Clone)]
pub enum CommandResult {
    Success(Option<Value>),
    Error {
        message: String,
        cause: Option<Cause>,
    },
}

impl CommandResult {
    pub fn success() -> Self {
        Self::Success(None)
    }

    pub fn success_with(data: Value) -> Self {
        Self::Success(Some(data))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            cause: None,
        }
    }

    pub fn error_with_cause<E>(message: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Error {
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Success(data) => data.as_ref(),
            Self::Error { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::Error { message, .. } => Some(message),
        }
    }

    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync)> {
        match self {
            Self::Error {
                cause: Some(cause), ..
            } => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(None) => f.write_str("success"),
            Self::Success(Some(data)) => write!(f, "success: {data}"),
            Self::Error {
                message,
                cause: Some(cause),
            } => write!(f, "error: {message} ({cause})"),
            Self::Error { message, .. } => write!(f, "error: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("test payload must be an object"),
        }
    }

    #[test]
    fn test_empty_action_is_rejected() {
        assert_eq!(
            Command::new(CommandSource::Internal, "", Payload::new()).unwrap_err(),
            CommandError::EmptyAction
        );
        assert_eq!(
            Command::new(CommandSource::Internal, "   ", Payload::new()).unwrap_err(),
            CommandError::EmptyAction
        );
    }

    #[test]
    fn test_accessors() {
        let command = Command::new(
            CommandSource::Broker,
            "show_notification",
            payload(json!({"title": "hi", "sticky": true})),
        )
        .unwrap();

        assert_eq!(command.action(), "show_notification");
        assert_eq!(command.source(), CommandSource::Broker);
        assert_eq!(command.get_str("title"), Some("hi"));
        assert_eq!(command.get_bool("sticky"), Some(true));
        assert_eq!(command.get_str("sticky"), None);
        assert!(command.get("missing").is_none());
    }

    #[test]
    fn test_payload_keeps_insertion_order() {
        let command = Command::new(
            CommandSource::Internal,
            "ordered",
            payload(json!({"z": 1, "a": 2, "m": 3})),
        )
        .unwrap();

        let keys: Vec<&str> = command.payload().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_derive_leaves_original_untouched() {
        let original =
            Command::new(CommandSource::Endpoint, "first", payload(json!({"a": 1}))).unwrap();
        let derived = original
            .derive("second", payload(json!({"b": 2})))
            .unwrap();

        assert_eq!(original.action(), "first");
        assert_eq!(original.get("a"), Some(&json!(1)));
        assert_eq!(derived.source(), CommandSource::Endpoint);
        assert_ne!(derived.id(), original.id());
    }

    #[test]
    fn test_clones_share_payload() {
        let command =
            Command::new(CommandSource::Internal, "x", payload(json!({"k": "v"}))).unwrap();
        let clone = command.clone();
        assert!(std::ptr::eq(command.payload(), clone.payload()));
        assert_eq!(clone.id(), command.id());
    }

    #[test]
    fn test_result_helpers() {
        let ok = CommandResult::success_with(json!({"n": 1}));
        assert!(ok.is_success());
        assert_eq!(ok.data(), Some(&json!({"n": 1})));
        assert_eq!(ok.to_string(), r#"success: {"n":1}"#);

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = CommandResult::error_with_cause("write failed", io);
        assert!(err.is_error());
        assert_eq!(err.error_message(), Some("write failed"));
        assert_eq!(err.cause().unwrap().to_string(), "disk gone");
        assert_eq!(err.to_string(), "error: write failed (disk gone)");
    }

    #[test]
    fn test_source_display() {
        assert_eq!(CommandSource::StructuredCall.to_string(), "structured_call");
        assert_eq!(
            serde_json::to_string(&CommandSource::Endpoint).unwrap(),
            "\"endpoint\""
        );
    }
}
