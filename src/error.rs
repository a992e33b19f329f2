//! Error types for the relay
//!
//! Each layer owns a focused `thiserror` enum; `RelayError` is the umbrella
//! returned from construction, configuration and the CLI. The core broker and
//! routing operations never return these to their callers, they log instead.

use crate::command::CommandError;
use crate::config::ConfigError;
use crate::transport::mqtt::MqttError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Maximum length of a sanitized error message, suffix included
const MAX_MESSAGE_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static CREDENTIAL_URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([a-z][a-z0-9+.-]*://)[^/\s:@]+:[^/\s@]+@").expect("url pattern is valid")
});

/// Main error type for relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Endpoint error: {message}")]
    Endpoint { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RelayError {
    /// Create endpoint error
    pub fn endpoint<S: Into<String>>(message: S) -> Self {
        Self::Endpoint {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Render this error for consumption outside the process
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Strip credentials from a message and bound its length
///
/// Applied to any failure text that leaves the process: connection diagnostics,
/// HTTP error bodies and command results relayed over the broker.
pub fn sanitize_error_message(message: &str) -> String {
    let redacted = SECRET_PATTERN.replace_all(message, "${1}=***");
    let mut sanitized = CREDENTIAL_URL_PATTERN
        .replace_all(&redacted, "${1}***@")
        .into_owned();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATE_SUFFIX);
    }

    sanitized
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
