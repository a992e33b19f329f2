//! System-level commands: `get_system_info` and `log_event`

use crate::command::{Command, CommandHandler, CommandResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

const GET_SYSTEM_INFO: &str = "get_system_info";
const LOG_EVENT: &str = "log_event";

pub struct SystemCommandHandler {
    relay_id: String,
    started_at: DateTime<Utc>,
}

impl SystemCommandHandler {
    pub fn new(relay_id: impl Into<String>) -> Self {
        Self {
            relay_id: relay_id.into(),
            started_at: Utc::now(),
        }
    }

    fn system_info(&self) -> CommandResult {
        let uptime = (Utc::now() - self.started_at).num_seconds().max(0);
        let info = json!({
            "version": env!("CARGO_PKG_VERSION"),
            "relayId": self.relay_id,
            "uptimeSeconds": uptime,
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        });
        debug!(info = %info, "Retrieved system info");
        CommandResult::success_with(info)
    }

    fn log_event(command: &Command) -> CommandResult {
        let Some(message) = command.get_str("message") else {
            return CommandResult::error("No message provided");
        };
        let level = command
            .get_str("level")
            .map(str::to_uppercase)
            .unwrap_or_else(|| "INFO".to_string());

        match level.as_str() {
            "DEBUG" => debug!(source = %command.source(), "Remote log: {message}"),
            "INFO" => info!(source = %command.source(), "Remote log: {message}"),
            "WARN" => warn!(source = %command.source(), "Remote log: {message}"),
            "ERROR" => error!(source = %command.source(), "Remote log: {message}"),
            other => info!(source = %command.source(), "Remote log ({other}): {message}"),
        }
        CommandResult::success()
    }
}

#[async_trait]
impl CommandHandler for SystemCommandHandler {
    fn action_pattern(&self) -> &str {
        "get_system_info|log_event"
    }

    fn can_handle(&self, command: &Command) -> bool {
        matches!(command.action(), GET_SYSTEM_INFO | LOG_EVENT)
    }

    async fn handle(&self, command: &Command) -> CommandResult {
        match command.action() {
            GET_SYSTEM_INFO => self.system_info(),
            LOG_EVENT => Self::log_event(command),
            other => CommandResult::error(format!("Unknown action: {other}")),
        }
    }
}
