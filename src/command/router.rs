//! Command routing
//!
//! The router owns the handler list and fans each command out to every
//! handler whose `can_handle` accepts it. Each handler runs in its own task,
//! so a handler that errors or panics never affects the others.

use super::adapters::{BrokerAdapter, EndpointAdapter, StructuredCallAdapter};
use super::model::{Command, CommandError, CommandResult, Payload};
use crate::command_span;
use crate::observability::metrics;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Action of the internal command that asks for a broker publish
pub const MQTT_PUBLISH_ACTION: &str = "mqtt_publish";

/// Resolves to the results of every handler that accepted the command
pub type DispatchHandle = JoinHandle<Vec<CommandResult>>;

/// A command handler
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Coarse descriptive pattern for discovery, e.g. `mqtt_.*`
    fn action_pattern(&self) -> &str;

    /// Authoritative acceptance check
    fn can_handle(&self, command: &Command) -> bool;

    async fn handle(&self, command: &Command) -> CommandResult;
}

fn same_handler(a: &Arc<dyn CommandHandler>, b: &Arc<dyn CommandHandler>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

pub struct CommandRouter {
    handlers: RwLock<Vec<Arc<dyn CommandHandler>>>,
    stopped: AtomicBool,
    status_prefix: String,
}

impl CommandRouter {
    pub fn new(status_prefix: impl Into<String>) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            stopped: AtomicBool::new(false),
            status_prefix: status_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<dyn CommandHandler>>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<dyn CommandHandler>>> {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a handler. Registering the same handler twice is a no-op.
    pub fn register_handler(&self, handler: Arc<dyn CommandHandler>) {
        let mut handlers = self.write();
        if handlers.iter().any(|existing| same_handler(existing, &handler)) {
            debug!(pattern = %handler.action_pattern(), "Handler already registered");
            return;
        }
        info!(pattern = %handler.action_pattern(), "Registered command handler");
        handlers.push(handler);
    }

    /// Returns true when the handler was registered
    pub fn unregister_handler(&self, handler: &Arc<dyn CommandHandler>) -> bool {
        let mut handlers = self.write();
        match handlers.iter().position(|existing| same_handler(existing, handler)) {
            Some(index) => {
                handlers.remove(index);
                info!(pattern = %handler.action_pattern(), "Unregistered command handler");
                true
            }
            None => false,
        }
    }

    /// Registered handlers in registration order
    pub fn handlers(&self) -> Vec<Arc<dyn CommandHandler>> {
        self.read().clone()
    }

    pub fn action_patterns(&self) -> Vec<String> {
        self.read()
            .iter()
            .map(|handler| handler.action_pattern().to_string())
            .collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Reject further dispatches. Handler tasks already running finish.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!("Command router stopped");
        }
    }

    fn matching_handlers(&self, command: &Command) -> Vec<Arc<dyn CommandHandler>> {
        self.read()
            .iter()
            .filter(|handler| {
                catch_unwind(AssertUnwindSafe(|| handler.can_handle(command))).unwrap_or_else(
                    |_| {
                        metrics().handler_panicked();
                        error!(
                            pattern = %handler.action_pattern(),
                            action = %command.action(),
                            "Handler panicked in can_handle, skipping"
                        );
                        false
                    },
                )
            })
            .cloned()
            .collect()
    }

    /// Run the command on every matching handler concurrently.
    ///
    /// Must be called within a Tokio runtime. The returned handle resolves to
    /// one result per matching handler; dropping it does not cancel anything.
    pub fn dispatch(&self, command: Command) -> Result<DispatchHandle, CommandError> {
        if self.is_stopped() {
            metrics().command_rejected();
            warn!(action = %command.action(), "Router stopped, rejecting command");
            return Err(CommandError::RouterStopped);
        }

        metrics().command_dispatched();
        let span = command_span!(
            command_id = %command.id(),
            action = %command.action(),
            source = %command.source()
        );

        let matching = self.matching_handlers(&command);
        if matching.is_empty() {
            metrics().command_unhandled();
            span.in_scope(|| {
                warn!(action = %command.action(), source = %command.source(), "No handler for command")
            });
            return Ok(tokio::spawn(async { Vec::new() }));
        }

        span.in_scope(|| debug!(handlers = matching.len(), "Dispatching command"));

        let tasks: Vec<(String, JoinHandle<CommandResult>)> = matching
            .into_iter()
            .map(|handler| {
                let pattern = handler.action_pattern().to_string();
                let command = command.clone();
                let task = tokio::spawn(
                    async move { handler.handle(&command).await }.instrument(span.clone()),
                );
                (pattern, task)
            })
            .collect();

        let action = command.action().to_string();
        Ok(tokio::spawn(
            async move {
                let mut results = Vec::with_capacity(tasks.len());
                for (pattern, task) in tasks {
                    results.push(collect_result(&action, &pattern, task.await));
                }
                results
            }
            .instrument(span),
        ))
    }

    /// Dispatch and wait for every handler
    pub async fn process(&self, command: Command) -> Result<Vec<CommandResult>, CommandError> {
        let handle = self.dispatch(command)?;
        Ok(handle.await.unwrap_or_else(|e| {
            error!(error = %e, "Dispatch task failed");
            Vec::new()
        }))
    }

    /// Publish `payload` to `{status_prefix}/{suffix}` through whichever
    /// handler owns the broker connection
    pub fn broadcast_update(
        &self,
        topic_suffix: &str,
        payload: &Value,
    ) -> Result<DispatchHandle, CommandError> {
        let topic = format!(
            "{}/{}",
            self.status_prefix,
            topic_suffix.trim_start_matches('/')
        );
        let mut publish = Payload::new();
        publish.insert("topic".to_string(), Value::String(topic));
        publish.insert("message".to_string(), Value::String(payload.to_string()));
        publish.insert("retain".to_string(), json!(false));

        self.send_internal_command(MQTT_PUBLISH_ACTION, publish)
    }

    pub fn send_internal_command(
        &self,
        action: &str,
        payload: Payload,
    ) -> Result<DispatchHandle, CommandError> {
        let command = StructuredCallAdapter::internal(action, payload)?;
        self.dispatch(command)
    }

    pub fn receive_broker_message(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<DispatchHandle, CommandError> {
        debug!(topic = %topic, "Received broker message");
        let command = BrokerAdapter::normalize(topic, payload)?;
        self.dispatch(command)
    }

    /// Returns false when the call was rejected
    pub fn receive_structured_call(&self, action: &str, payload: Payload) -> bool {
        let command = match StructuredCallAdapter::normalize(action, payload) {
            Ok(command) => command,
            Err(e) => {
                metrics().command_rejected();
                warn!(error = %e, "Ignoring structured call");
                return false;
            }
        };
        self.dispatch(command).is_ok()
    }

    pub fn receive_endpoint_message(
        &self,
        path: &str,
        body: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<DispatchHandle, CommandError> {
        debug!(path = %path, "Received endpoint message");
        let command = EndpointAdapter::normalize(path, body, headers)?;
        self.dispatch(command)
    }
}

fn collect_result(
    action: &str,
    pattern: &str,
    joined: Result<CommandResult, tokio::task::JoinError>,
) -> CommandResult {
    match joined {
        Ok(result) => {
            match &result {
                CommandResult::Success(_) => {
                    metrics().handler_succeeded();
                    debug!(action = %action, handler = %pattern, "Command handled");
                }
                CommandResult::Error { message, cause } => {
                    metrics().handler_failed();
                    warn!(
                        action = %action,
                        handler = %pattern,
                        error = %message,
                        cause = ?cause.as_ref().map(|c| c.to_string()),
                        "Handler returned error"
                    );
                }
            }
            result
        }
        Err(e) if e.is_panic() => {
            metrics().handler_panicked();
            error!(action = %action, handler = %pattern, "Handler panicked");
            CommandResult::error(format!("Handler {pattern} panicked"))
        }
        Err(e) => {
            metrics().handler_failed();
            warn!(action = %action, handler = %pattern, error = %e, "Handler task cancelled");
            CommandResult::error(format!("Handler {pattern} was cancelled"))
        }
    }
}

impl std::fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRouter")
            .field("handlers", &self.action_patterns())
            .field("stopped", &self.is_stopped())
            .field("status_prefix", &self.status_prefix)
            .finish()
    }
}
