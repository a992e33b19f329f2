//! Process-wide metrics collection
//!
//! Atomic counters for broker connectivity, message flow and command
//! dispatch, snapshotted on demand for the `/metrics` endpoint.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector
pub struct MetricsCollector {
    // Connectivity
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    reconnects_scheduled: AtomicU64,
    connection_start_time: AtomicU64,

    // Message flow
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    publishes_dropped: AtomicU64,
    messages_received: AtomicU64,
    listener_failures: AtomicU64,

    // Commands
    commands_dispatched: AtomicU64,
    commands_unhandled: AtomicU64,
    commands_rejected: AtomicU64,
    handler_successes: AtomicU64,
    handler_errors: AtomicU64,
    handler_panics: AtomicU64,

    // Lifecycle
    service_state: Mutex<String>,
    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            reconnects_scheduled: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            publishes_dropped: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            listener_failures: AtomicU64::new(0),
            commands_dispatched: AtomicU64::new(0),
            commands_unhandled: AtomicU64::new(0),
            commands_rejected: AtomicU64::new(0),
            handler_successes: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
            service_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.mqtt_disconnected();
    }

    pub fn mqtt_disconnected(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_dropped(&self) {
        self.publishes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_failed(&self) {
        self.listener_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Command metrics
    pub fn command_dispatched(&self) {
        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_unhandled(&self) {
        self.commands_unhandled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_succeeded(&self) {
        self.handler_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_failed(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_panicked(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_service_state(&self, state: &str) {
        if let Ok(mut current) = self.service_state.lock() {
            *current = state.to_string();
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.connections_lost,
            &self.reconnects_scheduled,
            &self.connection_start_time,
            &self.messages_published,
            &self.publish_failures,
            &self.publishes_dropped,
            &self.messages_received,
            &self.listener_failures,
            &self.commands_dispatched,
            &self.commands_unhandled,
            &self.commands_rejected,
            &self.handler_successes,
            &self.handler_errors,
            &self.handler_panics,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        self.set_service_state("initializing");
    }

    fn connection_duration(&self, now: u64) -> u64 {
        let start = self.connection_start_time.load(Ordering::Relaxed);
        if start == 0 || !self.mqtt_connected.load(Ordering::Relaxed) {
            0
        } else {
            now.saturating_sub(start)
        }
    }

    fn current_service_state(&self) -> String {
        self.service_state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        MetricsSnapshot {
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: load(&self.connection_attempts),
                connections_established: load(&self.connections_established),
                connection_failures: load(&self.connection_failures),
                connections_lost: load(&self.connections_lost),
                reconnects_scheduled: load(&self.reconnects_scheduled),
                messages_published: load(&self.messages_published),
                publish_failures: load(&self.publish_failures),
                publishes_dropped: load(&self.publishes_dropped),
                messages_received: load(&self.messages_received),
                listener_failures: load(&self.listener_failures),
                connection_duration_seconds: self.connection_duration(now),
            },
            commands: CommandMetrics {
                dispatched: load(&self.commands_dispatched),
                unhandled: load(&self.commands_unhandled),
                rejected: load(&self.commands_rejected),
                handler_successes: load(&self.handler_successes),
                handler_errors: load(&self.handler_errors),
                handler_panics: load(&self.handler_panics),
            },
            lifecycle: LifecycleMetrics {
                current_state: self.current_service_state(),
                uptime_seconds: now.saturating_sub(load(&self.uptime_start)),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub mqtt: MqttMetrics,
    pub commands: CommandMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub reconnects_scheduled: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub publishes_dropped: u64,
    pub messages_received: u64,
    pub listener_failures: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandMetrics {
    pub dispatched: u64,
    pub unhandled: u64,
    pub rejected: u64,
    pub handler_successes: u64,
    pub handler_errors: u64,
    pub handler_panics: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
