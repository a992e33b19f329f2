//! Listener registry for inbound broker messages
//!
//! Exact-topic, wildcard-pattern and global listeners plus connection-state
//! listeners. Every `notify` works on a snapshot taken under a read lock, so
//! callbacks may register or remove listeners without deadlocking and
//! concurrent registration never corrupts an in-progress delivery.

use super::topic::TopicMatcher;
use crate::observability::metrics;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error};

/// Callback receiving `(topic, payload)`
pub type MessageListener = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Callback receiving the new connected flag
pub type ConnectionListener = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    exact: HashMap<String, Vec<MessageListener>>,
    patterns: HashMap<String, Vec<MessageListener>>,
    global: Vec<MessageListener>,
    connection: Vec<ConnectionListener>,
}

/// Thread-safe registry of message and connection listeners
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<RwLock<Listeners>>,
}

fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    // Compare data pointers only; vtable pointers are not unique per type
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn remove_from<T: ?Sized>(list: &mut Vec<Arc<T>>, target: &Arc<T>) -> bool {
    match list.iter().position(|entry| same_listener(entry, target)) {
        Some(index) => {
            list.remove(index);
            true
        }
        None => false,
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Listeners> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Listeners> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a listener for an exact topic or a wildcard pattern
    pub fn add_listener(&self, pattern: &str, listener: MessageListener) {
        let mut listeners = self.write();
        let bucket = if TopicMatcher::is_wildcard(pattern) {
            &mut listeners.patterns
        } else {
            &mut listeners.exact
        };
        bucket.entry(pattern.to_string()).or_default().push(listener);
        debug!(pattern = %pattern, "Listener registered");
    }

    /// Remove one registration of `listener` under `pattern`
    pub fn remove_listener(&self, pattern: &str, listener: &MessageListener) {
        let mut listeners = self.write();
        let bucket = if TopicMatcher::is_wildcard(pattern) {
            &mut listeners.patterns
        } else {
            &mut listeners.exact
        };

        if let Some(entries) = bucket.get_mut(pattern) {
            remove_from(entries, listener);
            if entries.is_empty() {
                bucket.remove(pattern);
            }
        }
    }

    /// Remove every listener registered under `pattern`
    pub fn remove_all_listeners(&self, pattern: &str) {
        let mut listeners = self.write();
        listeners.exact.remove(pattern);
        listeners.patterns.remove(pattern);
    }

    pub fn add_global_listener(&self, listener: MessageListener) {
        self.write().global.push(listener);
    }

    pub fn remove_global_listener(&self, listener: &MessageListener) {
        remove_from(&mut self.write().global, listener);
    }

    pub fn add_connection_listener(&self, listener: ConnectionListener) {
        self.write().connection.push(listener);
    }

    pub fn remove_connection_listener(&self, listener: &ConnectionListener) {
        remove_from(&mut self.write().connection, listener);
    }

    /// Drop every registration
    pub fn clear(&self) {
        *self.write() = Listeners::default();
    }

    /// Number of message listeners across all three sets
    pub fn listener_count(&self) -> usize {
        let listeners = self.read();
        listeners.exact.values().map(Vec::len).sum::<usize>()
            + listeners.patterns.values().map(Vec::len).sum::<usize>()
            + listeners.global.len()
    }

    /// Deliver a message: exact listeners, then matching patterns, then
    /// globals. A panicking listener is logged and skipped.
    pub fn notify(&self, topic: &str, payload: &str) {
        let snapshot: Vec<MessageListener> = {
            let listeners = self.read();
            let exact = listeners.exact.get(topic).into_iter().flatten();
            let patterns = listeners
                .patterns
                .iter()
                .filter(|(pattern, _)| TopicMatcher::matches(topic, pattern))
                .flat_map(|(_, entries)| entries);
            exact
                .chain(patterns)
                .chain(listeners.global.iter())
                .cloned()
                .collect()
        };

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(topic, payload))).is_err() {
                metrics().listener_failed();
                error!(topic = %topic, "Message listener panicked");
            }
        }
    }

    /// Deliver a connection state change to connection listeners
    pub fn notify_connection(&self, connected: bool) {
        let snapshot: Vec<ConnectionListener> = self.read().connection.clone();

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(connected))).is_err() {
                metrics().listener_failed();
                error!(connected, "Connection listener panicked");
            }
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.read();
        f.debug_struct("ListenerRegistry")
            .field("exact", &listeners.exact.len())
            .field("patterns", &listeners.patterns.len())
            .field("global", &listeners.global.len())
            .field("connection", &listeners.connection.len())
            .finish()
    }
}
