//! Pure reconnection decision logic
//!
//! Tracks the backoff attempt counter and decides whether and when the
//! broker connection should try again.

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reconnect attempt counter.
///
/// Starts at 0, grows by one per failed or lost connection and returns to 0
/// after a successful connect or an explicit disconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffState {
    attempt: u32,
}

impl BackoffState {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failure and return the new attempt number
    pub fn record_failure(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the retry belonging to the current attempt
    pub fn next_delay(&self, config: &ReconnectConfig) -> Duration {
        config.delay_for_attempt(self.attempt)
    }
}

/// Outcome of a reconnection decision
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    AbortAutoReconnectDisabled,
}

/// Pure reconnection decisions
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide what to do after the connection dropped or failed to open
    pub fn should_attempt_reconnection(
        backoff: &BackoffState,
        config: &ReconnectConfig,
        auto_reconnect: bool,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        if !auto_reconnect {
            return ReconnectionDecision::AbortAutoReconnectDisabled;
        }

        ReconnectionDecision::Proceed {
            attempt: backoff.attempt(),
            delay: backoff.next_delay(config),
        }
    }

    pub fn can_publish(state: &ConnectionState) -> bool {
        state.is_connected()
    }

    /// Log connection state transition
    pub fn log_state_transition(from: ConnectionState, to: ConnectionState, reason: Option<&str>) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => match reason {
                Some(reason) => warn!(reason = %reason, "MQTT connection lost"),
                None => info!("MQTT connection closed"),
            },
            (ConnectionState::Connecting, ConnectionState::Disconnected) => {
                warn!(reason = reason.unwrap_or("unknown"), "MQTT connection attempt failed");
            }
            _ => {
                debug!(from = %from, to = %to, "MQTT state transition");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            base_interval_secs: 2,
            max_interval_secs: 60,
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_counts_failures_and_resets() {
        let mut backoff = BackoffState::default();
        let config = config();

        let delays: Vec<u64> = (0..6)
            .map(|_| {
                backoff.record_failure();
                backoff.next_delay(&config).as_secs()
            })
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60]);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        backoff.record_failure();
        assert_eq!(backoff.next_delay(&config), Duration::from_secs(2));
    }

    #[test]
    fn test_attempt_counter_saturates() {
        let mut backoff = BackoffState { attempt: u32::MAX };
        assert_eq!(backoff.record_failure(), u32::MAX);
    }

    #[test]
    fn test_reconnection_decisions() {
        let mut backoff = BackoffState::default();
        backoff.record_failure();
        backoff.record_failure();

        assert_eq!(
            HealthMonitor::should_attempt_reconnection(&backoff, &config(), true, false),
            ReconnectionDecision::Proceed {
                attempt: 2,
                delay: Duration::from_secs(4)
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(&backoff, &config(), false, false),
            ReconnectionDecision::AbortAutoReconnectDisabled
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(&backoff, &config(), true, true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_can_publish_only_when_connected() {
        assert!(HealthMonitor::can_publish(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Connecting));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Disconnected));
    }
}
