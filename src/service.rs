//! Relay service: the composition root
//!
//! Wires the listener registry, broker connection, command router, built-in
//! handlers and the HTTP endpoint, and owns their start/stop lifecycle.

use crate::command::{CommandHandler, CommandRouter};
use crate::config::RelayConfig;
use crate::endpoint::EndpointServer;
use crate::error::RelayResult;
use crate::handlers::{MqttPublishHandler, SystemCommandHandler};
use crate::lifecycle_span;
use crate::observability::metrics;
use crate::transport::mqtt::{BrokerConnection, ListenerRegistry, MessageListener};
use crate::transport::Connector;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

const ENDPOINT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningEndpoint {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct RelayService {
    config: RelayConfig,
    registry: ListenerRegistry,
    connection: BrokerConnection,
    router: Arc<CommandRouter>,
    handlers: Vec<Arc<dyn CommandHandler>>,
    endpoint: Option<Arc<EndpointServer>>,
    running_endpoint: Mutex<Option<RunningEndpoint>>,
    started: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RelayService {
    pub fn new(config: RelayConfig, connector: Arc<dyn Connector>) -> RelayResult<Self> {
        config.validate()?;

        let registry = ListenerRegistry::new();
        let connection = BrokerConnection::new(&config, connector, registry.clone())?;
        let router = Arc::new(CommandRouter::new(config.router.status_prefix.clone()));

        let handlers: Vec<Arc<dyn CommandHandler>> = vec![
            Arc::new(MqttPublishHandler::new(connection.clone())),
            Arc::new(SystemCommandHandler::new(config.relay.id.clone())),
        ];

        let endpoint = config.endpoint.enabled.then(|| {
            Arc::new(EndpointServer::new(
                config.relay.id.clone(),
                config.endpoint.port,
                connection.clone(),
                Arc::clone(&router),
            ))
        });

        Ok(Self {
            config,
            registry,
            connection,
            router,
            handlers,
            endpoint,
            running_endpoint: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// Bound address of the HTTP endpoint while it is running
    pub fn endpoint_addr(&self) -> Option<SocketAddr> {
        lock(&self.running_endpoint)
            .as_ref()
            .map(|running| running.addr)
    }

    /// Register handlers, route broker messages into the router, start the
    /// endpoint and connect. Calling it twice is a no-op.
    pub async fn start(&self) -> RelayResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Relay service already started");
            return Ok(());
        }

        let span = lifecycle_span!(relay_id = %self.config.relay.id, phase = "start");
        self.start_components().instrument(span).await
    }

    async fn start_components(&self) -> RelayResult<()> {
        metrics().set_service_state("starting");
        info!("Starting relay service");

        for handler in &self.handlers {
            self.router.register_handler(Arc::clone(handler));
        }
        self.registry.add_listener(
            &self.config.mqtt.subscribe_topic,
            Self::router_listener(Arc::clone(&self.router)),
        );

        if let Some(endpoint) = &self.endpoint {
            let (shutdown, signal) = oneshot::channel::<()>();
            let (addr, task) = endpoint.spawn(async move {
                let _ = signal.await;
            })?;
            *lock(&self.running_endpoint) = Some(RunningEndpoint {
                addr,
                shutdown,
                task,
            });
        }

        self.connection.start();
        self.connection.connect().await;

        metrics().set_service_state("running");
        info!("Relay service started");
        Ok(())
    }

    fn router_listener(router: Arc<CommandRouter>) -> MessageListener {
        Arc::new(move |topic: &str, payload: &str| {
            if let Err(e) = router.receive_broker_message(topic, payload.as_bytes()) {
                debug!(topic = %topic, error = %e, "Broker message not dispatched");
            }
        })
    }

    /// Reject new commands, disconnect (publishing offline), cancel the
    /// reconnect timer, stop the endpoint and drop all listeners
    pub async fn stop(&self) {
        let span = lifecycle_span!(relay_id = %self.config.relay.id, phase = "stop");
        async {
            metrics().set_service_state("stopping");
            info!("Stopping relay service");

            self.router.stop();
            self.connection.stop().await;
            self.registry.clear();

            let running = lock(&self.running_endpoint).take();
            if let Some(running) = running {
                let _ = running.shutdown.send(());
                let abort = running.task.abort_handle();
                if tokio::time::timeout(ENDPOINT_SHUTDOWN_TIMEOUT, running.task)
                    .await
                    .is_err()
                {
                    warn!("Endpoint server did not shut down in time, aborting");
                    abort.abort();
                }
            }

            metrics().set_service_state("stopped");
            info!("Relay service stopped");
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for RelayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayService")
            .field("relay_id", &self.config.relay.id)
            .field("connection", &self.connection)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockConnector;
    use crate::transport::mqtt::ConnectionState;

    fn service(connector: &MockConnector) -> RelayService {
        let mut config = RelayConfig::test_config();
        config.endpoint.enabled = false;
        RelayService::new(config, Arc::new(connector.clone())).unwrap()
    }

    #[tokio::test]
    async fn test_start_registers_handlers_and_connects() {
        let connector = MockConnector::new();
        let service = service(&connector);

        service.start().await.unwrap();
        assert!(
            service
                .connection()
                .wait_for_state(ConnectionState::Connected, Duration::from_secs(1))
                .await
        );
        assert_eq!(
            service.router().action_patterns(),
            vec!["mqtt_.*", "get_system_info|log_event"]
        );
        assert_eq!(service.registry().listener_count(), 1);

        service.start().await.unwrap();
        assert_eq!(connector.open_count(), 1);
        assert_eq!(service.router().handlers().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_publishes_offline_and_clears() {
        let connector = MockConnector::new();
        let service = service(&connector);
        service.start().await.unwrap();
        service
            .connection()
            .wait_for_state(ConnectionState::Connected, Duration::from_secs(1))
            .await;

        service.stop().await;

        assert!(service.router().is_stopped());
        assert_eq!(service.connection().state(), ConnectionState::Disconnected);
        assert_eq!(service.registry().listener_count(), 0);
        assert_eq!(
            connector
                .count_published("yan/availability", "offline")
                .await,
            1
        );

        service.connection().connect().await;
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = RelayConfig::test_config();
        config.mqtt.publish_topic = "yan/#".to_string();
        assert!(RelayService::new(config, Arc::new(MockConnector::new())).is_err());
    }
}
