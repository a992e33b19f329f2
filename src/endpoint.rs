//! HTTP surface
//!
//! `POST /api/<path..>` feeds the endpoint adapter. The remaining routes are
//! for operators and orchestration probes.

use crate::command::{CommandError, CommandRouter, EndpointAdapter};
use crate::error::{sanitize_error_message, RelayError};
use crate::observability::metrics;
use crate::transport::mqtt::{BrokerConnection, LastMessage};
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use warp::http::{HeaderMap, StatusCode};
use warp::reply::{json, with_status, Json, WithStatus};
use warp::Filter;

/// Largest request body accepted on `/api`
const MAX_BODY_BYTES: u64 = 64 * 1024;

/// HTTP endpoint server
pub struct EndpointServer {
    relay_id: String,
    port: u16,
    connection: BrokerConnection,
    router: Arc<CommandRouter>,
}

impl EndpointServer {
    pub fn new(
        relay_id: impl Into<String>,
        port: u16,
        connection: BrokerConnection,
        router: Arc<CommandRouter>,
    ) -> Self {
        Self {
            relay_id: relay_id.into(),
            port,
            connection,
            router,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// All routes, without binding a socket
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let server = Arc::clone(self);
        let with_server = warp::any().map(move || Arc::clone(&server));

        // POST /api/<path..> - endpoint adapter ingress
        let api_route = warp::path("api")
            .and(warp::path::tail())
            .and(warp::post())
            .and(warp::header::headers_cloned())
            .and(warp::body::content_length_limit(MAX_BODY_BYTES))
            .and(warp::body::bytes())
            .and(with_server.clone())
            .and_then(
                |tail: warp::path::Tail, headers: HeaderMap, body: Bytes, server: Arc<Self>| async move {
                    Ok::<_, Infallible>(server.accept_command(tail.as_str(), &headers, &body))
                },
            );

        // GET /health - broker connectivity and last message
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<Self>| async move {
                Ok::<_, Infallible>(server.health_reply())
            });

        // GET /ready - 200 only while the broker is connected
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<Self>| async move {
                let ready = server.connection.is_connected();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                Ok::<_, Infallible>(with_status(json(&response), availability_status(ready)))
            });

        // GET /live - liveness probe
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(|| async move {
                let response = LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                };
                Ok::<_, Infallible>(json(&response))
            });

        // GET /metrics - metrics snapshot
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(|| async move { Ok::<_, Infallible>(json(&metrics().get_metrics())) });

        // GET /handlers - registered action patterns
        let handlers_route = warp::path("handlers")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server)
            .and_then(|server: Arc<Self>| async move {
                let response = HandlersResponse {
                    handlers: server.router.action_patterns(),
                };
                Ok::<_, Infallible>(json(&response))
            });

        // GET / - endpoint index
        let root_route = warp::path::end().and(warp::get()).and_then(|| async move {
            let endpoints: BTreeMap<&str, &str> = [
                ("/api/<path>", "POST a command; path becomes the action"),
                ("/health", "Broker connectivity and last message"),
                ("/ready", "Readiness probe, 200 while connected"),
                ("/live", "Liveness probe"),
                ("/metrics", "Counters and lifecycle state"),
                ("/handlers", "Registered handler patterns"),
            ]
            .into_iter()
            .collect();
            Ok::<_, Infallible>(json(&IndexResponse { endpoints }))
        });

        api_route
            .or(health_route)
            .or(ready_route)
            .or(live_route)
            .or(metrics_route)
            .or(handlers_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin())
    }

    /// Bind and serve until `shutdown` resolves
    pub fn spawn(
        self: &Arc<Self>,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(SocketAddr, JoinHandle<()>), RelayError> {
        let routes = self.routes();
        let (addr, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(([0, 0, 0, 0], self.port), shutdown)
            .map_err(|e| {
                RelayError::endpoint(format!("Failed to bind port {}: {e}", self.port))
            })?;

        info!(%addr, "Endpoint server listening");
        Ok((addr, tokio::spawn(server)))
    }

    fn accept_command(&self, path: &str, headers: &HeaderMap, body: &[u8]) -> WithStatus<Json> {
        let body = String::from_utf8_lossy(body);
        let headers = header_map(headers);
        let action = EndpointAdapter::action_for_path(path);

        match self.router.receive_endpoint_message(path, &body, &headers) {
            Ok(_) => {
                debug!(action = %action, "Accepted endpoint command");
                with_status(
                    json(&AcceptedResponse {
                        accepted: true,
                        action,
                    }),
                    StatusCode::ACCEPTED,
                )
            }
            Err(e) => {
                let status = match e {
                    CommandError::RouterStopped => StatusCode::SERVICE_UNAVAILABLE,
                    CommandError::EmptyAction => StatusCode::BAD_REQUEST,
                };
                with_status(
                    json(&ErrorResponse {
                        accepted: false,
                        error: sanitize_error_message(&e.to_string()),
                        timestamp: current_timestamp(),
                    }),
                    status,
                )
            }
        }
    }

    fn health_reply(&self) -> WithStatus<Json> {
        let state = self.connection.state();
        let connected = state.is_connected();
        let status = HealthStatus {
            status: if connected { "healthy" } else { "degraded" },
            relay_id: self.relay_id.clone(),
            mqtt_state: state.to_string(),
            reconnect_attempt: self.connection.reconnect_attempt(),
            last_message: self.connection.last_message(),
            uptime_seconds: metrics().get_metrics().lifecycle.uptime_seconds,
            timestamp: current_timestamp(),
        };
        with_status(json(&status), availability_status(connected))
    }
}

fn availability_status(available: bool) -> StatusCode {
    if available {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Lower-cased header names; values that are not visible ASCII are skipped
fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    accepted: bool,
    action: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    accepted: bool,
    error: String,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    relay_id: String,
    mqtt_state: String,
    reconnect_attempt: u32,
    last_message: Option<LastMessage>,
    uptime_seconds: u64,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct HandlersResponse {
    handlers: Vec<String>,
}

#[derive(Debug, Serialize)]
struct IndexResponse {
    endpoints: BTreeMap<&'static str, &'static str>,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
