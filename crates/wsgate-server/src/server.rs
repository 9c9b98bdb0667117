//! `GatewayServer`: axum listener wiring the gateway components together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use wsgate_settings::GatewaySettings;

use crate::backend::{Backend, TimeoutBackend};
use crate::channels::ChannelRegistry;
use crate::dispatcher::MessageDispatcher;
use crate::health::{self, HealthResponse};
use crate::keepalive::{KeepAlive, KeepAliveConfig};
use crate::manager::ConnectionManager;
use crate::metrics::WS_CONNECTIONS_REJECTED_TOTAL;
use crate::middleware::{MiddlewareRef, MiddlewareRegistry};
use crate::registry::Registry;
use crate::routes::{RouteDescriptor, RouteError, RouteTable};
use crate::session::run_ws_session;
use crate::shutdown::ShutdownCoordinator;

const HEALTH_PATH: &str = "/health";
const METRICS_PATH: &str = "/metrics";
/// How long shutdown waits for in-flight async-route calls.
const DETACHED_DRAIN: Duration = Duration::from_secs(5);

/// Errors building a [`GatewayServer`].
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("websocket path {0:?} collides with a built-in endpoint")]
    ReservedPath(String),
}

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ConnectionManager>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub start_time: Instant,
    /// Prometheus render handle, if a recorder was installed.
    pub metrics: Option<PrometheusHandle>,
    pub max_connections: usize,
    pub max_message_size: usize,
}

/// The gateway listener.
pub struct GatewayServer {
    settings: GatewaySettings,
    manager: Arc<ConnectionManager>,
    keepalive: Arc<KeepAlive>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl GatewayServer {
    /// Build a server from settings.
    ///
    /// `registry` is shared by the connection manager, channel fan-out and
    /// keep-alive prober; pass the same one to any backend that publishes.
    /// When `dispatch.requestTimeoutMs` is set, `backend` is wrapped in a
    /// [`TimeoutBackend`].
    pub fn new(
        settings: GatewaySettings,
        registry: Arc<Registry>,
        backend: Arc<dyn Backend>,
        middlewares: Arc<MiddlewareRegistry>,
    ) -> Result<Self, ServerError> {
        let path = settings.server.path.as_str();
        if path == HEALTH_PATH || path == METRICS_PATH {
            return Err(ServerError::ReservedPath(path.to_owned()));
        }

        let routes = RouteTable::from_descriptors(settings.routes.iter().map(RouteDescriptor::from))?;
        let backend: Arc<dyn Backend> = match settings.dispatch.request_timeout() {
            Some(timeout) => Arc::new(TimeoutBackend::new(backend, timeout)),
            None => backend,
        };
        let global = settings
            .middlewares
            .iter()
            .map(|name| MiddlewareRef::from(name.as_str()))
            .collect();

        let dispatcher = MessageDispatcher::new(Arc::new(routes), middlewares, backend)
            .with_global_middlewares(global)
            .with_local_prefix(settings.dispatch.local_action_prefix.clone());
        let manager = ConnectionManager::new(registry.clone(), Arc::new(dispatcher))
            .with_send_queue_capacity(settings.server.send_queue_capacity);
        let keepalive = KeepAlive::new(registry, KeepAliveConfig::from(&settings.keep_alive));

        Ok(Self {
            settings,
            manager: Arc::new(manager),
            keepalive: Arc::new(keepalive),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        })
    }

    /// Serve `GET /metrics` from this Prometheus handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        let state = AppState {
            manager: self.manager.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
            max_connections: self.settings.server.max_connections,
            max_message_size: self.settings.server.max_message_size,
        };

        Router::new()
            .route(&self.settings.server.path, get(ws_handler))
            .route(HEALTH_PATH, get(health_handler))
            .route(METRICS_PATH, get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind and start serving.
    ///
    /// Returns the bound address (useful with port 0) and a handle that
    /// completes once the listener and the keep-alive scheduler have
    /// stopped after [`ShutdownCoordinator::shutdown`] and detached
    /// async-route calls have drained (bounded by a timeout).
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.settings.server.host, self.settings.server.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, path = %self.settings.server.path, "gateway listening");

        let token = self.shutdown.token();
        let keepalive = self
            .settings
            .keep_alive
            .enabled
            .then(|| tokio::spawn(self.keepalive.clone().run(token.clone())));

        let app = self.router();
        let detached = self.manager.dispatcher().detached_tasks().clone();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                warn!(error = %e, "listener exited with error");
            }
            if let Some(keepalive) = keepalive {
                let _ = keepalive.await;
            }
            let _ = detached.close();
            if tokio::time::timeout(DETACHED_DRAIN, detached.wait()).await.is_err() {
                warn!(pending = detached.len(), "async dispatches still running at shutdown");
            }
            info!("gateway stopped");
        });

        Ok((local_addr, handle))
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        self.manager.dispatcher().routes()
    }

    pub fn channels(&self) -> &ChannelRegistry {
        self.manager.channels()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn keepalive(&self) -> &Arc<KeepAlive> {
        &self.keepalive
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }
}

/// GET <path>: WebSocket upgrade.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL, "reason" => "shutting_down").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }
    let active = state.manager.connection_count();
    if active >= state.max_connections {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL, "reason" => "limit").increment(1);
        warn!(active, limit = state.max_connections, "connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    let manager = state.manager.clone();
    let token = state.shutdown.token();
    ws.max_message_size(state.max_message_size)
        .on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| run_ws_session(socket, manager, token))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.manager.connection_count(),
        state.manager.channels().channel_count(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .metrics
        .as_ref()
        .map(crate::metrics::render)
        .ok_or(StatusCode::NOT_FOUND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::{Map, Value};
    use std::time::Duration;
    use tower::ServiceExt;
    use wsgate_core::DispatchFailure;
    use wsgate_settings::RouteSettings;

    struct Null;

    #[async_trait]
    impl Backend for Null {
        async fn call(
            &self,
            _action: &str,
            _params: Value,
            _meta: Map<String, Value>,
        ) -> Result<Value, DispatchFailure> {
            Ok(Value::Null)
        }
    }

    fn make_server(settings: GatewaySettings) -> GatewayServer {
        GatewayServer::new(
            settings,
            Arc::new(Registry::new()),
            Arc::new(Null),
            Arc::new(MiddlewareRegistry::new()),
        )
        .unwrap()
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn health_endpoint_reports_counts() {
        let server = make_server(GatewaySettings::default());
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["channels"], 0);
        assert!(body["uptimeSecs"].is_number());
    }

    #[tokio::test]
    async fn health_reports_shutdown() {
        let server = make_server(GatewaySettings::default());
        server.shutdown().shutdown();
        let (_, body) = get_json(server.router(), "/health").await;
        assert_eq!(body["status"], "shutting_down");
    }

    #[tokio::test]
    async fn metrics_404_without_recorder() {
        let server = make_server(GatewaySettings::default());
        let (status, _) = get_json(server.router(), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_served_with_handle() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let server = make_server(GatewaySettings::default()).with_metrics(handle);
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn plain_get_on_ws_path_is_rejected() {
        let mut settings = GatewaySettings::default();
        settings.server.path = "/ws".into();
        let server = make_server(settings);
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
        assert_ne!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_path_returns_404() {
        let server = make_server(GatewaySettings::default());
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn routes_come_from_settings() {
        let mut settings = GatewaySettings::default();
        settings.routes = vec![
            RouteSettings {
                action: "ping.*".into(),
                ..RouteSettings::default()
            },
            RouteSettings {
                action: "^jobs\\..+".into(),
                is_async: true,
                ..RouteSettings::default()
            },
        ];
        let server = make_server(settings);
        assert_eq!(server.routes().len(), 2);
    }

    #[test]
    fn invalid_route_pattern_fails_construction() {
        let mut settings = GatewaySettings::default();
        settings.routes = vec![RouteSettings {
            action: "^(unclosed".into(),
            ..RouteSettings::default()
        }];
        let result = GatewayServer::new(
            settings,
            Arc::new(Registry::new()),
            Arc::new(Null),
            Arc::new(MiddlewareRegistry::new()),
        );
        assert!(matches!(result, Err(ServerError::Route(_))));
    }

    #[test]
    fn reserved_path_fails_construction() {
        let mut settings = GatewaySettings::default();
        settings.server.path = "/health".into();
        let result = GatewayServer::new(
            settings,
            Arc::new(Registry::new()),
            Arc::new(Null),
            Arc::new(MiddlewareRegistry::new()),
        );
        assert!(matches!(result, Err(ServerError::ReservedPath(_))));
    }

    #[tokio::test]
    async fn listen_stops_on_shutdown() {
        let mut settings = GatewaySettings::default();
        settings.server.host = "127.0.0.1".into();
        settings.server.port = 0;
        let server = make_server(settings);
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);

        server.shutdown().shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn listener_handle_waits_for_async_dispatches() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let mut settings = GatewaySettings::default();
        settings.server.host = "127.0.0.1".into();
        settings.server.port = 0;
        let server = make_server(settings);
        let (_addr, handle) = server.listen().await.unwrap();

        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        drop(server.manager().dispatcher().detached_tasks().spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.store(true, Ordering::SeqCst);
        }));

        server.shutdown().shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(finished.load(Ordering::SeqCst));
    }
}
