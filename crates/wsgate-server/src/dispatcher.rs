//! Inbound message state machine.
//!
//! ```text
//! Received ─parse─▶ Parsed ─resolve─▶ Routed ─middleware─▶ MiddlewarePassed
//!    │                 │                │                         │
//!    ▼                 ▼                ▼                      dispatch
//! Rejected         Rejected      Aborted / Handled                │
//!                                                    Responded ◀──┴──▶ Detached (async)
//! ```
//!
//! Parsing, routing and middleware run synchronously; the backend call is
//! the only suspension point and no lock is held across it.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use wsgate_core::{GatewayError, InboundRequest, ResponseEnvelope};

use crate::backend::Backend;
use crate::connection::ClientConnection;
use crate::context::{RequestContext, META_LOCAL};
use crate::metrics::{GATEWAY_DISPATCH_DURATION_SECONDS, GATEWAY_ERRORS_TOTAL, GATEWAY_MESSAGES_TOTAL};
use crate::middleware::{MiddlewareRef, MiddlewareRegistry, Pipeline, PipelineOutcome};
use crate::routes::{Resolution, Route, RouteTable};

/// Metric label for dispatches made while the route table is empty.
const PASSTHROUGH_LABEL: &str = "passthrough";

/// Where a message's handling stopped.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Parse or routing failure; an error envelope was sent.
    Rejected(GatewayError),
    /// A middleware aborted; an error envelope was sent.
    Aborted(GatewayError),
    /// A middleware took over the request.
    Handled,
    /// The backend answered and the envelope was queued.
    Responded { is_error: bool },
    /// The route is async; the backend call runs detached.
    Detached,
}

/// Parses, routes, filters and dispatches inbound messages.
pub struct MessageDispatcher {
    routes: Arc<RouteTable>,
    middlewares: Arc<MiddlewareRegistry>,
    global: Vec<MiddlewareRef>,
    backend: Arc<dyn Backend>,
    local_prefix: String,
    /// Backend calls made for async routes.
    detached: TaskTracker,
}

impl MessageDispatcher {
    pub fn new(
        routes: Arc<RouteTable>,
        middlewares: Arc<MiddlewareRegistry>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            routes,
            middlewares,
            global: Vec::new(),
            backend,
            local_prefix: "$local.".to_owned(),
            detached: TaskTracker::new(),
        }
    }

    /// Service-wide middlewares, run before every route's own.
    #[must_use]
    pub fn with_global_middlewares(mut self, global: Vec<MiddlewareRef>) -> Self {
        self.global = global;
        self
    }

    /// Prefix applied to actions dispatched through `local` routes.
    #[must_use]
    pub fn with_local_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.local_prefix = prefix.into();
        self
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn middlewares(&self) -> &Arc<MiddlewareRegistry> {
        &self.middlewares
    }

    /// Tracker for in-flight async-route calls. Close and wait on it to
    /// drain them at shutdown.
    pub fn detached_tasks(&self) -> &TaskTracker {
        &self.detached
    }

    /// Handle one raw text frame from `conn`.
    pub async fn handle(&self, conn: &Arc<ClientConnection>, raw: &str) -> DispatchOutcome {
        counter!(GATEWAY_MESSAGES_TOTAL).increment(1);

        // Received -> Parsed
        let request = match InboundRequest::parse(raw) {
            Ok(request) => request,
            Err(failure) => {
                debug!(conn_id = %conn.id, kind = failure.error.error_kind(), "rejected inbound message");
                record_error(&failure.error);
                let _ = conn.send_envelope(&failure.envelope());
                return DispatchOutcome::Rejected(failure.error);
            }
        };

        // Parsed -> Routed
        let route = match self.routes.resolve(&request.method) {
            Resolution::Matched(route) => Some(route),
            Resolution::PassThrough => None,
            Resolution::NotFound => {
                let error = GatewayError::RouteNotFound(request.method);
                debug!(conn_id = %conn.id, error = %error, "no route");
                record_error(&error);
                let _ = conn.send_envelope(&ResponseEnvelope::failure(request.correlation, &error));
                return DispatchOutcome::Rejected(error);
            }
        };

        // Routed -> MiddlewarePassed
        let mut ctx = RequestContext::new(conn.clone(), request, route);
        let route_middlewares = ctx.route.as_ref().map(|r| r.middlewares.clone()).unwrap_or_default();
        match Pipeline::new(&self.middlewares).run(&self.global, &route_middlewares, &mut ctx) {
            PipelineOutcome::Completed => {}
            PipelineOutcome::Handled => return DispatchOutcome::Handled,
            PipelineOutcome::Aborted(error) => {
                record_error(&error);
                return DispatchOutcome::Aborted(error);
            }
        }

        // MiddlewarePassed -> Dispatched
        let (local, is_async) = ctx
            .route
            .as_ref()
            .map_or((false, false), |r| (r.local, r.is_async));
        let correlation = ctx.correlation().clone();
        let label = dispatch_label(ctx.route.as_deref());
        let RequestContext {
            action,
            params,
            mut meta,
            ..
        } = ctx;
        let target = if local {
            let _ = meta.insert(META_LOCAL.into(), Value::Bool(true));
            format!("{}{}", self.local_prefix, action)
        } else {
            action
        };

        if is_async {
            let backend = self.backend.clone();
            let conn_id = conn.id.clone();
            drop(self.detached.spawn(async move {
                if let Err(failure) = backend.call(&target, params, meta).await {
                    warn!(conn_id = %conn_id, action = %target, error = %failure, "async dispatch failed");
                }
            }));
            return DispatchOutcome::Detached;
        }

        // Dispatched -> Responded
        let started = Instant::now();
        let result = self.backend.call(&target, params, meta).await;
        histogram!(GATEWAY_DISPATCH_DURATION_SECONDS, "route" => label)
            .record(started.elapsed().as_secs_f64());

        let envelope = match result {
            Ok(value) => ResponseEnvelope::success(correlation, value),
            Err(failure) => {
                let error = GatewayError::Dispatch(failure);
                debug!(conn_id = %conn.id, action = %target, error = %error, "backend call failed");
                record_error(&error);
                ResponseEnvelope::failure(correlation, &error)
            }
        };
        let is_error = envelope.is_error();
        if !conn.send_envelope(&envelope) {
            warn!(conn_id = %conn.id, action = %target, "failed to enqueue response (queue full or closed)");
        }
        DispatchOutcome::Responded { is_error }
    }
}

/// Bounded label for per-dispatch metrics: the matched route's pattern,
/// never the client-supplied action.
fn dispatch_label(route: Option<&Route>) -> String {
    route.map_or_else(|| PASSTHROUGH_LABEL.to_owned(), |r| r.pattern().to_owned())
}

fn record_error(error: &GatewayError) {
    counter!(GATEWAY_ERRORS_TOTAL, "kind" => error.error_kind()).increment(1);
}
