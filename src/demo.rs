//! Demo backend and middlewares served by the `wsgate` binary.
//!
//! Actions:
//! - `ping.pong` answers `"pong"`
//! - `echo.*` answers with the request params
//! - `channels.subscribe|unsubscribe|publish|broadcast` drive channel
//!   fan-out for the calling connection
//! - `$node.actions` / `$node.stats` (via a `local` route) describe the node

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;
use wsgate_core::{ConnectionId, DispatchFailure, MiddlewareError};
use wsgate_server::{
    Backend, ChannelRegistry, Flow, MiddlewareRegistry, RequestContext, RouteDescriptor,
    RouteError, RouteTable,
};

const ACTIONS: &[&str] = &[
    "ping.pong",
    "echo.*",
    "channels.subscribe",
    "channels.unsubscribe",
    "channels.publish",
    "channels.broadcast",
    "$node.actions",
    "$node.stats",
];

pub struct DemoBackend {
    channels: ChannelRegistry,
    local_prefix: String,
}

impl DemoBackend {
    pub fn new(channels: ChannelRegistry, local_prefix: impl Into<String>) -> Self {
        Self {
            channels,
            local_prefix: local_prefix.into(),
        }
    }

    fn local(&self, action: &str) -> Result<Value, DispatchFailure> {
        match action {
            "$node.actions" => Ok(json!(ACTIONS)),
            "$node.stats" => Ok(json!({
                "channels": self.channels.channel_count(),
            })),
            other => Err(not_found(other)),
        }
    }
}

#[async_trait]
impl Backend for DemoBackend {
    async fn call(
        &self,
        action: &str,
        params: Value,
        meta: Map<String, Value>,
    ) -> Result<Value, DispatchFailure> {
        if let Some(local) = action.strip_prefix(self.local_prefix.as_str()) {
            return self.local(local);
        }

        match action {
            "ping.pong" => Ok(json!("pong")),
            "channels.subscribe" => {
                let conn = caller(&meta)?;
                let channel = channel_param(&params)?;
                let added = self.channels.subscribe(&conn, channel);
                Ok(json!({ "channel": channel, "subscribed": added }))
            }
            "channels.unsubscribe" => {
                let conn = caller(&meta)?;
                let channel = channel_param(&params)?;
                let removed = self.channels.unsubscribe(&conn, channel);
                Ok(json!({ "channel": channel, "unsubscribed": removed }))
            }
            "channels.publish" => {
                let conn = caller(&meta)?;
                let channel = channel_param(&params)?;
                let recipients = self.channels.publish(channel, &params["data"], &[conn]);
                Ok(json!({ "channel": channel, "recipients": recipients }))
            }
            "channels.broadcast" => {
                let conn = caller(&meta)?;
                let recipients = self.channels.broadcast(&params["data"], &[conn]);
                Ok(json!({ "recipients": recipients }))
            }
            a if a.starts_with("echo.") => Ok(params),
            other => Err(not_found(other)),
        }
    }
}

fn not_found(action: &str) -> DispatchFailure {
    DispatchFailure::new(format!("action '{action}' is not available"), 404)
        .with_type("ACTION_NOT_FOUND")
}

fn caller(meta: &Map<String, Value>) -> Result<ConnectionId, DispatchFailure> {
    meta.get("websocketId")
        .and_then(Value::as_str)
        .map(ConnectionId::from_raw)
        .ok_or_else(|| DispatchFailure::internal("request metadata has no websocketId"))
}

fn channel_param(params: &Value) -> Result<&str, DispatchFailure> {
    params
        .get("channel")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            DispatchFailure::new("params.channel must be a non-empty string", 400)
                .with_type("INVALID_PARAMS")
        })
}

/// Register the `log` and `commands` middlewares.
pub fn register_middlewares(registry: &MiddlewareRegistry) {
    registry.register("log", |ctx: &mut RequestContext| {
        debug!(action = %ctx.action, conn_id = %ctx.connection_id(), "request");
        Flow::Continue
    });
    registry.register("commands", |ctx: &mut RequestContext| match ctx.action.as_str() {
        "cmd.echo" => {
            let params = ctx.params.clone();
            let _ = ctx.respond(params);
            Flow::Handled
        }
        "cmd.error" => Flow::Abort(MiddlewareError::new("test error")),
        _ => Flow::Continue,
    });
}

/// Routes used when the settings file declares none.
pub fn install_default_routes(routes: &RouteTable) -> Result<(), RouteError> {
    routes.add_route(
        RouteDescriptor::new("*.*")
            .middleware("log")
            .middleware("commands"),
    )?;
    routes.add_route(RouteDescriptor::new("$node.*").middleware("log").local())
}
