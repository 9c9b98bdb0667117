//! Per-message request context handed to middlewares and the backend.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use wsgate_core::{ConnectionId, Correlation, GatewayError, InboundRequest, ResponseEnvelope};

use crate::connection::ClientConnection;
use crate::routes::Route;

/// Metadata key carrying the client correlation value.
pub const META_ID: &str = "id";
/// Metadata key carrying the RFC 3339 arrival time.
pub const META_ARRIVED_AT: &str = "arrivedAt";
/// Metadata key carrying the originating connection ID.
pub const META_WEBSOCKET_ID: &str = "websocketId";
/// Metadata key set on dispatches through `local` routes.
pub const META_LOCAL: &str = "local";

/// One inbound request on its way through the pipeline.
///
/// Middlewares may rewrite `params` and add `meta` entries; whatever is in
/// `meta` when the chain completes is forwarded to the backend.
pub struct RequestContext {
    pub action: String,
    pub params: Value,
    pub meta: Map<String, Value>,
    /// `None` when the route table is empty.
    pub route: Option<Arc<Route>>,
    connection: Arc<ClientConnection>,
    correlation: Correlation,
    responded: bool,
}

impl RequestContext {
    pub fn new(
        connection: Arc<ClientConnection>,
        request: InboundRequest,
        route: Option<Arc<Route>>,
    ) -> Self {
        let mut meta = Map::new();
        let _ = meta.insert(META_ID.into(), request.correlation.as_value());
        let _ = meta.insert(
            META_ARRIVED_AT.into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        let _ = meta.insert(
            META_WEBSOCKET_ID.into(),
            Value::String(connection.id.to_string()),
        );
        Self {
            action: request.method,
            params: request.params,
            meta,
            route,
            connection,
            correlation: request.correlation,
            responded: false,
        }
    }

    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection.id
    }

    pub fn correlation(&self) -> &Correlation {
        &self.correlation
    }

    /// Answer the client directly with a result.
    ///
    /// A request is answered at most once: after the first response this
    /// returns `false` without writing anything.
    pub fn respond(&mut self, result: Value) -> bool {
        if self.responded {
            return false;
        }
        self.responded = true;
        self.connection
            .send_envelope(&ResponseEnvelope::success(self.correlation.clone(), result))
    }

    /// Answer the client directly with an error envelope.
    pub fn respond_error(&mut self, error: &GatewayError) -> bool {
        if self.responded {
            return false;
        }
        self.responded = true;
        self.connection
            .send_envelope(&ResponseEnvelope::failure(self.correlation.clone(), error))
    }

    /// Whether anything has been written back for this request.
    pub fn has_responded(&self) -> bool {
        self.responded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::OutboundFrame;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn make_context(raw: &str) -> (RequestContext, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(8);
        let conn = Arc::new(ClientConnection::new(ConnectionId::from_raw("ws_ctx"), tx));
        let request = InboundRequest::parse(raw).unwrap();
        (RequestContext::new(conn, request, None), rx)
    }

    fn next_json(rx: &mut mpsc::Receiver<OutboundFrame>) -> Value {
        match rx.try_recv().unwrap() {
            OutboundFrame::Text(t) => serde_json::from_str(&t).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn metadata_carries_id_arrival_and_connection() {
        let (ctx, _rx) = make_context(r#"{"method":"a.b","id":"req-1"}"#);
        assert_eq!(ctx.meta[META_ID], "req-1");
        assert_eq!(ctx.meta[META_WEBSOCKET_ID], "ws_ctx");
        let arrived = ctx.meta[META_ARRIVED_AT].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(arrived).is_ok());
    }

    #[test]
    fn missing_id_is_null_in_metadata() {
        let (ctx, _rx) = make_context(r#"{"method":"a.b"}"#);
        assert!(ctx.meta[META_ID].is_null());
    }

    #[test]
    fn respond_echoes_correlation() {
        let (mut ctx, mut rx) = make_context(r#"{"action":"cmd.echo","params":{"x":1},"transaction":9}"#);
        assert!(!ctx.has_responded());
        let params = ctx.params.clone();
        assert!(ctx.respond(params));
        assert!(ctx.has_responded());
        assert_eq!(next_json(&mut rx), json!({"transaction": 9, "result": {"x": 1}}));
    }

    #[test]
    fn respond_error_uses_error_envelope() {
        let (mut ctx, mut rx) = make_context(r#"{"method":"a.b","id":4}"#);
        let _ = ctx.respond_error(&GatewayError::RouteNotFound("a.b".into()));
        let wire = next_json(&mut rx);
        assert_eq!(wire["id"], 4);
        assert_eq!(wire["error"]["code"], 404);
    }

    #[test]
    fn second_answer_is_refused() {
        let (mut ctx, mut rx) = make_context(r#"{"method":"a.b","id":2}"#);
        assert!(ctx.respond(json!(1)));
        assert!(!ctx.respond(json!(2)));
        assert!(!ctx.respond_error(&GatewayError::RouteNotFound("a.b".into())));
        assert_eq!(next_json(&mut rx), json!({"id": 2, "result": 1}));
        assert!(rx.try_recv().is_err());
    }
}
