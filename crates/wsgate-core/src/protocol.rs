//! Wire protocol: inbound request parsing and outbound response framing.
//!
//! Two request dialects are accepted:
//!
//! | Dialect | Request | Correlation echoed as |
//! |---------|---------|-----------------------|
//! | RPC | `{"method", "params", "id"?}` | `"id"` (defaults to `0`) |
//! | Action | `{"action", "params", "transaction"?}` | `"transaction"` (omitted when absent) |
//!
//! Responses are `{<correlation>, "result": ...}` or
//! `{<correlation>, "error": {message, code, type?, data?}}`.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::errors::{ErrorBody, GatewayError};

/// Longest raw body echoed back inside a parse error.
const MAX_ECHOED_BODY: usize = 1024;

/// Which request shape the client used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Dialect {
    /// `{method, params, id}`.
    #[default]
    Rpc,
    /// `{action, params, transaction}`.
    Action,
}

/// Client-supplied correlation marker, echoed on the response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Correlation {
    pub dialect: Dialect,
    pub value: Option<Value>,
}

impl Correlation {
    /// RPC-dialect correlation with the given id.
    pub fn id(value: Value) -> Self {
        Self {
            dialect: Dialect::Rpc,
            value: Some(value),
        }
    }

    /// Action-dialect correlation with the given transaction marker.
    pub fn transaction(value: Value) -> Self {
        Self {
            dialect: Dialect::Action,
            value: Some(value),
        }
    }

    /// The value as it will appear in metadata (`null` when absent).
    pub fn as_value(&self) -> Value {
        self.value.clone().unwrap_or(Value::Null)
    }

    fn write_into<M: SerializeMap>(&self, map: &mut M) -> Result<(), M::Error> {
        match self.dialect {
            Dialect::Rpc => {
                let id = self.value.clone().unwrap_or_else(|| Value::from(0));
                map.serialize_entry("id", &id)
            }
            Dialect::Action => match &self.value {
                Some(value) => map.serialize_entry("transaction", value),
                None => Ok(()),
            },
        }
    }
}

/// A parsed inbound request.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundRequest {
    /// Action name to resolve against the route table.
    pub method: String,
    /// Parameters (`{}` when omitted or null).
    pub params: Value,
    /// Correlation marker to echo on the response.
    pub correlation: Correlation,
}

/// Why a raw message could not become an [`InboundRequest`].
#[derive(Clone, Debug)]
pub struct ParseFailure {
    pub error: GatewayError,
    /// Whatever correlation could be recovered before the failure.
    pub correlation: Correlation,
}

impl ParseFailure {
    /// The error envelope to send back to the client.
    pub fn envelope(&self) -> ResponseEnvelope {
        ResponseEnvelope::failure(self.correlation.clone(), &self.error)
    }
}

impl InboundRequest {
    /// Parse a raw text frame.
    pub fn parse(raw: &str) -> Result<Self, ParseFailure> {
        let value: Value = serde_json::from_str(raw).map_err(|e| ParseFailure {
            error: GatewayError::Parse {
                body: truncate(raw, MAX_ECHOED_BODY),
                reason: e.to_string(),
            },
            correlation: Correlation::default(),
        })?;

        let Value::Object(mut obj) = value else {
            return Err(ParseFailure {
                error: GatewayError::Parse {
                    body: truncate(raw, MAX_ECHOED_BODY),
                    reason: "request must be a JSON object".into(),
                },
                correlation: Correlation::default(),
            });
        };

        let (dialect, method) = match (obj.remove("method"), obj.remove("action")) {
            (Some(method), _) => (Dialect::Rpc, method),
            (None, Some(action)) => (Dialect::Action, action),
            (None, None) => (Dialect::Rpc, Value::Null),
        };

        let correlation = Correlation {
            dialect,
            value: match dialect {
                Dialect::Rpc => obj.remove("id"),
                Dialect::Action => obj.remove("transaction"),
            }
            .filter(|v| !v.is_null()),
        };

        let method = match method {
            Value::String(s) if !s.is_empty() => s,
            _ => {
                return Err(ParseFailure {
                    error: GatewayError::MissingMethod,
                    correlation,
                })
            }
        };

        let params = match obj.remove("params") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(p) => p,
        };

        Ok(Self {
            method,
            params,
            correlation,
        })
    }
}

fn truncate(raw: &str, max: usize) -> String {
    if raw.len() <= max {
        return raw.to_owned();
    }
    let mut end = max;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].to_owned()
}

/// Outcome payload of a response.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(ErrorBody),
}

/// A response frame addressed to one connection.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseEnvelope {
    pub correlation: Correlation,
    pub outcome: Outcome,
}

impl ResponseEnvelope {
    pub fn success(correlation: Correlation, result: Value) -> Self {
        Self {
            correlation,
            outcome: Outcome::Result(result),
        }
    }

    pub fn failure(correlation: Correlation, error: &GatewayError) -> Self {
        Self {
            correlation,
            outcome: Outcome::Error(error.to_error_body()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    /// Serialize to the text frame sent on the socket.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"id":0,"error":{{"message":"failed to serialize response: {e}","code":500}}}}"#)
        })
    }
}

impl Serialize for ResponseEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        self.correlation.write_into(&mut map)?;
        match &self.outcome {
            Outcome::Result(value) => map.serialize_entry("result", value)?,
            Outcome::Error(body) => map.serialize_entry("error", body)?,
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parse_rpc_request() {
        let req = InboundRequest::parse(r#"{"method":"ping.pong","params":{"a":1},"id":1}"#).unwrap();
        assert_eq!(req.method, "ping.pong");
        assert_eq!(req.params["a"], 1);
        assert_eq!(req.correlation, Correlation::id(json!(1)));
    }

    #[test]
    fn parse_action_request() {
        let req =
            InboundRequest::parse(r#"{"action":"users.list","transaction":"tx-9"}"#).unwrap();
        assert_eq!(req.method, "users.list");
        assert_eq!(req.params, json!({}));
        assert_eq!(req.correlation, Correlation::transaction(json!("tx-9")));
    }

    #[test]
    fn method_wins_over_action() {
        let req = InboundRequest::parse(r#"{"method":"a.b","action":"c.d","id":"x"}"#).unwrap();
        assert_eq!(req.method, "a.b");
        assert_eq!(req.correlation.dialect, Dialect::Rpc);
    }

    #[test]
    fn null_params_become_empty_object() {
        let req = InboundRequest::parse(r#"{"method":"a.b","params":null}"#).unwrap();
        assert_eq!(req.params, json!({}));
    }

    #[test]
    fn malformed_json_is_parse_error_with_default_id() {
        let failure = InboundRequest::parse("{not json").unwrap_err();
        assert_matches!(failure.error, GatewayError::Parse { .. });
        let wire = serde_json::to_value(failure.envelope()).unwrap();
        assert_eq!(wire["id"], 0);
        assert_eq!(wire["error"]["code"], 400);
        assert_eq!(wire["error"]["data"]["body"], "{not json");
    }

    #[test]
    fn non_object_is_parse_error() {
        let failure = InboundRequest::parse("[1,2,3]").unwrap_err();
        assert_matches!(failure.error, GatewayError::Parse { .. });
    }

    #[test]
    fn missing_method_keeps_correlation() {
        let failure = InboundRequest::parse(r#"{"params":{},"id":7}"#).unwrap_err();
        assert_matches!(failure.error, GatewayError::MissingMethod);
        let wire = serde_json::to_value(failure.envelope()).unwrap();
        assert_eq!(wire["id"], 7);
        assert_eq!(wire["error"]["code"], 400);
    }

    #[test]
    fn non_string_method_is_missing_method() {
        let failure = InboundRequest::parse(r#"{"method":42}"#).unwrap_err();
        assert_matches!(failure.error, GatewayError::MissingMethod);
    }

    #[test]
    fn success_envelope_echoes_id() {
        let env = ResponseEnvelope::success(Correlation::id(json!(1)), json!({"pong": true}));
        let wire: Value = serde_json::from_str(&env.to_text()).unwrap();
        assert_eq!(wire, json!({"id": 1, "result": {"pong": true}}));
    }

    #[test]
    fn success_envelope_echoes_transaction() {
        let env = ResponseEnvelope::success(Correlation::transaction(json!("t1")), json!(5));
        let wire: Value = serde_json::from_str(&env.to_text()).unwrap();
        assert_eq!(wire, json!({"transaction": "t1", "result": 5}));
    }

    #[test]
    fn action_dialect_without_transaction_omits_marker() {
        let corr = Correlation {
            dialect: Dialect::Action,
            value: None,
        };
        let wire = serde_json::to_value(ResponseEnvelope::success(corr, json!(null))).unwrap();
        assert!(wire.get("transaction").is_none());
        assert!(wire.get("id").is_none());
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundary() {
        let raw = "é".repeat(MAX_ECHOED_BODY);
        let failure = InboundRequest::parse(&raw).unwrap_err();
        let GatewayError::Parse { body, .. } = failure.error else {
            panic!("expected parse error");
        };
        assert!(body.len() <= MAX_ECHOED_BODY);
    }
}
