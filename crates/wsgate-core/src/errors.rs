//! Gateway error taxonomy and its wire form.
//!
//! Every failure that reaches a client is rendered as an [`ErrorBody`]:
//! a human-readable message, a numeric code, an optional type tag and
//! optional structured data. Transport errors are connection-scoped and
//! never serialised.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Malformed inbound payload.
pub const CODE_BAD_REQUEST: i64 = 400;
/// No route matched the requested action.
pub const CODE_NOT_FOUND: i64 = 404;
/// Middleware abort or unexpected internal failure.
pub const CODE_INTERNAL: i64 = 500;
/// Backend did not answer within the configured timeout.
pub const CODE_TIMEOUT: i64 = 504;

/// Type tag for unparseable request bodies.
pub const TYPE_INVALID_REQUEST_BODY: &str = "INVALID_REQUEST_BODY";
/// Type tag for structurally valid JSON that is not a request.
pub const TYPE_INVALID_REQUEST: &str = "INVALID_REQUEST";
/// Type tag for unknown actions.
pub const TYPE_METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
/// Default type tag for middleware aborts.
pub const TYPE_MIDDLEWARE_ERROR: &str = "MIDDLEWARE_ERROR";
/// Type tag for dispatcher timeouts.
pub const TYPE_REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";

/// Transport error messages that indicate an abrupt but harmless peer exit.
const BENIGN_TRANSPORT_PATTERNS: &[&str] = &[
    "without closing handshake",
    "connection closed normally",
    "trying to work with closed connection",
    "broken pipe",
];

/// Wire-format error object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub message: String,
    /// Numeric code (HTTP-like).
    pub code: i64,
    /// Machine-readable type tag.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Explicit abort raised by a middleware.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct MiddlewareError {
    pub message: String,
    pub kind: Option<String>,
    pub data: Option<Value>,
}

impl MiddlewareError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            data: None,
        }
    }

    #[must_use]
    pub fn with_type(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Failure reported by the backend dispatcher.
///
/// The gateway does not interpret these fields; they are copied onto the
/// wire as-is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct DispatchFailure {
    pub message: String,
    pub code: i64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl DispatchFailure {
    pub fn new(message: impl Into<String>, code: i64) -> Self {
        Self {
            message: message.into(),
            code,
            kind: None,
            data: None,
        }
    }

    /// Internal failure with code 500.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(message, CODE_INTERNAL)
    }

    #[must_use]
    pub fn with_type(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Every way handling a single inbound message can fail.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    /// Payload is not valid JSON or not a JSON object.
    #[error("Invalid request body")]
    Parse { body: String, reason: String },

    /// Valid JSON object without a usable method/action name.
    #[error("Request is missing a method name")]
    MissingMethod,

    /// Routes are configured and none matched.
    #[error("Method '{0}' not found")]
    RouteNotFound(String),

    /// A middleware aborted the chain.
    #[error("{0}")]
    Middleware(#[from] MiddlewareError),

    /// The backend action failed.
    #[error("{0}")]
    Dispatch(#[from] DispatchFailure),

    /// The backend call exceeded the configured timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Socket-level failure scoped to one connection.
    #[error("transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    /// Numeric code placed on the wire.
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse { .. } | Self::MissingMethod => CODE_BAD_REQUEST,
            Self::RouteNotFound(_) => CODE_NOT_FOUND,
            Self::Middleware(_) | Self::Transport(_) => CODE_INTERNAL,
            Self::Dispatch(failure) => failure.code,
            Self::Timeout(_) => CODE_TIMEOUT,
        }
    }

    /// Optional type tag placed on the wire.
    pub fn error_type(&self) -> Option<String> {
        match self {
            Self::Parse { .. } => Some(TYPE_INVALID_REQUEST_BODY.to_owned()),
            Self::MissingMethod => Some(TYPE_INVALID_REQUEST.to_owned()),
            Self::RouteNotFound(_) => Some(TYPE_METHOD_NOT_FOUND.to_owned()),
            Self::Middleware(err) => Some(
                err.kind
                    .clone()
                    .unwrap_or_else(|| TYPE_MIDDLEWARE_ERROR.to_owned()),
            ),
            Self::Dispatch(failure) => failure.kind.clone(),
            Self::Timeout(_) => Some(TYPE_REQUEST_TIMEOUT.to_owned()),
            Self::Transport(_) => None,
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse",
            Self::MissingMethod => "missing_method",
            Self::RouteNotFound(_) => "route_not_found",
            Self::Middleware(_) => "middleware",
            Self::Dispatch(_) => "dispatch",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
        }
    }

    /// Whether a transport error is an expected peer disconnect that should
    /// only be logged as a warning.
    pub fn is_benign_transport(&self) -> bool {
        match self {
            Self::Transport(message) => {
                let lower = message.to_ascii_lowercase();
                BENIGN_TRANSPORT_PATTERNS.iter().any(|p| lower.contains(p))
            }
            _ => false,
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> ErrorBody {
        let data = match self {
            Self::Parse { body, reason } => Some(json!({ "body": body, "error": reason })),
            Self::RouteNotFound(action) => Some(json!({ "action": action })),
            Self::Middleware(err) => err.data.clone(),
            Self::Dispatch(failure) => failure.data.clone(),
            Self::MissingMethod | Self::Timeout(_) | Self::Transport(_) => None,
        };
        ErrorBody {
            message: self.to_string(),
            code: self.code(),
            kind: self.error_type(),
            data,
        }
    }
}
