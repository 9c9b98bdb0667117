//! # wsgate-core
//!
//! Types shared by every wsgate crate:
//!
//! - [`ids`]: opaque connection identities
//! - [`protocol`]: inbound request parsing and outbound response envelopes
//! - [`errors`]: the gateway error taxonomy and its wire representation

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod protocol;

pub use errors::{DispatchFailure, ErrorBody, GatewayError, MiddlewareError};
pub use ids::ConnectionId;
pub use protocol::{Correlation, Dialect, InboundRequest, Outcome, ParseFailure, ResponseEnvelope};
