//! WebSocket gateway server.
//!
//! Inbound frames flow through [`dispatcher::MessageDispatcher`]: parse,
//! resolve against the [`routes::RouteTable`], run the
//! [`middleware::Pipeline`], then call the [`backend::Backend`]. Channel
//! fan-out goes through [`channels::ChannelRegistry`], and idle peers are
//! probed by [`keepalive::KeepAlive`]. All three share one
//! [`registry::Registry`].

#![deny(unsafe_code)]

pub mod backend;
pub mod channels;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod health;
pub mod keepalive;
pub mod manager;
pub mod metrics;
pub mod middleware;
pub mod registry;
pub mod routes;
pub mod server;
pub mod session;
pub mod shutdown;

pub use backend::{Backend, TimeoutBackend};
pub use channels::ChannelRegistry;
pub use connection::{ClientConnection, OutboundFrame};
pub use context::RequestContext;
pub use dispatcher::{DispatchOutcome, MessageDispatcher};
pub use keepalive::{KeepAlive, KeepAliveConfig, SweepStats};
pub use manager::ConnectionManager;
pub use middleware::{Flow, Middleware, MiddlewareRef, MiddlewareRegistry, Pipeline, PipelineOutcome};
pub use registry::Registry;
pub use routes::{ActionMatcher, Resolution, Route, RouteDescriptor, RouteError, RouteTable};
pub use server::{AppState, GatewayServer, ServerError};
pub use shutdown::ShutdownCoordinator;
