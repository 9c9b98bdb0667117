//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a settings file only needs the
//! keys it overrides.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Keep-alive prober settings.
    pub keep_alive: KeepAliveSettings,
    /// Backend dispatch settings.
    pub dispatch: DispatchSettings,
    /// Service-wide middleware names, run before any route middleware.
    pub middlewares: Vec<String>,
    /// Ordered route list. Empty means every action passes through.
    pub routes: Vec<RouteSettings>,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl GatewaySettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.keep_alive.ping_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "keepAlive.pingIntervalMs must be greater than 0".into(),
            ));
        }
        if self.keep_alive.max_simultaneous_pings == 0 {
            return Err(SettingsError::InvalidValue(
                "keepAlive.maxSimultaneousPings must be greater than 0".into(),
            ));
        }
        if !self.server.path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server.path must start with '/', got {:?}",
                self.server.path
            )));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be greater than 0".into(),
            ));
        }
        if let Some(pos) = self.routes.iter().position(|r| r.action.is_empty()) {
            return Err(SettingsError::InvalidValue(format!(
                "routes[{pos}].action must not be empty"
            )));
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// TCP port (0 auto-assigns).
    pub port: u16,
    /// HTTP path accepting the WebSocket upgrade.
    pub path: String,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound frame queue per connection.
    pub send_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            path: "/".to_string(),
            max_connections: 10_000,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            send_queue_capacity: 1024,
        }
    }
}

/// Keep-alive prober settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeepAliveSettings {
    /// Whether the prober runs at all.
    pub enabled: bool,
    /// Idle time before a connection is probed, in milliseconds.
    pub ping_interval_ms: u64,
    /// Probes sent before a pacing pause.
    pub max_simultaneous_pings: usize,
    /// Pacing pause between probe batches, in milliseconds.
    pub delay_between_pings_ms: u64,
    /// Subtracted from a probed connection's activity stamp, in milliseconds.
    pub compensation_ms: u64,
    /// Unanswered probes before the connection is closed (0 disables).
    pub max_missed_probes: u32,
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ping_interval_ms: 30_000,
            max_simultaneous_pings: 2000,
            delay_between_pings_ms: 1000,
            compensation_ms: 250,
            max_missed_probes: 3,
        }
    }
}

impl KeepAliveSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn delay_between_pings(&self) -> Duration {
        Duration::from_millis(self.delay_between_pings_ms)
    }

    pub fn compensation(&self) -> Duration {
        Duration::from_millis(self.compensation_ms)
    }
}

/// Backend dispatch settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchSettings {
    /// Per-call timeout in milliseconds (0 waits forever).
    pub request_timeout_ms: u64,
    /// Prefix added to the action name of `local` routes.
    pub local_action_prefix: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 0,
            local_action_prefix: "$local.".to_string(),
        }
    }
}

impl DispatchSettings {
    /// `None` when no timeout is configured.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

/// One route descriptor as written in a settings file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteSettings {
    /// Literal action, glob with `*` segments, or a `^`-anchored regex.
    pub action: String,
    /// Middleware names resolved against the middleware registry.
    pub middlewares: Vec<String>,
    /// Dispatch to a process-internal action.
    pub local: bool,
    /// Do not wait for the backend result.
    #[serde(rename = "async")]
    pub is_async: bool,
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`RUST_LOG` takes precedence).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Per-module level overrides.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}
