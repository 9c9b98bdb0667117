//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `GET /metrics`. Call once at startup,
/// before any metric is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Upgrades refused by the connection limit (counter).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "ws_connections_rejected_total";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Transport errors (counter, labels: benign).
pub const WS_TRANSPORT_ERRORS_TOTAL: &str = "ws_transport_errors_total";
/// Inbound messages (counter).
pub const GATEWAY_MESSAGES_TOTAL: &str = "gateway_messages_total";
/// Requests that ended in an error envelope (counter, labels: kind).
pub const GATEWAY_ERRORS_TOTAL: &str = "gateway_errors_total";
/// Backend call duration (histogram, labels: route pattern or "passthrough").
pub const GATEWAY_DISPATCH_DURATION_SECONDS: &str = "gateway_dispatch_duration_seconds";
/// Backend calls that exceeded the configured timeout (counter).
pub const GATEWAY_DISPATCH_TIMEOUTS_TOTAL: &str = "gateway_dispatch_timeouts_total";
/// Frames delivered by publish/broadcast (counter).
pub const CHANNEL_DELIVERIES_TOTAL: &str = "channel_deliveries_total";
/// Frames dropped because a send queue was full (counter).
pub const CHANNEL_DROPS_TOTAL: &str = "channel_drops_total";
/// Live channels (gauge).
pub const CHANNELS_ACTIVE: &str = "channels_active";
/// Keep-alive probes sent (counter).
pub const KEEPALIVE_PROBES_TOTAL: &str = "keepalive_probes_total";
/// Connections closed for unanswered probes (counter).
pub const KEEPALIVE_EVICTIONS_TOTAL: &str = "keepalive_evictions_total";
/// Keep-alive sweep duration (histogram).
pub const KEEPALIVE_SWEEP_DURATION_SECONDS: &str = "keepalive_sweep_duration_seconds";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_names_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTIONS_REJECTED_TOTAL,
            WS_CONNECTION_DURATION_SECONDS,
            WS_TRANSPORT_ERRORS_TOTAL,
            GATEWAY_MESSAGES_TOTAL,
            GATEWAY_ERRORS_TOTAL,
            GATEWAY_DISPATCH_DURATION_SECONDS,
            GATEWAY_DISPATCH_TIMEOUTS_TOTAL,
            CHANNEL_DELIVERIES_TOTAL,
            CHANNEL_DROPS_TOTAL,
            CHANNELS_ACTIVE,
            KEEPALIVE_PROBES_TOTAL,
            KEEPALIVE_EVICTIONS_TOTAL,
            KEEPALIVE_SWEEP_DURATION_SECONDS,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
