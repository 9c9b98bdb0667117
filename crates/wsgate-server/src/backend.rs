//! Backend dispatcher boundary.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde_json::{Map, Value};
use tracing::warn;
use wsgate_core::{DispatchFailure, GatewayError};

use crate::metrics::GATEWAY_DISPATCH_TIMEOUTS_TOTAL;

/// Executes named actions on behalf of the gateway.
///
/// The gateway never inspects `params`, the result, or the failure
/// payload; it only copies them between the wire and this trait.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn call(
        &self,
        action: &str,
        params: Value,
        meta: Map<String, Value>,
    ) -> Result<Value, DispatchFailure>;
}

#[async_trait]
impl<B: Backend + ?Sized> Backend for Arc<B> {
    async fn call(
        &self,
        action: &str,
        params: Value,
        meta: Map<String, Value>,
    ) -> Result<Value, DispatchFailure> {
        (**self).call(action, params, meta).await
    }
}

/// Wraps a backend and fails calls that run longer than `timeout` with a
/// 504 `REQUEST_TIMEOUT` failure.
pub struct TimeoutBackend<B> {
    inner: B,
    timeout: Duration,
}

impl<B: Backend> TimeoutBackend<B> {
    pub fn new(inner: B, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl<B: Backend> Backend for TimeoutBackend<B> {
    async fn call(
        &self,
        action: &str,
        params: Value,
        meta: Map<String, Value>,
    ) -> Result<Value, DispatchFailure> {
        match tokio::time::timeout(self.timeout, self.inner.call(action, params, meta)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                counter!(GATEWAY_DISPATCH_TIMEOUTS_TOTAL).increment(1);
                warn!(action, timeout = ?self.timeout, "backend call timed out");
                Err(timeout_failure(self.timeout))
            }
        }
    }
}

fn timeout_failure(timeout: Duration) -> DispatchFailure {
    let body = GatewayError::Timeout(timeout).to_error_body();
    DispatchFailure {
        message: body.message,
        code: body.code,
        kind: body.kind,
        data: body.data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Sleepy(Duration);

    #[async_trait]
    impl Backend for Sleepy {
        async fn call(
            &self,
            action: &str,
            _params: Value,
            _meta: Map<String, Value>,
        ) -> Result<Value, DispatchFailure> {
            tokio::time::sleep(self.0).await;
            Ok(json!({ "action": action }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fast_call_passes_through() {
        let backend = TimeoutBackend::new(Sleepy(Duration::from_millis(10)), Duration::from_secs(1));
        let result = backend.call("ping.pong", json!({}), Map::new()).await.unwrap();
        assert_eq!(result["action"], "ping.pong");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_with_504() {
        let backend = TimeoutBackend::new(Sleepy(Duration::from_secs(30)), Duration::from_secs(2));
        let failure = backend.call("slow.op", json!({}), Map::new()).await.unwrap_err();
        assert_eq!(failure.code, 504);
        assert_eq!(failure.kind.as_deref(), Some("REQUEST_TIMEOUT"));
    }

    #[tokio::test]
    async fn arc_dyn_backend_delegates() {
        let backend: Arc<dyn Backend> = Arc::new(Sleepy(Duration::ZERO));
        let result = backend.call("a.b", json!(null), Map::new()).await.unwrap();
        assert_eq!(result["action"], "a.b");
    }
}
