//! Per-call timeout wrapper for fetch dispatchers.

use std::sync::Arc;
use std::time::Duration;

use cascade_error::ForwardError;
use cascade_sandbox::{FetchDispatcher, FetchRequest, FetchResponse};

/// A [`FetchDispatcher`] that enforces a per-call timeout on the inner dispatcher.
pub struct TimeoutFetcher {
    inner: Arc<dyn FetchDispatcher>,
    timeout: Duration,
}

impl TimeoutFetcher {
    /// Wrap an inner dispatcher with a per-call timeout.
    pub fn new(inner: Arc<dyn FetchDispatcher>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait::async_trait]
impl FetchDispatcher for TimeoutFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ForwardError> {
        let url = request.url.clone();
        match tokio::time::timeout(self.timeout, self.inner.fetch(request)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ForwardError::Timeout {
                url,
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}
