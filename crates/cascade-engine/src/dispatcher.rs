//! Ordered, fail-fast batch execution.

use std::sync::Arc;

use cascade_sandbox::{FetchDispatcher, SandboxExecutor};
use serde_json::{json, Value};

use crate::action::{decode_batch, Action, PlannedAction};
use crate::error::BatchError;
use crate::forward::HttpForwarder;

/// Default cap on a single action's `repeat`.
pub const DEFAULT_MAX_REPEAT: u64 = 1000;

/// Runs batches of actions.
///
/// Actions and their repeats run one at a time in input order, so result
/// `i` always belongs to the `i`-th expanded action. A sandbox or forward
/// failure stops the batch; unknown kinds are recorded and skipped.
pub struct ActionDispatcher {
    sandbox: Arc<SandboxExecutor>,
    transport: Arc<dyn FetchDispatcher>,
    forwarder: HttpForwarder,
    max_repeat: u64,
}

impl ActionDispatcher {
    /// Create a dispatcher. `transport` serves both `http` actions and script `fetch` calls.
    pub fn new(sandbox: Arc<SandboxExecutor>, transport: Arc<dyn FetchDispatcher>) -> Self {
        Self {
            sandbox,
            forwarder: HttpForwarder::new(transport.clone()),
            transport,
            max_repeat: DEFAULT_MAX_REPEAT,
        }
    }

    /// Override the per-action repeat cap.
    pub fn with_max_repeat(mut self, max_repeat: u64) -> Self {
        self.max_repeat = max_repeat;
        self
    }

    /// Decode and run a raw JSON batch.
    pub async fn process_batch(&self, batch: &Value) -> Result<Vec<Value>, BatchError> {
        let plan = decode_batch(batch, self.max_repeat)?;
        self.execute(&plan).await
    }

    /// Run an already decoded batch.
    pub async fn execute(&self, plan: &[PlannedAction]) -> Result<Vec<Value>, BatchError> {
        let expanded: u64 = plan.iter().map(|p| p.repeat).sum();
        tracing::info!(actions = plan.len(), expanded, "processing batch");

        let mut results = Vec::with_capacity(usize::try_from(expanded).unwrap_or(0));
        for (index, planned) in plan.iter().enumerate() {
            for iteration in 0..planned.repeat {
                let value = self.run_one(index, iteration, &planned.action).await?;
                results.push(value);
            }
        }

        tracing::info!(results = results.len(), "batch complete");
        Ok(results)
    }

    async fn run_one(
        &self,
        index: usize,
        iteration: u64,
        action: &Action,
    ) -> Result<Value, BatchError> {
        match action {
            Action::Code(code) => {
                tracing::debug!(index, iteration, "running code action");
                self.sandbox
                    .run(&code.source, self.transport.clone())
                    .await
                    .map_err(|e| {
                        tracing::error!(index, iteration, error = %e, "code action failed");
                        BatchError::Execution(e)
                    })
            }
            Action::Http(http) => {
                tracing::debug!(index, iteration, url = %http.url, "running http action");
                self.forwarder.forward(http).await.map_err(|e| {
                    tracing::error!(
                        index,
                        iteration,
                        code = e.code(),
                        retryable = e.retryable(),
                        error = %e,
                        "http action failed"
                    );
                    BatchError::Forward(e)
                })
            }
            Action::Unknown { kind } => {
                let message = format!("Unknown action type: {kind}");
                tracing::warn!(index, iteration, "{}", message);
                Ok(json!({ "error": message }))
            }
        }
    }
}
