//! deno_core op definitions for the cascade sandbox.
//!
//! The `#[op2]` macro generates additional public items that cannot carry doc
//! comments, so `missing_docs` is relaxed for this module.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;
use tokio::sync::watch;

use crate::{FetchDispatcher, FetchRequest, ScriptLogLevel, ScriptLogSink};

/// Per-execution budget for `fetch` calls.
pub struct FetchLimits {
    /// Maximum number of calls allowed.
    pub max_calls: usize,
    /// Calls made so far.
    pub calls_made: usize,
}

/// The serialized `{ok}` / `{error}` envelope, first writer wins.
pub struct ExecutionResult(pub String);

/// Flips to `true` once the script has settled. Pending timers observe it and
/// resolve early so the event loop can drain.
pub struct ExecutionSettled(pub watch::Sender<bool>);

impl Default for ExecutionSettled {
    fn default() -> Self {
        Self(watch::channel(false).0)
    }
}

/// Forward one rendered log line to the configured sink.
#[op2(fast)]
pub fn op_cascade_log(state: &mut OpState, #[string] level: &str, #[string] msg: &str) {
    let sink = state.borrow::<Arc<dyn ScriptLogSink>>();
    sink.log(ScriptLogLevel::from_name(level), msg);
}

/// Store the execution envelope and release pending timers.
#[op2(fast)]
pub fn op_cascade_set_result(state: &mut OpState, #[string] json: &str) {
    if state.try_borrow::<ExecutionResult>().is_none() {
        state.put(ExecutionResult(json.to_string()));
    }
    if let Some(settled) = state.try_borrow::<ExecutionSettled>() {
        settled.0.send_replace(true);
    }
}

/// Issue an outbound request through the host's [`FetchDispatcher`].
///
/// Enforces the per-execution call budget held in [`FetchLimits`].
#[op2(async)]
#[string]
pub async fn op_cascade_fetch(
    op_state: Rc<RefCell<OpState>>,
    #[string] request_json: String,
) -> Result<String, JsErrorBox> {
    {
        let mut st = op_state.borrow_mut();
        let limits = st.borrow_mut::<FetchLimits>();
        if limits.calls_made >= limits.max_calls {
            return Err(JsErrorBox::generic(format!(
                "fetch limit exceeded (max {} calls per execution)",
                limits.max_calls
            )));
        }
        limits.calls_made += 1;
    }

    let request: FetchRequest = serde_json::from_str(&request_json)
        .map_err(|e| JsErrorBox::type_error(format!("invalid fetch request: {e}")))?;

    tracing::debug!(url = %request.url, method = %request.method, "script fetch dispatched");

    let dispatcher = {
        let st = op_state.borrow();
        st.borrow::<Arc<dyn FetchDispatcher>>().clone()
    };

    let response = dispatcher
        .fetch(request)
        .await
        .map_err(|e| JsErrorBox::type_error(format!("fetch failed: {e}")))?;

    serde_json::to_string(&response)
        .map_err(|e| JsErrorBox::generic(format!("response serialization failed: {e}")))
}

/// Sleep for a timer. Resolves `true` when the delay elapsed and `false` when
/// the script settled first.
#[op2(async)]
pub async fn op_cascade_sleep(op_state: Rc<RefCell<OpState>>, #[smi] millis: u32) -> bool {
    let mut settled = op_state.borrow().borrow::<ExecutionSettled>().0.subscribe();
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(u64::from(millis))) => true,
        _ = settled.wait_for(|done| *done) => false,
    }
}

deno_core::extension!(
    cascade_ext,
    ops = [
        op_cascade_log,
        op_cascade_set_result,
        op_cascade_fetch,
        op_cascade_sleep
    ],
);
