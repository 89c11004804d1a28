#![warn(missing_docs)]

//! # cascade-sandbox
//!
//! V8 sandbox for `code` actions.
//!
//! Runs a script body in a fresh deno_core isolate with no filesystem, module,
//! or environment access. The only bridges to the host are explicitly
//! registered ops: a log sink ([`ScriptLogSink`]), outbound HTTP through a
//! [`FetchDispatcher`], and timers.
//!
//! ## Isolation model
//!
//! - **Fresh runtime per call**: nothing a script defines survives into the next one
//! - **No ambient capabilities**: `Deno`, `eval` and function constructors are removed
//! - **Pre-execution validation**: obvious escape attempts are rejected before V8 starts
//! - **Deadline enforcement**: a watchdog terminates V8 even inside CPU-bound loops
//! - **Bounded resources**: heap, code size, output size, fetch count, concurrent isolates

pub mod error;
pub mod executor;
pub mod host;
pub mod ipc;
pub mod ops;
pub mod validator;

use std::collections::BTreeMap;

use cascade_error::ForwardError;
use serde::{Deserialize, Serialize};

pub use error::SandboxError;
pub use executor::{ExecutionMode, SandboxConfig, SandboxExecutor};

/// One outbound HTTP request issued by a script's `fetch` call or a forwarded action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Absolute target URL.
    pub url: String,
    /// HTTP method, upper case.
    pub method: String,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Raw request body. `None` sends no body.
    #[serde(default)]
    pub body: Option<String>,
}

/// The response to a [`FetchRequest`], fully buffered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Canonical reason phrase, empty when unknown.
    #[serde(default)]
    pub status_text: String,
    /// Response headers, lower-cased names.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Final URL after redirects.
    #[serde(default)]
    pub url: String,
    /// Response body decoded as UTF-8 (lossy).
    #[serde(default)]
    pub body: String,
}

/// Outbound HTTP capability handed to scripts and to the HTTP forwarder.
///
/// Only transport-level failures are errors; any HTTP status is a valid response.
#[async_trait::async_trait]
pub trait FetchDispatcher: Send + Sync {
    /// Perform one request.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ForwardError>;
}

/// Severity of a script log call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLogLevel {
    /// `logger.debug`, `console.debug`
    Debug,
    /// `logger.info`, `console.log`, `console.info`
    Info,
    /// `logger.warn`, `console.warn`
    Warn,
    /// `logger.error`, `console.error`
    Error,
}

impl ScriptLogLevel {
    /// Parse the level name passed from the bootstrap script; unknown names map to `Info`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "debug" => ScriptLogLevel::Debug,
            "warn" => ScriptLogLevel::Warn,
            "error" => ScriptLogLevel::Error,
            _ => ScriptLogLevel::Info,
        }
    }
}

/// Where script log lines go.
pub trait ScriptLogSink: Send + Sync {
    /// Record one rendered log line.
    fn log(&self, level: ScriptLogLevel, message: &str);
}

/// Tracing target for script output.
pub const SCRIPT_LOG_TARGET: &str = "cascade::sandbox::script";

/// Emits script output as `tracing` events on the current thread.
///
/// Events pick up whatever transaction scope is active where they are emitted.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl ScriptLogSink for TracingLogSink {
    fn log(&self, level: ScriptLogLevel, message: &str) {
        match level {
            ScriptLogLevel::Debug => tracing::debug!(target: SCRIPT_LOG_TARGET, "{}", message),
            ScriptLogLevel::Info => tracing::info!(target: SCRIPT_LOG_TARGET, "{}", message),
            ScriptLogLevel::Warn => tracing::warn!(target: SCRIPT_LOG_TARGET, "{}", message),
            ScriptLogLevel::Error => tracing::error!(target: SCRIPT_LOG_TARGET, "{}", message),
        }
    }
}
