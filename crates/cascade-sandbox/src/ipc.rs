//! IPC protocol between the server and a `cascade-worker` child.
//!
//! Each frame is a 4-byte big-endian length followed by a JSON payload.
//! Frames are typed by [`ParentMessage`] and [`ChildMessage`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::SandboxError;
use crate::{FetchRequest, FetchResponse, ScriptLogLevel};

/// Default maximum IPC message size: 8 MB.
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Messages sent from the parent process to the worker child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParentMessage {
    /// First message: run this script.
    Execute {
        /// The script body.
        code: String,
        /// Limits for this execution.
        config: WorkerConfig,
    },
    /// Answer to a [`ChildMessage::FetchRequest`].
    FetchResult {
        /// Matches the request's `request_id`.
        request_id: u64,
        /// The response, or a transport error message.
        result: Result<FetchResponse, String>,
    },
}

/// Messages sent from the worker child to the parent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildMessage {
    /// The script called `fetch`; the parent performs the request.
    FetchRequest {
        /// Correlates the eventual [`ParentMessage::FetchResult`].
        request_id: u64,
        /// The request to perform.
        request: FetchRequest,
    },
    /// One line of script log output.
    Log {
        /// Severity.
        level: ScriptLogLevel,
        /// Rendered message.
        message: String,
    },
    /// The script finished.
    ExecutionComplete {
        /// The completion value, or why it failed.
        result: Result<Value, ExecutionFailure>,
    },
}

/// A sandbox failure in a form that survives the process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFailure {
    /// Deadline exceeded inside the worker.
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },
    /// V8 heap limit hit.
    HeapLimit,
    /// Result larger than allowed.
    OutputTooLarge {
        /// Maximum allowed size.
        max: usize,
    },
    /// The script threw or failed to parse.
    Script {
        /// Error message.
        message: String,
    },
    /// Anything else.
    Internal {
        /// Error message.
        message: String,
    },
}

impl From<&SandboxError> for ExecutionFailure {
    fn from(err: &SandboxError) -> Self {
        match err {
            SandboxError::Timeout { timeout_ms } => ExecutionFailure::Timeout {
                timeout_ms: *timeout_ms,
            },
            SandboxError::HeapLimitExceeded => ExecutionFailure::HeapLimit,
            SandboxError::OutputTooLarge { max } => ExecutionFailure::OutputTooLarge { max: *max },
            SandboxError::JsError { message } => ExecutionFailure::Script {
                message: message.clone(),
            },
            other => ExecutionFailure::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl From<ExecutionFailure> for SandboxError {
    fn from(failure: ExecutionFailure) -> Self {
        match failure {
            ExecutionFailure::Timeout { timeout_ms } => SandboxError::Timeout { timeout_ms },
            ExecutionFailure::HeapLimit => SandboxError::HeapLimitExceeded,
            ExecutionFailure::OutputTooLarge { max } => SandboxError::OutputTooLarge { max },
            ExecutionFailure::Script { message } => SandboxError::JsError { message },
            ExecutionFailure::Internal { message } => {
                SandboxError::Execution(anyhow::anyhow!("worker: {message}"))
            }
        }
    }
}

/// Limits passed to the worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Wall-clock budget in milliseconds.
    pub timeout_ms: u64,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum `fetch` calls.
    pub max_fetch_calls: usize,
    /// Maximum size of the JSON result in bytes.
    pub max_output_size: usize,
    /// Maximum script size in bytes.
    pub max_code_size: usize,
    /// Maximum IPC message size in bytes.
    #[serde(default = "default_max_ipc_message_size")]
    pub max_ipc_message_size: usize,
}

fn default_max_ipc_message_size() -> usize {
    DEFAULT_MAX_IPC_MESSAGE_SIZE
}

impl From<&crate::SandboxConfig> for WorkerConfig {
    fn from(config: &crate::SandboxConfig) -> Self {
        Self {
            timeout_ms: config.timeout.as_millis() as u64,
            max_heap_size: config.max_heap_size,
            max_fetch_calls: config.max_fetch_calls,
            max_output_size: config.max_output_size,
            max_code_size: config.max_code_size,
            max_ipc_message_size: config.max_ipc_message_size,
        }
    }
}

impl WorkerConfig {
    /// Sandbox configuration for the single execution inside the worker.
    pub fn to_sandbox_config(&self) -> crate::SandboxConfig {
        crate::SandboxConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            max_code_size: self.max_code_size,
            max_output_size: self.max_output_size,
            max_heap_size: self.max_heap_size,
            max_concurrent: 1,
            max_fetch_calls: self.max_fetch_calls,
            execution_mode: crate::executor::ExecutionMode::InProcess,
            max_ipc_message_size: self.max_ipc_message_size,
        }
    }
}

/// Write a length-delimited JSON message.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), std::io::Error> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("IPC payload too large: {} bytes", payload.len()),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-delimited JSON message using [`DEFAULT_MAX_IPC_MESSAGE_SIZE`].
///
/// Returns `None` at a clean EOF.
pub async fn read_message<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<T>, std::io::Error> {
    read_message_with_limit(reader, DEFAULT_MAX_IPC_MESSAGE_SIZE).await
}

/// Read a length-delimited JSON message, rejecting frames over `max_size` bytes.
///
/// Returns `None` at a clean EOF.
pub async fn read_message_with_limit<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, std::io::Error> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("IPC message too large: {len} bytes (limit: {max_size} bytes)"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let msg: T = serde_json::from_slice(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(msg))
}
