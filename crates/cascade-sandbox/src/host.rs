//! Parent-side management of `cascade-worker` child processes.
//!
//! Spawns the worker with a clean environment, talks length-delimited JSON
//! over its stdin/stdout, performs its fetches through the parent's
//! [`FetchDispatcher`], and re-emits its log lines under the caller's
//! transaction.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::{ChildStdin, ChildStdout, Command};

use crate::error::SandboxError;
use crate::ipc::{read_message_with_limit, write_message, ChildMessage, ParentMessage, WorkerConfig};
use crate::{FetchDispatcher, ScriptLogSink, TracingLogSink};

/// Worker binary name.
pub const WORKER_BINARY: &str = "cascade-worker";

/// Environment variable overriding the worker location (absolute path).
pub const WORKER_BIN_ENV: &str = "CASCADE_WORKER_BIN";

/// Spawns and drives sandbox worker processes.
pub struct SandboxHost;

impl SandboxHost {
    /// Run `code` in a fresh worker process.
    ///
    /// The child is killed if it outlives the configured timeout (plus a
    /// short grace period for it to report its own timeout).
    pub async fn execute_in_child(
        code: &str,
        config: &crate::SandboxConfig,
        fetcher: Arc<dyn FetchDispatcher>,
    ) -> Result<serde_json::Value, SandboxError> {
        let worker_bin = find_worker_binary()?;
        let worker_config = WorkerConfig::from(config);
        let timeout = config.timeout;

        let mut child = Command::new(&worker_bin)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(if std::env::var("CASCADE_DEBUG").is_ok() {
                std::process::Stdio::inherit()
            } else {
                std::process::Stdio::null()
            })
            .env_clear()
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::Execution(anyhow::anyhow!(
                    "failed to spawn worker at {}: {}",
                    worker_bin.display(),
                    e
                ))
            })?;

        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdin on child")))?;
        let child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdout on child")))?;
        let mut child_stdout = BufReader::new(child_stdout);

        let execute_msg = ParentMessage::Execute {
            code: code.to_string(),
            config: worker_config,
        };
        write_message(&mut child_stdin, &execute_msg)
            .await
            .map_err(|e| SandboxError::Execution(anyhow::anyhow!("failed to send Execute: {e}")))?;

        let result = tokio::time::timeout(
            timeout + Duration::from_secs(2),
            ipc_event_loop(
                &mut child_stdin,
                &mut child_stdout,
                fetcher,
                config.max_ipc_message_size,
            ),
        )
        .await;

        match result {
            Ok(inner) => inner,
            Err(_elapsed) => {
                let _ = child.kill().await;
                Err(SandboxError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// Read child messages until the execution completes, serving fetches and
/// logging on the way.
async fn ipc_event_loop(
    child_stdin: &mut ChildStdin,
    child_stdout: &mut BufReader<ChildStdout>,
    fetcher: Arc<dyn FetchDispatcher>,
    max_message_size: usize,
) -> Result<serde_json::Value, SandboxError> {
    let sink = TracingLogSink;
    loop {
        let msg: Option<ChildMessage> = read_message_with_limit(child_stdout, max_message_size)
            .await
            .map_err(|e| SandboxError::Execution(anyhow::anyhow!("IPC read error: {e}")))?;

        match msg {
            Some(ChildMessage::ExecutionComplete { result }) => {
                return result.map_err(SandboxError::from);
            }
            Some(ChildMessage::FetchRequest {
                request_id,
                request,
            }) => {
                let result = fetcher.fetch(request).await.map_err(|e| e.to_string());
                let response = ParentMessage::FetchResult { request_id, result };
                write_message(child_stdin, &response).await.map_err(|e| {
                    SandboxError::Execution(anyhow::anyhow!("failed to send fetch result: {e}"))
                })?;
            }
            Some(ChildMessage::Log { level, message }) => sink.log(level, &message),
            None => {
                return Err(SandboxError::Execution(anyhow::anyhow!(
                    "worker exited without sending result"
                )));
            }
        }
    }
}

/// Locate the worker binary.
///
/// Search order:
/// 1. `CASCADE_WORKER_BIN` (must be an absolute path)
/// 2. The directory of the current executable, then its parent (test binaries live in `deps/`)
///
/// On Unix, world-writable binaries are rejected.
pub fn find_worker_binary() -> Result<PathBuf, SandboxError> {
    if let Ok(path) = std::env::var(WORKER_BIN_ENV) {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "{WORKER_BIN_ENV} must be an absolute path, got: {path}"
            )));
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            for candidate in [Some(dir), dir.parent()].into_iter().flatten() {
                let worker = candidate.join(WORKER_BINARY);
                if worker.exists() {
                    validate_binary_permissions(&worker)?;
                    return Ok(worker);
                }
            }
        }
    }

    Err(SandboxError::Execution(anyhow::anyhow!(
        "{WORKER_BINARY} binary not found. Set {WORKER_BIN_ENV} or install it next to cascade-runner"
    )))
}

/// Reject world-writable worker binaries (Unix only).
fn validate_binary_permissions(_path: &Path) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(_path).map_err(|e| {
            SandboxError::Execution(anyhow::anyhow!(
                "cannot read metadata for {}: {}",
                _path.display(),
                e
            ))
        })?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "insecure permissions on worker binary {}: mode {:o} is world-writable",
                _path.display(),
                mode,
            )));
        }
    }
    Ok(())
}
