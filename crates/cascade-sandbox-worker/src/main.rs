//! Cascade sandbox worker: an isolated child process for one script.
//!
//! Spawned by [`cascade_sandbox::host::SandboxHost`]. Reads an `Execute`
//! message from stdin, runs the script in a V8 isolate, and writes the result
//! to stdout. `fetch` calls and log lines are proxied to the parent over the
//! same IPC channel.
//!
//! The process starts with a cleared environment and holds no connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use cascade_error::ForwardError;
use cascade_sandbox::ipc::{
    read_message, read_message_with_limit, write_message, ChildMessage, ExecutionFailure,
    ParentMessage,
};
use cascade_sandbox::validator::validate_code;
use cascade_sandbox::{
    FetchDispatcher, FetchRequest, FetchResponse, ScriptLogLevel, ScriptLogSink,
};
use tokio::io::{self, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

type FetchWaiter = oneshot::Sender<Result<FetchResponse, String>>;

/// Fetch dispatcher that asks the parent to perform each request.
struct IpcFetchBridge {
    tx: mpsc::UnboundedSender<ChildMessage>,
    waiter_tx: mpsc::UnboundedSender<(u64, FetchWaiter)>,
    next_id: AtomicU64,
}

#[async_trait::async_trait]
impl FetchDispatcher for IpcFetchBridge {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ForwardError> {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (resp_tx, resp_rx) = oneshot::channel();
        self.waiter_tx
            .send((request_id, resp_tx))
            .map_err(|_| anyhow::anyhow!("IPC waiter channel closed"))?;

        self.tx
            .send(ChildMessage::FetchRequest {
                request_id,
                request,
            })
            .map_err(|_| anyhow::anyhow!("IPC send channel closed"))?;

        let result = resp_rx
            .await
            .map_err(|_| anyhow::anyhow!("IPC response channel closed"))?;

        result.map_err(|message| ForwardError::Internal(anyhow::anyhow!(message)))
    }
}

/// Log sink that forwards lines to the parent, in order with the result.
struct IpcLogSink {
    tx: mpsc::UnboundedSender<ChildMessage>,
}

impl ScriptLogSink for IpcLogSink {
    fn log(&self, level: ScriptLogLevel, message: &str) {
        let _ = self.tx.send(ChildMessage::Log {
            level,
            message: message.to_string(),
        });
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let env_keys: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for key in env_keys {
        std::env::remove_var(&key);
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    let msg: ParentMessage = read_message(&mut stdin)
        .await
        .context("failed to read initial message from parent")?
        .context("parent closed stdin before sending Execute")?;

    let (code, config) = match msg {
        ParentMessage::Execute { code, config } => (code, config),
        other => anyhow::bail!("expected Execute message, got: {:?}", other),
    };

    let sandbox_config = config.to_sandbox_config();
    let max_ipc_size = config.max_ipc_message_size;

    let (tx, mut rx) = mpsc::unbounded_channel::<ChildMessage>();
    let (waiter_tx, mut waiter_rx) = mpsc::unbounded_channel::<(u64, FetchWaiter)>();

    let dispatcher: Arc<dyn FetchDispatcher> = Arc::new(IpcFetchBridge {
        tx: tx.clone(),
        waiter_tx,
        next_id: AtomicU64::new(1),
    });
    let sink: Arc<dyn ScriptLogSink> = Arc::new(IpcLogSink { tx: tx.clone() });

    // V8 isolates are !Send: run on a dedicated thread.
    let exec_tx = tx;
    let exec_handle = std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                let _ = exec_tx.send(ChildMessage::ExecutionComplete {
                    result: Err(ExecutionFailure::Internal {
                        message: format!("failed to create tokio runtime: {e}"),
                    }),
                });
                return;
            }
        };

        let result = match validate_code(&code, Some(sandbox_config.max_code_size)) {
            Ok(()) => rt.block_on(cascade_sandbox::executor::run_execute(
                &sandbox_config,
                &code,
                dispatcher,
                sink,
            )),
            Err(e) => Err(e),
        };

        let _ = exec_tx.send(ChildMessage::ExecutionComplete {
            result: result.map_err(|e| ExecutionFailure::from(&e)),
        });
    });

    // Reads from the parent run on their own task: a frame read is not
    // cancel-safe, so it must not sit in a select arm.
    let (parent_tx, mut parent_rx) = mpsc::unbounded_channel::<io::Result<ParentMessage>>();
    tokio::spawn(async move {
        loop {
            match read_message_with_limit::<ParentMessage, _>(&mut stdin, max_ipc_size).await {
                Ok(Some(msg)) => {
                    if parent_tx.send(Ok(msg)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = parent_tx.send(Err(e));
                    break;
                }
            }
        }
    });

    let mut pending_waiters: HashMap<u64, FetchWaiter> = HashMap::new();

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(child_msg) => {
                        let is_complete = matches!(child_msg, ChildMessage::ExecutionComplete { .. });
                        write_message(&mut stdout, &child_msg).await
                            .context("failed to write message to parent")?;
                        stdout.flush().await?;
                        if is_complete {
                            break;
                        }
                    }
                    None => {
                        let msg = ChildMessage::ExecutionComplete {
                            result: Err(ExecutionFailure::Internal {
                                message: "worker thread exited unexpectedly".into(),
                            }),
                        };
                        write_message(&mut stdout, &msg).await.ok();
                        break;
                    }
                }
            }

            incoming = parent_rx.recv() => {
                match incoming {
                    Some(Ok(ParentMessage::FetchResult { request_id, result })) => {
                        // The waiter is always queued before its request is sent.
                        while let Ok((id, sender)) = waiter_rx.try_recv() {
                            pending_waiters.insert(id, sender);
                        }
                        if let Some(waiter) = pending_waiters.remove(&request_id) {
                            let _ = waiter.send(result);
                        }
                    }
                    Some(Ok(_)) => {
                        tracing::warn!("unexpected message type from parent");
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "failed to read from parent");
                        break;
                    }
                    None => break,
                }
            }

            waiter = waiter_rx.recv() => {
                if let Some((id, sender)) = waiter {
                    pending_waiters.insert(id, sender);
                }
            }
        }
    }

    // Dropping the waiters fails any fetch still in flight, letting the V8
    // thread finish.
    drop(pending_waiters);
    drop(waiter_rx);
    let _ = exec_handle.join();

    Ok(())
}
