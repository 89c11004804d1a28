//! Sandbox executor: creates a fresh V8 isolate per script and runs it.
//!
//! Each invocation gets a brand new runtime, so nothing leaks between calls.
//!
//! V8 isolates are `!Send`, so all JsRuntime work runs on a dedicated thread
//! with its own current-thread tokio runtime. The public API is async and
//! `Send`-safe.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use cascade_context::TransactionContext;
use cascade_error::ForwardError;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};

use crate::error::SandboxError;
use crate::ops::{cascade_ext, ExecutionResult, ExecutionSettled, FetchLimits};
use crate::validator::validate_code;
use crate::{FetchDispatcher, FetchRequest, FetchResponse, ScriptLogSink, TracingLogSink};

/// Where scripts run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// V8 on a dedicated thread of this process.
    #[default]
    InProcess,
    /// A `cascade-worker` child process per execution, with a cleared environment.
    ChildProcess,
}

/// Configuration for the sandbox executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock budget for one script.
    pub timeout: Duration,
    /// Maximum script size in bytes.
    pub max_code_size: usize,
    /// Maximum size of the JSON result in bytes.
    pub max_output_size: usize,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum concurrent isolates.
    pub max_concurrent: usize,
    /// Maximum `fetch` calls per script.
    pub max_fetch_calls: usize,
    /// In-process or child-process isolation.
    pub execution_mode: ExecutionMode,
    /// Maximum IPC message size in bytes (child-process mode).
    pub max_ipc_message_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            max_code_size: 64 * 1024,        // 64 KB
            max_output_size: 1024 * 1024,    // 1 MB
            max_heap_size: 64 * 1024 * 1024, // 64 MB
            max_concurrent: 16,
            max_fetch_calls: 50,
            execution_mode: ExecutionMode::default(),
            max_ipc_message_size: crate::ipc::DEFAULT_MAX_IPC_MESSAGE_SIZE,
        }
    }
}

/// Runs scripts in fresh V8 isolates.
///
/// A semaphore caps the number of live isolates. Invocations beyond the cap
/// wait for a slot, up to the script timeout, and then fail with
/// [`SandboxError::ConcurrencyLimit`].
pub struct SandboxExecutor {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
}

impl SandboxExecutor {
    /// Create a new sandbox executor with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self { config, semaphore }
    }

    /// The active configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `source` as the body of an async function and return its
    /// JSON-serialized completion value (`undefined` becomes `null`).
    ///
    /// Script `fetch` calls go through `fetcher`; script log output goes to
    /// `tracing` under the caller's transaction.
    pub async fn run(
        &self,
        source: &str,
        fetcher: Arc<dyn FetchDispatcher>,
    ) -> Result<Value, SandboxError> {
        tracing::debug!(
            code_len = source.len(),
            mode = ?self.config.execution_mode,
            "sandbox run: starting"
        );

        validate_code(source, Some(self.config.max_code_size))?;

        let _permit = tokio::time::timeout(
            self.config.timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| SandboxError::ConcurrencyLimit {
            max: self.config.max_concurrent,
        })?
        .map_err(|_| SandboxError::Execution(anyhow::anyhow!("sandbox semaphore closed")))?;

        let result = match self.config.execution_mode {
            ExecutionMode::ChildProcess => {
                crate::host::SandboxHost::execute_in_child(source, &self.config, fetcher).await
            }
            ExecutionMode::InProcess => self.run_in_process(source, fetcher).await,
        };

        match &result {
            Ok(_) => tracing::debug!("sandbox run: complete"),
            Err(e) => tracing::warn!(error = %e, "sandbox run: failed"),
        }

        result
    }

    /// In-process execution: a dedicated thread with its own isolate.
    async fn run_in_process(
        &self,
        source: &str,
        fetcher: Arc<dyn FetchDispatcher>,
    ) -> Result<Value, SandboxError> {
        let code = source.to_string();
        let config = self.config.clone();
        let context = TransactionContext::current();
        let fetcher: Arc<dyn FetchDispatcher> = Arc::new(HostBridgeFetcher {
            inner: fetcher,
            handle: tokio::runtime::Handle::current(),
            context: context.clone(),
        });

        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::Builder::new()
            .name("cascade-sandbox".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        if tx.send(Err(SandboxError::Execution(e.into()))).is_err() {
                            tracing::warn!("sandbox result receiver dropped");
                        }
                        return;
                    }
                };
                let sink: Arc<dyn ScriptLogSink> = Arc::new(TracingLogSink);
                let result = rt.block_on(cascade_context::propagate(
                    context,
                    run_execute(&config, &code, fetcher, sink),
                ));
                if tx.send(result).is_err() {
                    tracing::warn!("sandbox result receiver dropped before result was sent");
                }
            })
            .map_err(|e| SandboxError::Execution(e.into()))?;

        rx.await
            .map_err(|_| SandboxError::Execution(anyhow::anyhow!("sandbox thread panicked")))?
    }
}

/// Runs fetches on the host runtime rather than the sandbox thread's runtime,
/// so connection pools stay on the runtime that owns them and the request's
/// transaction follows the call.
struct HostBridgeFetcher {
    inner: Arc<dyn FetchDispatcher>,
    handle: tokio::runtime::Handle,
    context: Option<Arc<TransactionContext>>,
}

#[async_trait::async_trait]
impl FetchDispatcher for HostBridgeFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ForwardError> {
        let inner = self.inner.clone();
        let task = self.handle.spawn(cascade_context::propagate(
            self.context.clone(),
            async move { inner.fetch(request).await },
        ));
        AbortOnDrop(task)
            .await
            .map_err(|e| ForwardError::Internal(anyhow::anyhow!("fetch task failed: {e}")))?
    }
}

/// Aborts the wrapped task if the awaiting side goes away (sandbox timeout).
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the `HeapLimitState` boxed in `run_user_code`,
    // which unregisters this callback before the box is dropped.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Script installed before user code: captures the ops in closures, defines
/// the frozen capability globals, removes `Deno`, `eval` and the function
/// constructors, and leaves a one-shot `__cascadeRun(source)` behind.
const BOOTSTRAP: &str = r#"
((ops) => {
    const logOp = ops.op_cascade_log;
    const setResultOp = ops.op_cascade_set_result;
    const fetchOp = ops.op_cascade_fetch;
    const sleepOp = ops.op_cascade_sleep;

    const render = (args) => args.map((arg) => {
        if (typeof arg === "string") return arg;
        if (arg instanceof Error) return `${arg.name}: ${arg.message}`;
        try {
            const json = JSON.stringify(arg);
            return json === undefined ? String(arg) : json;
        } catch (_) {
            return String(arg);
        }
    }).join(" ");
    const emitter = (level) => (...args) => logOp(level, render(args));

    const logger = Object.freeze({
        debug: emitter("debug"),
        info: emitter("info"),
        log: emitter("info"),
        warn: emitter("warn"),
        error: emitter("error"),
    });
    const console = Object.freeze({
        debug: emitter("debug"),
        trace: emitter("debug"),
        log: emitter("info"),
        info: emitter("info"),
        warn: emitter("warn"),
        error: emitter("error"),
    });

    const toHeaders = (headers) => {
        const out = {};
        if (headers && typeof headers === "object") {
            for (const [name, value] of Object.entries(headers)) {
                out[String(name)] = String(value);
            }
        }
        return out;
    };
    const toBody = (body) => {
        if (body === undefined || body === null) return null;
        return typeof body === "string" ? body : JSON.stringify(body);
    };

    const fetch = async (input, init) => {
        const options = init || {};
        const request = {
            url: String(input),
            method: String(options.method || "GET").toUpperCase(),
            headers: toHeaders(options.headers),
            body: toBody(options.body),
        };
        const raw = JSON.parse(await fetchOp(JSON.stringify(request)));
        const text = raw.body;
        return Object.freeze({
            status: raw.status,
            ok: raw.status >= 200 && raw.status < 300,
            statusText: raw.status_text,
            headers: Object.freeze(raw.headers),
            url: raw.url,
            text: async () => text,
            json: async () => JSON.parse(text),
        });
    };

    let nextTimerId = 1;
    const activeTimers = new Set();
    const setTimeout = (callback, delay, ...args) => {
        const id = nextTimerId++;
        activeTimers.add(id);
        const millis = Math.min(Math.max(Math.floor(Number(delay) || 0), 0), 2147483647);
        sleepOp(millis).then((elapsed) => {
            if (activeTimers.delete(id) && elapsed && typeof callback === "function") {
                callback(...args);
            }
        });
        return id;
    };
    const clearTimeout = (id) => {
        activeTimers.delete(id);
    };

    const install = (name, value) => {
        try {
            Object.defineProperty(globalThis, name, {
                value, writable: false, configurable: false, enumerable: false,
            });
        } catch (_) {
            globalThis[name] = value;
        }
    };
    install("logger", logger);
    install("console", console);
    install("fetch", fetch);
    install("setTimeout", setTimeout);
    install("clearTimeout", clearTimeout);
    install("global", globalThis);
    delete globalThis.Deno;
    delete globalThis.eval;
    const AsyncFunction = (async function(){}).constructor;
    const GeneratorFunction = (function*(){}).constructor;
    Object.defineProperty(Function.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
    Object.defineProperty(AsyncFunction.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
    Object.defineProperty(GeneratorFunction.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });

    const describe = (error) =>
        (error && error.message !== undefined) ? String(error.message) : String(error);
    const settle = (envelope) => setResultOp(JSON.stringify(envelope));

    // One-shot entry point. The body is compiled on its own, so script text
    // can never reach `settle`.
    Object.defineProperty(globalThis, "__cascadeRun", {
        value: (source) => {
            delete globalThis.__cascadeRun;
            let body;
            try {
                body = new AsyncFunction(source);
            } catch (error) {
                settle({ error: String(error) });
                return;
            }
            body().then(
                (value) => {
                    try {
                        settle({ ok: value === undefined ? null : value });
                    } catch (error) {
                        settle({ error: describe(error) });
                    }
                },
                (error) => settle({ error: describe(error) }),
            );
        },
        configurable: true,
    });
})(Deno.core.ops);
"#;

/// Call the one-shot entry point with the script body as a string literal.
fn wrap_source(code: &str) -> Result<String, SandboxError> {
    Ok(format!("__cascadeRun({});", serde_json::to_string(code)?))
}

/// Run one script on the current thread, which must not be a multi-thread
/// runtime worker. Public for reuse in the worker binary.
pub async fn run_execute(
    config: &SandboxConfig,
    code: &str,
    fetcher: Arc<dyn FetchDispatcher>,
    log_sink: Arc<dyn ScriptLogSink>,
) -> Result<Value, SandboxError> {
    let mut runtime = create_runtime(config, fetcher, log_sink);

    runtime
        .execute_script("[cascade:bootstrap]", BOOTSTRAP)
        .map_err(|e| SandboxError::JsError {
            message: e.to_string(),
        })?;

    run_user_code(&mut runtime, code, config).await
}

/// Create a fresh JsRuntime with the cascade extension loaded and heap limits set.
pub(crate) fn create_runtime(
    config: &SandboxConfig,
    fetcher: Arc<dyn FetchDispatcher>,
    log_sink: Arc<dyn ScriptLogSink>,
) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, config.max_heap_size);

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![cascade_ext::init_ops_and_esm()],
        create_params: Some(create_params),
        ..Default::default()
    });

    {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        state.put(fetcher);
        state.put(log_sink);
        state.put(FetchLimits {
            max_calls: config.max_fetch_calls,
            calls_made: 0,
        });
        state.put(ExecutionSettled::default());
    }

    runtime
}

/// Execute the wrapped script under the watchdog and heap guard, then read
/// the settled envelope out of OpState.
async fn run_user_code(
    runtime: &mut JsRuntime,
    code: &str,
    config: &SandboxConfig,
) -> Result<Value, SandboxError> {
    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    // CPU watchdog: terminates V8 even inside a synchronous loop.
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let timeout = config.timeout;
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();

    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    let exec_error = match runtime.execute_script("[cascade:script]", wrap_source(code)?) {
        Ok(_) => {
            match tokio::time::timeout(
                config.timeout,
                runtime.run_event_loop(PollEventLoopOptions::default()),
            )
            .await
            {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => {
                    timed_out.store(true, Ordering::SeqCst);
                    None
                }
            }
        }
        Err(e) => Some(e.to_string()),
    };

    // Stop the watchdog before the isolate can go away.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();
    runtime
        .v8_isolate()
        .remove_near_heap_limit_callback(near_heap_limit_callback, 0);

    if heap_state.triggered.load(Ordering::SeqCst) {
        return Err(SandboxError::HeapLimitExceeded);
    }

    if timed_out.load(Ordering::SeqCst) {
        return Err(SandboxError::Timeout {
            timeout_ms: config.timeout.as_millis() as u64,
        });
    }

    let envelope = {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        state.try_take::<ExecutionResult>()
    };

    let result_str = match envelope {
        Some(ExecutionResult(json)) => {
            if let Some(err) = &exec_error {
                tracing::debug!(error = %err, "event loop error after script settled");
            }
            json
        }
        None => {
            return Err(SandboxError::JsError {
                message: exec_error
                    .unwrap_or_else(|| "script did not complete: its promise never settled".into()),
            })
        }
    };

    if result_str.len() > config.max_output_size {
        return Err(SandboxError::OutputTooLarge {
            max: config.max_output_size,
        });
    }

    let envelope: Value = serde_json::from_str(&result_str)?;

    if let Some(error) = envelope.get("error") {
        return Err(SandboxError::JsError {
            message: error.as_str().unwrap_or("unknown error").to_string(),
        });
    }

    Ok(envelope.get("ok").cloned().unwrap_or(Value::Null))
}
