#![warn(missing_docs)]

//! cascade-runner
//!
//! Accepts batches of `code` and `http` actions on `POST /api/v1/execute` and
//! runs them in order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cascade_client::{ReqwestFetcher, TimeoutFetcher};
use cascade_config::{CascadeConfig, ExecutionModeSetting, SandboxSection};
use cascade_context::TransactionFormat;
use cascade_engine::ActionDispatcher;
use cascade_sandbox::{ExecutionMode, FetchDispatcher, SandboxConfig, SandboxExecutor};
use cascade_server::{build_router, serve, AppState};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cascade-runner", version, about)]
struct Args {
    /// Config file (default: $CASCADE_CONFIG, then ./cascade.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port, overrides config and $PORT
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    port: Option<u16>,

    /// Bind address, overrides config
    #[arg(long)]
    host: Option<String>,
}

/// Build SandboxConfig from the `[sandbox]` table.
fn build_sandbox_config(section: &SandboxSection) -> SandboxConfig {
    SandboxConfig {
        timeout: Duration::from_millis(section.timeout_ms),
        max_code_size: section.max_code_kb * 1024,
        max_output_size: section.max_output_kb * 1024,
        max_heap_size: section.max_heap_mb * 1024 * 1024,
        max_concurrent: section.max_concurrent,
        max_fetch_calls: section.max_fetch_calls,
        execution_mode: match section.execution_mode {
            ExecutionModeSetting::InProcess => ExecutionMode::InProcess,
            ExecutionModeSetting::ChildProcess => ExecutionMode::ChildProcess,
        },
        ..SandboxConfig::default()
    }
}

/// `RUST_LOG` when set, otherwise the configured level.
fn log_filter(config: &CascadeConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log.level.as_filter()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("received shutdown signal, stopping gracefully");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, config_path) =
        CascadeConfig::load(args.config.as_deref()).context("failed to load config")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    tracing_subscriber::fmt()
        .event_format(TransactionFormat::new(config.server.service_name.clone()))
        .with_env_filter(log_filter(&config))
        .with_writer(std::io::stderr)
        .init();

    match &config_path {
        Some(path) => tracing::info!(path = %path.display(), "loaded config"),
        None => tracing::info!("no config file found, using defaults"),
    }

    let sandbox_config = build_sandbox_config(&config.sandbox);
    tracing::info!(
        timeout_ms = config.sandbox.timeout_ms,
        mode = ?sandbox_config.execution_mode,
        max_concurrent = sandbox_config.max_concurrent,
        "sandbox configured"
    );

    let transport: Arc<dyn FetchDispatcher> = Arc::new(TimeoutFetcher::new(
        Arc::new(ReqwestFetcher::new().context("failed to build HTTP client")?),
        Duration::from_secs(config.forward.timeout_secs),
    ));
    let dispatcher = ActionDispatcher::new(
        Arc::new(SandboxExecutor::new(sandbox_config)),
        transport,
    )
    .with_max_repeat(config.engine.max_repeat);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    serve(
        listener,
        build_router(AppState::new(dispatcher)),
        shutdown_signal(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sandbox_config_matches_library_defaults() {
        let built = build_sandbox_config(&SandboxSection::default());
        let defaults = SandboxConfig::default();
        assert_eq!(built.timeout, defaults.timeout);
        assert_eq!(built.max_code_size, defaults.max_code_size);
        assert_eq!(built.max_output_size, defaults.max_output_size);
        assert_eq!(built.max_heap_size, defaults.max_heap_size);
        assert_eq!(built.max_concurrent, defaults.max_concurrent);
        assert_eq!(built.max_fetch_calls, defaults.max_fetch_calls);
        assert_eq!(built.execution_mode, ExecutionMode::InProcess);
    }

    #[test]
    fn sandbox_overrides_are_applied() {
        let config = CascadeConfig::from_toml(
            r#"
            [sandbox]
            timeout_ms = 500
            max_heap_mb = 32
            max_code_kb = 8
            execution_mode = "child_process"
            "#,
        )
        .unwrap();
        let built = build_sandbox_config(&config.sandbox);
        assert_eq!(built.timeout, Duration::from_millis(500));
        assert_eq!(built.max_heap_size, 32 * 1024 * 1024);
        assert_eq!(built.max_code_size, 8 * 1024);
        assert_eq!(built.execution_mode, ExecutionMode::ChildProcess);
    }

    #[test]
    fn args_parse() {
        let args = Args::try_parse_from(["cascade-runner", "--port", "9000", "-c", "x.toml"]).unwrap();
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.config, Some(PathBuf::from("x.toml")));
        assert!(args.host.is_none());
    }

    #[test]
    fn port_zero_is_rejected() {
        assert!(Args::try_parse_from(["cascade-runner", "--port", "0"]).is_err());
    }
}
