#![warn(missing_docs)]

//! # cascade-server
//!
//! axum surface for the runner:
//!
//! - `POST /api/v1/execute`: body is a JSON array of actions, answer is
//!   `{"results": [...]}` or `{"error": "..."}`
//! - `GET /health`: liveness probe
//!
//! Every request runs inside a [`TransactionContext`](cascade_context::TransactionContext)
//! seeded from `x-transaction-id`, and the id is echoed on the response.

pub mod error;
pub mod middleware;
pub mod routes;

use std::future::Future;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use cascade_engine::ActionDispatcher;
use tower_http::trace::TraceLayer;

pub use error::AppError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Runs batches for `POST /api/v1/execute`.
    pub dispatcher: Arc<ActionDispatcher>,
}

impl AppState {
    /// Wrap a dispatcher.
    pub fn new(dispatcher: ActionDispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
        }
    }
}

/// Build the router with all routes and middleware.
///
/// Used by [`serve`] and by integration tests.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/execute", post(routes::execute))
        .route("/health", get(routes::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        // Outermost, so request spans and handler logs see the transaction.
        .layer(axum::middleware::from_fn(middleware::transaction))
}

/// Serve `router` on a bound listener until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("server stopped");
    Ok(())
}
