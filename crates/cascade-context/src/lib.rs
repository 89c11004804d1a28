#![warn(missing_docs)]

//! # cascade-context
//!
//! Ambient, per-request correlation for the cascade runner.
//!
//! A [`TransactionContext`] is established once per inbound request with
//! [`TransactionContext::scope`] and is readable from anywhere on that
//! request's logical call chain through [`TransactionContext::current`],
//! including after `.await` points on a multi-thread runtime. The storage is
//! a `tokio::task_local!` slot, so two requests in flight at the same time
//! never observe each other's id.
//!
//! Task-local storage does not follow work onto new tasks or threads. Code
//! that hands work to another task (the sandbox's V8 thread, a spawned
//! transport call) captures [`TransactionContext::current`] first and
//! re-establishes it there with [`propagate`].

pub mod format;

use std::future::Future;
use std::sync::Arc;

pub use format::TransactionFormat;

/// Header carrying the transaction id between services.
pub const TRANSACTION_HEADER: &str = "x-transaction-id";

/// Placeholder logged when no transaction is active.
pub const UNKNOWN_TRANSACTION: &str = "N/A";

tokio::task_local! {
    static CURRENT: Arc<TransactionContext>;
}

/// Per-request correlation context.
///
/// Read-only once created. Clone is cheap relative to request processing but
/// callers normally hold the `Arc` returned by [`current`](Self::current).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionContext {
    transaction_id: String,
}

impl TransactionContext {
    /// Create a context with an explicit transaction id.
    pub fn new(transaction_id: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a context with a freshly generated UUID v4 id.
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    /// Create a context from an inbound header value.
    ///
    /// A missing or blank header yields a generated id.
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(id) if !id.is_empty() => Self::new(id),
            _ => Self::generate(),
        }
    }

    /// The full transaction id.
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// The leading segment of the id (up to the first `-`), used as a log prefix.
    pub fn short_id(&self) -> &str {
        self.transaction_id
            .split('-')
            .next()
            .unwrap_or(&self.transaction_id)
    }

    /// Run a future with this context active.
    ///
    /// Nesting is supported: an inner scope shadows the outer one for the
    /// duration of the inner future.
    pub async fn scope<F: Future>(self, f: F) -> F::Output {
        CURRENT.scope(Arc::new(self), f).await
    }

    /// Run a synchronous closure with this context active.
    pub fn scope_sync<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(Arc::new(self), f)
    }

    /// The context of the enclosing scope, if any.
    #[inline]
    pub fn current() -> Option<Arc<Self>> {
        CURRENT.try_with(Arc::clone).ok()
    }

    /// The transaction id of the enclosing scope, if any.
    pub fn current_id() -> Option<String> {
        CURRENT.try_with(|ctx| ctx.transaction_id.clone()).ok()
    }
}

/// Run `f` inside a previously captured context, or bare when none was active.
///
/// Used at task and thread hand-offs together with [`TransactionContext::current`].
pub async fn propagate<F: Future>(context: Option<Arc<TransactionContext>>, f: F) -> F::Output {
    match context {
        Some(ctx) => CURRENT.scope(ctx, f).await,
        None => f.await,
    }
}
