//! Transaction middleware.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use cascade_context::{TransactionContext, TRANSACTION_HEADER};

/// Establish the request's [`TransactionContext`] and echo its id on the response.
///
/// The id comes from an inbound `x-transaction-id` header when it is present
/// and non-blank, and is generated otherwise.
pub async fn transaction(req: Request, next: Next) -> Response {
    let inbound = req
        .headers()
        .get(TRANSACTION_HEADER)
        .and_then(|v| v.to_str().ok());
    let ctx = TransactionContext::from_header(inbound);
    let echo = HeaderValue::from_str(ctx.transaction_id()).ok();

    let mut response = ctx
        .scope(async move {
            tracing::debug!(method = %req.method(), path = %req.uri().path(), "request received");
            next.run(req).await
        })
        .await;

    if let Some(value) = echo {
        response.headers_mut().insert(TRANSACTION_HEADER, value);
    }
    response
}
