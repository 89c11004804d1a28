//! Route handlers.

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::AppState;

/// `POST /api/v1/execute`
pub async fn execute(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, AppError> {
    let batch: Value = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!(error = %e, "Invalid request body");
        AppError::bad_request(format!("Invalid JSON body: {e}"))
    })?;

    match state.dispatcher.process_batch(&batch).await {
        Ok(results) => Ok(Json(json!({ "results": results }))),
        Err(e) if e.is_validation() => {
            tracing::warn!(error = %e, "Invalid request body");
            Err(e.into())
        }
        Err(e) => {
            tracing::error!(error = %e, "Error processing actions");
            Err(e.into())
        }
    }
}

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
