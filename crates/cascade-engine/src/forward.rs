//! `http` actions: one outbound call, response unwrapped into a result value.

use std::collections::BTreeMap;
use std::sync::Arc;

use cascade_error::ForwardError;
use cascade_sandbox::{FetchDispatcher, FetchRequest};
use serde_json::{Map, Value};

use crate::action::HttpAction;

const CONTENT_TYPE: &str = "Content-Type";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Issues `http` actions through a [`FetchDispatcher`].
///
/// Any HTTP status is a result. Only transport failures are errors.
#[derive(Clone)]
pub struct HttpForwarder {
    transport: Arc<dyn FetchDispatcher>,
}

impl HttpForwarder {
    /// Create a forwarder over `transport`.
    pub fn new(transport: Arc<dyn FetchDispatcher>) -> Self {
        Self { transport }
    }

    /// Send `action` and return its unwrapped response body.
    pub async fn forward(&self, action: &HttpAction) -> Result<Value, ForwardError> {
        let request = build_request(action)?;
        tracing::debug!(url = %request.url, method = %request.method, "forwarding");

        let response = self.transport.fetch(request).await?;
        tracing::debug!(url = %action.url, status = response.status, "forward complete");

        Ok(unwrap_response(&response.body))
    }
}

fn build_request(action: &HttpAction) -> Result<FetchRequest, ForwardError> {
    let mut headers = BTreeMap::new();
    if !action
        .headers
        .keys()
        .any(|name| name.eq_ignore_ascii_case(CONTENT_TYPE))
    {
        headers.insert(CONTENT_TYPE.to_string(), JSON_CONTENT_TYPE.to_string());
    }
    headers.extend(action.headers.clone());

    let body = action
        .body
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| ForwardError::InvalidRequest(format!("body is not serializable: {e}")))?;

    Ok(FetchRequest {
        url: action.url.clone(),
        method: action.method.to_ascii_uppercase(),
        headers,
        body,
    })
}

/// Parse a response body, falling back to `{}`, and unwrap a `results` key when present.
pub fn unwrap_response(body: &str) -> Value {
    let parsed: Value =
        serde_json::from_str(body).unwrap_or_else(|_| Value::Object(Map::new()));
    match parsed {
        Value::Object(mut fields) if fields.contains_key("results") => {
            fields.remove("results").unwrap_or(Value::Null)
        }
        other => other,
    }
}
