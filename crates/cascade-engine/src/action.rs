//! Action model and batch decoding.
//!
//! Wire format: a JSON array of objects, each with a `type` (alias `kind`)
//! and an optional `repeat`.
//!
//! ```json
//! [
//!   { "type": "code", "source": "return 1 + 1;" },
//!   { "type": "http", "url": "http://svc/api", "method": "POST",
//!     "headers": { "x-key": "v" }, "body": { "a": 1 }, "repeat": 2 }
//! ]
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::BatchError;

/// Message for a body that is not a JSON array.
pub const NOT_AN_ARRAY: &str = "Request body must be an array of actions";

/// One decoded action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Run a script body in the sandbox.
    Code(CodeAction),
    /// Forward one HTTP request.
    Http(HttpAction),
    /// Anything else; `kind` is the rendered type value.
    Unknown {
        /// Rendered kind, `undefined` when absent.
        kind: String,
    },
}

/// A `code` action.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CodeAction {
    /// Script body, run as the body of an async function.
    pub source: String,
}

/// An `http` action.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpAction {
    /// Target URL.
    pub url: String,
    /// HTTP method, `POST` by default.
    pub method: String,
    /// Headers merged over the default `Content-Type: application/json`.
    pub headers: BTreeMap<String, String>,
    /// JSON body; `None` (field absent) sends no body, `null` sends `null`.
    pub body: Option<Value>,
}

#[derive(Deserialize)]
struct HttpActionWire {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: Option<BTreeMap<String, String>>,
}

impl HttpActionWire {
    /// `body` comes from the raw object, since serde folds `null` into `None`.
    fn into_action(self, body: Option<&Value>) -> HttpAction {
        HttpAction {
            url: self.url,
            method: self.method.unwrap_or_else(|| "POST".to_string()),
            headers: self.headers.unwrap_or_default(),
            body: body.cloned(),
        }
    }
}

/// An action with its repeat count.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAction {
    /// What to run.
    pub action: Action,
    /// How many times; `0` contributes no results.
    pub repeat: u64,
}

/// Decode a whole batch, failing before anything runs if any entry is malformed.
pub fn decode_batch(batch: &Value, max_repeat: u64) -> Result<Vec<PlannedAction>, BatchError> {
    let entries = batch
        .as_array()
        .ok_or_else(|| BatchError::Validation(NOT_AN_ARRAY.to_string()))?;

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| decode_action(index, entry, max_repeat))
        .collect()
}

fn decode_action(index: usize, entry: &Value, max_repeat: u64) -> Result<PlannedAction, BatchError> {
    let Some(fields) = entry.as_object() else {
        return Ok(PlannedAction {
            action: Action::Unknown {
                kind: "undefined".into(),
            },
            repeat: 1,
        });
    };

    let repeat = decode_repeat(index, fields, max_repeat)?;
    let invalid = |e: serde_json::Error| BatchError::Validation(format!("action {index}: {e}"));

    let action = match fields.get("type").or_else(|| fields.get("kind")) {
        Some(Value::String(kind)) if kind == "code" => {
            Action::Code(CodeAction::deserialize(entry).map_err(invalid)?)
        }
        Some(Value::String(kind)) if kind == "http" => {
            let wire = HttpActionWire::deserialize(entry).map_err(invalid)?;
            Action::Http(wire.into_action(fields.get("body")))
        }
        Some(Value::String(kind)) => Action::Unknown { kind: kind.clone() },
        Some(other) => Action::Unknown {
            kind: other.to_string(),
        },
        None => Action::Unknown {
            kind: "undefined".into(),
        },
    };

    Ok(PlannedAction { action, repeat })
}

fn decode_repeat(index: usize, fields: &Map<String, Value>, max_repeat: u64) -> Result<u64, BatchError> {
    let repeat = match fields.get("repeat") {
        None | Some(Value::Null) => return Ok(1),
        Some(Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i,
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => f as i64,
            _ => {
                return Err(BatchError::Validation(format!(
                    "action {index}: repeat must be an integer, got {n}"
                )))
            }
        },
        Some(other) => {
            return Err(BatchError::Validation(format!(
                "action {index}: repeat must be an integer, got {other}"
            )))
        }
    };

    if repeat <= 0 {
        return Ok(0);
    }
    let repeat = repeat as u64;
    if repeat > max_repeat {
        return Err(BatchError::Validation(format!(
            "action {index}: repeat {repeat} exceeds the maximum of {max_repeat}"
        )));
    }
    Ok(repeat)
}
