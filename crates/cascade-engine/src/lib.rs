#![warn(missing_docs)]

//! # cascade-engine
//!
//! Turns a JSON batch of actions into an ordered list of results.
//!
//! A batch is decoded in full before anything runs ([`action::decode_batch`]),
//! then [`ActionDispatcher`] executes each action `repeat` times, strictly in
//! order: `code` actions in the sandbox, `http` actions through the
//! [`HttpForwarder`]. Unknown kinds are recorded as `{"error": ...}` entries;
//! any sandbox or forward failure aborts the rest of the batch.

pub mod action;
pub mod dispatcher;
pub mod error;
pub mod forward;

pub use action::{Action, CodeAction, HttpAction, PlannedAction};
pub use dispatcher::ActionDispatcher;
pub use error::BatchError;
pub use forward::HttpForwarder;
