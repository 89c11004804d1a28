#![warn(missing_docs)]

//! # cascade-client
//!
//! [`FetchDispatcher`](cascade_sandbox::FetchDispatcher) implementations used
//! by the server: a reqwest-backed transport and a per-call timeout wrapper.

pub mod http;
pub mod timeout;

pub use http::ReqwestFetcher;
pub use timeout::TimeoutFetcher;
