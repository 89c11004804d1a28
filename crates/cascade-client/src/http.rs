//! reqwest-backed transport.

use std::collections::BTreeMap;

use cascade_context::{TransactionContext, TRANSACTION_HEADER};
use cascade_error::ForwardError;
use cascade_sandbox::{FetchDispatcher, FetchRequest, FetchResponse};
use reqwest::{Method, Url};

/// Sends [`FetchRequest`]s with a shared `reqwest::Client`.
///
/// Adds `x-transaction-id` from the ambient transaction unless the request
/// already carries one.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    /// Build with a default client.
    pub fn new() -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("cascade-runner/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ForwardError::Internal(e.into()))?;
        Ok(Self { client })
    }

    /// Use an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Render an error and its sources as `outer: inner: root`.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[async_trait::async_trait]
impl FetchDispatcher for ReqwestFetcher {
    #[tracing::instrument(skip(self, request), fields(url = %request.url, method = %request.method))]
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ForwardError> {
        let method = Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            ForwardError::InvalidRequest(format!("invalid HTTP method '{}'", request.method))
        })?;
        let url = Url::parse(&request.url).map_err(|e| {
            ForwardError::InvalidRequest(format!("invalid URL '{}': {e}", request.url))
        })?;

        let mut builder = self.client.request(method, url);
        let mut has_transaction = false;
        for (name, value) in &request.headers {
            has_transaction |= name.eq_ignore_ascii_case(TRANSACTION_HEADER);
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !has_transaction {
            if let Some(id) = TransactionContext::current_id() {
                builder = builder.header(TRANSACTION_HEADER, id);
            }
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_builder() {
                ForwardError::InvalidRequest(error_chain(&e))
            } else {
                ForwardError::Transport {
                    url: request.url.clone(),
                    message: error_chain(&e),
                }
            }
        })?;

        let status = response.status();
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }
        let final_url = response.url().to_string();

        let bytes = response.bytes().await.map_err(|e| ForwardError::Transport {
            url: request.url.clone(),
            message: error_chain(&e),
        })?;

        tracing::debug!(status = status.as_u16(), body_len = bytes.len(), "response received");

        Ok(FetchResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            url: final_url,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(method: &str, url: String) -> FetchRequest {
        FetchRequest {
            url,
            method: method.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    #[tokio::test]
    async fn sends_method_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/items"))
            .and(header("content-type", "application/json"))
            .and(body_string(r#"{"a":1}"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let mut req = request("PUT", format!("{}/items", server.uri()));
        req.headers
            .insert("content-type".into(), "application/json".into());
        req.body = Some(r#"{"a":1}"#.into());

        let res = ReqwestFetcher::new().unwrap().fetch(req).await.unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.status_text, "OK");
        assert_eq!(res.body, r#"{"ok":true}"#);
        assert!(res.headers["content-type"].starts_with("application/json"));
    }

    #[tokio::test]
    async fn non_success_status_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let res = ReqwestFetcher::new()
            .unwrap()
            .fetch(request("GET", server.uri()))
            .await
            .unwrap();
        assert_eq!(res.status, 503);
        assert_eq!(res.body, "down");
    }

    #[tokio::test]
    async fn adds_ambient_transaction_header() {
        let server = MockServer::start().await;
        Mock::given(header(TRANSACTION_HEADER, "txn-out"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = ReqwestFetcher::new().unwrap();
        let res = TransactionContext::new("txn-out")
            .scope(fetcher.fetch(request("POST", server.uri())))
            .await
            .unwrap();
        assert_eq!(res.status, 204);
    }

    #[tokio::test]
    async fn explicit_transaction_header_wins() {
        let server = MockServer::start().await;
        Mock::given(header(TRANSACTION_HEADER, "caller-chosen"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut req = request("GET", server.uri());
        req.headers
            .insert("X-Transaction-Id".into(), "caller-chosen".into());
        let fetcher = ReqwestFetcher::new().unwrap();
        TransactionContext::new("ambient")
            .scope(fetcher.fetch(req))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_method_is_rejected_before_sending() {
        let err = ReqwestFetcher::new()
            .unwrap()
            .fetch(request("NOT A METHOD", "http://localhost/".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::InvalidRequest(_)), "{err}");
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let err = ReqwestFetcher::new()
            .unwrap()
            .fetch(request("GET", "not a url".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::InvalidRequest(_)), "{err}");
    }

    #[tokio::test]
    async fn connection_failure_is_transport_error() {
        let err = ReqwestFetcher::new()
            .unwrap()
            .fetch(request("GET", "http://127.0.0.1:1/".into()))
            .await
            .unwrap_err();
        match err {
            ForwardError::Transport { url, .. } => assert_eq!(url, "http://127.0.0.1:1/"),
            other => panic!("expected transport error, got {other:?}"),
        }
    }
}
