//! End-to-end batch behavior with a real sandbox and a real HTTP transport.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cascade_client::ReqwestFetcher;
use cascade_context::{TransactionContext, TRANSACTION_HEADER};
use cascade_engine::{ActionDispatcher, BatchError};
use cascade_error::ForwardError;
use cascade_sandbox::{
    FetchDispatcher, FetchRequest, FetchResponse, SandboxConfig, SandboxError, SandboxExecutor,
};
use serde_json::{json, Value};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn dispatcher_with(transport: Arc<dyn FetchDispatcher>) -> ActionDispatcher {
    ActionDispatcher::new(
        Arc::new(SandboxExecutor::new(SandboxConfig::default())),
        transport,
    )
}

fn http_dispatcher() -> ActionDispatcher {
    dispatcher_with(Arc::new(ReqwestFetcher::new().unwrap()))
}

/// Records each request's transaction header and answers `{"results": <header>}`.
#[derive(Default)]
struct TransactionEcho {
    seen: Mutex<Vec<(String, Option<String>)>>,
}

#[async_trait::async_trait]
impl FetchDispatcher for TransactionEcho {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ForwardError> {
        let ambient = TransactionContext::current_id();
        self.seen
            .lock()
            .unwrap()
            .push((request.url.clone(), ambient.clone()));
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(FetchResponse {
            status: 200,
            status_text: "OK".into(),
            headers: Default::default(),
            url: request.url,
            body: json!({ "results": ambient }).to_string(),
        })
    }
}

#[tokio::test]
async fn code_action_returns_value() {
    let results = http_dispatcher()
        .process_batch(&json!([{ "type": "code", "source": "return 1+1;" }]))
        .await
        .unwrap();
    assert_eq!(results, vec![json!(2)]);
}

#[tokio::test]
async fn results_follow_expanded_order() {
    let batch = json!([
        { "type": "code", "source": "return 'a';", "repeat": 2 },
        { "type": "frobnicate" },
        { "type": "code", "source": "return 'b';", "repeat": 0 },
        { "type": "code", "source": "return 'c';", "repeat": 3 },
    ]);
    let results = http_dispatcher().process_batch(&batch).await.unwrap();
    assert_eq!(
        results,
        vec![
            json!("a"),
            json!("a"),
            json!({ "error": "Unknown action type: frobnicate" }),
            json!("c"),
            json!("c"),
            json!("c"),
        ]
    );
}

#[tokio::test]
async fn infinite_loop_is_cut_off_at_the_deadline() {
    let started = Instant::now();
    let err = http_dispatcher()
        .process_batch(&json!([{ "type": "code", "source": "while (true) {}" }]))
        .await
        .unwrap_err();
    assert!(
        matches!(err, BatchError::Execution(SandboxError::Timeout { timeout_ms: 3000 })),
        "{err:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn globals_do_not_leak_between_runs() {
    let results = http_dispatcher()
        .process_batch(&json!([
            { "type": "code", "source": "global.x = 1;" },
            { "type": "code", "source": "return typeof global.x;" },
        ]))
        .await
        .unwrap();
    assert_eq!(results, vec![Value::Null, json!("undefined")]);
}

#[tokio::test]
async fn http_actions_unwrap_results() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/wrapped"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({ "q": 1 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [1, 2, 3] })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/plain"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "foo": "bar" })))
        .mount(&server)
        .await;
    Mock::given(path("/text"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;

    let batch = json!([
        { "type": "http", "url": format!("{}/wrapped", server.uri()), "body": { "q": 1 } },
        { "type": "http", "url": format!("{}/plain", server.uri()), "method": "GET" },
        { "type": "http", "url": format!("{}/text", server.uri()) },
    ]);
    let results = http_dispatcher().process_batch(&batch).await.unwrap();
    assert_eq!(results, vec![json!([1, 2, 3]), json!({ "foo": "bar" }), json!({})]);
}

#[tokio::test]
async fn forwards_carry_the_transaction_id() {
    let server = MockServer::start().await;
    Mock::given(header(TRANSACTION_HEADER, "txn-forward"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": "seen" })))
        .expect(2)
        .mount(&server)
        .await;

    let url = format!("{}/next", server.uri());
    let batch = json!([
        { "type": "http", "url": url.clone() },
        { "type": "code", "source": format!("const r = await fetch('{url}'); return (await r.json()).results;") },
    ]);
    let results = TransactionContext::new("txn-forward")
        .scope(http_dispatcher().process_batch(&batch))
        .await
        .unwrap();
    assert_eq!(results, vec![json!("seen"), json!("seen")]);
}

#[tokio::test]
async fn script_failure_stops_the_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let url = server.uri();
    let batch = json!([
        { "type": "http", "url": url.clone() },
        { "type": "code", "source": "throw new Error('boom');" },
        { "type": "http", "url": url },
    ]);
    let err = http_dispatcher().process_batch(&batch).await.unwrap_err();
    match err {
        BatchError::Execution(SandboxError::JsError { message }) => {
            assert!(message.contains("boom"), "{message}")
        }
        other => panic!("expected script error, got {other:?}"),
    }
}

#[tokio::test]
async fn transport_failure_stops_the_batch() {
    let batch = json!([
        { "type": "http", "url": "http://127.0.0.1:1/unreachable" },
        { "type": "code", "source": "return 1;" },
    ]);
    let err = http_dispatcher().process_batch(&batch).await.unwrap_err();
    assert!(
        matches!(err, BatchError::Forward(ForwardError::Transport { .. })),
        "{err:?}"
    );
}

#[tokio::test]
async fn replaying_a_pure_batch_is_idempotent() {
    let batch = json!([
        { "type": "code", "source": "return [1, 2, 3].map(n => n * 2);", "repeat": 2 },
        { "type": "code", "source": "const o = { a: 1 }; o.b = 'x'; return o;" },
        { "type": "mystery" },
    ]);
    let dispatcher = http_dispatcher();
    let first = dispatcher.process_batch(&batch).await.unwrap();
    let second = dispatcher.process_batch(&batch).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batches_keep_their_own_transaction() {
    let echo = Arc::new(TransactionEcho::default());
    let dispatcher = Arc::new(dispatcher_with(echo.clone()));

    let mut handles = Vec::new();
    for i in 0..4 {
        let dispatcher = dispatcher.clone();
        let batch = json!([
            { "type": "http", "url": format!("http://svc/{i}"), "repeat": 3 },
            { "type": "code", "source": format!(
                "const r = await fetch('http://svc/{i}/script'); return (await r.json()).results;"
            ) },
        ]);
        handles.push(tokio::spawn(async move {
            let id = format!("txn-{i}");
            let results = TransactionContext::new(id.clone())
                .scope(async move { dispatcher.process_batch(&batch).await })
                .await
                .unwrap();
            (id, results)
        }));
    }

    for handle in handles {
        let (id, results) = handle.await.unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r == &json!(id)), "{id}: {results:?}");
    }

    for (url, seen) in echo.seen.lock().unwrap().iter() {
        let i = url
            .trim_start_matches("http://svc/")
            .split('/')
            .next()
            .unwrap();
        assert_eq!(seen.as_deref(), Some(format!("txn-{i}").as_str()), "{url}");
    }
}
