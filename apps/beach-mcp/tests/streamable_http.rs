use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::{self, Body, BodyDataStream},
    http::{HeaderValue, Request, StatusCode},
    response::Response,
    Router,
};
use beach_mcp::{
    build_router,
    jsonrpc::codes,
    routes::mcp::{LAST_EVENT_ID_HEADER, SESSION_HEADER},
    AppState, CallContext, DispatchError, Dispatcher, SessionId, SessionState, ToolRegistry,
    TransportConfig,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tower::util::ServiceExt;

const PROTOCOL_VERSION: &str = "mcp-protocol-version";

fn app_with(dispatcher: Arc<dyn Dispatcher>) -> (Router, AppState) {
    app_with_config(&TransportConfig::default(), dispatcher)
}

fn app_with_config(
    config: &TransportConfig,
    dispatcher: Arc<dyn Dispatcher>,
) -> (Router, AppState) {
    let state = AppState::new(config, dispatcher);
    (build_router(state.clone()), state)
}

fn app() -> (Router, AppState) {
    app_with(Arc::new(ToolRegistry::with_diagnostics()))
}

fn initialize_body() -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-03-26",
            "clientInfo": { "name": "integration", "version": "0.0.0" }
        }
    })
}

fn post(session: Option<&str>, body: &Value) -> Request<Body> {
    post_raw(session, body.to_string())
}

fn post_raw(session: Option<&str>, body: impl Into<Body>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json");
    if let Some(session) = session {
        builder = builder.header(SESSION_HEADER, session);
    }
    builder.body(body.into()).unwrap()
}

fn get_stream(session: &str, last_event_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("GET")
        .uri("/mcp")
        .header("accept", "text/event-stream")
        .header(SESSION_HEADER, session);
    if let Some(last) = last_event_id {
        builder = builder.header(LAST_EVENT_ID_HEADER, last);
    }
    builder.body(Body::empty()).unwrap()
}

fn delete(session: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri("/mcp")
        .header(SESSION_HEADER, session)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn initialize(app: &Router) -> String {
    let response = app.clone().oneshot(post(None, &initialize_body())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session = response.headers()[SESSION_HEADER]
        .to_str()
        .unwrap()
        .to_string();
    let body = json_body(response).await;
    assert_eq!(body["result"]["protocolVersion"], "2025-03-26");
    session
}

fn tool_call(id: i64, name: &str, arguments: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": name, "arguments": arguments }
    })
}

/// Pushes a notification through the `notify` tool and returns its event id.
async fn notify(app: &Router, session: &str, message: &str) -> String {
    let response = app
        .clone()
        .oneshot(post(
            Some(session),
            &tool_call(10, "notify", json!({ "message": message })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    body["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .to_string()
}

struct SseReader {
    body: BodyDataStream,
    buffer: String,
}

impl SseReader {
    fn new(response: Response) -> Self {
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );
        Self {
            body: response.into_body().into_data_stream(),
            buffer: String::new(),
        }
    }

    /// Next `(id, data)` pair; skips keep-alive comments.
    async fn next_event(&mut self) -> (String, Value) {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..end + 2).collect();
                let mut id = None;
                let mut data = None;
                for line in block.lines() {
                    if let Some(value) = line.strip_prefix("id:") {
                        id = Some(value.trim().to_string());
                    } else if let Some(value) = line.strip_prefix("data:") {
                        data = Some(value.trim().to_string());
                    }
                }
                if let (Some(id), Some(data)) = (id, data) {
                    return (id, serde_json::from_str(&data).unwrap());
                }
                continue;
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), self.body.next())
                .await
                .expect("timed out waiting for an SSE event")
                .expect("stream ended")
                .unwrap();
            self.buffer.push_str(std::str::from_utf8(&chunk).unwrap());
        }
    }
}

fn message_text(event: &Value) -> &str {
    event["params"]["data"].as_str().unwrap()
}

#[tokio::test]
async fn resumes_missed_events_after_reconnect() {
    let (app, _state) = app();
    let session = initialize(&app).await;

    let mut stream = SseReader::new(app.clone().oneshot(get_stream(&session, None)).await.unwrap());
    let e1 = notify(&app, &session, "one").await;
    let e2 = notify(&app, &session, "two").await;

    let (id, event) = stream.next_event().await;
    assert_eq!(id, e1);
    assert_eq!(event["method"], "notifications/message");
    assert_eq!(message_text(&event), "one");
    let (id, _) = stream.next_event().await;
    assert_eq!(id, e2);

    // Network drop.
    drop(stream);
    let e3 = notify(&app, &session, "three").await;
    let e4 = notify(&app, &session, "four").await;

    let mut resumed = SseReader::new(
        app.clone()
            .oneshot(get_stream(&session, Some(&e2)))
            .await
            .unwrap(),
    );
    let (id, event) = resumed.next_event().await;
    assert_eq!((id.as_str(), message_text(&event)), (e3.as_str(), "three"));
    let (id, event) = resumed.next_event().await;
    assert_eq!((id.as_str(), message_text(&event)), (e4.as_str(), "four"));

    let e5 = notify(&app, &session, "five").await;
    let (id, event) = resumed.next_event().await;
    assert_eq!((id.as_str(), message_text(&event)), (e5.as_str(), "five"));
}

#[tokio::test]
async fn resumption_marker_from_another_session_is_ignored() {
    let (app, _state) = app();
    let alice = initialize(&app).await;
    let bob = initialize(&app).await;

    let alice_event = notify(&app, &alice, "a1").await;
    notify(&app, &alice, "a2 private").await;

    let mut stream = SseReader::new(
        app.clone()
            .oneshot(get_stream(&bob, Some(&alice_event)))
            .await
            .unwrap(),
    );
    let bob_event = notify(&app, &bob, "b1").await;
    let (id, event) = stream.next_event().await;
    assert_eq!(id, bob_event);
    assert_eq!(message_text(&event), "b1");
}

#[tokio::test]
async fn resuming_from_the_newest_event_replays_nothing() {
    let (app, _state) = app();
    let session = initialize(&app).await;

    let mut stream = SseReader::new(app.clone().oneshot(get_stream(&session, None)).await.unwrap());
    let e1 = notify(&app, &session, "one").await;
    let e2 = notify(&app, &session, "two").await;
    assert_eq!(stream.next_event().await.0, e1);
    assert_eq!(stream.next_event().await.0, e2);
    drop(stream);

    let mut resumed = SseReader::new(
        app.clone()
            .oneshot(get_stream(&session, Some(&e2)))
            .await
            .unwrap(),
    );
    let e3 = notify(&app, &session, "three").await;
    let (id, event) = resumed.next_event().await;
    assert_eq!((id.as_str(), message_text(&event)), (e3.as_str(), "three"));
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (app, state) = app();
    let session = initialize(&app).await;

    let response = app.clone().oneshot(delete(&session)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["result"]["terminated"], true);
    assert_eq!(body["result"]["sessionId"], session.as_str());

    let response = app.clone().oneshot(delete(&session)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"]["code"], codes::SESSION_NOT_FOUND);

    let ping = json!({ "jsonrpc": "2.0", "id": 3, "method": "ping" });
    let response = app.clone().oneshot(post(Some(&session), &ping)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(state.sessions().get(&SessionId::from(session)).is_none());
}

#[tokio::test]
async fn disallowed_origin_is_rejected_before_routing() {
    let (app, state) = app();
    let mut request = post(None, &initialize_body());
    request
        .headers_mut()
        .insert("origin", "http://evil.com".parse().unwrap());

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], codes::ACCESS_DENIED);
    assert_eq!(body["id"], Value::Null);
    assert!(state.sessions().is_empty());

    let mut request = post(None, &initialize_body());
    request
        .headers_mut()
        .insert("origin", "http://localhost:5173".parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn origin_is_rejected_before_an_oversized_body_is_read() {
    let config = TransportConfig {
        max_body_bytes: 16,
        ..TransportConfig::default()
    };
    let (app, state) = app_with_config(&config, Arc::new(ToolRegistry::with_diagnostics()));

    let mut request = post(None, &initialize_body());
    request
        .headers_mut()
        .insert("origin", "http://evil.example".parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"]["code"], codes::ACCESS_DENIED);

    let response = app.clone().oneshot(post(None, &initialize_body())).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(state.sessions().is_empty());
}

#[tokio::test]
async fn non_text_origin_is_rejected() {
    let (app, state) = app();
    let mut request = post(None, &initialize_body());
    request.headers_mut().insert(
        "origin",
        HeaderValue::from_bytes(b"http://evil.example\xff").unwrap(),
    );

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"]["code"], codes::ACCESS_DENIED);
    assert!(state.sessions().is_empty());
}

#[tokio::test]
async fn initiation_is_exempt_from_version_check() {
    let (app, _state) = app();

    let mut request = post(None, &initialize_body());
    request
        .headers_mut()
        .insert(PROTOCOL_VERSION, "1999-01-01".parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session = response.headers()[SESSION_HEADER]
        .to_str()
        .unwrap()
        .to_string();

    let ping = json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" });
    let mut request = post(Some(&session), &ping);
    request
        .headers_mut()
        .insert(PROTOCOL_VERSION, "1999-01-01".parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], codes::VERSION_MISMATCH);

    let mut request = post(Some(&session), &ping);
    request
        .headers_mut()
        .insert(PROTOCOL_VERSION, "2025-03-26".parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn malformed_requests_get_json_rpc_errors() {
    let (app, state) = app();
    let ping = json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" });

    let response = app.clone().oneshot(post(None, &ping)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], codes::INVALID_REQUEST);

    let response = app.clone().oneshot(post_raw(None, "{not json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], codes::PARSE_ERROR);

    let batch = json!([initialize_body()]);
    let response = app.clone().oneshot(post(None, &batch)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("GET")
        .uri("/mcp")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert!(state.sessions().is_empty());
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let (app, _state) = app();
    let ping = json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" });

    let response = app
        .clone()
        .oneshot(post(Some("does-not-exist"), &ping))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], codes::SESSION_NOT_FOUND);

    let response = app
        .clone()
        .oneshot(get_stream("does-not-exist", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.clone().oneshot(delete("does-not-exist")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn tools_are_reachable_through_a_session() {
    let (app, _state) = app();
    let session = initialize(&app).await;

    let response = app
        .clone()
        .oneshot(post(Some(&session), &tool_call(4, "echo", json!({ "text": "hi" }))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["id"], 4);
    assert_eq!(body["result"]["content"][0]["text"], "hi");

    let response = app
        .clone()
        .oneshot(post(Some(&session), &tool_call(5, "missing", json!({}))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["error"]["code"], codes::METHOD_NOT_FOUND);

    let initialized = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
    let response = app
        .clone()
        .oneshot(post(Some(&session), &initialized))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

struct Broken;

#[async_trait]
impl Dispatcher for Broken {
    async fn execute(
        &self,
        _ctx: CallContext,
        _operation: &str,
        _arguments: Value,
    ) -> Result<Value, DispatchError> {
        Err(DispatchError::Internal(anyhow::anyhow!(
            "query failed on replica db-7.internal"
        )))
    }
}

#[tokio::test]
async fn internal_errors_do_not_leak_or_close_the_session() {
    let (app, state) = app_with(Arc::new(Broken));
    let session = initialize(&app).await;

    let response = app
        .clone()
        .oneshot(post(Some(&session), &tool_call(6, "anything", json!({}))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], codes::INTERNAL_ERROR);
    assert!(!body.to_string().contains("db-7"));

    assert!(state.sessions().get(&SessionId::from(session.as_str())).is_some());
    let ping = json!({ "jsonrpc": "2.0", "id": 7, "method": "ping" });
    let response = app.clone().oneshot(post(Some(&session), &ping)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

/// Parks every call until released so a request can be held in flight.
#[derive(Default)]
struct Gated {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl Dispatcher for Gated {
    async fn execute(
        &self,
        _ctx: CallContext,
        operation: &str,
        _arguments: Value,
    ) -> Result<Value, DispatchError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(json!({ "operation": operation }))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_during_in_flight_call_still_answers_it() {
    let gated = Arc::new(Gated::default());
    let (app, state) = app_with(gated.clone());
    let session = initialize(&app).await;
    let live = state
        .sessions()
        .get(&SessionId::from(session.as_str()))
        .unwrap();

    let in_flight = tokio::spawn(
        app.clone()
            .oneshot(post(Some(&session), &tool_call(8, "slow", json!({})))),
    );
    gated.entered.notified().await;

    let response = app.clone().oneshot(delete(&session)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(live.state(), SessionState::Closed);

    gated.release.notify_one();
    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["id"], 8);
    assert_eq!(body["result"]["operation"], "slow");

    assert_eq!(live.state(), SessionState::Closed);
    assert!(state.sessions().get(live.id()).is_none());
    let ping = json!({ "jsonrpc": "2.0", "id": 9, "method": "ping" });
    let response = app.clone().oneshot(post(Some(&session), &ping)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let response = app.clone().oneshot(get_stream(&session, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_initiations_get_distinct_sessions() {
    let (app, state) = app();
    let handles: Vec<_> = (0..32)
        .map(|_| {
            let app = app.clone();
            tokio::spawn(async move {
                let response = app.oneshot(post(None, &initialize_body())).await.unwrap();
                assert_eq!(response.status(), StatusCode::OK);
                response.headers()[SESSION_HEADER]
                    .to_str()
                    .unwrap()
                    .to_string()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        assert!(ids.insert(handle.await.unwrap()));
    }
    assert_eq!(state.sessions().active_count(), 32);
}

#[tokio::test]
async fn health_reports_active_sessions() {
    let (app, _state) = app();
    initialize(&app).await;

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_sessions"], 1);
}
