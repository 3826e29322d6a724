use std::convert::Infallible;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::StreamExt;
use metrics::counter;
use serde_json::json;
use tracing::debug;

use crate::{
    controller::{CloseReason, RpcReply},
    error::{SessionIntent, TransportError},
    event_store::EventId,
    jsonrpc::{IncomingMessage, JsonRpcRequest, JSONRPC_VERSION, INITIALIZE_METHOD},
    session::SessionId,
    state::AppState,
};

pub const SESSION_HEADER: &str = "mcp-session-id";
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

#[derive(Debug)]
pub enum RequestKind {
    Initiate(JsonRpcRequest),
    Continue(SessionId),
    Resume {
        session_id: SessionId,
        last_event_id: Option<EventId>,
    },
    Terminate(SessionId),
}

impl RequestKind {
    fn label(&self) -> &'static str {
        match self {
            RequestKind::Initiate(_) => "initiate",
            RequestKind::Continue(_) => "continue",
            RequestKind::Resume { .. } => "resume",
            RequestKind::Terminate(_) => "terminate",
        }
    }
}

fn optional_header(headers: &HeaderMap, name: &str) -> Result<Option<String>, TransportError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => {
            let text = value
                .to_str()
                .map_err(|_| TransportError::malformed(format!("{name} header is not valid text")))?
                .trim();
            Ok((!text.is_empty()).then(|| text.to_string()))
        }
    }
}

/// Decides what a `/mcp` request is asking for. Only a POST without a
/// session header may create a session, and only if it is `initialize`.
pub fn classify(
    method: &Method,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<RequestKind, TransportError> {
    let missing_session = || TransportError::malformed(format!("missing {SESSION_HEADER} header"));

    let Some(session_id) = optional_header(headers, SESSION_HEADER)?.map(SessionId::from) else {
        if *method != Method::POST {
            return Err(missing_session());
        }
        return match IncomingMessage::parse(body)? {
            IncomingMessage::Request(request) if request.method == INITIALIZE_METHOD => {
                Ok(RequestKind::Initiate(request))
            }
            _ => Err(missing_session()),
        };
    };

    if *method == Method::POST {
        Ok(RequestKind::Continue(session_id))
    } else if *method == Method::GET {
        Ok(RequestKind::Resume {
            session_id,
            last_event_id: optional_header(headers, LAST_EVENT_ID_HEADER)?.map(EventId::from),
        })
    } else if *method == Method::DELETE {
        Ok(RequestKind::Terminate(session_id))
    } else {
        Err(TransportError::malformed(format!("unsupported method {method}")))
    }
}

pub async fn handle_mcp(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let outcome = match classify(&method, &headers, &body) {
        Ok(kind) => {
            counter!("beach_mcp_requests_total", 1, "kind" => kind.label());
            match kind {
                RequestKind::Initiate(request) => initiate(&state, request),
                RequestKind::Continue(session_id) => {
                    continue_session(&state, &session_id, &body).await
                }
                RequestKind::Resume {
                    session_id,
                    last_event_id,
                } => resume(&state, &session_id, last_event_id.as_ref()),
                RequestKind::Terminate(session_id) => terminate(&state, &session_id),
            }
        }
        Err(err) => Err(err),
    };

    outcome.unwrap_or_else(|err| {
        debug!(method = %method, reason = err.metric_label(), error = %err, "mcp request rejected");
        err.into_response()
    })
}

fn reply_response(reply: RpcReply) -> Response {
    match reply {
        RpcReply::Message { status, body } => (status, Json(body)).into_response(),
        RpcReply::Accepted => StatusCode::ACCEPTED.into_response(),
    }
}

fn initiate(state: &AppState, request: JsonRpcRequest) -> Result<Response, TransportError> {
    let session = state.sessions().create();
    let reply = session.initialize(request);
    if !session.is_active() {
        return Ok(reply_response(reply));
    }

    let header = match HeaderValue::from_str(session.id().as_str()) {
        Ok(header) => header,
        Err(err) => {
            session.close(CloseReason::InitializationFailed);
            return Err(TransportError::Internal(
                anyhow::Error::new(err).context("session id is not a valid header value"),
            ));
        }
    };
    let mut response = reply_response(reply);
    response.headers_mut().insert(SESSION_HEADER, header);
    Ok(response)
}

async fn continue_session(
    state: &AppState,
    session_id: &SessionId,
    body: &[u8],
) -> Result<Response, TransportError> {
    let session = state
        .sessions()
        .get(session_id)
        .ok_or(TransportError::SessionNotFound(SessionIntent::Continue))?;
    let message = IncomingMessage::parse(body)?;
    let reply = session.handle(message).await?;
    Ok(reply_response(reply))
}

fn resume(
    state: &AppState,
    session_id: &SessionId,
    last_event_id: Option<&EventId>,
) -> Result<Response, TransportError> {
    let session = state
        .sessions()
        .get(session_id)
        .ok_or(TransportError::SessionNotFound(SessionIntent::Continue))?;
    let subscription = session.open_stream(last_event_id)?;

    let stream = subscription.into_stream().map(|frame| {
        let data = serde_json::to_string(&frame.message).unwrap_or_else(|_| "{}".into());
        Ok::<_, Infallible>(
            Event::default()
                .id(frame.event_id.as_str())
                .event("message")
                .data(data),
        )
    });
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(state.keep_alive()))
        .into_response())
}

fn terminate(state: &AppState, session_id: &SessionId) -> Result<Response, TransportError> {
    if !state.sessions().terminate(session_id) {
        return Err(TransportError::SessionNotFound(SessionIntent::Terminate));
    }
    Ok(Json(json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": null,
        "result": { "terminated": true, "sessionId": session_id }
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    const INITIALIZE: &[u8] = br#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#;
    const PING: &[u8] = br#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#;

    fn with_session(id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_str(id).unwrap());
        headers
    }

    #[test]
    fn post_without_session_must_be_initialize() {
        let headers = HeaderMap::new();
        assert!(matches!(
            classify(&Method::POST, &headers, INITIALIZE),
            Ok(RequestKind::Initiate(request)) if request.id == Some(json!(1))
        ));
        assert!(matches!(
            classify(&Method::POST, &headers, PING),
            Err(TransportError::Malformed(_))
        ));
        assert!(matches!(
            classify(&Method::POST, &headers, b"{oops"),
            Err(TransportError::Parse(_))
        ));
    }

    #[test]
    fn session_header_selects_continuation() {
        let headers = with_session("abc");
        assert!(matches!(
            classify(&Method::POST, &headers, INITIALIZE),
            Ok(RequestKind::Continue(id)) if id.as_str() == "abc"
        ));
        assert!(matches!(
            classify(&Method::DELETE, &headers, b""),
            Ok(RequestKind::Terminate(id)) if id.as_str() == "abc"
        ));
    }

    #[test]
    fn get_carries_last_event_id() {
        let mut headers = with_session("abc");
        assert!(matches!(
            classify(&Method::GET, &headers, b""),
            Ok(RequestKind::Resume { last_event_id: None, .. })
        ));

        headers.insert(
            LAST_EVENT_ID_HEADER,
            HeaderValue::from_static("abc_00000000000000000003"),
        );
        assert!(matches!(
            classify(&Method::GET, &headers, b""),
            Ok(RequestKind::Resume { last_event_id: Some(id), .. })
                if id.as_str() == "abc_00000000000000000003"
        ));
    }

    #[test]
    fn get_and_delete_need_a_session() {
        let headers = HeaderMap::new();
        for method in [Method::GET, Method::DELETE] {
            assert!(matches!(
                classify(&method, &headers, b""),
                Err(TransportError::Malformed(_))
            ));
        }
        assert!(matches!(
            classify(&Method::GET, &with_session("   "), b""),
            Err(TransportError::Malformed(_))
        ));
    }
}
