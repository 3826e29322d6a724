//! Per-session state machine: `Uninitialized -> Active -> Closed`.
//!
//! A [`Session`] answers the client's POSTed JSON-RPC messages, forwards
//! operations to the [`Dispatcher`], and owns the push side of the session's
//! event stream. Every pushed message is written to the [`EventStore`] first,
//! then offered to the currently attached SSE channel (if any). Attaching a
//! channel and snapshotting the replay backlog happen under the same lock, so
//! a resuming client sees each event exactly once and in order.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use futures_util::{stream, FutureExt, Stream, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::{
    dispatch::{CallContext, DispatchError, Dispatcher, Notifier},
    error::{SessionIntent, TransportError},
    event_store::{EventId, EventStore, StreamId},
    jsonrpc::{
        self, codes, IncomingMessage, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
        INITIALIZE_METHOD,
    },
    session::{SessionConfig, SessionId},
};

const TOOLS_CALL_METHOD: &str = "tools/call";
const PING_METHOD: &str = "ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Terminated,
    IdleTimeout,
    InitializationFailed,
    Shutdown,
}

impl CloseReason {
    pub fn metric_label(self) -> &'static str {
        match self {
            CloseReason::Terminated => "terminated",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::InitializationFailed => "initialization_failed",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

pub(crate) type CloseHook = Box<dyn FnOnce(&SessionId, CloseReason) + Send>;

/// One message on its way to an SSE response.
#[derive(Debug, Clone, PartialEq)]
pub struct PushFrame {
    pub event_id: EventId,
    pub message: Value,
}

/// Replay backlog plus the live receiver for one GET.
pub struct PushSubscription {
    replayed: Vec<PushFrame>,
    live: mpsc::Receiver<PushFrame>,
}

impl PushSubscription {
    pub fn replayed(&self) -> &[PushFrame] {
        &self.replayed
    }

    pub fn into_stream(self) -> impl Stream<Item = PushFrame> + Send + 'static {
        stream::iter(self.replayed).chain(ReceiverStream::new(self.live))
    }
}

/// Outcome of one POSTed message.
#[derive(Debug)]
pub enum RpcReply {
    Message {
        status: StatusCode,
        body: JsonRpcResponse,
    },
    /// Notifications and client responses: nothing to answer.
    Accepted,
}

impl RpcReply {
    fn ok(id: Value, result: Value) -> Self {
        RpcReply::Message {
            status: StatusCode::OK,
            body: JsonRpcResponse::success(id, result),
        }
    }

    fn error(status: StatusCode, id: Value, code: i64, message: impl Into<String>) -> Self {
        RpcReply::Message {
            status,
            body: JsonRpcResponse::failure(id, JsonRpcError::new(code, message)),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RpcReply::Message { status, .. } => *status,
            RpcReply::Accepted => StatusCode::ACCEPTED,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    #[serde(default)]
    protocol_version: Option<String>,
    #[serde(default)]
    client_info: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

struct SessionInner {
    state: SessionState,
    channel: Option<mpsc::Sender<PushFrame>>,
    last_activity: Instant,
    protocol_version: Option<String>,
    on_close: Option<CloseHook>,
}

pub struct Session {
    id: SessionId,
    stream_id: StreamId,
    created_at: DateTime<Utc>,
    config: Arc<SessionConfig>,
    events: Arc<dyn EventStore>,
    dispatcher: Arc<dyn Dispatcher>,
    this: Weak<Session>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        config: Arc<SessionConfig>,
        events: Arc<dyn EventStore>,
        dispatcher: Arc<dyn Dispatcher>,
        on_close: CloseHook,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            stream_id: StreamId::from(&id),
            id,
            created_at: Utc::now(),
            config,
            events,
            dispatcher,
            this: this.clone(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Uninitialized,
                channel: None,
                last_activity: Instant::now(),
                protocol_version: None,
                on_close: Some(on_close),
            }),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.inner.lock().protocol_version.clone()
    }

    pub fn has_push_channel(&self) -> bool {
        self.inner
            .lock()
            .channel
            .as_ref()
            .map(|sender| !sender.is_closed())
            .unwrap_or(false)
    }

    /// Handles the `initialize` request that created this session.
    pub fn initialize(&self, request: JsonRpcRequest) -> RpcReply {
        let id = request.request_id();
        let params = match &request.params {
            None => InitializeParams::default(),
            Some(Value::Object(_)) => match request.decode_params::<InitializeParams>() {
                Ok(params) => params,
                Err(err) => {
                    return self.reject_initialize(id, format!("invalid initialize params: {err}"))
                }
            },
            Some(_) => {
                return self.reject_initialize(id, "initialize params must be an object".into())
            }
        };

        let negotiated = self.negotiate(params.protocol_version.as_deref());
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Uninitialized {
                return RpcReply::error(
                    StatusCode::BAD_REQUEST,
                    id,
                    codes::INVALID_REQUEST,
                    "session already initialized",
                );
            }
            inner.state = SessionState::Active;
            inner.protocol_version = Some(negotiated.clone());
            inner.last_activity = Instant::now();
        }

        info!(
            session_id = %self.id,
            protocol_version = %negotiated,
            requested = ?params.protocol_version,
            client = ?params.client_info,
            "session initialized"
        );

        RpcReply::ok(
            id,
            json!({
                "protocolVersion": negotiated,
                "capabilities": {
                    "tools": { "listChanged": false },
                    "logging": {}
                },
                "serverInfo": {
                    "name": self.config.server_name,
                    "version": self.config.server_version
                }
            }),
        )
    }

    fn reject_initialize(&self, id: Value, reason: String) -> RpcReply {
        warn!(session_id = %self.id, reason = %reason, "rejecting initialize request");
        self.close(CloseReason::InitializationFailed);
        RpcReply::error(StatusCode::BAD_REQUEST, id, codes::INVALID_PARAMS, reason)
    }

    fn negotiate(&self, requested: Option<&str>) -> String {
        match requested {
            Some(version) if self.config.supports_protocol_version(version) => version.to_string(),
            _ => self.config.latest_protocol_version().to_string(),
        }
    }

    /// Handles one POSTed message on an active session.
    pub async fn handle(&self, message: IncomingMessage) -> Result<RpcReply, TransportError> {
        if !self.touch() {
            return Err(TransportError::SessionNotFound(SessionIntent::Continue));
        }

        match message {
            IncomingMessage::Request(request) => Ok(self.handle_request(request).await),
            IncomingMessage::Notification(notification) => {
                debug!(
                    session_id = %self.id,
                    method = %notification.method,
                    "client notification accepted"
                );
                Ok(RpcReply::Accepted)
            }
            IncomingMessage::Response(response) => {
                let response_id = response.get("id").cloned().unwrap_or(Value::Null);
                debug!(
                    session_id = %self.id,
                    id = %response_id,
                    "client response accepted"
                );
                Ok(RpcReply::Accepted)
            }
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> RpcReply {
        let id = request.request_id();
        match request.method.as_str() {
            INITIALIZE_METHOD => RpcReply::error(
                StatusCode::BAD_REQUEST,
                id,
                codes::INVALID_REQUEST,
                "session already initialized",
            ),
            PING_METHOD => RpcReply::ok(id, json!({})),
            TOOLS_CALL_METHOD => match request.decode_params::<ToolCallParams>() {
                Ok(params) => {
                    let arguments = params.arguments.unwrap_or_else(|| json!({}));
                    self.dispatch(id, &params.name, arguments).await
                }
                Err(err) => RpcReply::error(
                    StatusCode::OK,
                    id,
                    codes::INVALID_PARAMS,
                    format!("invalid params: {err}"),
                ),
            },
            method => {
                let arguments = request.params.clone().unwrap_or_else(|| json!({}));
                self.dispatch(id, method, arguments).await
            }
        }
    }

    async fn dispatch(&self, id: Value, operation: &str, arguments: Value) -> RpcReply {
        let ctx = CallContext::new(self.id.clone(), Notifier::new(self.this.clone()));
        let outcome = AssertUnwindSafe(self.dispatcher.execute(ctx, operation, arguments))
            .catch_unwind()
            .await;
        self.touch();

        match outcome {
            Ok(Ok(result)) => RpcReply::ok(id, result),
            Ok(Err(DispatchError::UnknownOperation(name))) => RpcReply::error(
                StatusCode::OK,
                id,
                codes::METHOD_NOT_FOUND,
                format!("unknown operation {name}"),
            ),
            Ok(Err(DispatchError::InvalidArguments(reason))) => RpcReply::error(
                StatusCode::OK,
                id,
                codes::INVALID_PARAMS,
                format!("invalid arguments: {reason}"),
            ),
            Ok(Err(DispatchError::Failed(reason))) => {
                debug!(session_id = %self.id, operation, reason = %reason, "operation failed");
                RpcReply::error(StatusCode::OK, id, codes::OPERATION_FAILED, reason)
            }
            Ok(Err(DispatchError::Internal(err))) => {
                error!(session_id = %self.id, operation, error = ?err, "operation errored");
                Self::internal_error(id)
            }
            Err(panic) => {
                error!(
                    session_id = %self.id,
                    operation,
                    panic = %panic_message(panic.as_ref()),
                    "operation panicked"
                );
                Self::internal_error(id)
            }
        }
    }

    fn internal_error(id: Value) -> RpcReply {
        RpcReply::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            id,
            codes::INTERNAL_ERROR,
            "internal error",
        )
    }

    /// Records activity; `false` once the session has left `Active`.
    fn touch(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Active {
            return false;
        }
        inner.last_activity = Instant::now();
        true
    }

    /// Appends `message` to the session's stream and offers it to the live
    /// channel. `None` unless the session is active.
    pub fn push(&self, message: Value) -> Option<EventId> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Active {
            return None;
        }

        let event_id = self.events.append(&self.stream_id, message.clone());
        let delivery = inner.channel.as_ref().map(|sender| {
            sender.try_send(PushFrame {
                event_id: event_id.clone(),
                message,
            })
        });
        match delivery {
            None | Some(Ok(())) => {}
            Some(Err(TrySendError::Full(_))) => {
                // The client falls behind; it resumes from the log via Last-Event-ID.
                warn!(
                    session_id = %self.id,
                    event_id = %event_id,
                    "push channel full; detaching"
                );
                counter!("beach_mcp_push_channel_detached_total", 1, "reason" => "full");
                inner.channel = None;
            }
            Some(Err(TrySendError::Closed(_))) => {
                debug!(session_id = %self.id, "push channel dropped by client");
                counter!("beach_mcp_push_channel_detached_total", 1, "reason" => "closed");
                inner.channel = None;
            }
        }
        Some(event_id)
    }

    pub fn notify(&self, method: &str, params: Option<Value>) -> Option<EventId> {
        self.push(jsonrpc::notification(method, params))
    }

    /// Attaches a fresh push channel, replacing any previous one. When
    /// `last_event_id` belongs to this session's stream, the events recorded
    /// after it are returned as the subscription's backlog.
    pub fn open_stream(
        &self,
        last_event_id: Option<&EventId>,
    ) -> Result<PushSubscription, TransportError> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Active {
            return Err(TransportError::SessionNotFound(SessionIntent::Continue));
        }

        let mut replayed = Vec::new();
        if let Some(last) = last_event_id {
            if last.stream_id().as_ref() == Some(&self.stream_id) {
                let outcome = self.events.replay_after(last, &mut |event_id, message| {
                    replayed.push(PushFrame {
                        event_id: event_id.clone(),
                        message: message.clone(),
                    })
                });
                if outcome.is_none() {
                    debug!(
                        session_id = %self.id,
                        last_event_id = %last,
                        "resumption point unknown; continuing with live events"
                    );
                }
            } else {
                warn!(
                    session_id = %self.id,
                    last_event_id = %last,
                    "ignoring resumption marker from another stream"
                );
            }
        }

        let (sender, live) = mpsc::channel(self.config.push_channel_depth);
        if inner.channel.replace(sender).is_some() {
            debug!(session_id = %self.id, "push channel rebound");
        }
        inner.last_activity = Instant::now();
        info!(
            session_id = %self.id,
            replayed = replayed.len(),
            "push channel opened"
        );

        Ok(PushSubscription { replayed, live })
    }

    /// Moves the session to `Closed`. Only the first call has any effect.
    pub fn close(&self, reason: CloseReason) -> bool {
        let hook = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Closed {
                return false;
            }
            inner.state = SessionState::Closed;
            inner.channel = None;
            inner.on_close.take()
        };

        self.events.forget_stream(&self.stream_id);
        counter!(
            "beach_mcp_sessions_closed_total",
            1,
            "reason" => reason.metric_label()
        );
        info!(
            session_id = %self.id,
            reason = reason.metric_label(),
            age_secs = (Utc::now() - self.created_at).num_seconds(),
            "session closed"
        );

        if let Some(hook) = hook {
            hook(&self.id, reason);
        }
        true
    }

    /// How long the session has gone without activity while no client is
    /// listening. `None` if it is streaming or not active.
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        let inner = self.inner.lock();
        let streaming = inner
            .channel
            .as_ref()
            .map(|sender| !sender.is_closed())
            .unwrap_or(false);
        if inner.state != SessionState::Active || streaming {
            return None;
        }
        Some(now.saturating_duration_since(inner.last_activity))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
