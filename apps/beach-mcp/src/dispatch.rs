//! Boundary between the session transport and whatever executes operations.

use std::{
    collections::BTreeMap,
    future::Future,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    controller::Session,
    event_store::EventId,
    session::SessionId,
};

/// Operation name the transport uses to ask for the tool catalog.
pub const LIST_OPERATIONS: &str = "tools/list";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown operation {0}")]
    UnknownOperation(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// The operation ran and reported a failure the client should see.
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Executes decoded operations on behalf of a session.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn execute(
        &self,
        ctx: CallContext,
        operation: &str,
        arguments: Value,
    ) -> Result<Value, DispatchError>;
}

/// Per-call view of the calling session.
#[derive(Clone)]
pub struct CallContext {
    session_id: SessionId,
    notifier: Notifier,
}

impl CallContext {
    pub(crate) fn new(session_id: SessionId, notifier: Notifier) -> Self {
        Self {
            session_id,
            notifier,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}

/// Pushes notifications onto a session's stream without keeping it alive.
#[derive(Clone)]
pub struct Notifier {
    session: Weak<Session>,
}

impl Notifier {
    pub(crate) fn new(session: Weak<Session>) -> Self {
        Self { session }
    }

    /// Returns the event id, or `None` once the session is gone or closed.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Option<EventId> {
        self.session.upgrade()?.notify(method, params)
    }
}

type ToolFuture = BoxFuture<'static, Result<Value, DispatchError>>;
type ToolHandler = Arc<dyn Fn(CallContext, Value) -> ToolFuture + Send + Sync>;

struct RegisteredTool {
    description: String,
    input_schema: Value,
    handler: ToolHandler,
}

/// Name-to-handler table implementing [`Dispatcher`].
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the transport's own diagnostic tools.
    pub fn with_diagnostics() -> Self {
        Self::new()
            .register(
                "echo",
                "Returns the supplied text.",
                json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"]
                }),
                |_ctx, arguments| async move {
                    let text = arguments
                        .get("text")
                        .and_then(Value::as_str)
                        .ok_or_else(|| DispatchError::InvalidArguments("text is required".into()))?;
                    Ok::<_, DispatchError>(text_content(text))
                },
            )
            .register(
                "notify",
                "Pushes a log notification onto the caller's event stream.",
                json!({
                    "type": "object",
                    "properties": { "message": { "type": "string" } },
                    "required": ["message"]
                }),
                |ctx, arguments| async move {
                    let message = arguments
                        .get("message")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            DispatchError::InvalidArguments("message is required".into())
                        })?;
                    let event_id = ctx
                        .notifier()
                        .notify(
                            "notifications/message",
                            Some(json!({ "level": "info", "data": message })),
                        )
                        .ok_or_else(|| DispatchError::Failed("session is closed".into()))?;
                    Ok::<_, DispatchError>(text_content(event_id.as_str()))
                },
            )
    }

    pub fn register<F, Fut>(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, DispatchError>> + Send + 'static,
    {
        let handler: ToolHandler = Arc::new(move |ctx, arguments| handler(ctx, arguments).boxed());
        self.tools.insert(
            name.into(),
            RegisteredTool {
                description: description.into(),
                input_schema,
                handler,
            },
        );
        self
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn catalog(&self) -> Value {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .map(|(name, tool)| {
                json!({
                    "name": name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();
        json!({ "tools": tools })
    }
}

#[async_trait]
impl Dispatcher for ToolRegistry {
    async fn execute(
        &self,
        ctx: CallContext,
        operation: &str,
        arguments: Value,
    ) -> Result<Value, DispatchError> {
        if operation == LIST_OPERATIONS {
            return Ok(self.catalog());
        }
        let handler = self
            .tools
            .get(operation)
            .map(|tool| Arc::clone(&tool.handler))
            .ok_or_else(|| DispatchError::UnknownOperation(operation.to_string()))?;
        handler(ctx, arguments).await
    }
}

fn text_content(text: &str) -> Value {
    json!({ "content": [{ "type": "text", "text": text }] })
}
