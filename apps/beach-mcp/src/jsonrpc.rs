//! JSON-RPC 2.0 envelope used on the `/mcp` endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

/// Method that opens a new session. Exempt from protocol-version checks.
pub const INITIALIZE_METHOD: &str = "initialize";

pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const VERSION_MISMATCH: i64 = -32000;
    pub const SESSION_NOT_FOUND: i64 = -32001;
    pub const OPERATION_FAILED: i64 = -32002;
    pub const ACCESS_DENIED: i64 = -32003;
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn request_id(&self) -> Value {
        self.id.clone().unwrap_or(Value::Null)
    }

    /// Deserialize `params`, treating a missing value as JSON `null`.
    pub fn decode_params<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.params.clone().unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Builds a server-to-client notification suitable for the push channel.
pub fn notification(method: &str, params: Option<Value>) -> Value {
    let mut message = serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
    });
    if let Some(params) = params {
        message["params"] = params;
    }
    message
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(&'static str),
}

/// A single decoded client message.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcRequest),
    /// The client answering a server-initiated request.
    Response(Value),
}

impl IncomingMessage {
    pub fn parse(body: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(body)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let Some(object) = value.as_object() else {
            return Err(EnvelopeError::Invalid(
                "expected a single JSON-RPC object; batches are not supported",
            ));
        };
        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(EnvelopeError::Invalid("jsonrpc must be \"2.0\""));
        }

        match object.get("method") {
            Some(Value::String(_)) => {
                let request: JsonRpcRequest = serde_json::from_value(value)?;
                match request.id {
                    Some(Value::Null) | None => Ok(IncomingMessage::Notification(request)),
                    Some(Value::String(_)) | Some(Value::Number(_)) => {
                        Ok(IncomingMessage::Request(request))
                    }
                    Some(_) => Err(EnvelopeError::Invalid("id must be a string or number")),
                }
            }
            Some(_) => Err(EnvelopeError::Invalid("method must be a string")),
            None if object.contains_key("id")
                && (object.contains_key("result") || object.contains_key("error")) =>
            {
                Ok(IncomingMessage::Response(value))
            }
            None => Err(EnvelopeError::Invalid("missing method")),
        }
    }
}

/// Cheap check used by the security gate: is this body an `initialize` call?
pub fn is_initiation(body: &[u8]) -> bool {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("method")
                .and_then(Value::as_str)
                .map(|method| method == INITIALIZE_METHOD)
        })
        .unwrap_or(false)
}
