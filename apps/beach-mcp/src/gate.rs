//! Origin and protocol-version checks applied to every `/mcp` request before
//! it reaches the router.

use std::sync::Arc;

use axum::{
    body::{self, Body},
    extract::{Request, State},
    http::{header, HeaderMap, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::counter;
use tracing::warn;

use crate::{error::TransportError, jsonrpc, state::AppState};

pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

pub const DEFAULT_ALLOWED_ORIGINS: [&str; 4] = [
    "http://localhost",
    "https://localhost",
    "http://127.0.0.1",
    "https://127.0.0.1",
];

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Prefixes an `Origin` header must start with.
    pub allowed_origins: Vec<String>,
    pub supported_versions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SecurityGate {
    config: Arc<GateConfig>,
}

impl SecurityGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn check_origin(&self, origin: Option<&str>) -> Result<(), TransportError> {
        let Some(origin) = origin else {
            return Ok(());
        };
        if self
            .config
            .allowed_origins
            .iter()
            .any(|prefix| origin.starts_with(prefix.as_str()))
        {
            Ok(())
        } else {
            Err(TransportError::AccessDenied {
                origin: origin.to_string(),
            })
        }
    }

    /// `initiation` exempts the `initialize` request, which is where the
    /// version gets negotiated in the first place.
    pub fn check_version(
        &self,
        version: Option<&str>,
        initiation: bool,
    ) -> Result<(), TransportError> {
        match version {
            Some(version)
                if !initiation
                    && !self
                        .config
                        .supported_versions
                        .iter()
                        .any(|supported| supported == version) =>
            {
                Err(TransportError::VersionMismatch {
                    version: version.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Rejects an `Origin` that is present and either unreadable or outside
    /// the allow-list. Runs before anything reads the body.
    pub fn admit_origin(&self, headers: &HeaderMap) -> Result<(), TransportError> {
        let verdict = match header_text(headers, header::ORIGIN.as_str()) {
            None => Ok(()),
            Some(Ok(origin)) => self.check_origin(Some(origin)),
            Some(Err(origin)) => Err(TransportError::AccessDenied { origin }),
        };
        record(verdict)
    }

    pub fn admit_version(
        &self,
        headers: &HeaderMap,
        initiation: bool,
    ) -> Result<(), TransportError> {
        let verdict = match header_text(headers, PROTOCOL_VERSION_HEADER) {
            None => Ok(()),
            Some(Ok(version)) => self.check_version(Some(version), initiation),
            Some(Err(_)) if initiation => Ok(()),
            Some(Err(version)) => Err(TransportError::VersionMismatch { version }),
        };
        record(verdict)
    }

    /// Origin first, then version.
    pub fn admit(&self, headers: &HeaderMap, initiation: bool) -> Result<(), TransportError> {
        self.admit_origin(headers)?;
        self.admit_version(headers, initiation)
    }
}

/// `Err` carries a lossy rendering of a value that is not visible ASCII.
fn header_text<'a>(headers: &'a HeaderMap, name: &str) -> Option<Result<&'a str, String>> {
    headers.get(name).map(|value| {
        value
            .to_str()
            .map_err(|_| String::from_utf8_lossy(value.as_bytes()).into_owned())
    })
}

fn record(verdict: Result<(), TransportError>) -> Result<(), TransportError> {
    if let Err(err) = &verdict {
        warn!(
            reason = err.metric_label(),
            error = %err,
            "request rejected by security gate"
        );
        counter!("beach_mcp_gate_rejections_total", 1, "reason" => err.metric_label());
    }
    verdict
}

/// Middleware wrapping the `/mcp` routes. The origin is checked from the
/// headers alone; POST bodies are then buffered so the version check can tell
/// an `initialize` call apart. The bytes are passed on as-is.
pub async fn enforce(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();

    if let Err(err) = state.gate().admit_origin(&parts.headers) {
        return err.into_response();
    }

    let (initiation, body) = if parts.method == Method::POST {
        match body::to_bytes(body, state.max_body_bytes()).await {
            Ok(bytes) => (jsonrpc::is_initiation(&bytes), Body::from(bytes)),
            Err(err) => {
                warn!(error = %err, "failed to read request body");
                return TransportError::malformed("request body unreadable or too large")
                    .into_response();
            }
        }
    } else {
        (false, body)
    };

    if let Err(err) = state.gate().admit_version(&parts.headers, initiation) {
        return err.into_response();
    }

    next.run(Request::from_parts(parts, body)).await
}
