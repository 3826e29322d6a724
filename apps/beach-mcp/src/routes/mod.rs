pub mod mcp;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::{gate, state::AppState};

pub fn build_router(state: AppState) -> Router {
    let mcp_routes = Router::new()
        .route(
            "/mcp",
            post(mcp::handle_mcp)
                .get(mcp::handle_mcp)
                .delete(mcp::handle_mcp),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), gate::enforce))
        .layer(DefaultBodyLimit::max(state.max_body_bytes()));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .merge(mcp_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    active_sessions: usize,
    uptime_secs: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: env!("CARGO_PKG_NAME"),
        active_sessions: state.sessions().active_count(),
        uptime_secs: state.uptime().as_secs(),
    })
}

async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    match state.render_metrics() {
        Some(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
