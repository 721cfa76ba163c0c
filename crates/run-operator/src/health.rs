//! Liveness endpoint served next to the controller

use axum::{
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

pub const HEALTH_BODY: &str = "ALL GOOD!";

/// Router answering `200 ALL GOOD!` to `GET /health` and to any other GET
pub fn router() -> Router {
    Router::new()
        .route("/health", get(health_check))
        .fallback(fallback)
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
}

async fn health_check() -> &'static str {
    HEALTH_BODY
}

async fn fallback(method: Method) -> impl IntoResponse {
    if method == Method::GET {
        (StatusCode::OK, HEALTH_BODY)
    } else {
        (StatusCode::METHOD_NOT_ALLOWED, "")
    }
}
