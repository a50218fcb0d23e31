use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

use nbexp_core::FetchError;

use crate::render::render;
use crate::state::{AppState, release_memory_to_os};

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

// ============================================================
// Metrics
// ============================================================

pub(crate) async fn handle_metrics(State(state): State<AppState>) -> Response {
    let cancel = state.request_token();
    let _guard = cancel.clone().drop_guard();

    let result = match state.exporter.scrape(&cancel).await {
        Ok(result) => result,
        Err(FetchError::Closed) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
        }
        Err(e) => {
            error!(error = %e, "scrape failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    if cancel.is_cancelled() {
        warn!(
            timeout_ms = state.request_timeout.as_millis() as u64,
            "scrape cancelled before completion"
        );
    }

    let health = state.exporter.collector().health();
    let body = match render(&result, &health) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "failed to render metrics");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    drop(result);
    release_memory_to_os();

    ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response()
}

// ============================================================
// Health
// ============================================================

pub(crate) async fn handle_health(State(state): State<AppState>) -> Response {
    let cancel = state.request_token();
    let _guard = cancel.clone().drop_guard();

    let health = state.exporter.health(&cancel).await;
    match health.reason() {
        None => (StatusCode::OK, "ok").into_response(),
        Some(reason) => {
            warn!(reason = %reason, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, reason).into_response()
        }
    }
}
