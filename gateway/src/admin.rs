//! Ambient admin/health surface (SPEC_FULL.md §4.3): `GET /healthz` and
//! `GET /metrics`, always present alongside the user-facing dispatch even
//! though per-grain metrics/federation are explicitly out of scope.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::state::AppState;

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ui_sessions = state.ui_sessions.len();
    let api_sessions = state.api_sessions.len();
    let requests_total = state.requests_total.load(Ordering::Relaxed);

    let body = format!(
        "# HELP sandstorm_gateway_ui_sessions Active UI sessions held open by the gateway.\n\
         # TYPE sandstorm_gateway_ui_sessions gauge\n\
         sandstorm_gateway_ui_sessions {ui_sessions}\n\
         # HELP sandstorm_gateway_api_sessions Active API sessions held open by the gateway.\n\
         # TYPE sandstorm_gateway_api_sessions gauge\n\
         sandstorm_gateway_api_sessions {api_sessions}\n\
         # HELP sandstorm_gateway_requests_total Requests dispatched since process start.\n\
         # TYPE sandstorm_gateway_requests_total counter\n\
         sandstorm_gateway_requests_total {requests_total}\n"
    );

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}
