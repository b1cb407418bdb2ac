//! HTTP handlers for the /runner endpoints.
//!
//! The token and version gates run as middleware before these handlers; the
//! validated values arrive through request extensions. The token a runner
//! presents at registration is captured as its outbound bearer credential.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::json;
use std::sync::Arc;

use super::service::RunnerRegistry;
use super::types::{AckResponse, HeartbeatRequest, RegisterRequest, RegistryError, UnregisterRequest};
use crate::auth::types::{AuthToken, RunnerVersion};

pub async fn handle_register_runner(
    Extension(registry): Extension<Arc<RunnerRegistry>>,
    Extension(AuthToken(token)): Extension<AuthToken>,
    Extension(RunnerVersion(version)): Extension<RunnerVersion>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    match registry.register(&req.url, &req.name, &token, &version, req.task_types) {
        Ok(_) => (StatusCode::OK, Json(AckResponse { ok: true })).into_response(),
        Err(e) => {
            tracing::warn!("Runner registration rejected: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "detail": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub async fn handle_runner_heartbeat(
    Extension(registry): Extension<Arc<RunnerRegistry>>,
    Extension(RunnerVersion(version)): Extension<RunnerVersion>,
    Json(req): Json<HeartbeatRequest>,
) -> Response {
    match registry.heartbeat(&req.url, &version) {
        Ok(()) => (StatusCode::OK, Json(AckResponse { ok: true })).into_response(),
        Err(RegistryError::UnknownRunner(url)) => {
            tracing::debug!("Heartbeat from unknown runner {}", url);
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "detail": "Runner not found" })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::warn!("Runner heartbeat rejected: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "detail": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub async fn handle_unregister_runner(
    Extension(registry): Extension<Arc<RunnerRegistry>>,
    Json(req): Json<UnregisterRequest>,
) -> Response {
    if registry.unregister(&req.url) {
        (StatusCode::OK, Json(AckResponse { ok: true })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "Runner not found" })),
        )
            .into_response()
    }
}

pub async fn handle_list_runners(
    Extension(registry): Extension<Arc<RunnerRegistry>>,
) -> impl IntoResponse {
    Json(registry.list())
}
