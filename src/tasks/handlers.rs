//! HTTP handlers for the task lifecycle endpoints.
//!
//! The submit path must never fail because of runner-side conditions: it
//! validates the request, persists the pending task and answers with the
//! task id; everything runner-related happens on the dispatch workers and
//! is observable through the status endpoint.

use std::collections::HashMap;

use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::json;
use std::sync::Arc;

use super::manager::{CompletionOutcome, SubmitError, TaskManager};
use super::protocol::{CompletionAck, ExecuteResponse, RestartRequest, TaskListQuery};
use super::types::{CompletionNotification, TaskRequest, TaskView};
use crate::auth::service::tokens_match;
use crate::auth::types::AuthToken;
use crate::registry::service::RunnerRegistry;

pub async fn handle_execute_task(
    Extension(manager): Extension<Arc<TaskManager>>,
    Extension(AuthToken(token)): Extension<AuthToken>,
    Json(request): Json<TaskRequest>,
) -> Response {
    match manager.submit(request, Some(token)).await {
        Ok(task) => (
            StatusCode::OK,
            Json(ExecuteResponse {
                task_id: task.task_id,
                status: task.status,
            }),
        )
            .into_response(),
        Err(SubmitError::Validation(detail)) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "detail": detail }))).into_response()
        }
        Err(SubmitError::QueueFull) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "detail": "dispatch queue is full, try again later" })),
        )
            .into_response(),
        Err(SubmitError::Store(e)) => {
            tracing::error!("Failed to persist submitted task: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": "failed to persist task" })),
            )
                .into_response()
        }
    }
}

pub async fn handle_task_status(
    Extension(manager): Extension<Arc<TaskManager>>,
    Path(task_id): Path<String>,
) -> Response {
    match manager.store().get(&task_id) {
        Some(task) => (StatusCode::OK, Json(task.view())).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "Task not found" })),
        )
            .into_response(),
    }
}

pub async fn handle_list_tasks(
    Extension(manager): Extension<Arc<TaskManager>>,
    Query(query): Query<TaskListQuery>,
) -> impl IntoResponse {
    let tasks: HashMap<String, TaskView> = manager
        .store()
        .list(&query.into_filter())
        .into_iter()
        .map(|task| (task.task_id.clone(), task.view()))
        .collect();
    Json(tasks)
}

/// Runner-initiated completion. Authenticated with the token captured at
/// the runner's registration, not just any manager token: the presented
/// bearer must match the runner the task was dispatched to.
pub async fn handle_task_completion(
    Extension(manager): Extension<Arc<TaskManager>>,
    Extension(registry): Extension<Arc<RunnerRegistry>>,
    Extension(AuthToken(token)): Extension<AuthToken>,
    Json(notification): Json<CompletionNotification>,
) -> Response {
    let Some(task) = manager.store().get(&notification.task_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "Task not found" })),
        )
            .into_response();
    };

    let Some(runner) = task.runner_url.as_deref().and_then(|url| registry.get(url)) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "Runner not found" })),
        )
            .into_response();
    };
    if !tokens_match(&token, &runner.token) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "detail": "Token not authorized for this task" })),
        )
            .into_response();
    }

    match manager.complete(&notification).await {
        CompletionOutcome::Applied(_) | CompletionOutcome::Idempotent => {
            (StatusCode::OK, Json(CompletionAck { ok: true })).into_response()
        }
        CompletionOutcome::Stale => (
            StatusCode::ACCEPTED,
            Json(json!({ "detail": "Completion for a superseded run; ignored" })),
        )
            .into_response(),
        CompletionOutcome::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "Task not found" })),
        )
            .into_response(),
        CompletionOutcome::StoreFailed => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": "failed to persist completion" })),
        )
            .into_response(),
    }
}

pub async fn handle_restart_selected(
    Extension(manager): Extension<Arc<TaskManager>>,
    Json(request): Json<RestartRequest>,
) -> impl IntoResponse {
    let report = manager.restart_selected(&request.task_ids).await;
    Json(report)
}
