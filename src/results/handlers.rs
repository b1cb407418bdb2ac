//! Result access layer: manifests and output files.
//!
//! Two modes, chosen per deployment. With shared storage enabled the
//! manager reads `{runners_storage_path}/{task_id}/...` directly; otherwise
//! it proxy-streams the runner's result endpoints 1:1 to the client.
//!
//! Error mapping is uniform across both modes: traversal → 400, missing
//! task/manifest/file (or runner 404) → 404, task not finished → 425,
//! anything else upstream → 502.
//!
//! A `warning` task whose result is successfully retrieved is promoted to
//! `completed`: the warning existed to surface an undelivered result, and
//! retrieval is the acknowledgement.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Path;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::json;
use tokio_util::io::ReaderStream;

use super::paths::{resolve_task_file, validate_task_dir_component};
use crate::client::service::RunnerClient;
use crate::client::types::ClientError;
use crate::config::Config;
use crate::registry::service::RunnerRegistry;
use crate::registry::types::Runner;
use crate::tasks::manager::TaskManager;
use crate::tasks::types::{Task, TaskStatus};

fn detail(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "detail": message }))).into_response()
}

/// Gate shared by both endpoints: the task must exist and be in a state
/// that has a result.
fn result_ready_task(manager: &TaskManager, task_id: &str) -> Result<Task, Response> {
    let Some(task) = manager.store().get(task_id) else {
        return Err(detail(StatusCode::NOT_FOUND, "Task not found"));
    };
    match task.status {
        TaskStatus::Completed | TaskStatus::Warning => Ok(task),
        TaskStatus::Failed => Err(detail(
            StatusCode::BAD_REQUEST,
            &format!(
                "Task failed: {}",
                task.error_message.as_deref().unwrap_or("unknown error")
            ),
        )),
        status => Err(detail(
            StatusCode::TOO_EARLY,
            &format!("Task not completed. Status: {:?}", status),
        )),
    }
}

/// Promotes a `warning` task to `completed` once its result was fetched.
async fn acknowledge_warning(manager: &TaskManager, task_id: &str) {
    let store = manager.store();
    let _guard = store.lock(task_id).await;
    let Some(mut task) = store.get(task_id) else {
        return;
    };
    if task.status != TaskStatus::Warning {
        return;
    }
    task.status = TaskStatus::Completed;
    task.error_message = None;
    task.updated_at = chrono::Utc::now();
    if let Err(e) = store.put(&task).await {
        tracing::error!("Failed to persist warning acknowledgement for {}: {}", task_id, e);
    } else {
        tracing::info!("Task {} warning cleared by result retrieval", task_id);
    }
}

fn assigned_runner(registry: &RunnerRegistry, task: &Task) -> Result<Runner, Response> {
    task.runner_url
        .as_deref()
        .and_then(|url| registry.get(url))
        .ok_or_else(|| {
            detail(
                StatusCode::BAD_GATEWAY,
                "Runner that executed this task is no longer available",
            )
        })
}

pub async fn handle_task_result(
    Extension(manager): Extension<Arc<TaskManager>>,
    Extension(registry): Extension<Arc<RunnerRegistry>>,
    Extension(client): Extension<Arc<RunnerClient>>,
    Extension(cfg): Extension<Arc<Config>>,
    Path(task_id): Path<String>,
) -> Response {
    let task = match result_ready_task(&manager, &task_id) {
        Ok(task) => task,
        Err(response) => return response,
    };

    if cfg.runners_storage_enabled {
        local_manifest(&manager, &cfg, &task).await
    } else {
        let runner = match assigned_runner(&registry, &task) {
            Ok(runner) => runner,
            Err(response) => return response,
        };
        proxy_manifest(&manager, &client, &runner, &task).await
    }
}

pub async fn handle_task_result_file(
    Extension(manager): Extension<Arc<TaskManager>>,
    Extension(registry): Extension<Arc<RunnerRegistry>>,
    Extension(client): Extension<Arc<RunnerClient>>,
    Extension(cfg): Extension<Arc<Config>>,
    Path((task_id, file_path)): Path<(String, String)>,
) -> Response {
    let task = match result_ready_task(&manager, &task_id) {
        Ok(task) => task,
        Err(response) => return response,
    };

    // Traversal screening happens before any filesystem or network access,
    // in both modes.
    if let Err(reason) = super::paths::validate_relative_path(&file_path) {
        return detail(StatusCode::BAD_REQUEST, &reason);
    }

    if cfg.runners_storage_enabled {
        local_file(&manager, &cfg, &task, &file_path).await
    } else {
        let runner = match assigned_runner(&registry, &task) {
            Ok(runner) => runner,
            Err(response) => return response,
        };
        proxy_file(&manager, &client, &runner, &task, &file_path).await
    }
}

// ======================================================
// Shared-storage mode
// ======================================================

async fn local_manifest(manager: &TaskManager, cfg: &Config, task: &Task) -> Response {
    if let Err(reason) = validate_task_dir_component(&task.task_id) {
        return detail(StatusCode::BAD_REQUEST, &reason);
    }
    let manifest_path: PathBuf = cfg
        .runners_storage_path
        .join(&task.task_id)
        .join("manifest.json");

    let raw = match tokio::fs::read(&manifest_path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return detail(StatusCode::NOT_FOUND, "Manifest not found in shared storage");
        }
        Err(e) => {
            tracing::error!("Failed to read manifest {}: {}", manifest_path.display(), e);
            return detail(StatusCode::BAD_GATEWAY, "Error reading manifest");
        }
    };

    let mut manifest: serde_json::Value = match serde_json::from_slice(&raw) {
        Ok(manifest) => manifest,
        Err(e) => {
            tracing::error!("Invalid manifest JSON for task {}: {}", task.task_id, e);
            return detail(StatusCode::BAD_GATEWAY, "Invalid manifest");
        }
    };
    if let Some(object) = manifest.as_object_mut() {
        object
            .entry("task_id")
            .or_insert_with(|| json!(task.task_id));
    }

    acknowledge_warning(manager, &task.task_id).await;
    (StatusCode::OK, Json(manifest)).into_response()
}

async fn local_file(manager: &TaskManager, cfg: &Config, task: &Task, file_path: &str) -> Response {
    let resolved = match resolve_task_file(&cfg.runners_storage_path, &task.task_id, file_path) {
        Ok(resolved) => resolved,
        Err(reason) => return detail(StatusCode::BAD_REQUEST, &reason),
    };

    let file = match tokio::fs::File::open(&resolved).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return detail(StatusCode::NOT_FOUND, "Result file not found in shared storage");
        }
        Err(e) => {
            tracing::error!("Failed to open result file {}: {}", resolved.display(), e);
            return detail(StatusCode::BAD_GATEWAY, "Error reading result file");
        }
    };

    let length = match file.metadata().await {
        Ok(metadata) if metadata.is_file() => metadata.len(),
        Ok(_) => {
            return detail(StatusCode::NOT_FOUND, "Result file not found in shared storage");
        }
        Err(e) => {
            tracing::error!("Failed to stat result file {}: {}", resolved.display(), e);
            return detail(StatusCode::BAD_GATEWAY, "Error reading result file");
        }
    };

    let filename = resolved
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("result.bin")
        .to_string();

    acknowledge_warning(manager, &task.task_id).await;

    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                "application/octet-stream".to_string(),
            ),
            (header::CONTENT_LENGTH, length.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", filename),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}

// ======================================================
// Proxy mode
// ======================================================

fn map_proxy_error(task_id: &str, error: ClientError) -> Response {
    match error {
        ClientError::Rejected { status, .. } if status == reqwest::StatusCode::NOT_FOUND => {
            detail(StatusCode::NOT_FOUND, "Result not found on runner")
        }
        ClientError::Rejected { status, .. } => {
            tracing::error!("Runner result fetch for {} returned {}", task_id, status);
            detail(StatusCode::BAD_GATEWAY, "Error fetching result from runner")
        }
        ClientError::Transport(e) => {
            tracing::error!("Runner result fetch for {} failed: {}", task_id, e);
            detail(StatusCode::BAD_GATEWAY, "Error contacting runner")
        }
    }
}

async fn proxy_manifest(
    manager: &TaskManager,
    client: &RunnerClient,
    runner: &Runner,
    task: &Task,
) -> Response {
    let upstream = match client.fetch_manifest(runner, &task.task_id).await {
        Ok(upstream) => upstream,
        Err(e) => return map_proxy_error(&task.task_id, e),
    };

    acknowledge_warning(manager, &task.task_id).await;

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json".to_string())],
        Body::from_stream(upstream.bytes_stream()),
    )
        .into_response()
}

async fn proxy_file(
    manager: &TaskManager,
    client: &RunnerClient,
    runner: &Runner,
    task: &Task,
    file_path: &str,
) -> Response {
    let upstream = match client
        .fetch_result_file(runner, &task.task_id, file_path)
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => return map_proxy_error(&task.task_id, e),
    };

    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let disposition = upstream
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| {
            let name = file_path.rsplit('/').next().unwrap_or(file_path);
            format!("attachment; filename={}", name)
        });

    acknowledge_warning(manager, &task.task_id).await;

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(upstream.bytes_stream()),
    )
        .into_response()
}
