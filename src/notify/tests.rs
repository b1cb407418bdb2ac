//! Notify Pipeline Tests
//!
//! ## Test Scopes
//! - **Delivery**: webhook fires with the idempotency key and the client's
//!   bearer token; bookkeeping lands on the task.
//! - **Retry**: transient 5xx answers are retried on the backoff schedule
//!   up to the attempt cap.
//! - **Stale guard**: a delivery whose run was superseded is dropped
//!   without touching the wire.
//!
//! The webhook endpoint is a real axum server on a loopback port with a
//! scripted sequence of response codes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::notify::pipeline::NotifyPipeline;
use crate::store::persistence::TaskStore;
use crate::tasks::types::{Task, TaskRequest, TaskStatus};

#[derive(Clone)]
struct HookCall {
    payload: serde_json::Value,
    bearer: Option<String>,
    at: Instant,
}

struct StubHook {
    url: String,
    calls: Arc<Mutex<Vec<HookCall>>>,
}

/// Webhook double answering with a scripted status sequence; the last
/// status repeats once the script runs out.
async fn spawn_stub_hook(script: &[u16]) -> StubHook {
    let calls: Arc<Mutex<Vec<HookCall>>> = Arc::new(Mutex::new(Vec::new()));
    let statuses: Arc<Mutex<VecDeque<u16>>> =
        Arc::new(Mutex::new(script.iter().copied().collect()));

    let calls_handle = calls.clone();
    let app = Router::new().route(
        "/hook",
        post(move |headers: HeaderMap, Json(payload): Json<serde_json::Value>| {
            let calls = calls_handle.clone();
            let statuses = statuses.clone();
            async move {
                let bearer = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                calls.lock().await.push(HookCall {
                    payload,
                    bearer,
                    at: Instant::now(),
                });

                let mut script = statuses.lock().await;
                let code = if script.len() > 1 {
                    script.pop_front().unwrap_or(200)
                } else {
                    script.front().copied().unwrap_or(200)
                };
                StatusCode::from_u16(code).unwrap_or(StatusCode::OK)
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    StubHook {
        url: format!("http://127.0.0.1:{}/hook", addr.port()),
        calls,
    }
}

fn notify_config(max_retries: u32, base_delay: Duration, factor: f64) -> Config {
    let mut cfg = Config::default();
    cfg.notify_max_retries = max_retries;
    cfg.notify_retry_delay = base_delay;
    cfg.notify_backoff_factor = factor;
    cfg.notify_workers = 1;
    cfg
}

async fn seeded_task(store: &TaskStore, notify_url: Option<String>) -> Task {
    let request = TaskRequest {
        etab_name: "etab-main".to_string(),
        app_name: "studio-app".to_string(),
        app_version: None,
        task_type: "encoding".to_string(),
        source_url: "http://media.example.org/in.mp4".to_string(),
        affiliation: None,
        parameters: HashMap::new(),
        notify_url,
    };
    let mut task = Task::from_request(request, Some("client-token".to_string()));
    task.status = TaskStatus::Completed;
    task.script_output = Some("frames=1200".to_string());
    store.put(&task).await.unwrap();
    task
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    for _ in 0..400 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within the polling window");
}

// ============================================================
// Delivery
// ============================================================

#[tokio::test]
async fn test_delivery_carries_idempotency_key_and_client_token() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(dir.path()).await.unwrap();
    let hook = spawn_stub_hook(&[200]).await;
    let task = seeded_task(&store, Some(hook.url.clone())).await;

    let pipeline = NotifyPipeline::new(store.clone(), &notify_config(5, Duration::from_millis(10), 1.5));
    pipeline.clone().start();
    pipeline.enqueue(&task.task_id, &task.run_id);

    let store_probe = store.clone();
    let task_id = task.task_id.clone();
    wait_until(move || {
        store_probe
            .get(&task_id)
            .map(|t| t.notify_delivered_at.is_some())
            .unwrap_or(false)
    })
    .await;

    let calls = hook.calls.lock().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].payload["task_id"], task.task_id);
    assert_eq!(calls[0].payload["run_id"], task.run_id);
    assert_eq!(calls[0].payload["status"], "completed");
    assert_eq!(calls[0].payload["script_output"], "frames=1200");
    assert_eq!(calls[0].bearer.as_deref(), Some("Bearer client-token"));

    let delivered = store.get(&task.task_id).unwrap();
    assert_eq!(delivered.notify_attempts, 1);
    assert!(delivered.notify_last_error.is_none());
    // Delivery never rewrites the task's state.
    assert_eq!(delivered.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_duplicate_enqueue_collapses() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(dir.path()).await.unwrap();
    let hook = spawn_stub_hook(&[200]).await;
    let task = seeded_task(&store, Some(hook.url.clone())).await;

    let pipeline = NotifyPipeline::new(store.clone(), &notify_config(5, Duration::from_millis(10), 1.5));
    // Enqueue twice before the workers even start.
    pipeline.enqueue(&task.task_id, &task.run_id);
    pipeline.enqueue(&task.task_id, &task.run_id);
    pipeline.clone().start();

    let store_probe = store.clone();
    let task_id = task.task_id.clone();
    wait_until(move || {
        store_probe
            .get(&task_id)
            .map(|t| t.notify_delivered_at.is_some())
            .unwrap_or(false)
    })
    .await;
    // Give a would-be duplicate a moment to fire.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(hook.calls.lock().await.len(), 1);
}

// ============================================================
// Retry & backoff
// ============================================================

#[tokio::test]
async fn test_transient_failures_retry_until_success() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(dir.path()).await.unwrap();
    let hook = spawn_stub_hook(&[500, 500, 200]).await;
    let task = seeded_task(&store, Some(hook.url.clone())).await;

    let base = Duration::from_millis(50);
    let pipeline = NotifyPipeline::new(store.clone(), &notify_config(5, base, 2.0));
    pipeline.clone().start();
    pipeline.enqueue(&task.task_id, &task.run_id);

    let store_probe = store.clone();
    let task_id = task.task_id.clone();
    wait_until(move || {
        store_probe
            .get(&task_id)
            .map(|t| t.notify_delivered_at.is_some())
            .unwrap_or(false)
    })
    .await;

    let calls = hook.calls.lock().await;
    assert_eq!(calls.len(), 3);

    // Backoff schedule: ~base before attempt 2, ~base*factor before
    // attempt 3. Generous lower bounds only; upper bounds would flake.
    let gap1 = calls[1].at.duration_since(calls[0].at);
    let gap2 = calls[2].at.duration_since(calls[1].at);
    assert!(gap1 >= Duration::from_millis(40), "gap1 too short: {:?}", gap1);
    assert!(gap2 >= Duration::from_millis(80), "gap2 too short: {:?}", gap2);

    let delivered = store.get(&task.task_id).unwrap();
    assert_eq!(delivered.notify_attempts, 3);
    assert!(delivered.notify_delivered_at.is_some());
}

#[tokio::test]
async fn test_exhaustion_records_error_and_leaves_state_alone() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(dir.path()).await.unwrap();
    let hook = spawn_stub_hook(&[500]).await;
    let task = seeded_task(&store, Some(hook.url.clone())).await;

    let pipeline = NotifyPipeline::new(store.clone(), &notify_config(2, Duration::from_millis(10), 1.0));
    pipeline.clone().start();
    pipeline.enqueue(&task.task_id, &task.run_id);

    let pipeline_probe = pipeline.clone();
    wait_until(move || pipeline_probe.idle()).await;

    assert_eq!(hook.calls.lock().await.len(), 2);
    let task = store.get(&task.task_id).unwrap();
    assert_eq!(task.notify_attempts, 2);
    assert!(task.notify_delivered_at.is_none());
    assert!(task.notify_last_error.unwrap().contains("500"));
    assert_eq!(task.status, TaskStatus::Completed);
}

// ============================================================
// Stale guard & no-ops
// ============================================================

#[tokio::test]
async fn test_superseded_run_is_dropped_silently() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(dir.path()).await.unwrap();
    let hook = spawn_stub_hook(&[200]).await;
    let task = seeded_task(&store, Some(hook.url.clone())).await;

    let pipeline = NotifyPipeline::new(store.clone(), &notify_config(5, Duration::from_millis(10), 1.5));
    pipeline.clone().start();

    // Enqueue under a run id that no longer matches the task.
    pipeline.enqueue(&task.task_id, "superseded-run-id");

    let pipeline_probe = pipeline.clone();
    wait_until(move || pipeline_probe.idle()).await;

    assert!(hook.calls.lock().await.is_empty());
    assert!(store.get(&task.task_id).unwrap().notify_delivered_at.is_none());
}

#[tokio::test]
async fn test_missing_notify_url_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(dir.path()).await.unwrap();
    let task = seeded_task(&store, None).await;

    let pipeline = NotifyPipeline::new(store.clone(), &notify_config(5, Duration::from_millis(10), 1.5));
    pipeline.clone().start();
    pipeline.enqueue(&task.task_id, &task.run_id);

    let pipeline_probe = pipeline.clone();
    wait_until(move || pipeline_probe.idle()).await;

    let task = store.get(&task.task_id).unwrap();
    assert_eq!(task.notify_attempts, 0);
    assert!(task.notify_last_error.is_none());
}
