//! Task Engine Tests
//!
//! ## Test Scopes
//! - **Submission**: URL screening, queue backpressure, pending persistence.
//! - **Dispatch**: ping-then-run selection against live stub runners, retry
//!   exhaustion, runner rejection.
//! - **Completion**: run_id stale guard, idempotent re-delivery, the
//!   timeout sweeper losing the race against a completion.
//! - **Restart**: terminal-only restarts with a fresh run and a preserved
//!   envelope.
//!
//! Stub runners are real axum servers bound to a loopback port; the tests
//! run with `ssrf_allow_private` enabled the way a test deployment would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::Mutex;

use crate::client::service::RunnerClient;
use crate::config::Config;
use crate::notify::pipeline::NotifyPipeline;
use crate::registry::service::RunnerRegistry;
use crate::store::persistence::TaskStore;
use crate::tasks::manager::{CompletionOutcome, DispatchJob, SubmitError, TaskManager};
use crate::tasks::types::{
    CompletionNotification, CompletionStatus, TaskRequest, TaskStatus,
};
use crate::tasks::urls::validate_submitted_url;

struct Harness {
    manager: Arc<TaskManager>,
    registry: Arc<RunnerRegistry>,
    store: Arc<TaskStore>,
    _store_dir: tempfile::TempDir,
}

async fn harness(mutate: impl FnOnce(&mut Config)) -> Harness {
    let store_dir = tempfile::tempdir().unwrap();

    let mut cfg = Config::default();
    cfg.ssrf_allow_private = true;
    cfg.dispatch_retry_delay = Duration::from_millis(10);
    cfg.ping_timeout = Duration::from_secs(2);
    cfg.dispatch_timeout = Duration::from_secs(2);
    cfg.manager_url = "http://manager.test:8000".to_string();
    cfg.redispatch_on_start = false;
    mutate(&mut cfg);

    let store = TaskStore::open(store_dir.path()).await.unwrap();
    let registry = RunnerRegistry::with_manager_version(&cfg, "1.2.0");
    let client = RunnerClient::new(&cfg);
    let notify = NotifyPipeline::new(store.clone(), &cfg);
    let manager = TaskManager::new(
        store.clone(),
        registry.clone(),
        client,
        notify,
        cfg,
    );

    Harness {
        manager,
        registry,
        store,
        _store_dir: store_dir,
    }
}

struct StubRunner {
    base_url: String,
    available: Arc<AtomicBool>,
    run_status: Arc<AtomicU16>,
    run_calls: Arc<AtomicUsize>,
    last_run_payload: Arc<Mutex<Option<serde_json::Value>>>,
}

/// Boots a loopback runner double serving `/runner/ping` and `/task/run`.
async fn spawn_stub_runner(task_types: &[&str]) -> StubRunner {
    let available = Arc::new(AtomicBool::new(true));
    let run_status = Arc::new(AtomicU16::new(200));
    let run_calls = Arc::new(AtomicUsize::new(0));
    let last_run_payload = Arc::new(Mutex::new(None));
    let advertised: Vec<String> = task_types.iter().map(|t| t.to_string()).collect();

    let ping_available = available.clone();
    let ping_types = advertised.clone();
    let run_status_handle = run_status.clone();
    let run_calls_handle = run_calls.clone();
    let run_payload_handle = last_run_payload.clone();

    let app = Router::new()
        .route(
            "/runner/ping",
            get(move || {
                let available = ping_available.clone();
                let task_types = ping_types.clone();
                async move {
                    Json(serde_json::json!({
                        "available": available.load(Ordering::SeqCst),
                        "registered": true,
                        "task_types": task_types,
                    }))
                }
            }),
        )
        .route(
            "/task/run",
            post(move |Json(payload): Json<serde_json::Value>| {
                let status = run_status_handle.clone();
                let calls = run_calls_handle.clone();
                let slot = run_payload_handle.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    *slot.lock().await = Some(payload);
                    StatusCode::from_u16(status.load(Ordering::SeqCst))
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    StubRunner {
        base_url: format!("http://127.0.0.1:{}", addr.port()),
        available,
        run_status,
        run_calls,
        last_run_payload,
    }
}

fn request(task_type: &str) -> TaskRequest {
    TaskRequest {
        etab_name: "etab-main".to_string(),
        app_name: "studio-app".to_string(),
        app_version: Some("2.1.0".to_string()),
        task_type: task_type.to_string(),
        source_url: "http://media.example.org/in.mp4".to_string(),
        affiliation: None,
        parameters: HashMap::from([("preset".to_string(), serde_json::json!("fast"))]),
        notify_url: None,
    }
}

async fn dispatch_once(harness: &Harness, task_id: &str, attempt: u32) {
    harness
        .manager
        .clone()
        .run_dispatch_attempt(DispatchJob {
            task_id: task_id.to_string(),
            attempt,
        })
        .await;
}

// ============================================================
// Submission
// ============================================================

#[tokio::test]
async fn test_submit_persists_pending_task() {
    let harness = harness(|_| {}).await;

    let task = harness
        .manager
        .submit(request("encoding"), Some("client-token".to_string()))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Pending);
    let stored = harness.store.get(&task.task_id).unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(stored.client_token.as_deref(), Some("client-token"));
    assert_eq!(stored.task_type, "encoding");
}

#[tokio::test]
async fn test_submit_rejects_bad_urls() {
    let harness = harness(|cfg| cfg.ssrf_allow_private = false).await;

    let mut bad_scheme = request("encoding");
    bad_scheme.source_url = "ftp://media.example.org/in.mp4".to_string();
    assert!(matches!(
        harness.manager.submit(bad_scheme, None).await,
        Err(SubmitError::Validation(_))
    ));

    let mut private_ip = request("encoding");
    private_ip.source_url = "http://10.0.0.7/in.mp4".to_string();
    assert!(matches!(
        harness.manager.submit(private_ip, None).await,
        Err(SubmitError::Validation(_))
    ));

    let mut loopback_notify = request("encoding");
    loopback_notify.notify_url = Some("http://127.0.0.1:9/hook".to_string());
    assert!(matches!(
        harness.manager.submit(loopback_notify, None).await,
        Err(SubmitError::Validation(_))
    ));

    // Nothing was persisted.
    assert!(harness.store.is_empty());
}

#[tokio::test]
async fn test_submit_backpressure_returns_queue_full() {
    // Depth 1 and no workers: the second submission finds the queue full.
    let harness = harness(|cfg| cfg.dispatch_queue_depth = 1).await;

    harness.manager.submit(request("encoding"), None).await.unwrap();
    let second = harness.manager.submit(request("encoding"), None).await;

    assert!(matches!(second, Err(SubmitError::QueueFull)));
    // The rejected submission left no record behind.
    assert_eq!(harness.store.len(), 1);
}

// ============================================================
// URL screening
// ============================================================

#[tokio::test]
async fn test_url_screening_rules() {
    // Public literal addresses pass the screen without a resolver.
    assert!(validate_submitted_url("source_url", "http://93.184.216.34/a.mp4", false)
        .await
        .is_ok());
    assert!(validate_submitted_url("source_url", "https://93.184.216.34/a.mp4", false)
        .await
        .is_ok());

    for bad in [
        "ftp://example.org/a.mp4",
        "http:///no-host",
        "http://user:pw@example.org/a.mp4",
        "http://localhost/hook",
        "http://127.0.0.1/hook",
        "http://192.168.1.10/hook",
        "http://169.254.169.254/latest/meta-data",
        "http://[::1]/hook",
        "not a url",
    ] {
        assert!(
            validate_submitted_url("source_url", bad, false).await.is_err(),
            "{} should be rejected",
            bad
        );
    }

    // Test deployments may disable the address checks but keep the syntax.
    assert!(validate_submitted_url("source_url", "http://127.0.0.1/x", true)
        .await
        .is_ok());
    assert!(validate_submitted_url("source_url", "ftp://127.0.0.1/x", true)
        .await
        .is_err());
}

// ============================================================
// Dispatch
// ============================================================

#[tokio::test]
async fn test_dispatch_happy_path() {
    let harness = harness(|_| {}).await;
    let stub = spawn_stub_runner(&["encoding"]).await;

    harness
        .registry
        .register(&stub.base_url, "runner-1", "runner-tok", "1.2.0", vec!["encoding".to_string()])
        .unwrap();

    let task = harness.manager.submit(request("encoding"), None).await.unwrap();
    let pending_run_id = task.run_id.clone();

    dispatch_once(&harness, &task.task_id, 1).await;

    let running = harness.store.get(&task.task_id).unwrap();
    assert_eq!(running.status, TaskStatus::Running);
    assert!(running.started_at.is_some());
    assert_ne!(running.run_id, pending_run_id, "run_id must rotate on dispatch");
    assert_eq!(stub.run_calls.load(Ordering::SeqCst), 1);

    // The run payload carries the envelope plus the manager's additions.
    let payload = stub.last_run_payload.lock().await.clone().unwrap();
    assert_eq!(payload["task_id"], task.task_id);
    assert_eq!(payload["run_id"], running.run_id);
    assert_eq!(payload["task_type"], "encoding");
    assert_eq!(
        payload["completion_callback"],
        "http://manager.test:8000/task/completion"
    );
}

#[tokio::test]
async fn test_dispatch_skips_busy_runner() {
    let harness = harness(|_| {}).await;
    let busy = spawn_stub_runner(&["encoding"]).await;
    busy.available.store(false, Ordering::SeqCst);
    let free = spawn_stub_runner(&["encoding"]).await;

    harness
        .registry
        .register(&busy.base_url, "busy", "tok", "1.2.0", vec!["encoding".to_string()])
        .unwrap();
    harness
        .registry
        .register(&free.base_url, "free", "tok", "1.2.0", vec!["encoding".to_string()])
        .unwrap();

    let task = harness.manager.submit(request("encoding"), None).await.unwrap();
    dispatch_once(&harness, &task.task_id, 1).await;

    let running = harness.store.get(&task.task_id).unwrap();
    assert_eq!(running.status, TaskStatus::Running);
    assert_eq!(busy.run_calls.load(Ordering::SeqCst), 0);
    assert_eq!(free.run_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dispatch_runner_rejection_is_terminal() {
    let harness = harness(|_| {}).await;
    let stub = spawn_stub_runner(&["encoding"]).await;
    stub.run_status.store(500, Ordering::SeqCst);

    harness
        .registry
        .register(&stub.base_url, "runner-1", "tok", "1.2.0", vec!["encoding".to_string()])
        .unwrap();

    let task = harness.manager.submit(request("encoding"), None).await.unwrap();
    dispatch_once(&harness, &task.task_id, 1).await;

    let rejected = harness.store.get(&task.task_id).unwrap();
    assert_eq!(rejected.status, TaskStatus::Rejected);
    let message = rejected.error_message.unwrap();
    assert!(message.contains("500"), "error should reference the status: {}", message);
}

#[tokio::test]
async fn test_dispatch_without_runners_exhausts_into_rejected() {
    let harness = harness(|cfg| cfg.dispatch_max_attempts = 3).await;

    let task = harness.manager.submit(request("encoding"), None).await.unwrap();

    // Final allowed attempt with still no runner: terminal rejection.
    dispatch_once(&harness, &task.task_id, 3).await;

    let rejected = harness.store.get(&task.task_id).unwrap();
    assert_eq!(rejected.status, TaskStatus::Rejected);
    assert!(rejected
        .error_message
        .unwrap()
        .contains("no eligible runner"));
}

#[tokio::test]
async fn test_dispatch_retries_keep_task_pending() {
    let harness = harness(|cfg| cfg.dispatch_max_attempts = 5).await;

    let task = harness.manager.submit(request("encoding"), None).await.unwrap();
    dispatch_once(&harness, &task.task_id, 1).await;

    // Not the last attempt: still pending, retry scheduled.
    assert_eq!(
        harness.store.get(&task.task_id).unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn test_started_manager_rejects_after_retry_exhaustion() {
    let harness = harness(|cfg| {
        cfg.dispatch_max_attempts = 2;
        cfg.dispatch_retry_delay = Duration::from_millis(5);
        cfg.dispatch_workers = 1;
    })
    .await;
    harness.manager.start();

    let task = harness.manager.submit(request("encoding"), None).await.unwrap();

    let mut status = TaskStatus::Pending;
    for _ in 0..200 {
        status = harness.store.get(&task.task_id).unwrap().status;
        if status == TaskStatus::Rejected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, TaskStatus::Rejected);
}

// ============================================================
// Completion
// ============================================================

async fn running_task(harness: &Harness, stub: &StubRunner) -> (String, String) {
    harness
        .registry
        .register(&stub.base_url, "runner-1", "tok", "1.2.0", vec!["encoding".to_string()])
        .unwrap();
    let task = harness.manager.submit(request("encoding"), None).await.unwrap();
    dispatch_once(harness, &task.task_id, 1).await;
    let running = harness.store.get(&task.task_id).unwrap();
    assert_eq!(running.status, TaskStatus::Running);
    (running.task_id, running.run_id)
}

fn completion(task_id: &str, run_id: Option<&str>, status: CompletionStatus) -> CompletionNotification {
    CompletionNotification {
        task_id: task_id.to_string(),
        status,
        error_message: match status {
            CompletionStatus::Completed => None,
            _ => Some("ffmpeg exited with 1".to_string()),
        },
        script_output: Some("frames=1200".to_string()),
        run_id: run_id.map(str::to_string),
    }
}

#[tokio::test]
async fn test_completion_applies_and_redelivery_is_idempotent() {
    let harness = harness(|_| {}).await;
    let stub = spawn_stub_runner(&["encoding"]).await;
    let (task_id, run_id) = running_task(&harness, &stub).await;

    let outcome = harness
        .manager
        .complete(&completion(&task_id, Some(&run_id), CompletionStatus::Completed))
        .await;
    assert_eq!(outcome, CompletionOutcome::Applied(TaskStatus::Completed));

    let done = harness.store.get(&task_id).unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.completed_at.is_some());
    assert_eq!(done.script_output.as_deref(), Some("frames=1200"));
    assert!(done.error_message.is_none());

    // Same run delivered again: acknowledged, nothing changes.
    let replay = harness
        .manager
        .complete(&completion(&task_id, Some(&run_id), CompletionStatus::Failed))
        .await;
    assert_eq!(replay, CompletionOutcome::Idempotent);
    assert_eq!(harness.store.get(&task_id).unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_completion_statuses_map_to_task_states() {
    for (completion_status, expected) in [
        (CompletionStatus::Warning, TaskStatus::Warning),
        (CompletionStatus::Failed, TaskStatus::Failed),
    ] {
        let harness = harness(|_| {}).await;
        let stub = spawn_stub_runner(&["encoding"]).await;
        let (task_id, run_id) = running_task(&harness, &stub).await;

        harness
            .manager
            .complete(&completion(&task_id, Some(&run_id), completion_status))
            .await;

        let task = harness.store.get(&task_id).unwrap();
        assert_eq!(task.status, expected);
        assert_eq!(task.error_message.as_deref(), Some("ffmpeg exited with 1"));
    }
}

#[tokio::test]
async fn test_completion_unknown_task_and_legacy_run_id() {
    let harness = harness(|_| {}).await;
    let stub = spawn_stub_runner(&["encoding"]).await;

    let ghost = harness
        .manager
        .complete(&completion("no-such-task", None, CompletionStatus::Completed))
        .await;
    assert_eq!(ghost, CompletionOutcome::NotFound);

    // A missing run_id is tolerated for legacy runners.
    let (task_id, _) = running_task(&harness, &stub).await;
    let outcome = harness
        .manager
        .complete(&completion(&task_id, None, CompletionStatus::Completed))
        .await;
    assert_eq!(outcome, CompletionOutcome::Applied(TaskStatus::Completed));
}

#[tokio::test]
async fn test_stale_completion_after_restart() {
    let harness = harness(|_| {}).await;
    let stub = spawn_stub_runner(&["encoding"]).await;
    let (task_id, old_run_id) = running_task(&harness, &stub).await;

    // Operator restarts the task; it re-dispatches with a new run.
    harness
        .manager
        .complete(&completion(&task_id, Some(&old_run_id), CompletionStatus::Failed))
        .await;
    let report = harness.manager.restart_selected(&[task_id.clone()]).await;
    assert_eq!(report.restarted, vec![task_id.clone()]);

    dispatch_once(&harness, &task_id, 1).await;
    let rerun = harness.store.get(&task_id).unwrap();
    assert_eq!(rerun.status, TaskStatus::Running);
    assert_ne!(rerun.run_id, old_run_id);

    // The original runner reports late with the superseded run id.
    let stale = harness
        .manager
        .complete(&completion(&task_id, Some(&old_run_id), CompletionStatus::Completed))
        .await;
    assert_eq!(stale, CompletionOutcome::Stale);
    assert_eq!(harness.store.get(&task_id).unwrap().status, TaskStatus::Running);

    // The real completion for the new run applies.
    let real = harness
        .manager
        .complete(&completion(&task_id, Some(&rerun.run_id), CompletionStatus::Completed))
        .await;
    assert_eq!(real, CompletionOutcome::Applied(TaskStatus::Completed));
}

// ============================================================
// Timeout sweeper
// ============================================================

#[tokio::test]
async fn test_timeout_sweeper_marks_overdue_running_tasks() {
    let harness = harness(|cfg| cfg.execution_timeout = Duration::from_secs(3600)).await;
    let stub = spawn_stub_runner(&["encoding"]).await;
    let (task_id, _) = running_task(&harness, &stub).await;

    // Young task: untouched.
    assert_eq!(harness.manager.sweep_timeouts_once().await, 0);

    // Backdate the start beyond the execution timeout.
    {
        let _guard = harness.store.lock(&task_id).await;
        let mut task = harness.store.get(&task_id).unwrap();
        task.started_at = Some(chrono::Utc::now() - chrono::Duration::hours(2));
        harness.store.put(&task).await.unwrap();
    }

    assert_eq!(harness.manager.sweep_timeouts_once().await, 1);
    let timed_out = harness.store.get(&task_id).unwrap();
    assert_eq!(timed_out.status, TaskStatus::Timeout);
    assert!(timed_out.error_message.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_sweeper_never_overwrites_a_completion() {
    let harness = harness(|cfg| cfg.execution_timeout = Duration::from_secs(1)).await;
    let stub = spawn_stub_runner(&["encoding"]).await;
    let (task_id, run_id) = running_task(&harness, &stub).await;

    // Backdate, then complete before the sweeper fires.
    {
        let _guard = harness.store.lock(&task_id).await;
        let mut task = harness.store.get(&task_id).unwrap();
        task.started_at = Some(chrono::Utc::now() - chrono::Duration::hours(1));
        harness.store.put(&task).await.unwrap();
    }
    harness
        .manager
        .complete(&completion(&task_id, Some(&run_id), CompletionStatus::Completed))
        .await;

    assert_eq!(harness.manager.sweep_timeouts_once().await, 0);
    assert_eq!(harness.store.get(&task_id).unwrap().status, TaskStatus::Completed);
}

// ============================================================
// Restart
// ============================================================

#[tokio::test]
async fn test_restart_preserves_envelope_and_resets_execution() {
    let harness = harness(|_| {}).await;
    let stub = spawn_stub_runner(&["encoding"]).await;
    let (task_id, run_id) = running_task(&harness, &stub).await;
    harness
        .manager
        .complete(&completion(&task_id, Some(&run_id), CompletionStatus::Failed))
        .await;

    let report = harness.manager.restart_selected(&[task_id.clone()]).await;
    assert_eq!(report.requested, 1);
    assert_eq!(report.restarted, vec![task_id.clone()]);
    assert!(report.skipped.is_empty());
    assert!(report.failed.is_empty());

    let restarted = harness.store.get(&task_id).unwrap();
    assert_eq!(restarted.status, TaskStatus::Pending);
    assert_ne!(restarted.run_id, run_id);
    assert!(restarted.started_at.is_none());
    assert!(restarted.completed_at.is_none());
    assert!(restarted.error_message.is_none());
    assert!(restarted.script_output.is_none());
    // Envelope survives untouched.
    assert_eq!(restarted.etab_name, "etab-main");
    assert_eq!(restarted.task_type, "encoding");
    assert_eq!(restarted.parameters["preset"], serde_json::json!("fast"));
}

#[tokio::test]
async fn test_restart_skips_non_terminal_and_unknown_tasks() {
    let harness = harness(|_| {}).await;
    let stub = spawn_stub_runner(&["encoding"]).await;
    let (running_id, _) = running_task(&harness, &stub).await;

    let report = harness
        .manager
        .restart_selected(&[running_id.clone(), "missing-task".to_string()])
        .await;

    assert_eq!(report.requested, 2);
    assert!(report.restarted.is_empty());
    assert_eq!(report.skipped.len(), 2);
    let reasons: Vec<&str> = report.skipped.iter().map(|s| s.reason.as_str()).collect();
    assert!(reasons.iter().any(|r| r.contains("not restartable")));
    assert!(reasons.iter().any(|r| r.contains("not found")));
}

// ============================================================
// Startup re-dispatch
// ============================================================

#[tokio::test]
async fn test_pending_tasks_are_requeued_on_startup() {
    let harness = harness(|_| {}).await;

    let task = harness.manager.submit(request("encoding"), None).await.unwrap();
    // submit() already queued one job; redispatch_pending models the
    // startup scan over the freshly loaded store.
    let requeued = harness.manager.redispatch_pending();
    assert_eq!(requeued, 1);
    assert_eq!(
        harness.store.get(&task.task_id).unwrap().status,
        TaskStatus::Pending
    );
}

// ============================================================
// Retention
// ============================================================

#[tokio::test]
async fn test_retention_removes_only_old_terminal_tasks() {
    let harness = harness(|cfg| cfg.cleanup_task_days = 30).await;
    let stub = spawn_stub_runner(&["encoding"]).await;

    let (old_done_id, run_id) = running_task(&harness, &stub).await;
    harness
        .manager
        .complete(&completion(&old_done_id, Some(&run_id), CompletionStatus::Completed))
        .await;
    let fresh = harness.manager.submit(request("encoding"), None).await.unwrap();

    // Age the completed task past the retention window.
    {
        let _guard = harness.store.lock(&old_done_id).await;
        let mut task = harness.store.get(&old_done_id).unwrap();
        task.created_at = chrono::Utc::now() - chrono::Duration::days(45);
        harness.store.put(&task).await.unwrap();
    }

    assert_eq!(harness.manager.sweep_retention_once().await, 1);
    assert!(harness.store.get(&old_done_id).is_none());
    assert!(harness.store.get(&fresh.task_id).is_some());
}
