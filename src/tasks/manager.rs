//! Task lifecycle management.
//!
//! The manager owns every mutation of a task. Every path follows the same
//! discipline: take the task's stripe lock, re-read the record, check the
//! transition is still legal, write through to the store, release. Dispatch
//! keeps the lock across the `/task/run` call because no other mutation of
//! that task is legal until the runner has answered or timed out.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::dispatch::{DispatchOutcome, Dispatcher};
use super::types::{CompletionNotification, CompletionStatus, Task, TaskRequest, TaskStatus};
use super::urls::validate_submitted_url;
use crate::client::service::RunnerClient;
use crate::config::Config;
use crate::notify::pipeline::NotifyPipeline;
use crate::registry::service::RunnerRegistry;
use crate::store::persistence::{StoreError, TaskFilter, TaskStore};

const RETENTION_TICK: std::time::Duration = std::time::Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    Validation(String),
    /// The dispatch queue is full. Rejecting new work beats unbounded
    /// memory growth; the client retries.
    #[error("dispatch queue is full, try again later")]
    QueueFull,
    #[error("failed to persist task: {0}")]
    Store(#[from] StoreError),
}

/// What happened to a completion notification.
#[derive(Debug, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Transition applied; notify enqueued.
    Applied(TaskStatus),
    /// The payload's run was superseded (restart) or the task is not in a
    /// completable state. Acknowledged and ignored.
    Stale,
    /// Re-delivery of a completion that already won: no state change.
    Idempotent,
    NotFound,
    StoreFailed,
}

#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub task_id: String,
    pub attempt: u32,
}

pub struct TaskManager {
    store: Arc<TaskStore>,
    notify: Arc<NotifyPipeline>,
    dispatcher: Dispatcher,
    cfg: Config,
    dispatch_tx: mpsc::Sender<DispatchJob>,
    dispatch_rx: Mutex<Option<mpsc::Receiver<DispatchJob>>>,
}

impl TaskManager {
    pub fn new(
        store: Arc<TaskStore>,
        registry: Arc<RunnerRegistry>,
        client: Arc<RunnerClient>,
        notify: Arc<NotifyPipeline>,
        cfg: Config,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(cfg.dispatch_queue_depth);
        let dispatcher = Dispatcher::new(registry, client, cfg.completion_callback());

        Arc::new(Self {
            store,
            notify,
            dispatcher,
            cfg,
            dispatch_tx: tx,
            dispatch_rx: Mutex::new(Some(rx)),
        })
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// True when no dispatch job is queued or reserved. Used by the
    /// shutdown path to decide the queue has drained.
    pub fn dispatch_queue_idle(&self) -> bool {
        self.dispatch_tx.capacity() == self.dispatch_tx.max_capacity()
    }

    /// Spawns the dispatch workers, the timeout sweeper and the retention
    /// tick, and re-enqueues pending tasks found in the store.
    pub fn start(self: &Arc<Self>) {
        let receiver = self
            .dispatch_rx
            .try_lock()
            .ok()
            .and_then(|mut slot| slot.take());
        let Some(receiver) = receiver else {
            tracing::warn!("Task manager already started");
            return;
        };

        let receiver = Arc::new(Mutex::new(receiver));
        for worker_id in 0..self.cfg.dispatch_workers {
            let manager = self.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move {
                tracing::debug!("Dispatch worker {} started", worker_id);
                loop {
                    let job = { receiver.lock().await.recv().await };
                    match job {
                        Some(job) => manager.clone().run_dispatch_attempt(job).await,
                        None => break,
                    }
                }
            });
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.cfg.timeout_sweep_interval);
            loop {
                interval.tick().await;
                manager.sweep_timeouts_once().await;
            }
        });

        if self.cfg.cleanup_task_days > 0 {
            let manager = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(RETENTION_TICK);
                // The first tick fires immediately; skip it so startup is
                // not dominated by retention IO.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    manager.sweep_retention_once().await;
                }
            });
        }

        if self.cfg.redispatch_on_start {
            let requeued = self.redispatch_pending();
            if requeued > 0 {
                tracing::info!("Re-enqueued {} pending task(s) from the store", requeued);
            }
        }

        tracing::info!(
            "Task manager started with {} dispatch worker(s)",
            self.cfg.dispatch_workers
        );
    }

    /// Accepts a submission: validates URLs, persists the pending task and
    /// queues it for dispatch. Never blocks on runner I/O; runner-side
    /// failures surface later through status polling.
    pub async fn submit(
        &self,
        request: TaskRequest,
        client_token: Option<String>,
    ) -> Result<Task, SubmitError> {
        validate_submitted_url("source_url", &request.source_url, self.cfg.ssrf_allow_private)
            .await
            .map_err(SubmitError::Validation)?;
        if let Some(notify_url) = request.notify_url.as_deref().filter(|u| !u.is_empty()) {
            validate_submitted_url("notify_url", notify_url, self.cfg.ssrf_allow_private)
                .await
                .map_err(SubmitError::Validation)?;
        }

        // Reserve the queue slot before persisting so a full queue rejects
        // the request instead of stranding a pending record.
        let permit = self
            .dispatch_tx
            .try_reserve()
            .map_err(|_| SubmitError::QueueFull)?;

        let task = Task::from_request(request, client_token);
        {
            let _guard = self.store.lock(&task.task_id).await;
            self.store.put(&task).await?;
        }

        tracing::info!(
            "Task {} accepted (type '{}', app '{}')",
            task.task_id,
            task.task_type,
            task.app_name
        );
        permit.send(DispatchJob {
            task_id: task.task_id.clone(),
            attempt: 1,
        });

        Ok(task)
    }

    pub fn enqueue_dispatch(&self, task_id: &str, attempt: u32) -> bool {
        let job = DispatchJob {
            task_id: task_id.to_string(),
            attempt,
        };
        match self.dispatch_tx.try_send(job) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Could not enqueue dispatch for task {}: {}", task_id, e);
                false
            }
        }
    }

    /// One dispatch attempt. Holds the stripe lock from the pending
    /// re-check through the runner's answer.
    pub async fn run_dispatch_attempt(self: Arc<Self>, job: DispatchJob) {
        let guard = self.store.lock(&job.task_id).await;
        let Some(mut task) = self.store.get(&job.task_id) else {
            tracing::debug!("Dispatch job for unknown task {}", job.task_id);
            return;
        };
        if task.status != TaskStatus::Pending {
            tracing::debug!(
                "Skipping dispatch of task {} in status {:?}",
                job.task_id,
                task.status
            );
            return;
        }

        // Fresh correlation id for this attempt; completions for earlier
        // attempts become stale the moment this persists.
        task.run_id = Uuid::new_v4().to_string();

        let outcome = self.dispatcher.dispatch(&task).await;
        match outcome {
            DispatchOutcome::Dispatched {
                runner_url,
                runner_name,
            } => {
                let now = Utc::now();
                task.status = TaskStatus::Running;
                task.runner_url = Some(runner_url);
                task.runner_name = Some(runner_name);
                task.started_at = Some(now);
                task.updated_at = now;
                task.error_message = None;
                if let Err(e) = self.store.put(&task).await {
                    tracing::error!("Failed to persist running task {}: {}", task.task_id, e);
                }
            }
            DispatchOutcome::RunnerRejected { reason } => {
                self.mark_rejected(&mut task, reason).await;
            }
            DispatchOutcome::NoRunnerAvailable => {
                let max = self.cfg.dispatch_max_attempts;
                if max > 0 && job.attempt >= max {
                    let reason = format!(
                        "no eligible runner for task type '{}' after {} attempt(s)",
                        task.task_type, job.attempt
                    );
                    self.mark_rejected(&mut task, reason).await;
                } else {
                    drop(guard);
                    self.schedule_retry(job);
                }
            }
        }
    }

    async fn mark_rejected(&self, task: &mut Task, reason: String) {
        tracing::warn!("Task {} rejected: {}", task.task_id, reason);
        let now = Utc::now();
        task.status = TaskStatus::Rejected;
        task.error_message = Some(reason);
        task.completed_at = Some(now);
        task.updated_at = now;
        if let Err(e) = self.store.put(task).await {
            tracing::error!("Failed to persist rejected task {}: {}", task.task_id, e);
        }
        // No webhook for rejections; clients observe them by polling status.
    }

    fn schedule_retry(self: &Arc<Self>, job: DispatchJob) {
        let manager = self.clone();
        tokio::spawn(async move {
            // Small jitter keeps a burst of starved tasks from re-pinging
            // the same runners in lockstep.
            let jitter = std::time::Duration::from_millis(rand::random::<u64>() % 50);
            tokio::time::sleep(manager.cfg.dispatch_retry_delay + jitter).await;
            if !manager.enqueue_dispatch(&job.task_id, job.attempt + 1) {
                // Queue congested; keep the task pending and try again on
                // the same attempt counter.
                manager.schedule_retry(job);
            }
        });
    }

    /// Applies a runner's completion notification.
    pub async fn complete(&self, notification: &CompletionNotification) -> CompletionOutcome {
        let _guard = self.store.lock(&notification.task_id).await;
        let Some(mut task) = self.store.get(&notification.task_id) else {
            return CompletionOutcome::NotFound;
        };

        match notification.run_id.as_deref() {
            Some(run_id) if run_id != task.run_id => {
                tracing::info!(
                    "Ignoring stale completion for task {} (run {} superseded by {})",
                    task.task_id,
                    run_id,
                    task.run_id
                );
                return CompletionOutcome::Stale;
            }
            None => {
                tracing::warn!(
                    "Completion for task {} carries no run_id; assuming current run",
                    task.task_id
                );
            }
            _ => {}
        }

        if task.status.is_terminal() {
            // Same run delivered twice: the first one won, re-acknowledge.
            return CompletionOutcome::Idempotent;
        }
        if task.status != TaskStatus::Running {
            tracing::warn!(
                "Completion for task {} in status {:?}; ignoring",
                task.task_id,
                task.status
            );
            return CompletionOutcome::Stale;
        }

        let now = Utc::now();
        task.status = notification.status.into();
        task.completed_at = Some(now);
        task.updated_at = now;
        task.error_message = match notification.status {
            CompletionStatus::Completed => None,
            _ => notification.error_message.clone(),
        };
        if let Some(output) = &notification.script_output {
            task.script_output = Some(output.clone());
        }

        if let Err(e) = self.store.put(&task).await {
            tracing::error!("Failed to persist completion of task {}: {}", task.task_id, e);
            return CompletionOutcome::StoreFailed;
        }

        tracing::info!("Task {} finished with status {:?}", task.task_id, task.status);
        self.notify.enqueue(&task.task_id, &task.run_id);
        CompletionOutcome::Applied(task.status)
    }

    /// One timeout sweep: snapshot the running tasks first, then take each
    /// task's lock individually, never the reverse order.
    pub async fn sweep_timeouts_once(&self) -> usize {
        let running: Vec<String> = self
            .store
            .list(&TaskFilter {
                status: Some(TaskStatus::Running),
                ..Default::default()
            })
            .into_iter()
            .map(|task| task.task_id)
            .collect();

        let mut marked = 0;
        for task_id in running {
            let _guard = self.store.lock(&task_id).await;
            let Some(mut task) = self.store.get(&task_id) else {
                continue;
            };
            // A completion may have won the lock between snapshot and here.
            if task.status != TaskStatus::Running {
                continue;
            }
            let Some(started_at) = task.started_at else {
                continue;
            };

            let expired = (Utc::now() - started_at)
                .to_std()
                .map(|elapsed| elapsed > self.cfg.execution_timeout)
                .unwrap_or(false);
            if !expired {
                continue;
            }

            let now = Utc::now();
            task.status = TaskStatus::Timeout;
            task.error_message = Some(format!(
                "Task timed out after {}s without a completion",
                self.cfg.execution_timeout.as_secs()
            ));
            task.completed_at = Some(now);
            task.updated_at = now;

            if let Err(e) = self.store.put(&task).await {
                tracing::error!("Failed to persist timeout of task {}: {}", task_id, e);
                continue;
            }
            tracing::warn!("Task {} marked as timeout", task_id);
            self.notify.enqueue(&task.task_id, &task.run_id);
            marked += 1;
        }
        marked
    }

    /// Restarts the requested tasks that sit in a terminal state. Others
    /// are reported back per-id instead of silently dropped.
    pub async fn restart_selected(&self, task_ids: &[String]) -> RestartReport {
        let mut report = RestartReport {
            requested: task_ids.len(),
            restarted: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        };

        for task_id in task_ids {
            let _guard = self.store.lock(task_id).await;
            let Some(mut task) = self.store.get(task_id) else {
                report.skipped.push(RestartEntry {
                    task_id: task_id.clone(),
                    reason: "task not found".to_string(),
                });
                continue;
            };
            if !task.status.is_terminal() {
                report.skipped.push(RestartEntry {
                    task_id: task_id.clone(),
                    reason: format!("status {:?} is not restartable", task.status),
                });
                continue;
            }

            // Back to pending with a fresh run; the submission envelope is
            // preserved, everything execution-related resets.
            task.status = TaskStatus::Pending;
            task.run_id = Uuid::new_v4().to_string();
            task.runner_url = None;
            task.runner_name = None;
            task.started_at = None;
            task.completed_at = None;
            task.error_message = None;
            task.script_output = None;
            task.notify_attempts = 0;
            task.notify_last_error = None;
            task.notify_delivered_at = None;
            task.updated_at = Utc::now();

            if let Err(e) = self.store.put(&task).await {
                report.failed.push(RestartEntry {
                    task_id: task_id.clone(),
                    reason: e.to_string(),
                });
                continue;
            }

            if self.enqueue_dispatch(task_id, 1) {
                tracing::info!("Task {} restarted (run {})", task_id, task.run_id);
                report.restarted.push(task_id.clone());
            } else {
                report.failed.push(RestartEntry {
                    task_id: task_id.clone(),
                    reason: "dispatch queue full".to_string(),
                });
            }
        }

        report
    }

    /// Queues every pending task in the store for dispatch. Used at
    /// startup so accepted work survives a manager restart.
    pub fn redispatch_pending(&self) -> usize {
        let pending = self.store.list(&TaskFilter {
            status: Some(TaskStatus::Pending),
            ..Default::default()
        });
        let mut requeued = 0;
        for task in pending {
            if self.enqueue_dispatch(&task.task_id, 1) {
                requeued += 1;
            }
        }
        requeued
    }

    /// Deletes terminal tasks older than the retention window.
    pub async fn sweep_retention_once(&self) -> usize {
        if self.cfg.cleanup_task_days == 0 {
            return 0;
        }
        let cutoff = Utc::now() - chrono::Duration::days(self.cfg.cleanup_task_days as i64);

        let mut removed = 0;
        for candidate in self.store.all() {
            if !candidate.status.is_terminal() || candidate.created_at >= cutoff {
                continue;
            }
            let _guard = self.store.lock(&candidate.task_id).await;
            let Some(task) = self.store.get(&candidate.task_id) else {
                continue;
            };
            if !task.status.is_terminal() || task.created_at >= cutoff {
                continue;
            }
            match self.store.remove(&task.task_id).await {
                Ok(true) => {
                    tracing::info!(
                        "Task {} cleaned up ({}+ days old)",
                        task.task_id,
                        self.cfg.cleanup_task_days
                    );
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Failed to clean up task {}: {}", task.task_id, e);
                }
            }
        }
        removed
    }
}

#[derive(Debug, serde::Serialize)]
pub struct RestartEntry {
    pub task_id: String,
    pub reason: String,
}

#[derive(Debug, serde::Serialize)]
pub struct RestartReport {
    pub requested: usize,
    pub restarted: Vec<String>,
    pub skipped: Vec<RestartEntry>,
    pub failed: Vec<RestartEntry>,
}
