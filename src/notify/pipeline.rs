//! Completion webhook pipeline.
//!
//! Delivers `{task_id, run_id, status, ...}` to the client's `notify_url`
//! with at-least-once semantics: a bounded queue feeds a small worker pool,
//! each delivery retries with exponential backoff up to `notify_max_retries`,
//! and the `(task_id, run_id)` pair acts as the idempotency key, both here
//! (duplicate enqueues collapse) and for clients deduplicating replays.
//!
//! A restart regenerates the task's `run_id`, so every attempt re-reads the
//! task and drops silently when its run has been superseded; the restarted
//! run enqueues a delivery of its own.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use reqwest::header;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::config::Config;
use crate::store::persistence::TaskStore;
use crate::tasks::types::Task;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct NotifyJob {
    pub task_id: String,
    pub run_id: String,
}

/// Webhook body. `run_id` is the idempotency key clients dedup on.
#[derive(Debug, Serialize)]
struct NotifyPayload<'a> {
    task_id: &'a str,
    run_id: &'a str,
    status: crate::tasks::types::TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    script_output: Option<&'a str>,
}

pub struct NotifyPipeline {
    store: Arc<TaskStore>,
    http: reqwest::Client,
    tx: mpsc::Sender<NotifyJob>,
    rx: Mutex<Option<mpsc::Receiver<NotifyJob>>>,
    /// `task_id:run_id` pairs queued or being delivered.
    in_flight: DashSet<String>,
    max_retries: u32,
    base_delay: Duration,
    backoff_factor: f64,
    workers: usize,
}

impl NotifyPipeline {
    pub fn new(store: Arc<TaskStore>, cfg: &Config) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(cfg.notify_queue_depth);
        Arc::new(Self {
            store,
            http: reqwest::Client::new(),
            tx,
            rx: Mutex::new(Some(rx)),
            in_flight: DashSet::new(),
            max_retries: cfg.notify_max_retries.max(1),
            base_delay: cfg.notify_retry_delay,
            backoff_factor: cfg.notify_backoff_factor,
            workers: cfg.notify_workers.max(1),
        })
    }

    /// True when no delivery is queued or in progress.
    pub fn idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Queues a delivery. Duplicate `(task_id, run_id)` enqueues are no-ops.
    pub fn enqueue(&self, task_id: &str, run_id: &str) {
        let key = format!("{}:{}", task_id, run_id);
        if !self.in_flight.insert(key.clone()) {
            tracing::debug!("Notify for task {} run {} already queued", task_id, run_id);
            return;
        }

        let job = NotifyJob {
            task_id: task_id.to_string(),
            run_id: run_id.to_string(),
        };
        if let Err(e) = self.tx.try_send(job) {
            self.in_flight.remove(&key);
            tracing::warn!("Notify queue full, dropping delivery for task {}: {}", task_id, e);
        }
    }

    pub fn start(self: Arc<Self>) {
        let receiver = self
            .rx
            .try_lock()
            .ok()
            .and_then(|mut slot| slot.take());
        let Some(receiver) = receiver else {
            tracing::warn!("Notify pipeline already started");
            return;
        };

        let receiver = Arc::new(Mutex::new(receiver));
        for worker_id in 0..self.workers {
            let pipeline = self.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move {
                loop {
                    let job = { receiver.lock().await.recv().await };
                    match job {
                        Some(job) => pipeline.deliver(worker_id, job).await,
                        None => break,
                    }
                }
            });
        }

        tracing::info!("Notify pipeline started with {} worker(s)", self.workers);
    }

    /// Runs the full retry schedule for one delivery.
    async fn deliver(&self, worker_id: usize, job: NotifyJob) {
        let key = format!("{}:{}", job.task_id, job.run_id);
        let mut exhausted = true;

        for attempt in 1..=self.max_retries {
            // Re-read every attempt: a restart between attempts supersedes
            // this delivery.
            let Some(task) = self.store.get(&job.task_id) else {
                tracing::debug!("Task {} vanished before notify delivery", job.task_id);
                exhausted = false;
                break;
            };
            if task.run_id != job.run_id {
                tracing::debug!(
                    "Dropping stale notify for task {} (run {} superseded)",
                    job.task_id,
                    job.run_id
                );
                exhausted = false;
                break;
            }
            let Some(notify_url) = task.notify_url.clone().filter(|u| !u.is_empty()) else {
                exhausted = false;
                break;
            };

            match self.post_webhook(&task, &notify_url).await {
                Ok(()) => {
                    tracing::info!(
                        "Worker {} delivered notify for task {} (attempt {}/{})",
                        worker_id,
                        job.task_id,
                        attempt,
                        self.max_retries
                    );
                    self.record_outcome(&job, attempt, None).await;
                    self.in_flight.remove(&key);
                    return;
                }
                Err(error) => {
                    tracing::warn!(
                        "Notify attempt {}/{} for task {} failed: {}",
                        attempt,
                        self.max_retries,
                        job.task_id,
                        error
                    );
                    self.record_outcome(&job, attempt, Some(error)).await;

                    if attempt < self.max_retries {
                        tokio::time::sleep(self.backoff_delay(attempt)).await;
                    }
                }
            }
        }

        if exhausted {
            tracing::warn!(
                "Notify delivery for task {} gave up after {} attempt(s)",
                job.task_id,
                self.max_retries
            );
        }
        self.in_flight.remove(&key);
    }

    /// Delay before retry `n+1`: `base × factor^(n-1)`.
    fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1) as i32;
        self.base_delay.mul_f64(self.backoff_factor.powi(exponent))
    }

    async fn post_webhook(&self, task: &Task, notify_url: &str) -> Result<(), String> {
        let payload = NotifyPayload {
            task_id: &task.task_id,
            run_id: &task.run_id,
            status: task.status,
            error_message: task.error_message.as_deref(),
            script_output: task.script_output.as_deref(),
        };

        let mut request = self
            .http
            .post(notify_url)
            .json(&payload)
            .timeout(NOTIFY_TIMEOUT);
        if let Some(client_token) = task.client_token.as_deref() {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", client_token));
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!(
                "notify_url returned {}",
                response.status()
            ))
        }
    }

    /// Persists delivery bookkeeping under the task's stripe lock, skipping
    /// if the run moved on meanwhile.
    async fn record_outcome(&self, job: &NotifyJob, attempt: u32, error: Option<String>) {
        let _guard = self.store.lock(&job.task_id).await;
        let Some(mut task) = self.store.get(&job.task_id) else {
            return;
        };
        if task.run_id != job.run_id {
            return;
        }

        task.notify_attempts = attempt;
        match error {
            None => {
                task.notify_delivered_at = Some(chrono::Utc::now());
                task.notify_last_error = None;
            }
            Some(message) => {
                task.notify_last_error = Some(message);
            }
        }
        task.updated_at = chrono::Utc::now();

        if let Err(e) = self.store.put(&task).await {
            tracing::error!(
                "Failed to persist notify bookkeeping for task {}: {}",
                job.task_id,
                e
            );
        }
    }
}
