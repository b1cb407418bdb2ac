//! Runner selection and task dispatch.
//!
//! Selection walks the eligible runners in the registry's stable order and
//! pings each one before committing: runners self-report load through
//! `available`, and skipping a busy runner is cheaper than having it reject
//! the run. The first runner whose ping checks out gets the `/task/run`
//! call; a runner that answers the run with an HTTP error is remembered so
//! an exhausted walk can distinguish "nobody could take it right now"
//! (retryable) from "a runner actively refused it" (terminal).

use std::sync::Arc;

use crate::client::service::RunnerClient;
use crate::client::types::{ClientError, RunTaskRequest};
use crate::registry::service::RunnerRegistry;
use crate::tasks::types::Task;

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A runner accepted the run call.
    Dispatched {
        runner_url: String,
        runner_name: String,
    },
    /// No runner advertises the type, or every candidate was busy or
    /// unreachable. The task stays pending and dispatch retries later.
    NoRunnerAvailable,
    /// At least one selected runner answered `/task/run` with 4xx/5xx.
    RunnerRejected { reason: String },
}

pub struct Dispatcher {
    registry: Arc<RunnerRegistry>,
    client: Arc<RunnerClient>,
    completion_callback: String,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RunnerRegistry>,
        client: Arc<RunnerClient>,
        completion_callback: String,
    ) -> Self {
        Self {
            registry,
            client,
            completion_callback,
        }
    }

    /// One dispatch pass over the current pool. The caller holds the task's
    /// stripe lock for the whole call.
    pub async fn dispatch(&self, task: &Task) -> DispatchOutcome {
        let candidates = self.registry.find_eligible(&task.task_type);
        if candidates.is_empty() {
            tracing::debug!(
                "No registered runner advertises task type '{}'",
                task.task_type
            );
            return DispatchOutcome::NoRunnerAvailable;
        }

        let mut last_rejection: Option<String> = None;

        for runner in candidates {
            let ping = match self.client.ping(&runner).await {
                Ok(ping) => ping,
                Err(e) => {
                    tracing::warn!("Runner {} ping failed: {}", runner.url, e);
                    continue;
                }
            };

            let eligible = ping.available
                && ping.registered
                && ping.task_types.iter().any(|t| t == &task.task_type);
            if !eligible {
                tracing::debug!(
                    "Runner {} not eligible for task {} (available={}, registered={})",
                    runner.url,
                    task.task_id,
                    ping.available,
                    ping.registered
                );
                continue;
            }

            let payload = RunTaskRequest::from_task(task, self.completion_callback.clone());
            match self.client.run_task(&runner, &payload).await {
                Ok(()) => {
                    tracing::info!(
                        "Task {} dispatched to runner {} ({})",
                        task.task_id,
                        runner.name,
                        runner.url
                    );
                    return DispatchOutcome::Dispatched {
                        runner_url: runner.url,
                        runner_name: runner.name,
                    };
                }
                Err(ClientError::Rejected { status, body }) => {
                    let reason = format!(
                        "runner {} returned status {}: {}",
                        runner.url,
                        status.as_u16(),
                        truncate(&body, 512)
                    );
                    tracing::warn!("Task {} rejected: {}", task.task_id, reason);
                    last_rejection = Some(reason);
                }
                Err(ClientError::Transport(e)) => {
                    tracing::warn!(
                        "Run call to runner {} failed for task {}: {}",
                        runner.url,
                        task.task_id,
                        e
                    );
                }
            }
        }

        match last_rejection {
            Some(reason) => DispatchOutcome::RunnerRejected { reason },
            None => DispatchOutcome::NoRunnerAvailable,
        }
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
