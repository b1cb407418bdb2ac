use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, waiting for dispatch (or for a dispatch retry).
    Pending,
    /// Dispatched to a runner that accepted it.
    Running,
    /// Runner reported success.
    Completed,
    /// Runner reported success with caveats, or the completion webhook to
    /// the client could not be delivered yet.
    Warning,
    /// Runner reported failure.
    Failed,
    /// Exceeded the execution timeout without a completion.
    Timeout,
    /// No runner would take it, or the selected runner refused it.
    Rejected,
}

impl TaskStatus {
    /// Terminal states leave only via restart.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Warning | Self::Failed | Self::Timeout | Self::Rejected
        )
    }
}

/// Submission envelope received from clients on `/task/execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub etab_name: String,
    pub app_name: String,
    #[serde(default)]
    pub app_version: Option<String>,
    pub task_type: String,
    pub source_url: String,
    #[serde(default)]
    pub affiliation: Option<String>,
    /// Opaque passthrough to the runner. The manager never inspects it.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default)]
    pub notify_url: Option<String>,
}

/// A task record: submission envelope plus everything the manager learns
/// about its execution and delivery. This is the persisted shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub status: TaskStatus,

    // Submission envelope, preserved verbatim across restarts.
    pub etab_name: String,
    pub app_name: String,
    pub app_version: Option<String>,
    pub task_type: String,
    pub source_url: String,
    pub affiliation: Option<String>,
    pub parameters: HashMap<String, Value>,
    pub notify_url: Option<String>,
    /// Bearer token the client presented on submit; forwarded on notify
    /// callbacks. Never serialized to clients (see [`TaskView`]).
    pub client_token: Option<String>,

    // Assignment.
    pub runner_url: Option<String>,
    pub runner_name: Option<String>,

    // Execution.
    /// Regenerated on every dispatch attempt. Completions carrying a stale
    /// run_id are acknowledged and ignored.
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub script_output: Option<String>,

    // Delivery bookkeeping for the notify pipeline.
    #[serde(default)]
    pub notify_attempts: u32,
    #[serde(default)]
    pub notify_last_error: Option<String>,
    #[serde(default)]
    pub notify_delivered_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn from_request(request: TaskRequest, client_token: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4().to_string(),
            status: TaskStatus::Pending,
            etab_name: request.etab_name,
            app_name: request.app_name,
            app_version: request.app_version,
            task_type: request.task_type,
            source_url: request.source_url,
            affiliation: request.affiliation,
            parameters: request.parameters,
            notify_url: request.notify_url,
            client_token,
            runner_url: None,
            runner_name: None,
            run_id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            script_output: None,
            notify_attempts: 0,
            notify_last_error: None,
            notify_delivered_at: None,
        }
    }

    /// The day bucket this task persists in, fixed by `created_at` for the
    /// task's entire life.
    pub fn day_bucket(&self) -> NaiveDate {
        self.created_at.date_naive()
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            task_id: self.task_id.clone(),
            status: self.status,
            etab_name: self.etab_name.clone(),
            app_name: self.app_name.clone(),
            app_version: self.app_version.clone(),
            task_type: self.task_type.clone(),
            source_url: self.source_url.clone(),
            affiliation: self.affiliation.clone(),
            runner_url: self.runner_url.clone(),
            runner_name: self.runner_name.clone(),
            run_id: self.run_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message.clone(),
            script_output: self.script_output.clone(),
            notify_attempts: self.notify_attempts,
            notify_last_error: self.notify_last_error.clone(),
            notify_delivered_at: self.notify_delivered_at,
        }
    }
}

/// Client-facing projection of a task: everything except the submitted
/// parameters blob and the captured client token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: String,
    pub status: TaskStatus,
    pub etab_name: String,
    pub app_name: String,
    pub app_version: Option<String>,
    pub task_type: String,
    pub source_url: String,
    pub affiliation: Option<String>,
    pub runner_url: Option<String>,
    pub runner_name: Option<String>,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub script_output: Option<String>,
    pub notify_attempts: u32,
    pub notify_last_error: Option<String>,
    pub notify_delivered_at: Option<DateTime<Utc>>,
}

/// Completion payload runners POST to `/task/completion`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionNotification {
    pub task_id: String,
    pub status: CompletionStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub script_output: Option<String>,
    /// Absent on legacy runners; treated as matching the current run.
    #[serde(default)]
    pub run_id: Option<String>,
}

/// The subset of statuses a runner may report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    Warning,
    Failed,
}

impl From<CompletionStatus> for TaskStatus {
    fn from(status: CompletionStatus) -> Self {
        match status {
            CompletionStatus::Completed => TaskStatus::Completed,
            CompletionStatus::Warning => TaskStatus::Warning,
            CompletionStatus::Failed => TaskStatus::Failed,
        }
    }
}
