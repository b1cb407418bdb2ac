use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::types::TaskStatus;
use crate::store::persistence::TaskFilter;

// Endpoints
pub const ENDPOINT_TASK_EXECUTE: &str = "/task/execute";
pub const ENDPOINT_TASK_STATUS: &str = "/task/status";
pub const ENDPOINT_TASK_LIST: &str = "/task/list";
pub const ENDPOINT_TASK_RESULT: &str = "/task/result";
pub const ENDPOINT_TASK_COMPLETION: &str = "/task/completion";
pub const ENDPOINT_RUNNER_REGISTER: &str = "/runner/register";
pub const ENDPOINT_RUNNER_HEARTBEAT: &str = "/runner/heartbeat";
pub const ENDPOINT_RUNNER_UNREGISTER: &str = "/runner/unregister";
pub const ENDPOINT_RUNNER_LIST: &str = "/runner/list";
pub const ENDPOINT_RESTART_SELECTED: &str = "/tasks/restart-selected";

/// Response to a task submission.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub task_id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionAck {
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RestartRequest {
    pub task_ids: Vec<String>,
}

/// Query parameters accepted by the task listing endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub etab_name: Option<String>,
    pub app_name: Option<String>,
    /// Inclusive lower bound on the task's creation day (YYYY-MM-DD).
    pub from: Option<NaiveDate>,
    /// Inclusive upper bound on the task's creation day (YYYY-MM-DD).
    pub to: Option<NaiveDate>,
}

impl TaskListQuery {
    pub fn into_filter(self) -> TaskFilter {
        TaskFilter {
            status: self.status,
            task_type: self.task_type,
            etab_name: self.etab_name,
            app_name: self.app_name,
            created_from: self.from,
            created_to: self.to,
        }
    }
}
