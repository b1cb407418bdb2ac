use std::collections::HashMap;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::tasks::types::Task;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Network-level failure: connect, timeout, protocol. Retryable by the
    /// caller's own schedule.
    #[error("runner request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The runner answered with a non-2xx status.
    #[error("runner returned {status}: {body}")]
    Rejected { status: StatusCode, body: String },
}

/// Live state a runner reports on `/runner/ping`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub task_types: Vec<String>,
}

/// Payload POSTed to a runner's `/task/run`: the submission envelope plus
/// the manager-added correlation fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTaskRequest {
    pub task_id: String,
    pub run_id: String,
    pub etab_name: String,
    pub app_name: String,
    pub app_version: Option<String>,
    pub task_type: String,
    pub source_url: String,
    pub affiliation: Option<String>,
    pub parameters: HashMap<String, Value>,
    pub notify_url: Option<String>,
    /// URL the runner must POST its completion to.
    pub completion_callback: String,
}

impl RunTaskRequest {
    pub fn from_task(task: &Task, completion_callback: String) -> Self {
        Self {
            task_id: task.task_id.clone(),
            run_id: task.run_id.clone(),
            etab_name: task.etab_name.clone(),
            app_name: task.app_name.clone(),
            app_version: task.app_version.clone(),
            task_type: task.task_type.clone(),
            source_url: task.source_url.clone(),
            affiliation: task.affiliation.clone(),
            parameters: task.parameters.clone(),
            notify_url: task.notify_url.clone(),
            completion_callback,
        }
    }
}
