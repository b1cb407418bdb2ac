use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

/// Health of a runner from the manager's perspective.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    /// Heartbeating and selectable for dispatch.
    Registered,
    /// Missed the heartbeat window; excluded from selection until it
    /// heartbeats again.
    Unreachable,
    /// Explicitly unregistered. Terminal; the record is dropped.
    Removed,
}

/// A runner known to the manager.
///
/// Keyed by canonical URL. The `token` is the bearer credential the runner
/// presented at registration; every outbound call to the runner carries it.
/// It must never appear in logs.
#[derive(Debug, Clone)]
pub struct Runner {
    pub url: String,
    pub name: String,
    pub token: String,
    pub version: String,
    /// Task types advertised at registration. Selection re-checks the live
    /// set via `/runner/ping`, so this is a routing hint, not a contract.
    pub task_types: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    /// Monotonic companion to `last_heartbeat_at`; drives the sweeper.
    pub last_seen: Instant,
    pub status: RunnerStatus,
}

impl Runner {
    pub fn snapshot(&self) -> RunnerSnapshot {
        RunnerSnapshot {
            url: self.url.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            status: self.status,
            task_types: self.task_types.clone(),
            registered_at: self.registered_at,
            last_heartbeat_at: self.last_heartbeat_at,
        }
    }
}

/// Token-free view of a runner, safe to serialize to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSnapshot {
    pub url: String,
    pub name: String,
    pub version: String,
    pub status: RunnerStatus,
    pub task_types: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid runner url: {0}")]
    InvalidUrl(String),
    #[error("{0}")]
    VersionMismatch(String),
    #[error("unknown runner: {0}")]
    UnknownRunner(String),
}

// Wire types for the /runner endpoints.

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub task_types: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
}

/// Reduces a runner URL to `scheme://host:port`.
///
/// Hosts are lowercased by the parser, the port is made explicit so that
/// `http://host` and `http://host:80` collapse to the same key, and any
/// path, query or userinfo is rejected.
pub fn canonicalize_url(raw: &str) -> Result<String, RegistryError> {
    let parsed = reqwest::Url::parse(raw.trim())
        .map_err(|e| RegistryError::InvalidUrl(format!("{}: {}", raw, e)))?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(RegistryError::InvalidUrl(format!(
            "{}: scheme must be http or https",
            raw
        )));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(RegistryError::InvalidUrl(format!(
            "{}: userinfo is not allowed",
            raw
        )));
    }
    if parsed.path() != "/" && !parsed.path().is_empty() {
        return Err(RegistryError::InvalidUrl(format!(
            "{}: path is not allowed in a runner url",
            raw
        )));
    }
    if parsed.query().is_some() {
        return Err(RegistryError::InvalidUrl(format!(
            "{}: query is not allowed in a runner url",
            raw
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| RegistryError::InvalidUrl(format!("{}: missing host", raw)))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| RegistryError::InvalidUrl(format!("{}: missing port", raw)))?;

    Ok(format!("{}://{}:{}", scheme, host, port))
}
