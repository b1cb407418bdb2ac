use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use super::types::{canonicalize_url, Runner, RunnerSnapshot, RunnerStatus, RegistryError};
use crate::auth::service::check_runner_version;
use crate::config::Config;

/// In-memory registry of known runners, keyed by canonical URL.
///
/// Runners are never persisted: after a manager restart the pool rebuilds
/// itself from runner-side re-registration and heartbeats. DashMap gives
/// per-entry locking, so registration, heartbeats, listing and selection
/// all run without a global lock.
pub struct RunnerRegistry {
    pub runners: Arc<DashMap<String, Runner>>,
    manager_version: String,
    dead_after: Duration,
    sweep_interval: Duration,
}

impl RunnerRegistry {
    pub fn new(cfg: &Config) -> Arc<Self> {
        Arc::new(Self {
            runners: Arc::new(DashMap::new()),
            manager_version: crate::MANAGER_VERSION.to_string(),
            dead_after: cfg.heartbeat_dead_after,
            sweep_interval: cfg.heartbeat_sweep_interval,
        })
    }

    #[cfg(test)]
    pub fn with_manager_version(cfg: &Config, version: &str) -> Arc<Self> {
        Arc::new(Self {
            runners: Arc::new(DashMap::new()),
            manager_version: version.to_string(),
            dead_after: cfg.heartbeat_dead_after,
            sweep_interval: cfg.heartbeat_sweep_interval,
        })
    }

    /// Registers a runner, replacing any previous record under the same
    /// canonical URL. Re-registration is how runners rotate tokens and
    /// update their advertised task types.
    pub fn register(
        &self,
        url: &str,
        name: &str,
        token: &str,
        version: &str,
        task_types: Vec<String>,
    ) -> Result<String, RegistryError> {
        let canonical = canonicalize_url(url)?;
        check_runner_version(version, &self.manager_version)
            .map_err(RegistryError::VersionMismatch)?;

        let now = Utc::now();
        let runner = Runner {
            url: canonical.clone(),
            name: name.to_string(),
            token: token.to_string(),
            version: version.to_string(),
            task_types,
            registered_at: now,
            last_heartbeat_at: now,
            last_seen: Instant::now(),
            status: RunnerStatus::Registered,
        };

        let replaced = self.runners.insert(canonical.clone(), runner).is_some();
        if replaced {
            tracing::info!("Runner v{} re-registered: {}", version, canonical);
        } else {
            tracing::info!("Runner v{} registered: {}", version, canonical);
        }

        Ok(canonical)
    }

    /// Refreshes a runner's heartbeat. An `unreachable` runner that
    /// heartbeats again becomes selectable immediately.
    pub fn heartbeat(&self, url: &str, version: &str) -> Result<(), RegistryError> {
        let canonical = canonicalize_url(url)?;
        check_runner_version(version, &self.manager_version)
            .map_err(RegistryError::VersionMismatch)?;

        let mut runner = self
            .runners
            .get_mut(&canonical)
            .ok_or_else(|| RegistryError::UnknownRunner(canonical.clone()))?;

        runner.last_heartbeat_at = Utc::now();
        runner.last_seen = Instant::now();
        runner.version = version.to_string();
        if runner.status == RunnerStatus::Unreachable {
            tracing::info!("Runner {} reachable again", canonical);
            runner.status = RunnerStatus::Registered;
        }

        Ok(())
    }

    pub fn unregister(&self, url: &str) -> bool {
        let Ok(canonical) = canonicalize_url(url) else {
            return false;
        };
        match self.runners.remove(&canonical) {
            Some((_, runner)) => {
                tracing::info!("Runner {} unregistered", runner.url);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, url: &str) -> Option<Runner> {
        let canonical = canonicalize_url(url).ok()?;
        self.runners.get(&canonical).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<RunnerSnapshot> {
        let mut snapshots: Vec<RunnerSnapshot> = self
            .runners
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.url.cmp(&b.url));
        snapshots
    }

    /// Returns the `registered` runners advertising `task_type`, in a
    /// stable order: oldest registration first, URL as the tie-breaker.
    /// Dispatch walks this list, so the ordering doubles as a fairness and
    /// reproducibility guarantee.
    pub fn find_eligible(&self, task_type: &str) -> Vec<Runner> {
        let mut eligible: Vec<Runner> = self
            .runners
            .iter()
            .filter(|entry| {
                let runner = entry.value();
                runner.status == RunnerStatus::Registered
                    && runner.task_types.iter().any(|t| t == task_type)
            })
            .map(|entry| entry.value().clone())
            .collect();

        eligible.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.url.cmp(&b.url))
        });
        eligible
    }

    /// Spawns the liveness sweeper.
    pub fn start(self: Arc<Self>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.sweep_interval);
            loop {
                interval.tick().await;
                registry.sweep_once();
            }
        });
        tracing::info!(
            "Runner liveness sweeper started (every {:?}, dead after {:?})",
            self.sweep_interval,
            self.dead_after
        );
    }

    /// One sweep pass: marks runners `unreachable` when their last
    /// heartbeat is older than the dead-after window. Returns how many
    /// runners were newly marked.
    pub fn sweep_once(&self) -> usize {
        let now = Instant::now();
        let mut marked = 0;

        for mut entry in self.runners.iter_mut() {
            let runner = entry.value_mut();
            if runner.status != RunnerStatus::Registered {
                continue;
            }

            let silent_for = now.saturating_duration_since(runner.last_seen);
            if silent_for > self.dead_after {
                tracing::warn!(
                    "Runner {} unreachable (no heartbeat for {:?})",
                    runner.url,
                    silent_for
                );
                runner.status = RunnerStatus::Unreachable;
                marked += 1;
            }
        }

        marked
    }
}
