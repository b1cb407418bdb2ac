//! Environment-driven configuration for the manager.
//!
//! All options are read from environment variables at startup. Map-shaped
//! options use a double-underscore convention: `AUTHORIZED_TOKENS__backend`
//! defines the token named `backend`, `ADMIN_USERS__ops` defines the bcrypt
//! hash for the admin user `ops`. Validation runs once at startup and the
//! process refuses to boot on a misconfiguration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};


/// Placeholder token shipped in deployment templates. Refused in validation
/// so it can never reach production.
const DEFAULT_TOKEN_SENTINEL: &str = "default-manager-token";

const TOKEN_PREFIX: &str = "AUTHORIZED_TOKENS__";
const ADMIN_PREFIX: &str = "ADMIN_USERS__";

#[derive(Debug, Clone)]
pub struct Config {
    pub manager_port: u16,
    /// External base URL of this manager, used to build the
    /// `completion_callback` handed to runners.
    pub manager_url: String,
    /// Token name -> token value. Names exist only for operator bookkeeping.
    pub authorized_tokens: HashMap<String, String>,
    /// Admin username -> bcrypt hash.
    pub admin_users: HashMap<String, String>,
    pub cors_allow_origins: Vec<String>,
    pub cors_allow_credentials: bool,
    pub cors_allow_methods: Vec<String>,
    pub cors_allow_headers: Vec<String>,
    pub log_directory: Option<PathBuf>,
    pub log_level: String,
    /// When true, task results are read from `runners_storage_path` instead
    /// of being proxy-streamed from the runner.
    pub runners_storage_enabled: bool,
    pub runners_storage_path: PathBuf,
    pub task_store_path: PathBuf,
    pub heartbeat_dead_after: Duration,
    pub heartbeat_sweep_interval: Duration,
    pub ping_timeout: Duration,
    pub dispatch_timeout: Duration,
    pub dispatch_retry_delay: Duration,
    /// 0 means retry until an operator intervenes.
    pub dispatch_max_attempts: u32,
    pub dispatch_workers: usize,
    pub dispatch_queue_depth: usize,
    pub execution_timeout: Duration,
    pub timeout_sweep_interval: Duration,
    pub notify_max_retries: u32,
    pub notify_retry_delay: Duration,
    pub notify_backoff_factor: f64,
    pub notify_workers: usize,
    pub notify_queue_depth: usize,
    pub graceful_shutdown_timeout: Duration,
    /// Skips the private/loopback address checks on submitted URLs. Test
    /// deployments only.
    pub ssrf_allow_private: bool,
    pub redispatch_on_start: bool,
    /// Terminal tasks older than this many days are deleted by the retention
    /// tick. 0 disables retention.
    pub cleanup_task_days: u32,
    pub rate_limit_per_minute: u32,
    pub admin_rate_limit_per_minute: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manager_port: 8000,
            manager_url: "http://localhost:8000".to_string(),
            authorized_tokens: HashMap::new(),
            admin_users: HashMap::new(),
            cors_allow_origins: vec!["*".to_string()],
            cors_allow_credentials: false,
            cors_allow_methods: vec!["GET".to_string(), "POST".to_string()],
            cors_allow_headers: vec!["*".to_string()],
            log_directory: None,
            log_level: "info".to_string(),
            runners_storage_enabled: false,
            runners_storage_path: PathBuf::from("/srv/runner-storage"),
            task_store_path: PathBuf::from("data/tasks"),
            heartbeat_dead_after: Duration::from_secs(180),
            heartbeat_sweep_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
            dispatch_timeout: Duration::from_secs(30),
            dispatch_retry_delay: Duration::from_secs(15),
            dispatch_max_attempts: 0,
            dispatch_workers: 4,
            dispatch_queue_depth: 256,
            execution_timeout: Duration::from_secs(5 * 3600),
            timeout_sweep_interval: Duration::from_secs(60),
            notify_max_retries: 5,
            notify_retry_delay: Duration::from_secs(60),
            notify_backoff_factor: 1.5,
            notify_workers: 2,
            notify_queue_depth: 256,
            graceful_shutdown_timeout: Duration::from_secs(30),
            ssrf_allow_private: false,
            redispatch_on_start: true,
            cleanup_task_days: 30,
            rate_limit_per_minute: 120,
            admin_rate_limit_per_minute: 10,
        }
    }
}

impl Config {
    /// Builds a configuration from the process environment, falling back to
    /// defaults for anything unset. Does not validate; call [`validate`].
    ///
    /// [`validate`]: Config::validate
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parse_env("MANAGER_PORT") {
            cfg.manager_port = port;
        }
        if let Ok(url) = std::env::var("MANAGER_URL") {
            cfg.manager_url = url.trim_end_matches('/').to_string();
        }

        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix(TOKEN_PREFIX) {
                cfg.authorized_tokens
                    .insert(name.to_lowercase(), value);
            } else if let Some(user) = key.strip_prefix(ADMIN_PREFIX) {
                cfg.admin_users.insert(user.to_lowercase(), value);
            }
        }

        if let Ok(origins) = std::env::var("CORS_ALLOW_ORIGINS") {
            cfg.cors_allow_origins = parse_list(&origins);
        }
        cfg.cors_allow_credentials =
            parse_bool_env("CORS_ALLOW_CREDENTIALS", cfg.cors_allow_credentials);
        if let Ok(methods) = std::env::var("CORS_ALLOW_METHODS") {
            cfg.cors_allow_methods = parse_list(&methods);
        }
        if let Ok(headers) = std::env::var("CORS_ALLOW_HEADERS") {
            cfg.cors_allow_headers = parse_list(&headers);
        }

        if let Ok(dir) = std::env::var("LOG_DIRECTORY") {
            if !dir.trim().is_empty() {
                cfg.log_directory = Some(PathBuf::from(dir));
            }
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            cfg.log_level = level.to_lowercase();
        }

        cfg.runners_storage_enabled =
            parse_bool_env("RUNNERS_STORAGE_ENABLED", cfg.runners_storage_enabled);
        if let Ok(path) = std::env::var("RUNNERS_STORAGE_PATH") {
            cfg.runners_storage_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("TASK_STORE_PATH") {
            cfg.task_store_path = PathBuf::from(path);
        }

        cfg.heartbeat_dead_after =
            parse_secs_env("HEARTBEAT_DEAD_AFTER_SECONDS", cfg.heartbeat_dead_after);
        cfg.heartbeat_sweep_interval = parse_secs_env(
            "HEARTBEAT_SWEEP_INTERVAL_SECONDS",
            cfg.heartbeat_sweep_interval,
        );
        cfg.ping_timeout = parse_secs_env("PING_TIMEOUT_SECONDS", cfg.ping_timeout);
        cfg.dispatch_timeout = parse_secs_env("DISPATCH_TIMEOUT_SECONDS", cfg.dispatch_timeout);
        cfg.dispatch_retry_delay =
            parse_secs_env("DISPATCH_RETRY_DELAY_SECONDS", cfg.dispatch_retry_delay);
        if let Some(attempts) = parse_env("DISPATCH_MAX_ATTEMPTS") {
            cfg.dispatch_max_attempts = attempts;
        }
        if let Some(workers) = parse_env::<usize>("DISPATCH_WORKERS") {
            cfg.dispatch_workers = workers.max(1);
        }
        if let Some(depth) = parse_env::<usize>("DISPATCH_QUEUE_DEPTH") {
            cfg.dispatch_queue_depth = depth.max(1);
        }
        cfg.execution_timeout =
            parse_secs_env("EXECUTION_TIMEOUT_SECONDS", cfg.execution_timeout);
        cfg.timeout_sweep_interval = parse_secs_env(
            "TIMEOUT_SWEEP_INTERVAL_SECONDS",
            cfg.timeout_sweep_interval,
        );

        if let Some(retries) = parse_env("NOTIFY_MAX_RETRIES") {
            cfg.notify_max_retries = retries;
        }
        cfg.notify_retry_delay =
            parse_secs_env("NOTIFY_RETRY_DELAY_SECONDS", cfg.notify_retry_delay);
        if let Some(factor) = parse_env::<f64>("NOTIFY_BACKOFF_FACTOR") {
            cfg.notify_backoff_factor = factor;
        }
        if let Some(workers) = parse_env::<usize>("NOTIFY_WORKERS") {
            cfg.notify_workers = workers.max(1);
        }
        if let Some(depth) = parse_env::<usize>("NOTIFY_QUEUE_DEPTH") {
            cfg.notify_queue_depth = depth.max(1);
        }

        cfg.graceful_shutdown_timeout = parse_secs_env(
            "GRACEFUL_SHUTDOWN_TIMEOUT_SECONDS",
            cfg.graceful_shutdown_timeout,
        );
        cfg.ssrf_allow_private = parse_bool_env("SSRF_ALLOW_PRIVATE", cfg.ssrf_allow_private);
        cfg.redispatch_on_start =
            parse_bool_env("REDISPATCH_ON_START", cfg.redispatch_on_start);
        if let Some(days) = parse_env("CLEANUP_TASK_DAYS") {
            cfg.cleanup_task_days = days;
        }
        if let Some(limit) = parse_env("RATE_LIMIT_PER_MINUTE") {
            cfg.rate_limit_per_minute = limit;
        }
        if let Some(limit) = parse_env("ADMIN_RATE_LIMIT_PER_MINUTE") {
            cfg.admin_rate_limit_per_minute = limit;
        }

        cfg
    }

    /// Startup validation. Errors here are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.authorized_tokens.is_empty() {
            bail!("no authorized tokens configured (set AUTHORIZED_TOKENS__<name>)");
        }
        for (name, token) in &self.authorized_tokens {
            if token == DEFAULT_TOKEN_SENTINEL {
                bail!("authorized token '{}' still uses the placeholder value", name);
            }
            if token.trim().is_empty() {
                bail!("authorized token '{}' is empty", name);
            }
        }

        let wildcard_origin = self.cors_allow_origins.iter().any(|o| o == "*");
        if self.cors_allow_credentials && wildcard_origin {
            bail!("CORS_ALLOW_CREDENTIALS cannot be combined with a wildcard origin");
        }

        for (user, hash) in &self.admin_users {
            if !hash.starts_with("$2") {
                bail!("admin user '{}' has a non-bcrypt password hash", user);
            }
        }

        if self.notify_backoff_factor < 1.0 {
            bail!("NOTIFY_BACKOFF_FACTOR must be >= 1.0");
        }
        if self.rate_limit_per_minute == 0 || self.admin_rate_limit_per_minute == 0 {
            bail!("rate limits must be positive");
        }

        Ok(())
    }

    /// The completion callback URL handed to runners on dispatch.
    pub fn completion_callback(&self) -> String {
        format!("{}/task/completion", self.manager_url)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_secs_env(key: &str, default: Duration) -> Duration {
    parse_env::<u64>(key)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "t" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}
