use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use runner_manager::auth::handlers::{require_admin, require_runner_version, require_token};
use runner_manager::client::service::RunnerClient;
use runner_manager::config::Config;
use runner_manager::notify::pipeline::NotifyPipeline;
use runner_manager::registry::handlers::{
    handle_list_runners, handle_register_runner, handle_runner_heartbeat,
    handle_unregister_runner,
};
use runner_manager::registry::service::RunnerRegistry;
use runner_manager::results::handlers::{handle_task_result, handle_task_result_file};
use runner_manager::store::persistence::TaskStore;
use runner_manager::tasks::handlers::{
    handle_execute_task, handle_list_tasks, handle_restart_selected, handle_task_completion,
    handle_task_status,
};
use runner_manager::tasks::manager::TaskManager;
use runner_manager::tasks::protocol::{
    ENDPOINT_RESTART_SELECTED, ENDPOINT_RUNNER_HEARTBEAT, ENDPOINT_RUNNER_LIST,
    ENDPOINT_RUNNER_REGISTER, ENDPOINT_RUNNER_UNREGISTER, ENDPOINT_TASK_COMPLETION,
    ENDPOINT_TASK_EXECUTE, ENDPOINT_TASK_LIST, ENDPOINT_TASK_RESULT, ENDPOINT_TASK_STATUS,
};
use runner_manager::MANAGER_VERSION;

type IpRateLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

struct RateLimiters {
    global: IpRateLimiter,
    admin: IpRateLimiter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env();
    cfg.validate()?;

    // Keep the appender guard alive for the process lifetime.
    let _log_guard = init_logging(&cfg);

    tracing::info!("Runner manager v{} starting", MANAGER_VERSION);

    let store = TaskStore::open(cfg.task_store_path.clone()).await?;
    let registry = RunnerRegistry::new(&cfg);
    let client = RunnerClient::new(&cfg);
    let notify = NotifyPipeline::new(store.clone(), &cfg);
    let manager = TaskManager::new(
        store.clone(),
        registry.clone(),
        client.clone(),
        notify.clone(),
        cfg.clone(),
    );

    registry.clone().start();
    notify.clone().start();
    manager.start();

    let cfg = Arc::new(cfg);
    let limiters = Arc::new(RateLimiters {
        global: RateLimiter::keyed(per_minute(cfg.rate_limit_per_minute)),
        admin: RateLimiter::keyed(per_minute(cfg.admin_rate_limit_per_minute)),
    });

    let app = build_router(
        cfg.clone(),
        limiters,
        manager.clone(),
        registry.clone(),
        client.clone(),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.manager_port));
    tracing::info!("HTTP server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    drain_workers(&cfg, &manager, &notify).await;
    tracing::info!("Runner manager stopped");
    Ok(())
}

fn init_logging(cfg: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level: tracing::Level = cfg.log_level.parse().unwrap_or(tracing::Level::INFO);

    match &cfg.log_directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "manager.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_max_level(level).init();
            None
        }
    }
}

fn per_minute(limit: u32) -> Quota {
    let limit = NonZeroU32::new(limit.max(1)).unwrap_or(NonZeroU32::MIN);
    Quota::per_minute(limit)
}

fn build_router(
    cfg: Arc<Config>,
    limiters: Arc<RateLimiters>,
    manager: Arc<TaskManager>,
    registry: Arc<RunnerRegistry>,
    client: Arc<RunnerClient>,
) -> Router {
    let token_routes = Router::new()
        .route(ENDPOINT_TASK_EXECUTE, post(handle_execute_task))
        .route(
            &format!("{}/:task_id", ENDPOINT_TASK_STATUS),
            get(handle_task_status),
        )
        .route(ENDPOINT_TASK_LIST, get(handle_list_tasks))
        .route(
            &format!("{}/:task_id", ENDPOINT_TASK_RESULT),
            get(handle_task_result),
        )
        .route(
            &format!("{}/:task_id/file/*file_path", ENDPOINT_TASK_RESULT),
            get(handle_task_result_file),
        )
        .route(ENDPOINT_TASK_COMPLETION, post(handle_task_completion))
        .route(ENDPOINT_RUNNER_UNREGISTER, post(handle_unregister_runner))
        .route(ENDPOINT_RUNNER_LIST, get(handle_list_runners))
        .layer(from_fn_with_state(cfg.clone(), require_token));

    // Registration and heartbeats additionally pass the version gate.
    let runner_routes = Router::new()
        .route(ENDPOINT_RUNNER_REGISTER, post(handle_register_runner))
        .route(ENDPOINT_RUNNER_HEARTBEAT, post(handle_runner_heartbeat))
        .layer(from_fn(require_runner_version))
        .layer(from_fn_with_state(cfg.clone(), require_token));

    // Rate limiting sits outside basic auth so credential floods are shed
    // before bcrypt runs.
    let admin_routes = Router::new()
        .route(ENDPOINT_RESTART_SELECTED, post(handle_restart_selected))
        .layer(from_fn_with_state(cfg.clone(), require_admin))
        .layer(from_fn_with_state(limiters.clone(), admin_rate_limit));

    Router::new()
        .route("/", get(handle_root))
        .merge(token_routes)
        .merge(runner_routes)
        .merge(admin_routes)
        .layer(from_fn_with_state(limiters, global_rate_limit))
        .layer(build_cors(&cfg))
        .layer(Extension(manager))
        .layer(Extension(registry))
        .layer(Extension(client))
        .layer(Extension(cfg))
}

fn build_cors(cfg: &Config) -> CorsLayer {
    let mut layer = CorsLayer::new();

    if cfg.cors_allow_origins.iter().any(|o| o == "*") {
        layer = layer.allow_origin(Any);
    } else {
        let origins: Vec<HeaderValue> = cfg
            .cors_allow_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        layer = layer.allow_origin(AllowOrigin::list(origins));
    }

    if cfg.cors_allow_methods.iter().any(|m| m == "*") {
        layer = layer.allow_methods(Any);
    } else {
        let methods: Vec<Method> = cfg
            .cors_allow_methods
            .iter()
            .filter_map(|method| method.parse().ok())
            .collect();
        layer = layer.allow_methods(methods);
    }

    if cfg.cors_allow_headers.iter().any(|h| h == "*") {
        layer = layer.allow_headers(Any);
    } else {
        let headers: Vec<axum::http::HeaderName> = cfg
            .cors_allow_headers
            .iter()
            .filter_map(|header| header.parse().ok())
            .collect();
        layer = layer.allow_headers(headers);
    }

    if cfg.cors_allow_credentials {
        layer = layer.allow_credentials(true);
    }

    layer
}

async fn global_rate_limit(
    State(limiters): State<Arc<RateLimiters>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if limiters.global.check_key(&addr.ip()).is_err() {
        return rate_limited();
    }
    next.run(req).await
}

async fn admin_rate_limit(
    State(limiters): State<Arc<RateLimiters>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if limiters.admin.check_key(&addr.ip()).is_err() {
        tracing::warn!("Admin rate limit exceeded for {}", addr.ip());
        return rate_limited();
    }
    next.run(req).await
}

fn rate_limited() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({ "detail": "Rate limit exceeded. Please try again later." })),
    )
        .into_response()
}

#[derive(Serialize)]
struct RootResponse {
    message: &'static str,
    version: &'static str,
    documentation: &'static str,
}

async fn handle_root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Runner manager is up",
        version: MANAGER_VERSION,
        documentation: "/docs",
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

/// Gives in-flight dispatch and notify work a bounded window to finish.
async fn drain_workers(cfg: &Config, manager: &Arc<TaskManager>, notify: &Arc<NotifyPipeline>) {
    let drained = tokio::time::timeout(cfg.graceful_shutdown_timeout, async {
        while !(manager.dispatch_queue_idle() && notify.idle()) {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await;

    if drained.is_err() {
        tracing::warn!(
            "Workers still busy after {:?}; terminating anyway",
            cfg.graceful_shutdown_timeout
        );
    }
}
