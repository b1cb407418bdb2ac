//! Authentication middleware for the manager API.
//!
//! Three gates, applied as axum layers:
//! - API token: `X-API-Token` header first, `Authorization: Bearer` as a
//!   fallback, compared in constant time against the configured token set.
//! - Admin basic auth: `Authorization: Basic` verified against bcrypt hashes.
//! - Runner version: `X-Runner-Version` must match the manager MAJOR.MINOR.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::service::{basic_credentials, check_runner_version, extract_token, mask_token, token_is_authorized};
use super::types::{AuthToken, RunnerVersion};
use crate::config::Config;
use crate::MANAGER_VERSION;

fn unauthorized(detail: &str, scheme: &'static str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, scheme)],
        Json(json!({ "detail": detail })),
    )
        .into_response()
}

fn bad_request(detail: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "detail": detail }))).into_response()
}

/// Middleware: require a valid API token on the request.
pub async fn require_token(
    State(cfg): State<Arc<Config>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(token) = extract_token(req.headers()) else {
        return unauthorized("Missing authentication token", "Bearer");
    };

    if !token_is_authorized(&cfg, &token) {
        tracing::info!("Unauthorized token attempt: {}", mask_token(&token));
        return unauthorized("Invalid or expired token", "Bearer");
    }

    req.extensions_mut().insert(AuthToken(token));
    next.run(req).await
}

/// Middleware: require a compatible `X-Runner-Version` header. Layered on
/// the runner registration and heartbeat routes.
pub async fn require_runner_version(mut req: Request, next: Next) -> Response {
    let Some(version) = req
        .headers()
        .get("x-runner-version")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    else {
        return bad_request(
            "Missing X-Runner-Version header. Runner must send its version.".to_string(),
        );
    };

    if let Err(detail) = check_runner_version(&version, MANAGER_VERSION) {
        tracing::warn!("Rejected runner version {}: {}", version, detail);
        return bad_request(detail);
    }

    req.extensions_mut().insert(RunnerVersion(version));
    next.run(req).await
}

/// Middleware: require HTTP Basic credentials matching a configured admin
/// user's bcrypt hash.
pub async fn require_admin(
    State(cfg): State<Arc<Config>>,
    req: Request,
    next: Next,
) -> Response {
    let Some((user, password)) = basic_credentials(req.headers()) else {
        return unauthorized("Admin credentials required", "Basic");
    };

    let Some(stored_hash) = cfg.admin_users.get(&user) else {
        tracing::info!("Invalid admin credentials for unknown user");
        return unauthorized("Invalid credentials", "Basic");
    };

    if !bcrypt::verify(&password, stored_hash).unwrap_or(false) {
        tracing::info!("Invalid admin credentials for user {}", user);
        return unauthorized("Invalid credentials", "Basic");
    }

    next.run(req).await
}
