//! Credential checks shared by the auth middleware.
//!
//! Token comparisons run in constant time against every configured entry so
//! timing reveals neither membership nor which entry matched. Tokens never
//! reach the logs raw; [`mask_token`] renders `abcd...wxyz`.

use axum::http::{header, HeaderMap};
use base64::Engine;
use subtle::ConstantTimeEq;

use crate::config::Config;

/// Renders a token safe for logs: first/last four characters only.
pub fn mask_token(token: &str) -> String {
    if token.is_empty() {
        return "<empty>".to_string();
    }
    if token.len() <= 8 {
        return "***".to_string();
    }
    format!("{}...{}", &token[..4], &token[token.len() - 4..])
}

/// Constant-time membership test against the configured token set.
pub fn token_is_authorized(cfg: &Config, presented: &str) -> bool {
    let mut authorized = false;
    for value in cfg.authorized_tokens.values() {
        if bool::from(value.as_bytes().ct_eq(presented.as_bytes())) {
            authorized = true;
        }
    }
    authorized
}

/// Constant-time comparison of two tokens.
pub fn tokens_match(a: &str, b: &str) -> bool {
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Pulls the API token out of the headers: `X-API-Token` wins over
/// `Authorization: Bearer`.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-token") {
        if let Ok(token) = value.to_str() {
            if !token.trim().is_empty() {
                return Some(token.trim().to_string());
            }
        }
    }

    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Splits a semver-ish string into (major, minor). Accepts `1.2`, `1.2.3`,
/// `v1.2.3` and suffixed patch components like `1.2.3-rc1`.
pub fn parse_major_minor(version: &str) -> Option<(u64, u64)> {
    let candidate = version.trim().trim_start_matches('v');
    let mut parts = candidate.split('.');
    let major = parts.next()?.parse().ok()?;
    // Only the digit prefix of the minor matters; suffixes like `-rc1`
    // belong to the patch level and are ignored by the gate.
    let minor_digits: String = parts
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let minor = minor_digits.parse().ok()?;
    Some((major, minor))
}

/// Checks a runner version against the manager's MAJOR.MINOR. PATCH is free.
pub fn check_runner_version(runner_version: &str, manager_version: &str) -> Result<(), String> {
    let Some((runner_major, runner_minor)) = parse_major_minor(runner_version) else {
        return Err(format!(
            "Invalid X-Runner-Version format: {:?}. Expected MAJOR.MINOR.PATCH.",
            runner_version
        ));
    };
    let Some((manager_major, manager_minor)) = parse_major_minor(manager_version) else {
        return Err("Manager version is invalid; cannot verify runner compatibility.".to_string());
    };

    if (runner_major, runner_minor) != (manager_major, manager_minor) {
        return Err(format!(
            "Version mismatch: runner {} does not match manager {} (expected {}.{}.x)",
            runner_version, manager_version, manager_major, manager_minor
        ));
    }
    Ok(())
}

/// Decodes `Authorization: Basic` credentials. Usernames are normalised to
/// lowercase; passwords may themselves contain colons.
pub(crate) fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = auth.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_lowercase(), password.to_string()))
}
