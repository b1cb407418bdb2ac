//! Authentication Tests
//!
//! ## Test Scopes
//! - **Token Extraction**: header precedence between `X-API-Token` and
//!   `Authorization: Bearer`.
//! - **Authorization**: constant-time membership against the configured set.
//! - **Masking**: tokens never appear whole in log-bound strings.
//! - **Version Gate**: MAJOR.MINOR equality with free PATCH drift.
//! - **Basic Credentials**: admin header decoding rules.

use axum::http::{header, HeaderMap, HeaderValue};
use base64::Engine;

use crate::auth::service::{
    basic_credentials, check_runner_version, extract_token, mask_token, parse_major_minor,
    token_is_authorized,
};
use crate::config::Config;

fn config_with_tokens(tokens: &[&str]) -> Config {
    let mut cfg = Config::default();
    for (i, token) in tokens.iter().enumerate() {
        cfg.authorized_tokens
            .insert(format!("token{}", i), token.to_string());
    }
    cfg
}

// ============================================================
// Token extraction
// ============================================================

#[test]
fn test_extract_token_prefers_api_header() {
    let mut headers = HeaderMap::new();
    headers.insert("x-api-token", HeaderValue::from_static("from-header"));
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_static("Bearer from-bearer"),
    );

    assert_eq!(extract_token(&headers).as_deref(), Some("from-header"));
}

#[test]
fn test_extract_token_falls_back_to_bearer() {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_static("Bearer from-bearer"),
    );

    assert_eq!(extract_token(&headers).as_deref(), Some("from-bearer"));
    assert_eq!(extract_token(&HeaderMap::new()), None);
}

// ============================================================
// Authorization
// ============================================================

#[test]
fn test_token_authorization() {
    let cfg = config_with_tokens(&["alpha-token", "beta-token"]);

    assert!(token_is_authorized(&cfg, "alpha-token"));
    assert!(token_is_authorized(&cfg, "beta-token"));
    assert!(!token_is_authorized(&cfg, "gamma-token"));
    assert!(!token_is_authorized(&cfg, ""));
}

#[test]
fn test_mask_token_never_reveals_short_tokens() {
    assert_eq!(mask_token(""), "<empty>");
    assert_eq!(mask_token("abcd1234"), "***");
    assert_eq!(mask_token("abcd-secret-wxyz"), "abcd...wxyz");
}

// ============================================================
// Version gate
// ============================================================

#[test]
fn test_parse_major_minor_variants() {
    assert_eq!(parse_major_minor("1.2.3"), Some((1, 2)));
    assert_eq!(parse_major_minor("v1.2.3"), Some((1, 2)));
    assert_eq!(parse_major_minor("1.2"), Some((1, 2)));
    assert_eq!(parse_major_minor("1.2.3-rc1"), Some((1, 2)));
    assert_eq!(parse_major_minor("garbage"), None);
    assert_eq!(parse_major_minor(""), None);
}

#[test]
fn test_version_gate_allows_patch_drift() {
    assert!(check_runner_version("1.2.0", "1.2.9").is_ok());
    assert!(check_runner_version("1.2.5", "1.2.0").is_ok());
}

#[test]
fn test_version_gate_rejects_minor_and_major_drift() {
    let err = check_runner_version("1.3.0", "1.2.0").unwrap_err();
    assert!(err.contains("expected 1.2.x"));
    assert!(check_runner_version("2.2.0", "1.2.0").is_err());
}

// ============================================================
// Basic credentials
// ============================================================

#[test]
fn test_basic_credentials_parsing() {
    let mut headers = HeaderMap::new();
    let encoded = base64::engine::general_purpose::STANDARD.encode("Ops:hunter2:extra");
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Basic {}", encoded)).unwrap(),
    );

    let (user, password) = basic_credentials(&headers).unwrap();
    assert_eq!(user, "ops");
    assert_eq!(password, "hunter2:extra");
}
