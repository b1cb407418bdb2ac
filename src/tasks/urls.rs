//! SSRF screening for client-supplied URLs.
//!
//! `source_url` and `notify_url` both end up as outbound requests (from the
//! runner and the manager respectively), so a hostile submission could
//! otherwise probe internal networks. Rules: http/https only, host required,
//! no userinfo, and neither the literal address nor anything the hostname
//! resolves to may be private, loopback, link-local, multicast or
//! unspecified. `ssrf_allow_private` relaxes the address checks for test
//! deployments where everything runs on loopback.

use std::net::IpAddr;

pub fn ip_is_disallowed(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                // fc00::/7 unique-local, fe80::/10 link-local
                || (segments[0] & 0xfe00) == 0xfc00
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Syntactic screen: scheme, host, userinfo. Returns the parsed URL.
fn screen_syntax(field: &str, raw: &str) -> Result<reqwest::Url, String> {
    let parsed =
        reqwest::Url::parse(raw).map_err(|_| format!("{} is not a valid URL", field))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(format!("{} must use http or https", field));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(format!("{} must not include userinfo", field));
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(format!("{} is missing a host", field));
    }

    Ok(parsed)
}

/// Full validation of a submitted URL, including address resolution.
pub async fn validate_submitted_url(
    field: &str,
    raw: &str,
    allow_private: bool,
) -> Result<(), String> {
    let parsed = screen_syntax(field, raw)?;

    if allow_private {
        return Ok(());
    }

    let host = parsed.host_str().unwrap_or_default().trim_end_matches('.');
    if host.eq_ignore_ascii_case("localhost") {
        return Err(format!("{} host not allowed", field));
    }

    // Literal address: check directly without touching the resolver.
    if let Ok(ip) = host.parse::<IpAddr>() {
        if ip_is_disallowed(ip) {
            return Err(format!(
                "{} must not point to a private or reserved address",
                field
            ));
        }
        return Ok(());
    }
    // Bracketed IPv6 literal.
    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        if let Ok(ip) = inner.parse::<IpAddr>() {
            if ip_is_disallowed(ip) {
                return Err(format!(
                    "{} must not point to a private or reserved address",
                    field
                ));
            }
            return Ok(());
        }
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let resolved = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| format!("{} host cannot be resolved", field))?;

    let mut any = false;
    for addr in resolved {
        any = true;
        if ip_is_disallowed(addr.ip()) {
            return Err(format!(
                "{} resolves to a private/loopback/link-local address",
                field
            ));
        }
    }
    if !any {
        return Err(format!("{} host cannot be resolved", field));
    }

    Ok(())
}
