//! Outbound HTTP: URL validation and client construction.
//!
//! Identity providers are only ever reached over HTTPS; URLs failing the
//! scheme-and-character check are rejected before any request is sent.

use crate::config::{PluginConfig, keys};
use crate::core::{FederationError, Result};
use std::sync::LazyLock;
use std::time::Duration;

/// Characters permitted in an identity-provider URL.
static URL_ALLOWLIST: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z0-9\-._~:/?#\[\]@!$&'()*+,;=%]+$").expect("static regex")
});

/// Connect/read timeout applied to every outbound call.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Reject a URL unless it is HTTPS and contains only allowlisted characters.
///
/// Plain HTTP is accepted for loopback hosts only; the local callback
/// redirect never leaves the machine.
pub fn validate_idp_url(url: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(url).map_err(|e| FederationError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let loopback = matches!(parsed.host_str(), Some("127.0.0.1" | "localhost"));
    if parsed.scheme() != "https" && !(parsed.scheme() == "http" && loopback) {
        return Err(FederationError::InvalidUrl {
            url: url.to_string(),
            reason: format!("scheme '{}' is not https", parsed.scheme()),
        });
    }

    if !URL_ALLOWLIST.is_match(url) {
        return Err(FederationError::InvalidUrl {
            url: url.to_string(),
            reason: "contains disallowed characters".to_string(),
        });
    }

    Ok(parsed)
}

/// Build the shared HTTP client for a plugin configuration.
///
/// `ssl_insecure` disables certificate verification (test environments);
/// `http_verbose` switches reqwest's wire-level event logging, replacing the
/// original driver's log-silencing workaround with a plain flag.
pub fn build_client(config: &PluginConfig) -> Result<reqwest::Client> {
    let builder = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .danger_accept_invalid_certs(config.get_bool(keys::SSL_INSECURE, false))
        .connection_verbose(config.get_bool(keys::HTTP_VERBOSE, false))
        .cookie_store(true)
        .redirect(reqwest::redirect::Policy::limited(10));

    builder.build().map_err(FederationError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_url_is_accepted() {
        assert!(validate_idp_url("https://idp.example.com/sso?app=1").is_ok());
    }

    #[test]
    fn http_url_is_rejected() {
        let err = validate_idp_url("http://idp.example.com").unwrap_err();
        assert!(matches!(err, FederationError::InvalidUrl { .. }));
    }

    #[test]
    fn loopback_http_is_accepted() {
        assert!(validate_idp_url("http://127.0.0.1:7890/wharf/callback").is_ok());
        assert!(validate_idp_url("http://localhost:7890/").is_ok());
    }

    #[test]
    fn disallowed_characters_are_rejected() {
        let err = validate_idp_url("https://idp.example.com/<script>").unwrap_err();
        assert!(matches!(err, FederationError::InvalidUrl { .. }));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(validate_idp_url("not a url").is_err());
    }
}
