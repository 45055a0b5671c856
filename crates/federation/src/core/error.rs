//! Error taxonomy shared by every federation flow.
//!
//! All lower-level failures (I/O, parse, non-success HTTP status) are
//! normalized into [`FederationError`] at the flow boundary so the
//! connection layer never needs to know which concrete flow produced them.
//! Nothing retries automatically except the token-polling loop's
//! "authorization pending" case; every other failure is fail-fast and no
//! credential is ever cached on a failed or partial attempt.

use thiserror::Error;

/// Result alias for federation operations.
pub type Result<T> = std::result::Result<T, FederationError>;

/// Top-level error for credential federation.
#[derive(Debug, Error)]
pub enum FederationError {
    /// A required plugin parameter was never supplied.
    #[error("missing required connection parameter '{0}'")]
    MissingParameter(&'static str),

    /// URL rejected before any request was sent (non-HTTPS or disallowed
    /// characters).
    #[error("invalid identity provider URL '{url}': {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Malformed XML, HTML or JSON from an identity provider.
    #[error("failed to parse provider response: {0}")]
    ProtocolParse(String),

    /// The callback carried a `state` that does not match the one generated
    /// for this attempt.
    #[error("callback state mismatch, possible CSRF attack")]
    CsrfMismatch,

    /// A deadline elapsed (callback wait, token polling, HTTP timeout).
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The provider denied the request outright.
    #[error("access denied by identity provider: {0}")]
    AccessDenied(String),

    /// The provider asked us to back off; treated as fatal.
    #[error("rate limited by identity provider: {0}")]
    RateLimited(String),

    /// Non-success HTTP status from an upstream endpoint.
    #[error("upstream returned HTTP {status}: {body}")]
    Upstream {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated and sanitized for logging.
        body: String,
    },

    /// Transport-level HTTP failure.
    #[error("http transport error")]
    Http(#[from] reqwest::Error),

    /// Listener or local I/O failure.
    #[error("local listener error")]
    Io(#[from] std::io::Error),

    /// Anything that does not fit the taxonomy above.
    #[error("unexpected federation failure: {0}")]
    Unexpected(String),
}

/// Maximum error-response body length carried in errors and logs.
const MAX_ERROR_BODY_LEN: usize = 500;

impl FederationError {
    /// Build an [`FederationError::Upstream`] from a status and raw body,
    /// truncating and redacting token-bearing fields first.
    pub fn upstream(status: u16, body: &str) -> Self {
        Self::Upstream {
            status,
            body: sanitize_body(body),
        }
    }
}

/// Truncate a response body and redact fields that may carry secrets before
/// it ends up in an error message or a log line.
pub(crate) fn sanitize_body(body: &str) -> String {
    let truncated = if body.len() > MAX_ERROR_BODY_LEN {
        let mut end = MAX_ERROR_BODY_LEN;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... [truncated, {} total bytes]", &body[..end], body.len())
    } else {
        body.to_string()
    };

    if let Ok(mut json) = serde_json::from_str::<serde_json::Value>(&truncated) {
        for field in ["accessToken", "access_token", "clientSecret", "secretAccessKey", "sessionToken", "password"] {
            if json.get(field).is_some() {
                json[field] = serde_json::json!("[REDACTED]");
            }
        }
        json.to_string()
    } else {
        truncated
    }
}
