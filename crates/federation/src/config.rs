//! Plugin configuration supplied by the connection layer.
//!
//! The driver's URL/property parser feeds key/value pairs through
//! [`PluginConfig::set`]; flows read them back through typed accessors.
//! Keys are case-insensitive.

use crate::core::{FederationError, Result};
use std::collections::HashMap;
use std::time::Duration;

/// Well-known parameter names.
pub mod keys {
    /// Plugin selector (`saml`, `browser-idc`, `device-idc`, `web-identity`, `role-chain`).
    pub const PLUGIN: &str = "plugin";
    /// Identity provider host.
    pub const IDP_HOST: &str = "idp_host";
    /// Identity provider port.
    pub const IDP_PORT: &str = "idp_port";
    /// IdP login user.
    pub const USER: &str = "user";
    /// IdP login password.
    pub const PASSWORD: &str = "password";
    /// Role ARN to prefer among the asserted roles.
    pub const PREFERRED_ROLE: &str = "preferred_role";
    /// Requested credential duration in seconds.
    pub const DURATION: &str = "duration";
    /// Accept invalid TLS certificates (test environments only).
    pub const SSL_INSECURE: &str = "ssl_insecure";
    /// Connection-supplied database user.
    pub const DB_USER: &str = "db_user";
    /// Connection-supplied database groups (comma separated).
    pub const DB_GROUPS: &str = "db_groups";
    /// Regex dropping matching groups from the asserted list.
    pub const DB_GROUPS_FILTER: &str = "db_groups_filter";
    /// Lowercase the effective user and groups.
    pub const FORCE_LOWERCASE: &str = "force_lowercase";
    /// Create the database user if absent.
    pub const AUTO_CREATE: &str = "auto_create";
    /// Cloud region.
    pub const REGION: &str = "region";
    /// Security-token endpoint override.
    pub const STS_ENDPOINT: &str = "sts_endpoint";
    /// Role ARN (single) or comma-separated chain.
    pub const ROLE_ARN: &str = "role_arn";
    /// Externally supplied web-identity token.
    pub const WEB_IDENTITY_TOKEN: &str = "web_identity_token";
    /// Session name for role assumption.
    pub const ROLE_SESSION_NAME: &str = "role_session_name";
    /// OIDC issuer URL.
    pub const ISSUER_URL: &str = "issuer_url";
    /// Identity Center start URL.
    pub const START_URL: &str = "start_url";
    /// Identity Center host override.
    pub const IDC_HOST: &str = "idc_host";
    /// Identity Center region.
    pub const IDC_REGION: &str = "idc_region";
    /// Local callback listener port (0 = ephemeral).
    pub const LISTEN_PORT: &str = "listen_port";
    /// Seconds to wait for the IdP response / callback.
    pub const IDP_RESPONSE_TIMEOUT: &str = "idp_response_timeout";
    /// Display name used when registering an OAuth client.
    pub const CLIENT_DISPLAY_NAME: &str = "client_display_name";
    /// Statically supplied SAML assertion (base64).
    pub const SAML_ASSERTION: &str = "saml_assertion";
    /// Full IdP SSO login URL for browser-redirect SAML.
    pub const LOGIN_URL: &str = "login_url";
    /// IdP application id for form-automation SSO pages.
    pub const APP_ID: &str = "app_id";
    /// Account id for role-credential lookup.
    pub const ACCOUNT_ID: &str = "account_id";
    /// Role name for role-credential lookup.
    pub const ROLE_NAME: &str = "role_name";
    /// Target database for ephemeral credential issuance.
    pub const DATABASE: &str = "database";
    /// Warehouse cluster identifier.
    pub const CLUSTER_ID: &str = "cluster_id";
    /// Warehouse credential-issuance endpoint override.
    pub const WAREHOUSE_ENDPOINT: &str = "warehouse_endpoint";
    /// Static access key id seeding a role chain.
    pub const ACCESS_KEY_ID: &str = "access_key_id";
    /// Static secret access key seeding a role chain.
    pub const SECRET_ACCESS_KEY: &str = "secret_access_key";
    /// Static session token seeding a role chain.
    pub const SESSION_TOKEN: &str = "session_token";
    /// Bypass the shared credential cache.
    pub const DISABLE_CACHE: &str = "disable_cache";
    /// Enable verbose wire logging on the HTTP client.
    pub const HTTP_VERBOSE: &str = "http_verbose";
}

/// Default time to wait for a browser callback or device authorization.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);

/// Case-insensitive key/value parameter bag.
#[derive(Debug, Clone, Default)]
pub struct PluginConfig {
    params: HashMap<String, String>,
}

impl PluginConfig {
    /// Empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a parameter from the connection layer.
    pub fn set(&mut self, key: &str, value: &str) {
        self.params.insert(key.to_ascii_lowercase(), value.to_string());
    }

    /// Look up a parameter.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Look up a parameter, treating an empty value as absent.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    /// Look up a mandatory parameter.
    pub fn required(&self, key: &'static str) -> Result<&str> {
        self.get_non_empty(key)
            .ok_or(FederationError::MissingParameter(key))
    }

    /// Boolean parameter; absent or unparsable values fall back to `default`.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .map_or(default, |v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
    }

    /// Integer parameter.
    pub fn get_u32(&self, key: &'static str) -> Result<Option<u32>> {
        match self.get_non_empty(key) {
            None => Ok(None),
            Some(v) => v.parse::<u32>().map(Some).map_err(|e| {
                FederationError::Unexpected(format!("parameter '{key}' is not a number: {e}"))
            }),
        }
    }

    /// Requested credential duration in seconds, if configured.
    pub fn duration_seconds(&self) -> Result<Option<u32>> {
        self.get_u32(keys::DURATION)
    }

    /// Local listener port; 0 (ephemeral) when unconfigured.
    pub fn listen_port(&self) -> Result<u16> {
        match self.get_non_empty(keys::LISTEN_PORT) {
            None => Ok(0),
            Some(v) => v.parse::<u16>().map_err(|e| {
                FederationError::Unexpected(format!("parameter 'listen_port' is not a port: {e}"))
            }),
        }
    }

    /// Overall deadline for browser callbacks and token polling.
    pub fn response_timeout(&self) -> Result<Duration> {
        Ok(self
            .get_u32(keys::IDP_RESPONSE_TIMEOUT)?
            .map_or(DEFAULT_RESPONSE_TIMEOUT, |s| Duration::from_secs(u64::from(s))))
    }
}
