//! Request and response types for the security-token operations.

use crate::core::{Credential, SecretString};
use chrono::{DateTime, Utc};

/// Temporary session credentials returned by a role-assumption call.
#[derive(Debug, Clone)]
pub struct StsCredentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: SecretString,
    /// Session token.
    pub session_token: SecretString,
    /// Hard expiration of the session.
    pub expiration: DateTime<Utc>,
}

impl StsCredentials {
    /// View as a [`Credential`] for a holder.
    pub fn into_credential(self) -> Credential {
        Credential::Session {
            access_key_id: self.access_key_id,
            secret_access_key: self.secret_access_key,
            session_token: self.session_token,
        }
    }

    /// Signing identity for a follow-up signed call.
    pub fn signing(&self) -> crate::sts::SigningCredentials {
        crate::sts::SigningCredentials {
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            session_token: Some(self.session_token.clone()),
        }
    }
}

/// `AssumeRoleWithSAML` parameters.
#[derive(Debug, Clone)]
pub struct AssumeRoleWithSamlRequest {
    /// Role to assume.
    pub role_arn: String,
    /// SAML provider principal.
    pub principal_arn: String,
    /// Base64-encoded SAML assertion.
    pub saml_assertion: String,
    /// Requested session duration.
    pub duration_seconds: Option<u32>,
}

/// `AssumeRoleWithWebIdentity` parameters.
#[derive(Debug, Clone)]
pub struct AssumeRoleWithWebIdentityRequest {
    /// Role to assume.
    pub role_arn: String,
    /// Session name recorded against the assumed role.
    pub role_session_name: String,
    /// OIDC/JWT token proving the web identity.
    pub web_identity_token: SecretString,
    /// Requested session duration.
    pub duration_seconds: Option<u32>,
}

/// `AssumeRole` parameters (signed with the caller's credentials).
#[derive(Debug, Clone)]
pub struct AssumeRoleRequest {
    /// Role to assume.
    pub role_arn: String,
    /// Session name recorded against the assumed role.
    pub role_session_name: String,
    /// Requested session duration.
    pub duration_seconds: Option<u32>,
}

/// Ephemeral database credential request against the warehouse endpoint.
#[derive(Debug, Clone)]
pub struct GetDatabaseCredentialsRequest {
    /// Warehouse cluster identifier.
    pub cluster_id: String,
    /// Database user to issue credentials for.
    pub db_user: String,
    /// Target database, if scoped.
    pub database: Option<String>,
    /// Create the user if absent.
    pub auto_create: bool,
    /// Groups joined on login.
    pub db_groups: Vec<String>,
    /// Requested credential duration.
    pub duration_seconds: Option<u32>,
}

/// Ephemeral database user/password pair.
#[derive(Debug, Clone)]
pub struct DatabaseCredentials {
    /// Issued database user (may differ from the requested one by prefix).
    pub db_user: String,
    /// One-time password.
    pub db_password: SecretString,
    /// Password expiration.
    pub expiration: DateTime<Utc>,
}

impl DatabaseCredentials {
    /// View as a [`Credential`] for a holder.
    pub fn into_credential(self) -> Credential {
        Credential::Database {
            user: self.db_user,
            password: self.db_password,
        }
    }
}
