//! Credential and token holder value types.
//!
//! Holders are immutable after construction. A flow builds a fresh holder on
//! every successful refresh and the cache replaces, never mutates, the prior
//! entry.

use crate::core::SecretString;
use chrono::{DateTime, Utc};

/// A credential usable to open a warehouse connection.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Temporary cloud session: access key, secret, session token.
    Session {
        /// Access key id.
        access_key_id: String,
        /// Secret access key.
        secret_access_key: SecretString,
        /// Session token bound to the key pair.
        session_token: SecretString,
    },
    /// Ephemeral database user/password pair issued by the warehouse.
    Database {
        /// Database user name.
        user: String,
        /// One-time database password.
        password: SecretString,
    },
}

/// Database user/group settings asserted by the identity provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IamMetadata {
    /// Effective database user, if asserted.
    pub db_user: Option<String>,
    /// Database groups to join on login.
    pub db_groups: Vec<String>,
    /// Create the database user if it does not exist.
    pub auto_create: bool,
    /// Lowercase the asserted user and groups.
    pub force_lowercase: bool,
    /// Whether a connection-supplied user may override the asserted one.
    pub allow_db_user_override: bool,
}

/// An immutable credential plus its expiration and optional metadata.
#[derive(Debug, Clone)]
pub struct CredentialsHolder {
    /// The credential itself.
    pub credential: Credential,
    /// Hard expiration as reported by the issuing endpoint.
    pub expires_at: DateTime<Utc>,
    /// IdP-asserted database user/group settings, if any.
    pub metadata: Option<IamMetadata>,
}

impl CredentialsHolder {
    /// Wrap a credential with its expiration.
    pub fn new(credential: Credential, expires_at: DateTime<Utc>) -> Self {
        Self {
            credential,
            expires_at,
            metadata: None,
        }
    }

    /// Attach IdP-asserted metadata.
    pub fn with_metadata(mut self, metadata: IamMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// An opaque bearer token plus expiration.
///
/// `from_cache` records whether the holder was freshly obtained from the
/// provider or served from the shared cache.
#[derive(Debug, Clone)]
pub struct TokenHolder {
    /// The bearer token.
    pub token: SecretString,
    /// Token expiration.
    pub expires_at: DateTime<Utc>,
    /// True when served from the cache rather than freshly obtained.
    pub from_cache: bool,
}

impl TokenHolder {
    /// Wrap a freshly obtained token.
    pub fn fresh(token: impl Into<SecretString>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
            from_cache: false,
        }
    }

    /// Mark this holder as served from the cache.
    pub fn cached(mut self) -> Self {
        self.from_cache = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn holder_carries_metadata() {
        let holder = CredentialsHolder::new(
            Credential::Database {
                user: "alice".into(),
                password: "pw".into(),
            },
            Utc::now() + Duration::seconds(900),
        )
        .with_metadata(IamMetadata {
            db_user: Some("alice".into()),
            ..IamMetadata::default()
        });

        assert_eq!(
            holder.metadata.as_ref().and_then(|m| m.db_user.as_deref()),
            Some("alice")
        );
    }

    #[test]
    fn debug_never_prints_secrets() {
        let holder = CredentialsHolder::new(
            Credential::Session {
                access_key_id: "AKID".into(),
                secret_access_key: "sekrit".into(),
                session_token: "token".into(),
            },
            Utc::now(),
        );
        let debug = format!("{holder:?}");
        assert!(!debug.contains("sekrit"));
        assert!(debug.contains("AKID"));
    }

    #[test]
    fn token_holder_cache_flag() {
        let fresh = TokenHolder::fresh("t", Utc::now());
        assert!(!fresh.from_cache);
        assert!(fresh.cached().from_cache);
    }
}
