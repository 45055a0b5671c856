//! OAuth client-registration cache.
//!
//! Registered OAuth clients carry their own secret expiry independent of any
//! credential, so they live in a separate map keyed by the tuple that makes
//! a registration reusable: issuer (or redirect URI), region, listen port.

use crate::core::SecretString;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// An OAuth client registration returned by the IdP.
#[derive(Debug, Clone)]
pub struct RegisteredClient {
    /// Issued client id.
    pub client_id: String,
    /// Issued client secret.
    pub client_secret: SecretString,
    /// When the secret stops being accepted.
    pub expires_at: DateTime<Utc>,
}

/// Key identifying a reusable registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationKey {
    /// Issuer URL or redirect URI, whichever discriminates the registration.
    pub issuer_or_redirect: String,
    /// Cloud region the registration was made in.
    pub region: String,
    /// Local listener port baked into the redirect URI.
    pub listen_port: u16,
}

/// Process-wide registration cache.
#[derive(Debug, Default)]
pub struct ClientRegistrationCache {
    entries: DashMap<RegistrationKey, RegisteredClient>,
}

impl ClientRegistrationCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// A still-valid registration for `key`, if one exists.
    pub fn get_valid(&self, key: &RegistrationKey) -> Option<RegisteredClient> {
        self.entries
            .get(key)
            .filter(|client| client.expires_at > Utc::now())
            .map(|client| client.clone())
    }

    /// Store a registration until its advertised secret expiry.
    pub fn put(&self, key: RegistrationKey, client: RegisteredClient) {
        self.entries.insert(key, client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn reg_key(port: u16) -> RegistrationKey {
        RegistrationKey {
            issuer_or_redirect: "https://idc.example.com".into(),
            region: "us-east-1".into(),
            listen_port: port,
        }
    }

    #[test]
    fn valid_registration_is_served() {
        let cache = ClientRegistrationCache::new();
        cache.put(
            reg_key(7890),
            RegisteredClient {
                client_id: "client-1".into(),
                client_secret: "s".into(),
                expires_at: Utc::now() + Duration::days(30),
            },
        );
        assert_eq!(
            cache.get_valid(&reg_key(7890)).unwrap().client_id,
            "client-1"
        );
    }

    #[test]
    fn expired_registration_is_not_served() {
        let cache = ClientRegistrationCache::new();
        cache.put(
            reg_key(7890),
            RegisteredClient {
                client_id: "client-1".into(),
                client_secret: "s".into(),
                expires_at: Utc::now() - Duration::seconds(1),
            },
        );
        assert!(cache.get_valid(&reg_key(7890)).is_none());
    }

    #[test]
    fn port_discriminates_registrations() {
        let cache = ClientRegistrationCache::new();
        cache.put(
            reg_key(7890),
            RegisteredClient {
                client_id: "client-a".into(),
                client_secret: "s".into(),
                expires_at: Utc::now() + Duration::days(1),
            },
        );
        assert!(cache.get_valid(&reg_key(9999)).is_none());
    }
}
