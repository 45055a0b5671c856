//! Shared credential cache.
//!
//! One cache instance is constructed per driver process and passed by
//! reference into each plugin, so unrelated plugin instances with identical
//! configuration still deduplicate upstream federation calls. Entries are
//! replaced wholesale on refresh; holders are never mutated in place.

use crate::core::{CacheKey, CredentialsHolder};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

/// Default expiration grace protecting against clock skew and network
/// latency between "checked" and "used".
const DEFAULT_GRACE: Duration = Duration::minutes(5);

/// Process-wide map from cache key to the latest credential holder.
#[derive(Debug)]
pub struct CredentialCache {
    entries: DashMap<CacheKey, CredentialsHolder>,
    grace: Duration,
}

impl Default for CredentialCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialCache {
    /// Cache with the default five-minute expiration grace.
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_GRACE)
    }

    /// Cache with an explicit grace period (tests shrink this).
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            grace,
        }
    }

    /// Latest holder for `key`, expired or not.
    pub fn get(&self, key: &CacheKey) -> Option<CredentialsHolder> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Store a freshly obtained holder, replacing any prior entry.
    pub fn put(&self, key: CacheKey, holder: CredentialsHolder) {
        self.entries.insert(key, holder);
    }

    /// Whether `holder` is past `expires_at - grace` at instant `now`.
    pub fn is_expired(&self, holder: &CredentialsHolder, now: DateTime<Utc>) -> bool {
        now > holder.expires_at - self.grace
    }

    /// A non-expired holder for `key`, if one exists.
    pub fn get_valid(&self, key: &CacheKey) -> Option<CredentialsHolder> {
        self.get(key)
            .filter(|holder| !self.is_expired(holder, Utc::now()))
    }

    /// Number of cached entries (diagnostics and tests).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Credential;

    fn holder(expires_at: DateTime<Utc>) -> CredentialsHolder {
        CredentialsHolder::new(
            Credential::Session {
                access_key_id: "AKID".into(),
                secret_access_key: "secret".into(),
                session_token: "token".into(),
            },
            expires_at,
        )
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::builder("test").part(name).build()
    }

    #[test]
    fn put_then_get_returns_holder_until_grace_window() {
        let cache = CredentialCache::with_grace(Duration::minutes(5));
        let k = key("a");

        let fresh = holder(Utc::now() + Duration::hours(1));
        cache.put(k.clone(), fresh.clone());

        let got = cache.get(&k).expect("entry present");
        assert_eq!(got.expires_at, fresh.expires_at);
        assert!(!cache.is_expired(&got, Utc::now()));
        assert!(cache.get_valid(&k).is_some());
    }

    #[test]
    fn expired_within_grace_window() {
        let cache = CredentialCache::with_grace(Duration::minutes(5));
        // Expires in 2 minutes: inside the 5-minute grace, so already stale.
        let h = holder(Utc::now() + Duration::minutes(2));
        assert!(cache.is_expired(&h, Utc::now()));

        let k = key("b");
        cache.put(k.clone(), h);
        assert!(cache.get(&k).is_some());
        assert!(cache.get_valid(&k).is_none());
    }

    #[test]
    fn put_replaces_prior_entry() {
        let cache = CredentialCache::new();
        let k = key("c");
        let first = holder(Utc::now() + Duration::hours(1));
        let second = holder(Utc::now() + Duration::hours(2));

        cache.put(k.clone(), first);
        cache.put(k.clone(), second.clone());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&k).unwrap().expires_at, second.expires_at);
    }
}
