//! Deterministic cache keys.
//!
//! Identical plugin configuration must always produce an identical key:
//! this is the only mechanism by which independent connections deduplicate
//! federation calls against a rate-limited identity provider.

use std::fmt;

/// Composite cache key derived from plugin configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Start building a key for the given plugin discriminator.
    pub fn builder(plugin: &str) -> CacheKeyBuilder {
        CacheKeyBuilder {
            parts: vec![plugin.to_string()],
        }
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builder assembling key parts in a fixed order.
///
/// Absent parts are encoded as an empty segment so that `(a, None, c)` and
/// `(a, Some(""), c)` collide intentionally while `(a, c)` cannot.
#[derive(Debug)]
pub struct CacheKeyBuilder {
    parts: Vec<String>,
}

impl CacheKeyBuilder {
    /// Append a mandatory part.
    pub fn part(mut self, value: &str) -> Self {
        self.parts.push(value.to_string());
        self
    }

    /// Append an optional part (empty segment when absent).
    pub fn opt(mut self, value: Option<&str>) -> Self {
        self.parts.push(value.unwrap_or_default().to_string());
        self
    }

    /// Finish the key.
    pub fn build(self) -> CacheKey {
        CacheKey(self.parts.join(";"))
    }
}
