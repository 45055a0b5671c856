//! In-process caches: credentials and OAuth client registrations.
//!
//! Both caches are explicitly constructed services passed by reference into
//! each flow (no global state), so tests get per-test isolation for free.

mod clients;
mod credentials;

pub use clients::{ClientRegistrationCache, RegisteredClient, RegistrationKey};
pub use credentials::CredentialCache;

use std::sync::Arc;

/// The cache services shared by every plugin instance in a process.
#[derive(Debug, Clone, Default)]
pub struct FederationCaches {
    /// Federated credentials keyed by configuration.
    pub credentials: Arc<CredentialCache>,
    /// OAuth client registrations keyed by issuer/region/port.
    pub registrations: Arc<ClientRegistrationCache>,
}

impl FederationCaches {
    /// Fresh, empty cache services.
    pub fn new() -> Self {
        Self::default()
    }
}
