//! Wharf Federation - credential federation for the Wharf driver
//!
//! Turns an external identity (SAML assertion, Identity Center login, OIDC
//! token, static key pair) into warehouse credentials.
//!
//! # Features
//!
//! - **Tagged plugin flows** - SAML, browser/device Identity Center,
//!   web-identity, role chaining, selected by the `plugin` parameter
//! - **Process-wide caching** - identical configurations share credentials
//!   and coordinate refreshes
//! - **Defensive parsing** - assertion XML is size-capped and DOCTYPE-free
//! - **Secure secrets** - zeroized storage with redacted `Debug` output
#![deny(unsafe_code)]
#![forbid(unsafe_code)]

/// Opens URLs in the system browser
pub mod browser;
/// Credential and OAuth-registration caches
pub mod cache;
/// Connection-parameter bag and well-known keys
pub mod config;
/// Core types, errors, and primitives
pub mod core;
/// Outbound HTTP construction and URL validation
pub mod http;
/// Web-identity and role-chain flows
pub mod jwt;
/// Local HTTP callback listener for browser flows
pub mod listener;
/// Effective database user/group resolution
pub mod metadata;
/// Identity Center OAuth flows
pub mod oauth2;
/// PKCE and CSRF-state generation
pub mod pkce;
/// Plugin contract and construction
pub mod plugin;
/// SAML acquisition, parsing, and role assumption
pub mod saml;
/// Security-token and warehouse credential-issuance client
pub mod sts;

// ── Root re-exports ─────────────────────────────────────────────────────────
// Commonly-used types available directly as `wharf_federation::TypeName`.

// Core types & errors
pub use crate::core::{
    CacheKey, Credential, CredentialsHolder, FederationError, IamMetadata, Result, SecretString,
    TokenHolder,
};

// Configuration
pub use crate::config::{PluginConfig, keys};

// Caches
pub use crate::cache::{ClientRegistrationCache, CredentialCache, FederationCaches};

// Plugin contract
pub use crate::plugin::{CredentialProvider, FederationPlugin};

// Token-service seam
pub use crate::sts::{HttpStsClient, StsApi};

/// Commonly used types and traits
pub mod prelude {
    // Core types
    pub use crate::core::{
        Credential, CredentialsHolder, FederationError, IamMetadata, Result, SecretString,
        TokenHolder,
    };

    // Configuration
    pub use crate::config::{PluginConfig, keys};

    // Plugin contract
    pub use crate::plugin::{CredentialProvider, FederationPlugin};

    // Caches
    pub use crate::cache::FederationCaches;
}
