//! Core types, errors, and primitives for credential federation.

mod credentials;
mod error;
mod key;
mod secure;

pub use credentials::{Credential, CredentialsHolder, IamMetadata, TokenHolder};
pub use error::{FederationError, Result};
pub(crate) use error::sanitize_body;
pub use key::{CacheKey, CacheKeyBuilder};
pub use secure::SecretString;
