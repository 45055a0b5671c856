//! Token-seeded flows: web-identity exchange and chained role assumption.

use crate::cache::FederationCaches;
use crate::config::{PluginConfig, keys};
use crate::core::{CredentialsHolder, FederationError, Result};
use crate::metadata;
use crate::plugin::{CredentialProvider, RefreshCoordinator, base_cache_key, resolve_sts};
use crate::sts::{AssumeRoleRequest, AssumeRoleWithWebIdentityRequest, SigningCredentials, StsApi};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

const DEFAULT_SESSION_NAME: &str = "wharf-federation";

/// Exchanges an externally issued OIDC/JWT token for session credentials.
///
/// The token is obtained out of band (CI systems, workload identity); this
/// flow only performs the unsigned exchange.
pub struct WebIdentityPlugin {
    config: PluginConfig,
    coordinator: RefreshCoordinator,
    sts_override: Option<Arc<dyn StsApi>>,
}

impl WebIdentityPlugin {
    /// Build the flow over the shared caches.
    pub fn new(
        config: PluginConfig,
        caches: &FederationCaches,
        sts: Option<Arc<dyn StsApi>>,
    ) -> Self {
        Self {
            config,
            coordinator: RefreshCoordinator::new(&caches.credentials),
            sts_override: sts,
        }
    }

    fn bypass_cache(&self) -> bool {
        self.config.get_bool(keys::DISABLE_CACHE, false)
    }

    async fn fetch(&self) -> Result<CredentialsHolder> {
        let role_arn = self.config.required(keys::ROLE_ARN)?;
        let token = self.config.required(keys::WEB_IDENTITY_TOKEN)?;

        let sts = resolve_sts(&self.config, self.sts_override.as_ref())?;
        let session = sts
            .assume_role_with_web_identity(AssumeRoleWithWebIdentityRequest {
                role_arn: role_arn.to_string(),
                role_session_name: self
                    .config
                    .get_non_empty(keys::ROLE_SESSION_NAME)
                    .unwrap_or(DEFAULT_SESSION_NAME)
                    .to_string(),
                web_identity_token: token.into(),
                duration_seconds: self.config.duration_seconds()?,
            })
            .await?;

        let metadata = metadata::resolve(&self.config, None)?;
        let expires_at = session.expiration;
        Ok(CredentialsHolder::new(session.into_credential(), expires_at).with_metadata(metadata))
    }
}

#[async_trait]
impl CredentialProvider for WebIdentityPlugin {
    fn add_parameter(&mut self, key: &str, value: &str) {
        self.config.set(key, value);
    }

    async fn credentials(&self) -> Result<CredentialsHolder> {
        self.coordinator
            .get_or_refresh(&self.cache_key(), self.bypass_cache(), || self.fetch())
            .await
    }

    async fn refresh(&self) -> Result<CredentialsHolder> {
        self.coordinator
            .force_refresh(&self.cache_key(), self.bypass_cache(), || self.fetch())
            .await
    }

    fn cache_key(&self) -> crate::core::CacheKey {
        base_cache_key("web-identity", &self.config, &self.plugin_specific_cache_key())
    }

    fn plugin_specific_cache_key(&self) -> String {
        [
            self.config.get_non_empty(keys::ROLE_ARN),
            self.config.get_non_empty(keys::ROLE_SESSION_NAME),
            self.config.get_non_empty(keys::WEB_IDENTITY_TOKEN),
            self.config.get_non_empty(keys::STS_ENDPOINT),
        ]
        .map(Option::unwrap_or_default)
        .join(";")
    }
}

/// Assumes a comma-separated chain of roles, each hop signed with the
/// credentials of the previous one.
pub struct RoleChainPlugin {
    config: PluginConfig,
    coordinator: RefreshCoordinator,
    sts_override: Option<Arc<dyn StsApi>>,
}

impl RoleChainPlugin {
    /// Build the flow over the shared caches.
    pub fn new(
        config: PluginConfig,
        caches: &FederationCaches,
        sts: Option<Arc<dyn StsApi>>,
    ) -> Self {
        Self {
            config,
            coordinator: RefreshCoordinator::new(&caches.credentials),
            sts_override: sts,
        }
    }

    fn bypass_cache(&self) -> bool {
        self.config.get_bool(keys::DISABLE_CACHE, false)
    }

    /// Seed credentials: explicit parameters first, then `WHARF_*`
    /// environment variables.
    fn seed_credentials(&self) -> Result<SigningCredentials> {
        let from_config = |key: &str| self.config.get_non_empty(key).map(str::to_string);

        let access_key_id = from_config(keys::ACCESS_KEY_ID)
            .or_else(|| std::env::var("WHARF_ACCESS_KEY_ID").ok())
            .ok_or(FederationError::MissingParameter(keys::ACCESS_KEY_ID))?;
        let secret_access_key = from_config(keys::SECRET_ACCESS_KEY)
            .or_else(|| std::env::var("WHARF_SECRET_ACCESS_KEY").ok())
            .ok_or(FederationError::MissingParameter(keys::SECRET_ACCESS_KEY))?;
        let session_token = from_config(keys::SESSION_TOKEN)
            .or_else(|| std::env::var("WHARF_SESSION_TOKEN").ok());

        Ok(SigningCredentials {
            access_key_id,
            secret_access_key: secret_access_key.into(),
            session_token: session_token.map(Into::into),
        })
    }

    async fn fetch(&self) -> Result<CredentialsHolder> {
        let chain: Vec<&str> = self
            .config
            .required(keys::ROLE_ARN)?
            .split(',')
            .map(str::trim)
            .filter(|arn| !arn.is_empty())
            .collect();
        if chain.is_empty() {
            return Err(FederationError::MissingParameter(keys::ROLE_ARN));
        }

        let session_name = self
            .config
            .get_non_empty(keys::ROLE_SESSION_NAME)
            .unwrap_or(DEFAULT_SESSION_NAME)
            .to_string();
        let duration = self.config.duration_seconds()?;
        let sts = resolve_sts(&self.config, self.sts_override.as_ref())?;

        let mut signer = self.seed_credentials()?;
        let mut session = None;
        for role_arn in chain {
            info!(%role_arn, "assuming chained role");
            let hop = sts
                .assume_role(
                    &signer,
                    AssumeRoleRequest {
                        role_arn: role_arn.to_string(),
                        role_session_name: session_name.clone(),
                        duration_seconds: duration,
                    },
                )
                .await?;
            signer = hop.signing();
            session = Some(hop);
        }

        // Non-empty chain guarantees at least one hop.
        let session = session.ok_or_else(|| {
            FederationError::Unexpected("role chain produced no credentials".into())
        })?;
        let metadata = metadata::resolve(&self.config, None)?;
        let expires_at = session.expiration;
        Ok(CredentialsHolder::new(session.into_credential(), expires_at).with_metadata(metadata))
    }
}

#[async_trait]
impl CredentialProvider for RoleChainPlugin {
    fn add_parameter(&mut self, key: &str, value: &str) {
        self.config.set(key, value);
    }

    async fn credentials(&self) -> Result<CredentialsHolder> {
        self.coordinator
            .get_or_refresh(&self.cache_key(), self.bypass_cache(), || self.fetch())
            .await
    }

    async fn refresh(&self) -> Result<CredentialsHolder> {
        self.coordinator
            .force_refresh(&self.cache_key(), self.bypass_cache(), || self.fetch())
            .await
    }

    fn cache_key(&self) -> crate::core::CacheKey {
        base_cache_key("role-chain", &self.config, &self.plugin_specific_cache_key())
    }

    fn plugin_specific_cache_key(&self) -> String {
        [
            self.config.get_non_empty(keys::ROLE_ARN),
            self.config.get_non_empty(keys::ROLE_SESSION_NAME),
            self.config.get_non_empty(keys::ACCESS_KEY_ID),
            self.config.get_non_empty(keys::STS_ENDPOINT),
        ]
        .map(Option::unwrap_or_default)
        .join(";")
    }
}
