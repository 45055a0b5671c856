//! SAML federation flow.

use crate::cache::FederationCaches;
use crate::config::{PluginConfig, keys};
use crate::core::{CredentialsHolder, FederationError, Result};
use crate::http::build_client;
use crate::metadata;
use crate::plugin::{CredentialProvider, RefreshCoordinator, base_cache_key, resolve_sts};
use crate::saml::acquire::{AssertionAcquirer, BrowserAcquirer, FormAcquirer, StaticAcquirer};
use crate::saml::assertion::SamlAssertion;
use crate::sts::{AssumeRoleWithSamlRequest, StsApi};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Exchanges a SAML assertion for temporary session credentials.
///
/// The acquisition mode is picked from configuration: a static
/// `saml_assertion` wins, then a browser `login_url`, then form automation
/// against `idp_host`/`app_id`.
pub struct SamlPlugin {
    config: PluginConfig,
    coordinator: RefreshCoordinator,
    sts_override: Option<Arc<dyn StsApi>>,
}

impl SamlPlugin {
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

    fn acquirer(&self, http: reqwest::Client) -> Result<Box<dyn AssertionAcquirer>> {
        if self.config.get_non_empty(keys::SAML_ASSERTION).is_some() {
            Ok(Box::new(StaticAcquirer::from_config(&self.config)?))
        } else if self.config.get_non_empty(keys::LOGIN_URL).is_some() {
            Ok(Box::new(BrowserAcquirer::from_config(&self.config)?))
        } else if self.config.get_non_empty(keys::APP_ID).is_some() {
            Ok(Box::new(FormAcquirer::from_config(&self.config, http)?))
        } else {
            Err(FederationError::MissingParameter(keys::SAML_ASSERTION))
        }
    }

    async fn fetch(&self) -> Result<CredentialsHolder> {
        let http = build_client(&self.config)?;
        let encoded = self.acquirer(http)?.acquire().await?;
        let assertion = SamlAssertion::parse(&encoded)?;

        let roles = assertion.roles()?;
        let (role_arn, principal_arn) = select_role(
            &roles,
            self.config.get_non_empty(keys::PREFERRED_ROLE),
        )?;
        info!(%role_arn, "assuming asserted role");

        let sts = resolve_sts(&self.config, self.sts_override.as_ref())?;
        let session = sts
            .assume_role_with_saml(AssumeRoleWithSamlRequest {
                role_arn,
                principal_arn,
                saml_assertion: assertion.encoded().to_string(),
                duration_seconds: self.config.duration_seconds()?,
            })
            .await?;

        let metadata = metadata::resolve(&self.config, Some(&assertion.metadata()))?;
        let expires_at = session.expiration;
        Ok(CredentialsHolder::new(session.into_credential(), expires_at).with_metadata(metadata))
    }
}

/// The role/provider pair to assume: the preferred role when configured,
/// otherwise the first asserted one.
fn select_role(
    roles: &indexmap::IndexMap<String, String>,
    preferred: Option<&str>,
) -> Result<(String, String)> {
    match preferred {
        Some(role) => roles
            .get(role)
            .map(|provider| (role.to_string(), provider.clone()))
            .ok_or_else(|| {
                FederationError::AccessDenied(format!(
                    "preferred role '{role}' was not asserted by the identity provider"
                ))
            }),
        None => roles
            .first()
            .map(|(role, provider)| (role.clone(), provider.clone()))
            .ok_or_else(|| {
                FederationError::ProtocolParse("assertion does not assert any role".into())
            }),
    }
}

#[async_trait]
impl CredentialProvider for SamlPlugin {
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
        base_cache_key("saml", &self.config, &self.plugin_specific_cache_key())
    }

    fn plugin_specific_cache_key(&self) -> String {
        [
            self.config.get_non_empty(keys::IDP_HOST),
            self.config.get_non_empty(keys::IDP_PORT),
            self.config.get_non_empty(keys::PREFERRED_ROLE),
            self.config.get_non_empty(keys::LOGIN_URL),
            self.config.get_non_empty(keys::APP_ID),
            self.config.get_non_empty(keys::SAML_ASSERTION),
        ]
        .map(Option::unwrap_or_default)
        .join(";")
    }
}
