//! Plugin contract and construction.
//!
//! Every federation flow implements [`CredentialProvider`]. The connection
//! layer selects a flow by the `plugin` parameter through
//! [`FederationPlugin::from_config`] and only ever talks to the trait.

use crate::cache::{CredentialCache, FederationCaches};
use crate::config::{PluginConfig, keys};
use crate::core::{CacheKey, CredentialsHolder, FederationError, Result, TokenHolder};
use crate::http::build_client;
use crate::jwt::{RoleChainPlugin, WebIdentityPlugin};
use crate::oauth2::{BrowserIdcPlugin, DeviceIdcPlugin};
use crate::saml::SamlPlugin;
use crate::sts::{HttpStsClient, StsApi};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// A federation flow producing warehouse credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Record a connection parameter.
    fn add_parameter(&mut self, key: &str, value: &str);

    /// Credentials for this configuration, from cache when still valid.
    async fn credentials(&self) -> Result<CredentialsHolder>;

    /// Unconditionally re-run the flow and replace the cached entry.
    async fn refresh(&self) -> Result<CredentialsHolder>;

    /// The identity token backing this flow, for plugins that issue one.
    async fn auth_token(&self) -> Result<TokenHolder> {
        Err(FederationError::Unexpected(
            "plugin does not issue identity tokens".into(),
        ))
    }

    /// Full cache key for this configuration.
    fn cache_key(&self) -> CacheKey;

    /// The parts of the key that only this plugin contributes.
    fn plugin_specific_cache_key(&self) -> String;
}

/// Cache key prefix shared by all plugins: the parameters that change the
/// effective credential regardless of flow.
pub(crate) fn base_cache_key(plugin: &str, config: &PluginConfig, specific: &str) -> CacheKey {
    CacheKey::builder(plugin)
        .opt(config.get_non_empty(keys::USER))
        .opt(config.get_non_empty(keys::PASSWORD))
        .opt(config.get_non_empty(keys::REGION))
        .opt(config.get_non_empty(keys::DURATION))
        .opt(config.get_non_empty(keys::DB_USER))
        .opt(config.get_non_empty(keys::DB_GROUPS))
        .opt(config.get_non_empty(keys::AUTO_CREATE))
        .part(specific)
        .build()
}

/// The token-service client a flow should call: the injected test double if
/// one was supplied, otherwise an HTTP client built from configuration.
pub(crate) fn resolve_sts(
    config: &PluginConfig,
    sts_override: Option<&Arc<dyn StsApi>>,
) -> Result<Arc<dyn StsApi>> {
    if let Some(sts) = sts_override {
        return Ok(Arc::clone(sts));
    }
    let http = build_client(config)?;
    let region = config.required(keys::REGION)?;
    let client = HttpStsClient::new(
        http,
        region,
        config.get_non_empty(keys::STS_ENDPOINT),
        config.get_non_empty(keys::WAREHOUSE_ENDPOINT),
    )?;
    Ok(Arc::new(client))
}

/// Serializes refreshes for one plugin instance.
///
/// A waiter that queued behind an in-flight refresh re-reads the cache after
/// acquiring the lock, so n concurrent callers produce one upstream call.
/// With `bypass_shared` the instance works against a private cache of the
/// same shape, keeping concurrency semantics identical while leaving the
/// process-wide map untouched.
pub(crate) struct RefreshCoordinator {
    shared: Arc<CredentialCache>,
    private: CredentialCache,
    lock: tokio::sync::Mutex<()>,
}

impl RefreshCoordinator {
    pub(crate) fn new(shared: &Arc<CredentialCache>) -> Self {
        Self {
            shared: Arc::clone(shared),
            private: CredentialCache::new(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    fn cache(&self, bypass_shared: bool) -> &CredentialCache {
        if bypass_shared {
            &self.private
        } else {
            &self.shared
        }
    }

    pub(crate) async fn get_or_refresh<F, Fut>(
        &self,
        key: &CacheKey,
        bypass_shared: bool,
        fetch: F,
    ) -> Result<CredentialsHolder>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<CredentialsHolder>> + Send,
    {
        let cache = self.cache(bypass_shared);
        if let Some(holder) = cache.get_valid(key) {
            debug!(%key, "serving credentials from cache");
            return Ok(holder);
        }

        let _guard = self.lock.lock().await;
        if let Some(holder) = cache.get_valid(key) {
            debug!(%key, "credentials refreshed while waiting for the lock");
            return Ok(holder);
        }

        let holder = fetch().await?;
        cache.put(key.clone(), holder.clone());
        Ok(holder)
    }

    pub(crate) async fn force_refresh<F, Fut>(
        &self,
        key: &CacheKey,
        bypass_shared: bool,
        fetch: F,
    ) -> Result<CredentialsHolder>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<CredentialsHolder>> + Send,
    {
        let _guard = self.lock.lock().await;
        let holder = fetch().await?;
        self.cache(bypass_shared).put(key.clone(), holder.clone());
        Ok(holder)
    }
}

/// All federation flows, tagged by the `plugin` parameter value.
pub enum FederationPlugin {
    /// SAML assertion exchange (`plugin=saml`).
    Saml(SamlPlugin),
    /// Identity Center browser authorization-code flow (`plugin=browser-idc`).
    BrowserIdc(BrowserIdcPlugin),
    /// Identity Center device-code flow (`plugin=device-idc`).
    DeviceIdc(DeviceIdcPlugin),
    /// Externally supplied web-identity token (`plugin=web-identity`).
    WebIdentity(WebIdentityPlugin),
    /// Chained role assumption (`plugin=role-chain`).
    RoleChain(RoleChainPlugin),
}

impl FederationPlugin {
    /// Construct the flow named by the `plugin` parameter.
    ///
    /// `sts` substitutes the token-service client; production passes `None`.
    pub fn from_config(
        config: PluginConfig,
        caches: &FederationCaches,
        sts: Option<Arc<dyn StsApi>>,
    ) -> Result<Self> {
        let name = config.required(keys::PLUGIN)?.to_ascii_lowercase();
        match name.as_str() {
            "saml" => Ok(Self::Saml(SamlPlugin::new(config, caches, sts))),
            "browser-idc" => Ok(Self::BrowserIdc(BrowserIdcPlugin::new(config, caches, sts))),
            "device-idc" => Ok(Self::DeviceIdc(DeviceIdcPlugin::new(config, caches, sts))),
            "web-identity" => Ok(Self::WebIdentity(WebIdentityPlugin::new(config, caches, sts))),
            "role-chain" => Ok(Self::RoleChain(RoleChainPlugin::new(config, caches, sts))),
            other => Err(FederationError::Unexpected(format!(
                "unknown plugin '{other}'"
            ))),
        }
    }
}

macro_rules! delegate {
    ($self:ident, $plugin:ident => $body:expr) => {
        match $self {
            Self::Saml($plugin) => $body,
            Self::BrowserIdc($plugin) => $body,
            Self::DeviceIdc($plugin) => $body,
            Self::WebIdentity($plugin) => $body,
            Self::RoleChain($plugin) => $body,
        }
    };
}

#[async_trait]
impl CredentialProvider for FederationPlugin {
    fn add_parameter(&mut self, key: &str, value: &str) {
        delegate!(self, plugin => plugin.add_parameter(key, value));
    }

    async fn credentials(&self) -> Result<CredentialsHolder> {
        delegate!(self, plugin => plugin.credentials().await)
    }

    async fn refresh(&self) -> Result<CredentialsHolder> {
        delegate!(self, plugin => plugin.refresh().await)
    }

    async fn auth_token(&self) -> Result<TokenHolder> {
        delegate!(self, plugin => plugin.auth_token().await)
    }

    fn cache_key(&self) -> CacheKey {
        delegate!(self, plugin => plugin.cache_key())
    }

    fn plugin_specific_cache_key(&self) -> String {
        delegate!(self, plugin => plugin.plugin_specific_cache_key())
    }
}
