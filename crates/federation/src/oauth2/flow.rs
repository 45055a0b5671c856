//! Identity Center OAuth flows: browser authorization-code and device code.

use crate::browser;
use crate::cache::{ClientRegistrationCache, FederationCaches, RegisteredClient, RegistrationKey};
use crate::config::{PluginConfig, keys};
use crate::core::{CredentialsHolder, FederationError, Result, TokenHolder};
use crate::http::{build_client, validate_idp_url};
use crate::listener::{CALLBACK_PATH, CallbackListener};
use crate::metadata;
use crate::oauth2::client::{CONNECT_SCOPE, IdcClient, IdcToken, TokenGrant, TokenPoll};
use crate::pkce;
use crate::plugin::{CredentialProvider, RefreshCoordinator, base_cache_key, resolve_sts};
use crate::sts::{AssumeRoleRequest, GetDatabaseCredentialsRequest, StsApi, StsCredentials};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_CLIENT_NAME: &str = "Wharf Driver";
/// Lifetime assumed when the token endpoint does not advertise one.
const DEFAULT_TOKEN_EXPIRY_SECS: u64 = 900;
/// Tokens this close to expiry are not served from the instance slot.
const TOKEN_EXPIRY_SKEW: ChronoDuration = ChronoDuration::seconds(60);
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_SESSION_NAME: &str = "wharf-federation";

/// State shared by both Identity Center flows.
struct IdcBase {
    config: PluginConfig,
    coordinator: RefreshCoordinator,
    registrations: Arc<ClientRegistrationCache>,
    token_slot: parking_lot::Mutex<Option<TokenHolder>>,
    token_lock: tokio::sync::Mutex<()>,
    sts_override: Option<Arc<dyn StsApi>>,
}

impl IdcBase {
    fn new(
        config: PluginConfig,
        caches: &FederationCaches,
        sts: Option<Arc<dyn StsApi>>,
    ) -> Self {
        Self {
            config,
            coordinator: RefreshCoordinator::new(&caches.credentials),
            registrations: Arc::clone(&caches.registrations),
            token_slot: parking_lot::Mutex::new(None),
            token_lock: tokio::sync::Mutex::new(()),
            sts_override: sts,
        }
    }

    fn bypass_cache(&self) -> bool {
        self.config.get_bool(keys::DISABLE_CACHE, false)
    }

    fn region(&self) -> Result<&str> {
        self.config
            .get_non_empty(keys::IDC_REGION)
            .or_else(|| self.config.get_non_empty(keys::REGION))
            .ok_or(FederationError::MissingParameter(keys::REGION))
    }

    fn idc_client(&self) -> Result<IdcClient> {
        let http = build_client(&self.config)?;
        IdcClient::new(
            http,
            self.region()?,
            self.config.get_non_empty(keys::IDC_HOST),
        )
    }

    /// A still-valid token from the instance slot, flagged as cached.
    fn cached_token(&self) -> Option<TokenHolder> {
        self.token_slot
            .lock()
            .as_ref()
            .filter(|t| t.expires_at - TOKEN_EXPIRY_SKEW > Utc::now())
            .map(|t| t.clone().cached())
    }

    fn store_token(&self, holder: &TokenHolder) {
        *self.token_slot.lock() = Some(holder.clone());
    }

    /// A cached registration when valid, otherwise a fresh one.
    async fn registration(
        &self,
        idc: &IdcClient,
        discriminator: &str,
        listen_port: u16,
        issuer_url: Option<&str>,
        redirect_uri: Option<&str>,
    ) -> Result<RegisteredClient> {
        let key = RegistrationKey {
            issuer_or_redirect: discriminator.to_string(),
            region: self.region()?.to_string(),
            listen_port,
        };
        if let Some(client) = self.registrations.get_valid(&key) {
            debug!(client_id = %client.client_id, "reusing cached client registration");
            return Ok(client);
        }

        let name = self
            .config
            .get_non_empty(keys::CLIENT_DISPLAY_NAME)
            .unwrap_or(DEFAULT_CLIENT_NAME);
        let client = idc.register_client(name, issuer_url, redirect_uri).await?;
        self.registrations.put(key, client.clone());
        Ok(client)
    }

    /// Turn an access token into warehouse credentials.
    ///
    /// Always a role-credential lookup; optionally a signed `AssumeRole`
    /// hop and a signed database-credential issuance on top.
    async fn credentials_from_token(&self, token: &TokenHolder) -> Result<CredentialsHolder> {
        let idc = self.idc_client()?;
        let account_id = self.config.required(keys::ACCOUNT_ID)?;
        let role_name = self.config.required(keys::ROLE_NAME)?;

        let mut session: StsCredentials = idc
            .get_role_credentials(&token.token, account_id, role_name)
            .await?;

        if let Some(role_arn) = self.config.get_non_empty(keys::ROLE_ARN) {
            let sts = resolve_sts(&self.config, self.sts_override.as_ref())?;
            let signer = session.signing();
            session = sts
                .assume_role(
                    &signer,
                    AssumeRoleRequest {
                        role_arn: role_arn.to_string(),
                        role_session_name: self
                            .config
                            .get_non_empty(keys::ROLE_SESSION_NAME)
                            .unwrap_or(DEFAULT_SESSION_NAME)
                            .to_string(),
                        duration_seconds: self.config.duration_seconds()?,
                    },
                )
                .await?;
        }

        let metadata = metadata::resolve(&self.config, None)?;

        if let Some(cluster_id) = self.config.get_non_empty(keys::CLUSTER_ID) {
            let db_user = metadata
                .db_user
                .clone()
                .ok_or(FederationError::MissingParameter(keys::DB_USER))?;
            let sts = resolve_sts(&self.config, self.sts_override.as_ref())?;
            let database = sts
                .get_database_credentials(
                    &session.signing(),
                    GetDatabaseCredentialsRequest {
                        cluster_id: cluster_id.to_string(),
                        db_user,
                        database: self.config.get_non_empty(keys::DATABASE).map(str::to_string),
                        auto_create: metadata.auto_create,
                        db_groups: metadata.db_groups.clone(),
                        duration_seconds: self.config.duration_seconds()?,
                    },
                )
                .await?;
            let expires_at = database.expiration;
            return Ok(CredentialsHolder::new(database.into_credential(), expires_at)
                .with_metadata(metadata));
        }

        let expires_at = session.expiration;
        Ok(CredentialsHolder::new(session.into_credential(), expires_at).with_metadata(metadata))
    }
}

fn token_holder(token: IdcToken) -> TokenHolder {
    let lifetime = if token.expires_in == 0 {
        DEFAULT_TOKEN_EXPIRY_SECS
    } else {
        token.expires_in
    };
    TokenHolder::fresh(
        token.access_token,
        Utc::now() + ChronoDuration::seconds(i64::try_from(lifetime).unwrap_or(i64::MAX)),
    )
}

/// Authorization-code flow with PKCE through the system browser.
pub struct BrowserIdcPlugin {
    base: IdcBase,
}

impl BrowserIdcPlugin {
    /// Build the flow over the shared caches.
    pub fn new(
        config: PluginConfig,
        caches: &FederationCaches,
        sts: Option<Arc<dyn StsApi>>,
    ) -> Self {
        Self {
            base: IdcBase::new(config, caches, sts),
        }
    }

    async fn acquire_token(&self) -> Result<TokenHolder> {
        let config = &self.base.config;
        let issuer = config.required(keys::ISSUER_URL)?;
        let issuer_base = validate_idp_url(issuer)?;
        let timeout = config.response_timeout()?;
        let idc = self.base.idc_client()?;

        let listener = CallbackListener::bind(config.listen_port()?).await?;
        let redirect_uri = format!("http://127.0.0.1:{}{CALLBACK_PATH}", listener.port());

        let registration = self
            .base
            .registration(&idc, issuer, listener.port(), Some(issuer), Some(&redirect_uri))
            .await?;

        let verifier = pkce::generate_verifier();
        let state = pkce::generate_state();

        let mut authorize = issuer_base.clone();
        authorize.set_path(&format!("{}/authorize", issuer_base.path().trim_end_matches('/')));
        authorize
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &registration.client_id)
            .append_pair("redirect_uri", &redirect_uri)
            .append_pair("scopes", CONNECT_SCOPE)
            .append_pair("state", &state)
            .append_pair("code_challenge", &pkce::code_challenge(&verifier))
            .append_pair("code_challenge_method", "S256");

        info!(url = %authorize, "opening browser for authorization");
        if let Err(e) = browser::open(authorize.as_str()) {
            warn!(error = %e, "could not open a browser for the authorization URL");
        }
        let params = listener.wait(timeout).await?;

        if params.get("state").map(String::as_str) != Some(state.as_str()) {
            return Err(FederationError::CsrfMismatch);
        }
        let code = params
            .get("code")
            .filter(|c| !c.is_empty())
            .cloned()
            .ok_or_else(|| {
                FederationError::ProtocolParse(
                    "callback did not carry an authorization code".into(),
                )
            })?;

        match idc
            .create_token(
                &registration,
                TokenGrant::AuthorizationCode {
                    code,
                    code_verifier: verifier,
                    redirect_uri,
                },
            )
            .await?
        {
            TokenPoll::Ready(token) => Ok(token_holder(token)),
            TokenPoll::Pending => Err(FederationError::Unexpected(
                "token endpoint reported pending for an authorization-code grant".into(),
            )),
        }
    }
}

#[async_trait]
impl CredentialProvider for BrowserIdcPlugin {
    fn add_parameter(&mut self, key: &str, value: &str) {
        self.base.config.set(key, value);
    }

    async fn credentials(&self) -> Result<CredentialsHolder> {
        self.base
            .coordinator
            .get_or_refresh(&self.cache_key(), self.base.bypass_cache(), || async {
                let token = self.auth_token().await?;
                self.base.credentials_from_token(&token).await
            })
            .await
    }

    async fn refresh(&self) -> Result<CredentialsHolder> {
        self.base
            .coordinator
            .force_refresh(&self.cache_key(), self.base.bypass_cache(), || async {
                let token = self.acquire_token().await?;
                self.base.store_token(&token);
                self.base.credentials_from_token(&token).await
            })
            .await
    }

    async fn auth_token(&self) -> Result<TokenHolder> {
        if let Some(token) = self.base.cached_token() {
            return Ok(token);
        }
        let _guard = self.base.token_lock.lock().await;
        if let Some(token) = self.base.cached_token() {
            return Ok(token);
        }
        let holder = self.acquire_token().await?;
        self.base.store_token(&holder);
        Ok(holder)
    }

    fn cache_key(&self) -> crate::core::CacheKey {
        base_cache_key("browser-idc", &self.base.config, &self.plugin_specific_cache_key())
    }

    fn plugin_specific_cache_key(&self) -> String {
        let config = &self.base.config;
        [
            config.get_non_empty(keys::ISSUER_URL),
            config.get_non_empty(keys::IDC_HOST),
            config.get_non_empty(keys::IDC_REGION),
            config.get_non_empty(keys::ACCOUNT_ID),
            config.get_non_empty(keys::ROLE_NAME),
            config.get_non_empty(keys::ROLE_ARN),
            config.get_non_empty(keys::CLUSTER_ID),
            config.get_non_empty(keys::LISTEN_PORT),
        ]
        .map(Option::unwrap_or_default)
        .join(";")
    }
}

/// Device-code flow for environments without a local browser session.
pub struct DeviceIdcPlugin {
    base: IdcBase,
}

impl DeviceIdcPlugin {
    /// Build the flow over the shared caches.
    pub fn new(
        config: PluginConfig,
        caches: &FederationCaches,
        sts: Option<Arc<dyn StsApi>>,
    ) -> Self {
        Self {
            base: IdcBase::new(config, caches, sts),
        }
    }

    async fn acquire_token(&self) -> Result<TokenHolder> {
        let config = &self.base.config;
        let start_url = config.required(keys::START_URL)?;
        validate_idp_url(start_url)?;
        let idc = self.base.idc_client()?;

        let registration = self
            .base
            .registration(&idc, start_url, 0, None, None)
            .await?;
        let authorization = idc
            .start_device_authorization(&registration, start_url)
            .await?;

        info!(
            user_code = %authorization.user_code,
            url = %authorization.verification_uri,
            "confirm the device code in your browser"
        );
        if let Err(e) = browser::open(&authorization.verification_uri_complete) {
            warn!(error = %e, "could not open a browser for the verification URL");
        }

        let interval = Duration::from_secs(
            authorization
                .interval
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS)
                .max(1),
        );
        let deadline = config
            .response_timeout()?
            .min(Duration::from_secs(authorization.expires_in));

        let device_code = authorization.device_code;
        let poll = async {
            loop {
                tokio::time::sleep(interval).await;
                match idc
                    .create_token(
                        &registration,
                        TokenGrant::DeviceCode {
                            device_code: device_code.clone(),
                        },
                    )
                    .await?
                {
                    TokenPoll::Pending => debug!("authorization pending; polling again"),
                    TokenPoll::Ready(token) => return Ok(token_holder(token)),
                }
            }
        };

        tokio::time::timeout(deadline, poll)
            .await
            .map_err(|_| FederationError::Timeout("device authorization".into()))?
    }
}

#[async_trait]
impl CredentialProvider for DeviceIdcPlugin {
    fn add_parameter(&mut self, key: &str, value: &str) {
        self.base.config.set(key, value);
    }

    async fn credentials(&self) -> Result<CredentialsHolder> {
        self.base
            .coordinator
            .get_or_refresh(&self.cache_key(), self.base.bypass_cache(), || async {
                let token = self.auth_token().await?;
                self.base.credentials_from_token(&token).await
            })
            .await
    }

    async fn refresh(&self) -> Result<CredentialsHolder> {
        self.base
            .coordinator
            .force_refresh(&self.cache_key(), self.base.bypass_cache(), || async {
                let token = self.acquire_token().await?;
                self.base.store_token(&token);
                self.base.credentials_from_token(&token).await
            })
            .await
    }

    async fn auth_token(&self) -> Result<TokenHolder> {
        if let Some(token) = self.base.cached_token() {
            return Ok(token);
        }
        let _guard = self.base.token_lock.lock().await;
        if let Some(token) = self.base.cached_token() {
            return Ok(token);
        }
        let holder = self.acquire_token().await?;
        self.base.store_token(&holder);
        Ok(holder)
    }

    fn cache_key(&self) -> crate::core::CacheKey {
        base_cache_key("device-idc", &self.base.config, &self.plugin_specific_cache_key())
    }

    fn plugin_specific_cache_key(&self) -> String {
        let config = &self.base.config;
        [
            config.get_non_empty(keys::START_URL),
            config.get_non_empty(keys::IDC_HOST),
            config.get_non_empty(keys::IDC_REGION),
            config.get_non_empty(keys::ACCOUNT_ID),
            config.get_non_empty(keys::ROLE_NAME),
            config.get_non_empty(keys::ROLE_ARN),
            config.get_non_empty(keys::CLUSTER_ID),
        ]
        .map(Option::unwrap_or_default)
        .join(";")
    }
}
