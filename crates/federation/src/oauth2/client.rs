//! Identity Center OIDC client (JSON over HTTPS).

use crate::cache::RegisteredClient;
use crate::core::{FederationError, Result, SecretString};
use crate::http::validate_idp_url;
use crate::sts::StsCredentials;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::debug;

/// Scope requested for issued access tokens.
pub const CONNECT_SCOPE: &str = "wharf:connect";

/// Client registrations live for 90 days unless the service says otherwise.
const DEFAULT_REGISTRATION_TTL: Duration = Duration::days(90);

/// One `create_token` poll outcome.
#[derive(Debug)]
pub enum TokenPoll {
    /// The user has not finished authorizing yet; poll again.
    Pending,
    /// Token issued.
    Ready(IdcToken),
}

/// An issued access token.
#[derive(Debug, Clone)]
pub struct IdcToken {
    /// Bearer token for subsequent credential calls.
    pub access_token: SecretString,
    /// Advertised lifetime in seconds.
    pub expires_in: u64,
}

/// Device-authorization session handed to the user.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthorization {
    /// Code the client polls with.
    pub device_code: String,
    /// Code the user confirms in the browser.
    pub user_code: String,
    /// Plain verification page.
    pub verification_uri: String,
    /// Verification page with the user code prefilled.
    pub verification_uri_complete: String,
    /// Session lifetime in seconds.
    pub expires_in: u64,
    /// Requested polling interval in seconds.
    pub interval: Option<u64>,
}

/// Grant presented to the token endpoint.
#[derive(Debug)]
pub enum TokenGrant {
    /// Authorization-code grant with a PKCE verifier.
    AuthorizationCode {
        /// Code returned on the redirect.
        code: String,
        /// PKCE verifier matching the challenge sent on authorize.
        code_verifier: String,
        /// Redirect URI the code was issued against.
        redirect_uri: String,
    },
    /// Device-code grant.
    DeviceCode {
        /// Code from [`DeviceAuthorization`].
        device_code: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterClientResponse {
    client_id: String,
    client_secret: String,
    client_secret_expires_at: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTokenResponse {
    access_token: String,
    /// Omitted by some deployments; 0 is replaced by the default lifetime
    /// downstream.
    #[serde(default)]
    expires_in: u64,
}

#[derive(Deserialize)]
struct OidcError {
    error: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoleCredentialsResponse {
    role_credentials: RoleCredentials,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoleCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    /// Milliseconds since the epoch.
    expiration: i64,
}

/// HTTP client for the Identity Center registration/token/credential API.
pub struct IdcClient {
    http: reqwest::Client,
    base: url::Url,
}

impl IdcClient {
    /// Client for `region`, or against an explicit host override.
    pub fn new(http: reqwest::Client, region: &str, host_override: Option<&str>) -> Result<Self> {
        let base = match host_override {
            Some(host) if host.contains("://") => host.to_string(),
            Some(host) => format!("https://{host}/"),
            None => format!("https://oidc.{region}.wharf.cloud/"),
        };
        Ok(Self {
            http,
            base: validate_idp_url(&base)?,
        })
    }

    fn endpoint(&self, path: &str) -> Result<url::Url> {
        self.base.join(path).map_err(|e| FederationError::InvalidUrl {
            url: format!("{}{path}", self.base),
            reason: e.to_string(),
        })
    }

    /// Register a public OAuth client for this driver installation.
    pub async fn register_client(
        &self,
        client_name: &str,
        issuer_url: Option<&str>,
        redirect_uri: Option<&str>,
    ) -> Result<RegisteredClient> {
        let grant_types: Vec<&str> = if redirect_uri.is_some() {
            vec!["authorization_code", "refresh_token"]
        } else {
            vec!["urn:ietf:params:oauth:grant-type:device_code"]
        };
        let mut body = serde_json::json!({
            "clientName": client_name,
            "clientType": "public",
            "scopes": [CONNECT_SCOPE],
            "grantTypes": grant_types,
        });
        if let Some(issuer) = issuer_url {
            body["issuerUrl"] = serde_json::Value::from(issuer);
        }
        if let Some(redirect) = redirect_uri {
            body["redirectUris"] = serde_json::Value::from(vec![redirect]);
        }

        let parsed: RegisterClientResponse = self
            .post_json(self.endpoint("client/register")?, &body)
            .await?;
        debug!(client_id = %parsed.client_id, "registered OAuth client");

        let expires_at = parsed
            .client_secret_expires_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(|| Utc::now() + DEFAULT_REGISTRATION_TTL);
        Ok(RegisteredClient {
            client_id: parsed.client_id,
            client_secret: parsed.client_secret.into(),
            expires_at,
        })
    }

    /// Open a device-authorization session against the start URL.
    pub async fn start_device_authorization(
        &self,
        client: &RegisteredClient,
        start_url: &str,
    ) -> Result<DeviceAuthorization> {
        let body = serde_json::json!({
            "clientId": client.client_id,
            "clientSecret": client.client_secret,
            "startUrl": start_url,
        });
        self.post_json(self.endpoint("device_authorization")?, &body)
            .await
    }

    /// Exchange or poll a grant for an access token.
    pub async fn create_token(
        &self,
        client: &RegisteredClient,
        grant: TokenGrant,
    ) -> Result<TokenPoll> {
        let mut body = serde_json::json!({
            "clientId": client.client_id,
            "clientSecret": client.client_secret,
        });
        match grant {
            TokenGrant::AuthorizationCode {
                code,
                code_verifier,
                redirect_uri,
            } => {
                body["grantType"] = "authorization_code".into();
                body["code"] = code.into();
                body["codeVerifier"] = code_verifier.into();
                body["redirectUri"] = redirect_uri.into();
            }
            TokenGrant::DeviceCode { device_code } => {
                body["grantType"] = "urn:ietf:params:oauth:grant-type:device_code".into();
                body["deviceCode"] = device_code.into();
            }
        }

        let response = self
            .http
            .post(self.endpoint("token")?)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            let parsed: CreateTokenResponse = parse_json(&text)?;
            return Ok(TokenPoll::Ready(IdcToken {
                access_token: parsed.access_token.into(),
                expires_in: parsed.expires_in,
            }));
        }

        match serde_json::from_str::<OidcError>(&text).map(|e| e.error) {
            Ok(code) if code == "authorization_pending" => Ok(TokenPoll::Pending),
            Ok(code) if code == "slow_down" => Err(FederationError::RateLimited(
                "token endpoint asked to slow down".into(),
            )),
            Ok(code) if code == "access_denied" => Err(FederationError::AccessDenied(
                "user declined the authorization request".into(),
            )),
            Ok(code) if code == "expired_token" => Err(FederationError::Timeout(
                "authorization session expired before the user finished".into(),
            )),
            _ => Err(FederationError::upstream(status.as_u16(), &text)),
        }
    }

    /// Exchange an access token for session credentials on a role.
    pub async fn get_role_credentials(
        &self,
        token: &SecretString,
        account_id: &str,
        role_name: &str,
    ) -> Result<StsCredentials> {
        let mut url = self.endpoint("federation/credentials")?;
        url.query_pairs_mut()
            .append_pair("account_id", account_id)
            .append_pair("role_name", role_name);

        let response = token
            .expose(|t| self.http.get(url.clone()).bearer_auth(t))
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(map_json_error(status.as_u16(), &text));
        }

        let parsed: RoleCredentialsResponse = parse_json(&text)?;
        let credentials = parsed.role_credentials;
        let expiration = DateTime::from_timestamp_millis(credentials.expiration).ok_or_else(
            || FederationError::ProtocolParse("credential expiration out of range".into()),
        )?;
        Ok(StsCredentials {
            access_key_id: credentials.access_key_id,
            secret_access_key: credentials.secret_access_key.into(),
            session_token: credentials.session_token.into(),
            expiration,
        })
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: url::Url,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self.http.post(url).json(body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(map_json_error(status.as_u16(), &text));
        }
        parse_json(&text)
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text)
        .map_err(|e| FederationError::ProtocolParse(format!("identity center response: {e}")))
}

fn map_json_error(status: u16, body: &str) -> FederationError {
    match serde_json::from_str::<OidcError>(body).map(|e| e.error) {
        Ok(code) if code == "access_denied" || status == 401 || status == 403 => {
            FederationError::AccessDenied(code)
        }
        Ok(code) if code == "slow_down" || status == 429 => FederationError::RateLimited(code),
        _ => FederationError::upstream(status, body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> IdcClient {
        IdcClient {
            http: reqwest::Client::new(),
            base: url::Url::parse(&server.uri()).unwrap(),
        }
    }

    fn registration() -> RegisteredClient {
        RegisteredClient {
            client_id: "client-1".into(),
            client_secret: "secret".into(),
            expires_at: Utc::now() + Duration::days(30),
        }
    }

    #[test]
    fn host_override_keeps_an_explicit_scheme() {
        let client = IdcClient::new(
            reqwest::Client::new(),
            "us-east-1",
            Some("http://127.0.0.1:8080"),
        )
        .unwrap();
        assert_eq!(client.base.scheme(), "http");
        assert_eq!(client.base.port(), Some(8080));
    }

    #[test]
    fn bare_host_override_is_wrapped_as_https() {
        let client = IdcClient::new(reqwest::Client::new(), "us-east-1", Some("oidc.example.com"))
            .unwrap();
        assert_eq!(client.base.as_str(), "https://oidc.example.com/");
    }

    #[tokio::test]
    async fn token_without_an_advertised_lifetime_still_parses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accessToken": "access-token-1",
            })))
            .mount(&server)
            .await;

        let poll = client_for(&server)
            .create_token(
                &registration(),
                TokenGrant::DeviceCode {
                    device_code: "device-1".into(),
                },
            )
            .await
            .unwrap();
        match poll {
            TokenPoll::Ready(token) => assert_eq!(token.expires_in, 0),
            TokenPoll::Pending => panic!("expected an issued token"),
        }
    }

    #[tokio::test]
    async fn register_client_parses_the_registration() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/client/register"))
            .and(body_partial_json(serde_json::json!({
                "clientName": "wharf-driver",
                "clientType": "public",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "clientId": "client-1",
                "clientSecret": "s3cret",
                "clientSecretExpiresAt": 4102444800i64,
            })))
            .mount(&server)
            .await;

        let registered = client_for(&server)
            .register_client("wharf-driver", None, None)
            .await
            .unwrap();
        assert_eq!(registered.client_id, "client-1");
    }

    #[tokio::test]
    async fn pending_error_maps_to_pending_poll() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "authorization_pending",
            })))
            .mount(&server)
            .await;

        let poll = client_for(&server)
            .create_token(
                &registration(),
                TokenGrant::DeviceCode {
                    device_code: "device-1".into(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(poll, TokenPoll::Pending));
    }

    #[tokio::test]
    async fn access_denied_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "access_denied",
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .create_token(
                &registration(),
                TokenGrant::DeviceCode {
                    device_code: "device-1".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn role_credentials_are_parsed_with_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/federation/credentials"))
            .and(wiremock::matchers::header(
                "authorization",
                "Bearer token-1",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "roleCredentials": {
                    "accessKeyId": "AKID",
                    "secretAccessKey": "secret",
                    "sessionToken": "session",
                    "expiration": 4102444800000i64,
                }
            })))
            .mount(&server)
            .await;

        let credentials = client_for(&server)
            .get_role_credentials(&"token-1".into(), "123456789012", "db-role")
            .await
            .unwrap();
        assert_eq!(credentials.access_key_id, "AKID");
    }
}
